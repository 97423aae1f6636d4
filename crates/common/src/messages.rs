//! Message types exchanged between gateways and the upstream router.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifies a gateway. Opaque, non-empty.
pub type GatewayId = String;

/// Access key presented by a gateway. Empty means "no key registered".
pub type AccessKey = String;

/// Sent by a gateway when it comes online.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectMessage {
    pub gateway_id: GatewayId,
    /// Key that authorizes a later disconnect for the same gateway.
    #[serde(default)]
    pub key: AccessKey,
}

/// Sent by a gateway when it goes offline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisconnectMessage {
    pub gateway_id: GatewayId,
    #[serde(default)]
    pub key: AccessKey,
}

/// Radio frame received by a gateway, heading to the network.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UplinkMessage {
    pub gateway_id: GatewayId,
    pub payload: Bytes,
}

/// Frame scheduled by the network for a gateway to transmit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownlinkMessage {
    pub gateway_id: GatewayId,
    pub payload: Bytes,
}

/// Periodic gateway health report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusMessage {
    pub gateway_id: GatewayId,
    pub payload: Bytes,
}
