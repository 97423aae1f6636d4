//! Southbound and northbound backend traits.
//!
//! Subscriptions are delivered as bounded `mpsc` receivers. A receiver that
//! yields `None` has terminated gracefully; dropping a receiver releases the
//! subscription on the backend side. Backends must be safe for concurrent
//! use.

use crate::error::Result;
use async_trait::async_trait;
use common::{
    ConnectMessage, DisconnectMessage, DownlinkMessage, GatewayId, StatusMessage, UplinkMessage,
};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;

/// Stream of messages delivered by a subscription.
pub type MessageStream<T> = mpsc::Receiver<T>;

/// The side of the bridge facing the gateways.
#[async_trait]
pub trait Southbound: Send + Sync + 'static {
    /// Establishes the transport. Failures here are fatal to exchange
    /// startup.
    async fn connect(&self) -> Result<()>;

    /// Tears down the transport.
    async fn disconnect(&self) -> Result<()>;

    /// Injects a connect event, as a gateway coming online would.
    async fn publish_connect(&self, msg: ConnectMessage) -> Result<()>;

    /// Injects a disconnect event, as a gateway going offline would.
    async fn publish_disconnect(&self, msg: DisconnectMessage) -> Result<()>;

    /// Stream of connect events from all gateways.
    async fn subscribe_connect(&self) -> Result<MessageStream<ConnectMessage>>;

    /// Stream of disconnect events from all gateways.
    async fn subscribe_disconnect(&self) -> Result<MessageStream<DisconnectMessage>>;

    /// Stream of uplink frames received by one gateway.
    async fn subscribe_uplink(&self, id: &GatewayId) -> Result<MessageStream<UplinkMessage>>;

    /// Stream of status reports from one gateway.
    async fn subscribe_status(&self, id: &GatewayId) -> Result<MessageStream<StatusMessage>>;

    /// Delivers a downlink frame to its gateway.
    async fn publish_downlink(&self, msg: DownlinkMessage) -> Result<()>;

    /// Releases any per-gateway resource held by this backend.
    async fn cleanup_gateway(&self, id: &GatewayId);
}

/// The side of the bridge facing the upstream router.
#[async_trait]
pub trait Northbound: Send + Sync + 'static {
    /// Establishes the transport. Failures here are fatal to exchange
    /// startup.
    async fn connect(&self) -> Result<()>;

    /// Tears down the transport.
    async fn disconnect(&self) -> Result<()>;

    /// Forwards an uplink frame to the router.
    async fn publish_uplink(&self, msg: UplinkMessage) -> Result<()>;

    /// Forwards a status report to the router.
    async fn publish_status(&self, msg: StatusMessage) -> Result<()>;

    /// Stream of downlink frames the router schedules for one gateway.
    /// The stream closes on graceful termination of the upstream
    /// subscription.
    async fn subscribe_downlink(&self, id: &GatewayId) -> Result<MessageStream<DownlinkMessage>>;

    /// Ends the downlink stream for one gateway.
    async fn unsubscribe_downlink(&self, id: &GatewayId) -> Result<()>;

    /// Releases any per-gateway resource held by this backend.
    async fn cleanup_gateway(&self, id: &GatewayId);

    /// Housekeeping hook: drop per-gateway resources idle longer than
    /// `max_idle` whose gateway is not in `active`.
    async fn prune_idle(&self, _max_idle: Duration, _active: &HashSet<GatewayId>) {}
}
