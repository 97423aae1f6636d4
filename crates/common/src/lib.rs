//! Common types and utilities for the gateway bridge.

pub mod backoff;
pub mod messages;

pub use backoff::Backoff;
pub use messages::{
    AccessKey, ConnectMessage, DisconnectMessage, DownlinkMessage, GatewayId, StatusMessage,
    UplinkMessage,
};
