//! Narrow interfaces over the upstream router service.
//!
//! A [`RouterDialer`] resolves the router through discovery and opens the
//! RPC connection; a [`RouterConn`] hands out per-gateway links; a
//! [`GatewayLink`] carries the actual uplink/status/downlink traffic for
//! one gateway. The token callback is invoked at stream establishment so
//! that key rotation takes effect without re-dialing.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use common::GatewayId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Produces a fresh bearer token for a gateway on demand.
pub type TokenFn = Arc<dyn Fn(&GatewayId) -> String + Send + Sync>;

/// [`TokenFn`] curried onto one gateway.
pub type GatewayTokenFn = Arc<dyn Fn() -> String + Send + Sync>;

/// Configuration for the router adapter.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Discovery server address used to look up the router.
    pub discovery_server: String,
    /// Identity of the router to connect to.
    pub router_id: String,
    /// Initial delay before a downlink stream reconnect.
    pub reconnect_delay: Duration,
    /// Cap for the reconnect backoff.
    pub max_reconnect_delay: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            discovery_server: "localhost:1900".to_string(),
            router_id: "default-router".to_string(),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

/// Dials the upstream router: discovery lookup keyed by the configured
/// router ID, then RPC connection establishment.
#[async_trait]
pub trait RouterDialer: Send + Sync + 'static {
    type Conn: RouterConn;

    async fn dial(&self, config: &RouterConfig) -> Result<Self::Conn>;
}

/// An established connection to the router.
#[async_trait]
pub trait RouterConn: Send + Sync + 'static {
    type Link: GatewayLink;

    /// Creates the per-gateway client. Cheap; no I/O happens until the
    /// link is used.
    fn gateway_link(&self, id: &GatewayId, token: GatewayTokenFn) -> Self::Link;

    async fn close(&self);
}

/// Traffic channel for a single gateway.
#[async_trait]
pub trait GatewayLink: Send + Sync + 'static {
    async fn send_uplink(&self, payload: Bytes) -> Result<()>;

    async fn send_status(&self, payload: Bytes) -> Result<()>;

    /// Opens the downlink stream. `Ok` items carry frames; an `Err` item
    /// is a transient stream failure after which the caller re-subscribes.
    /// The channel closing without an error is a graceful end of stream.
    async fn subscribe(&self) -> Result<mpsc::Receiver<Result<Bytes>>>;

    /// Releases the upstream downlink subscription.
    async fn unsubscribe(&self) -> Result<()>;

    async fn close(&self);
}
