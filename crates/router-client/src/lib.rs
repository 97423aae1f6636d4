//! Northbound backend for the upstream network router.
//!
//! The concrete RPC transport stays behind the narrow [`RouterDialer`] /
//! [`RouterConn`] / [`GatewayLink`] traits. Everything above them lives
//! here and is exercised with mock transports in the tests: the
//! per-gateway connection cache, token handling, and the supervised
//! downlink reconnect loop.

pub mod adapter;
pub mod cache;
pub mod error;
pub mod link;

pub use adapter::RouterBackend;
pub use cache::ConnectionCache;
pub use error::{Error, Result};
pub use link::{GatewayLink, GatewayTokenFn, RouterConfig, RouterConn, RouterDialer, TokenFn};
