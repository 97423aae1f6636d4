//! The exchange: the concurrent heart of the bridge.
//!
//! Tracks which gateways are connected, authorizes connect and disconnect
//! events arriving from the southbound backends, and runs one stream
//! pipeline per connected gateway that relays uplink and status traffic
//! north and downlink traffic south.

pub mod error;
pub mod keyed;
pub mod pipeline;
pub mod registry;

mod exchange;

pub use crate::exchange::{Exchange, ExchangeConfig};
pub use error::{Error, Result};
pub use registry::Registry;
