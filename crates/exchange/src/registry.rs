//! Set of currently-connected gateways.

use common::GatewayId;
use dashmap::DashSet;
use std::collections::HashSet;

/// Concurrent set of gateway IDs. A gateway is in the registry exactly
/// while the exchange runs a pipeline for it.
#[derive(Default)]
pub struct Registry {
    gateways: DashSet<GatewayId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the id was not present before.
    pub fn add(&self, id: &GatewayId) -> bool {
        self.gateways.insert(id.clone())
    }

    /// Returns `true` when the id was present.
    pub fn remove(&self, id: &GatewayId) -> bool {
        self.gateways.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.gateways.contains(id)
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }

    pub fn clear(&self) {
        self.gateways.clear();
    }

    /// Point-in-time copy, used by the housekeeping sweep.
    pub fn snapshot(&self) -> HashSet<GatewayId> {
        self.gateways.iter().map(|id| id.clone()).collect()
    }
}
