//! Per-gateway link cache.
//!
//! One upstream link per active gateway, created lazily on first use and
//! closed exactly once on release. A single mutex covers every operation.

use crate::link::GatewayLink;
use common::GatewayId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

struct CachedLink<L> {
    link: Arc<L>,
    last_active: Instant,
}

pub struct ConnectionCache<L> {
    links: Mutex<HashMap<GatewayId, CachedLink<L>>>,
}

impl<L: GatewayLink> ConnectionCache<L> {
    pub fn new() -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached link for `id`, constructing one via `make` on a
    /// miss. Refreshes the entry's activity timestamp either way.
    pub async fn get(&self, id: &GatewayId, make: impl FnOnce() -> L) -> Arc<L> {
        let mut links = self.links.lock().await;
        let entry = links.entry(id.clone()).or_insert_with(|| CachedLink {
            link: Arc::new(make()),
            last_active: Instant::now(),
        });
        entry.last_active = Instant::now();
        entry.link.clone()
    }

    /// Closes and removes the link for `id`. Releasing an unknown id is a
    /// no-op.
    pub async fn release(&self, id: &GatewayId) {
        let mut links = self.links.lock().await;
        if let Some(cached) = links.remove(id) {
            debug!(gateway_id = %id, "releasing cached link");
            cached.link.close().await;
        }
    }

    /// Closes and removes every cached link.
    pub async fn release_all(&self) {
        let mut links = self.links.lock().await;
        for (id, cached) in links.drain() {
            debug!(gateway_id = %id, "releasing cached link");
            cached.link.close().await;
        }
    }

    /// Evicts links idle longer than `max_idle` whose gateway is not in
    /// `active`. Returns the evicted ids.
    pub async fn prune_idle(
        &self,
        max_idle: Duration,
        active: &HashSet<GatewayId>,
    ) -> Vec<GatewayId> {
        let mut links = self.links.lock().await;
        let expired: Vec<GatewayId> = links
            .iter()
            .filter(|(id, cached)| {
                cached.last_active.elapsed() > max_idle && !active.contains(id.as_str())
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(cached) = links.remove(id) {
                cached.link.close().await;
            }
        }
        expired
    }

    pub async fn len(&self) -> usize {
        self.links.lock().await.len()
    }
}

impl<L: GatewayLink> Default for ConnectionCache<L> {
    fn default() -> Self {
        Self::new()
    }
}
