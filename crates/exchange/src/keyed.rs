//! Per-gateway coordination locks.
//!
//! Connect and disconnect for the same gateway must serialize; events for
//! different gateways may run in parallel up to the worker-pool size. A
//! fixed ring of hash-bucketed mutexes keeps the memory bound independent
//! of the number of gateways ever seen.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

const SHARDS: usize = 32;

pub struct KeyedLocks {
    shards: Vec<Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Arc::new(Mutex::new(()))).collect(),
        }
    }

    /// Acquires the coordination slot for `key`. Keys that hash to the
    /// same shard contend with each other, which is harmless.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        self.shards[index].clone().lock_owned().await
    }
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new()
    }
}
