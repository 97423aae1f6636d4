//! Gateway access-key storage.
//!
//! The exchange records the key a gateway presents at connect time and uses
//! it to authorize the matching disconnect. A gateway registered with an
//! empty key accepts any presented key; once the entry is removed, only an
//! empty presented key validates.

use common::{AccessKey, GatewayId};
use dashmap::DashMap;
use tracing::debug;

/// Maps gateway IDs to their current access key.
///
/// All operations are atomic with respect to each other.
pub trait AuthStore: Send + Sync + 'static {
    /// Records the key for a gateway, overwriting any prior value.
    fn set_key(&self, id: &GatewayId, key: &AccessKey);

    /// True when the stored key is empty (key-less deployments pass
    /// through) or equals the presented one. With no entry stored, true
    /// only if the presented key is also empty.
    fn validate_key(&self, id: &GatewayId, key: &AccessKey) -> bool;

    /// Removes the entry for a gateway.
    fn delete(&self, id: &GatewayId);
}

/// In-memory `AuthStore`.
#[derive(Default)]
pub struct MemoryAuthStore {
    keys: DashMap<GatewayId, AccessKey>,
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuthStore for MemoryAuthStore {
    fn set_key(&self, id: &GatewayId, key: &AccessKey) {
        debug!(gateway_id = %id, "setting access key");
        self.keys.insert(id.clone(), key.clone());
    }

    fn validate_key(&self, id: &GatewayId, key: &AccessKey) -> bool {
        match self.keys.get(id) {
            Some(stored) => stored.is_empty() || *stored == *key,
            None => key.is_empty(),
        }
    }

    fn delete(&self, id: &GatewayId) {
        self.keys.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> GatewayId {
        s.to_string()
    }

    #[test]
    fn validates_matching_key() {
        let store = MemoryAuthStore::new();
        store.set_key(&id("dev"), &"key".to_string());
        assert!(store.validate_key(&id("dev"), &"key".to_string()));
        assert!(!store.validate_key(&id("dev"), &"other-key".to_string()));
    }

    #[test]
    fn empty_stored_key_accepts_anything() {
        let store = MemoryAuthStore::new();
        store.set_key(&id("dev"), &String::new());
        assert!(store.validate_key(&id("dev"), &"whatever".to_string()));
        assert!(store.validate_key(&id("dev"), &String::new()));
    }

    #[test]
    fn unknown_gateway_only_accepts_empty_key() {
        let store = MemoryAuthStore::new();
        assert!(store.validate_key(&id("dev"), &String::new()));
        assert!(!store.validate_key(&id("dev"), &"key".to_string()));
    }

    #[test]
    fn set_key_overwrites() {
        let store = MemoryAuthStore::new();
        store.set_key(&id("dev"), &"old".to_string());
        store.set_key(&id("dev"), &"new".to_string());
        assert!(!store.validate_key(&id("dev"), &"old".to_string()));
        assert!(store.validate_key(&id("dev"), &"new".to_string()));
    }

    #[test]
    fn delete_then_validate_requires_empty_key() {
        let store = MemoryAuthStore::new();
        store.set_key(&id("dev"), &"key".to_string());
        store.delete(&id("dev"));
        assert!(store.validate_key(&id("dev"), &String::new()));
        assert!(!store.validate_key(&id("dev"), &"key".to_string()));
    }
}
