//! Broker client registry.
//!
//! One client per connection target: repeat construction against the same
//! host and credentials returns the existing instance. The registry is an
//! explicit object owned by the application's composition root, not a
//! process-wide global.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::bus::Client;
use crate::config::BrokerConfig;

#[derive(Default)]
struct RegistryInner {
    /// Fingerprint → client.
    clients: HashMap<String, Arc<Client>>,
    /// Tag → fingerprint.
    tags: HashMap<String, String>,
}

/// Get-or-create store of broker clients keyed by connection fingerprint.
#[derive(Default)]
pub struct ClientRegistry {
    inner: Mutex<RegistryInner>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the client for this connection target, constructing it on
    /// first use. The tag becomes an alias for later lookup.
    pub fn get_or_create(&self, tag: &str, config: BrokerConfig) -> Arc<Client> {
        let fingerprint = config.fingerprint();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .tags
            .insert(tag.to_lowercase(), fingerprint.clone());
        if let Some(existing) = inner.clients.get(&fingerprint) {
            return Arc::clone(existing);
        }
        let client = Client::connect(tag, config);
        inner.clients.insert(fingerprint, Arc::clone(&client));
        client
    }

    /// Look a client up by the tag it was registered under.
    pub fn by_tag(&self, tag: &str) -> Option<Arc<Client>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let fingerprint = inner.tags.get(&tag.to_lowercase())?;
        inner.clients.get(fingerprint).cloned()
    }

    /// Number of distinct connection targets.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_target_returns_same_client() {
        let registry = ClientRegistry::new();
        let first = registry.get_or_create("orders", BrokerConfig::default());
        let second = registry.get_or_create("billing", BrokerConfig::default());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_different_credentials_get_distinct_clients() {
        let registry = ClientRegistry::new();
        let first = registry.get_or_create("orders", BrokerConfig::default());
        let second = registry.get_or_create(
            "orders-admin",
            BrokerConfig {
                username: "admin".to_string(),
                ..Default::default()
            },
        );
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_by_tag_lookup_is_case_insensitive() {
        let registry = ClientRegistry::new();
        let client = registry.get_or_create("Orders", BrokerConfig::default());
        let found = registry.by_tag("ORDERS").expect("tag registered");
        assert!(Arc::ptr_eq(&client, &found));
        assert!(registry.by_tag("unknown").is_none());
    }
}
