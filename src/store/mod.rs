//! Shared resource store
//!
//! All cross-instance state (runtime records, reverse lookups, the active
//! index, idle timers and the port pool) lives behind [`ResourceStore`]. The
//! operations mirror a Redis-like server: TTL keys with expiry notifications,
//! lists, hashes and sorted sets. Each single-key operation is atomic.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// Remaining lifetime of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

impl KeyTtl {
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            KeyTtl::Expires(d) => Some(*d),
            _ => None,
        }
    }
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a string value, clearing any TTL
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Set a string value that expires after `ttl`
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Returns whether the key existed
    async fn del(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// Attach a TTL to an existing key; false if the key is missing
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Append values to a list, returning its new length
    async fn rpush(&self, key: &str, values: &[String]) -> Result<usize>;

    async fn lpop(&self, key: &str) -> Result<Option<String>>;

    async fn llen(&self, key: &str) -> Result<usize>;

    /// Remove every occurrence of `value`, returning how many were removed
    async fn lrem(&self, key: &str, value: &str) -> Result<usize>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hkeys(&self, key: &str) -> Result<Vec<String>>;

    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// All members in ascending score order
    async fn zrange(&self, key: &str) -> Result<Vec<(String, f64)>>;

    /// Receive the names of keys removed because their TTL ran out
    fn subscribe_expired(&self) -> broadcast::Receiver<String>;

    /// Evict every key whose TTL has passed and publish each one
    async fn purge_expired(&self) -> Result<Vec<String>>;
}

/// Open the store selected in the configuration
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn ResourceStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory resource store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Sqlite => Ok(Arc::new(SqliteStore::open(&config.path)?)),
    }
}

/// Key layout shared by every component
pub mod keys {
    pub const PREFIX: &str = "spinhost:";

    pub const ACTIVE: &str = "spinhost:active";
    pub const PORT_POOL: &str = "spinhost:ports:pool";
    pub const PORTS_ALLOCATED: &str = "spinhost:ports:allocated";

    const IDLE_PREFIX: &str = "spinhost:idle:";

    pub fn spinlet(spinlet_id: &str) -> String {
        format!("{}spinlets:{}", PREFIX, spinlet_id)
    }

    pub fn service_path(path: &str) -> String {
        format!("{}servicepath:{}", PREFIX, path)
    }

    pub fn domain(domain: &str) -> String {
        format!("{}domain:{}", PREFIX, domain)
    }

    pub fn idle(spinlet_id: &str) -> String {
        format!("{}{}", IDLE_PREFIX, spinlet_id)
    }

    /// Spinlet id of an idle-timer key
    pub fn idle_spinlet_id(key: &str) -> Option<&str> {
        key.strip_prefix(IDLE_PREFIX).filter(|id| !id.is_empty())
    }

    pub fn metrics(spinlet_id: &str, timestamp_ms: i64) -> String {
        format!("{}metrics:resources:{}:{}", PREFIX, spinlet_id, timestamp_ms)
    }

    pub fn build_status(spinlet_id: &str) -> String {
        format!("{}builds:{}:status", PREFIX, spinlet_id)
    }

    pub fn build_result(spinlet_id: &str) -> String {
        format!("{}builds:{}:result", PREFIX, spinlet_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(keys::spinlet("abc"), "spinhost:spinlets:abc");
        assert_eq!(keys::service_path("localhost:3000"), "spinhost:servicepath:localhost:3000");
        assert_eq!(keys::domain("a.test"), "spinhost:domain:a.test");
        assert_eq!(keys::metrics("abc", 17), "spinhost:metrics:resources:abc:17");
        assert_eq!(keys::build_result("abc"), "spinhost:builds:abc:result");
    }

    #[test]
    fn test_idle_key_parsing() {
        let key = keys::idle("web-1");
        assert_eq!(keys::idle_spinlet_id(&key), Some("web-1"));
        assert_eq!(keys::idle_spinlet_id("spinhost:idle:"), None);
        assert_eq!(keys::idle_spinlet_id("spinhost:spinlets:web-1"), None);
    }

    #[test]
    fn test_open_memory_store() {
        let store = open_store(&StoreConfig::default()).unwrap();
        let _rx = store.subscribe_expired();
    }

    #[test]
    fn test_key_ttl_remaining() {
        assert_eq!(KeyTtl::Missing.remaining(), None);
        assert_eq!(KeyTtl::Persistent.remaining(), None);
        assert_eq!(
            KeyTtl::Expires(Duration::from_secs(3)).remaining(),
            Some(Duration::from_secs(3))
        );
    }
}
