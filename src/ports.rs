//! Port allocator
//!
//! Hands out ports from a fixed range. Free ports sit in a FIFO list in the
//! resource store and claimed ports in a `port -> spinlet id` hash; a port is
//! never in both. If the free list is lost or drained the allocator falls
//! back to scanning the whole range against the claimed map.

use crate::config::PortRangeConfig;
use crate::error::{Result, SpinError};
use crate::store::{keys, ResourceStore};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct PortAllocator {
    store: Arc<dyn ResourceStore>,
    range: PortRangeConfig,
}

impl PortAllocator {
    pub fn new(store: Arc<dyn ResourceStore>, range: PortRangeConfig) -> Self {
        Self { store, range }
    }

    pub fn range(&self) -> PortRangeConfig {
        self.range
    }

    fn exhausted(&self) -> SpinError {
        SpinError::ResourceExhausted {
            start: self.range.range_start,
            end: self.range.range_end,
        }
    }

    /// Fill the free list if it is empty
    ///
    /// Safe to call on every start. Ports already claimed are left out so the
    /// free list and the claimed map stay disjoint.
    pub async fn initialize(&self) -> Result<()> {
        if self.store.llen(keys::PORT_POOL).await? > 0 {
            debug!("Port pool already initialized");
            return Ok(());
        }

        let claimed = self.claimed_ports().await?;
        let free: Vec<String> = (self.range.range_start..=self.range.range_end)
            .filter(|port| !claimed.contains(port))
            .map(|port| port.to_string())
            .collect();

        if !free.is_empty() {
            self.store.rpush(keys::PORT_POOL, &free).await?;
        }

        info!(
            start = self.range.range_start,
            end = self.range.range_end,
            free = free.len(),
            claimed = claimed.len(),
            "Port pool initialized"
        );
        Ok(())
    }

    /// Claim a free port for `spinlet_id`
    pub async fn allocate(&self, spinlet_id: &str) -> Result<u16> {
        while let Some(raw) = self.store.lpop(keys::PORT_POOL).await? {
            let port = match raw.parse::<u16>() {
                Ok(port) if self.range.contains(port) => port,
                _ => {
                    warn!(entry = %raw, "Dropping invalid port pool entry");
                    continue;
                }
            };

            if self
                .store
                .hget(keys::PORTS_ALLOCATED, &port.to_string())
                .await?
                .is_some()
            {
                warn!(port, "Port in free pool was already allocated, skipping");
                continue;
            }

            self.store
                .hset(keys::PORTS_ALLOCATED, &port.to_string(), spinlet_id)
                .await?;
            debug!(port, spinlet_id, "Allocated port");
            return Ok(port);
        }

        // Pool drained or lost; look for any port nobody has claimed
        let claimed = self.claimed_ports().await?;
        let port = (self.range.range_start..=self.range.range_end)
            .find(|port| !claimed.contains(port))
            .ok_or_else(|| self.exhausted())?;

        self.store
            .hset(keys::PORTS_ALLOCATED, &port.to_string(), spinlet_id)
            .await?;
        warn!(port, spinlet_id, "Port pool empty, allocated by range scan");
        Ok(port)
    }

    /// Claim a specific port, e.g. one pinned by the launch spec
    pub async fn reserve(&self, port: u16, spinlet_id: &str) -> Result<()> {
        let field = port.to_string();
        if let Some(owner) = self.store.hget(keys::PORTS_ALLOCATED, &field).await? {
            if owner != spinlet_id {
                return Err(SpinError::ResourceExhausted {
                    start: port,
                    end: port,
                });
            }
        }

        if self.range.contains(port) {
            self.store.lrem(keys::PORT_POOL, &field).await?;
        }
        self.store
            .hset(keys::PORTS_ALLOCATED, &field, spinlet_id)
            .await?;
        debug!(port, spinlet_id, "Reserved fixed port");
        Ok(())
    }

    /// Return a port to the free list
    ///
    /// Idempotent: releasing a free port leaves exactly one copy in the list.
    pub async fn release(&self, port: u16) -> Result<()> {
        let field = port.to_string();
        self.store.hdel(keys::PORTS_ALLOCATED, &field).await?;

        if self.range.contains(port) {
            self.store.lrem(keys::PORT_POOL, &field).await?;
            self.store.rpush(keys::PORT_POOL, &[field]).await?;
        }
        debug!(port, "Released port");
        Ok(())
    }

    /// Release `port` unless it has since been claimed by another spinlet
    ///
    /// Returns whether the port was released.
    pub async fn release_for(&self, port: u16, spinlet_id: &str) -> Result<bool> {
        match self
            .store
            .hget(keys::PORTS_ALLOCATED, &port.to_string())
            .await?
        {
            Some(owner) if owner != spinlet_id => {
                warn!(port, spinlet_id, owner = %owner, "Port now belongs to another spinlet, not releasing");
                Ok(false)
            }
            _ => {
                self.release(port).await?;
                Ok(true)
            }
        }
    }

    pub async fn is_allocated(&self, port: u16) -> Result<bool> {
        Ok(self
            .store
            .hget(keys::PORTS_ALLOCATED, &port.to_string())
            .await?
            .is_some())
    }

    pub async fn list_allocated(&self) -> Result<BTreeMap<u16, String>> {
        let raw = self.store.hgetall(keys::PORTS_ALLOCATED).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(port, id)| port.parse().ok().map(|p| (p, id)))
            .collect())
    }

    async fn claimed_ports(&self) -> Result<HashSet<u16>> {
        Ok(self
            .store
            .hkeys(keys::PORTS_ALLOCATED)
            .await?
            .into_iter()
            .filter_map(|port| port.parse().ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn allocator(start: u16, end: u16) -> (PortAllocator, Arc<dyn ResourceStore>) {
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        let ports = PortAllocator::new(store.clone(), PortRangeConfig::new(start, end));
        ports.initialize().await.unwrap();
        (ports, store)
    }

    async fn pool(store: &Arc<dyn ResourceStore>) -> Vec<u16> {
        let mut out: Vec<u16> = Vec::new();
        let len = store.llen(keys::PORT_POOL).await.unwrap();
        for _ in 0..len {
            let v = store.lpop(keys::PORT_POOL).await.unwrap().unwrap();
            out.push(v.parse().unwrap());
        }
        let restore: Vec<String> = out.iter().map(|p| p.to_string()).collect();
        if !restore.is_empty() {
            store.rpush(keys::PORT_POOL, &restore).await.unwrap();
        }
        out
    }

    #[tokio::test]
    async fn test_allocates_in_order_then_exhausts() {
        let (ports, _) = allocator(3000, 3002).await;

        assert_eq!(ports.allocate("a").await.unwrap(), 3000);
        assert_eq!(ports.allocate("b").await.unwrap(), 3001);
        assert_eq!(ports.allocate("c").await.unwrap(), 3002);

        let err = ports.allocate("d").await.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.to_string(), "no available ports in range 3000-3002");
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (ports, store) = allocator(3000, 3004).await;
        ports.initialize().await.unwrap();
        assert_eq!(store.llen(keys::PORT_POOL).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_initialize_skips_claimed_ports() {
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        store.hset(keys::PORTS_ALLOCATED, "3001", "survivor").await.unwrap();

        let ports = PortAllocator::new(store.clone(), PortRangeConfig::new(3000, 3002));
        ports.initialize().await.unwrap();

        assert_eq!(pool(&store).await, vec![3000, 3002]);
    }

    #[tokio::test]
    async fn test_release_returns_port_once() {
        let (ports, store) = allocator(3000, 3001).await;
        let port = ports.allocate("a").await.unwrap();
        assert!(ports.is_allocated(port).await.unwrap());

        ports.release(port).await.unwrap();
        ports.release(port).await.unwrap();

        assert!(!ports.is_allocated(port).await.unwrap());
        assert_eq!(pool(&store).await, vec![3001, 3000]);
    }

    #[tokio::test]
    async fn test_release_never_allocated_port() {
        let (ports, store) = allocator(3000, 3001).await;
        ports.release(3001).await.unwrap();
        assert_eq!(pool(&store).await, vec![3000, 3001]);
        // Out-of-range ports never enter the pool
        ports.release(9000).await.unwrap();
        assert_eq!(store.llen(keys::PORT_POOL).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_scan_fallback_when_pool_lost() {
        let (ports, store) = allocator(3000, 3002).await;
        assert_eq!(ports.allocate("a").await.unwrap(), 3000);

        // Simulate a flushed pool
        store.del(keys::PORT_POOL).await.unwrap();

        assert_eq!(ports.allocate("b").await.unwrap(), 3001);
        assert_eq!(ports.allocate("c").await.unwrap(), 3002);
        assert!(ports.allocate("d").await.unwrap_err().is_exhausted());
    }

    #[tokio::test]
    async fn test_stale_pool_entry_skipped() {
        let (ports, store) = allocator(3000, 3001).await;
        // 3000 claimed behind the allocator's back while still pooled
        store.hset(keys::PORTS_ALLOCATED, "3000", "other").await.unwrap();
        store.rpush(keys::PORT_POOL, &["junk".to_string()]).await.unwrap();

        assert_eq!(ports.allocate("a").await.unwrap(), 3001);
        assert!(ports.allocate("b").await.unwrap_err().is_exhausted());
    }

    #[tokio::test]
    async fn test_release_for_respects_new_owner() {
        let (ports, _) = allocator(3000, 3000).await;
        let port = ports.allocate("old").await.unwrap();
        ports.release(port).await.unwrap();
        assert_eq!(ports.allocate("new").await.unwrap(), port);

        assert!(!ports.release_for(port, "old").await.unwrap());
        assert!(ports.is_allocated(port).await.unwrap());
        assert!(ports.release_for(port, "new").await.unwrap());
        assert!(!ports.is_allocated(port).await.unwrap());
    }

    #[tokio::test]
    async fn test_reserve_fixed_port() {
        let (ports, store) = allocator(3000, 3002).await;
        ports.reserve(3001, "pinned").await.unwrap();
        assert_eq!(pool(&store).await, vec![3000, 3002]);

        let err = ports.reserve(3001, "intruder").await.unwrap_err();
        assert!(err.is_exhausted());
        // Re-reserving for the same owner is fine
        ports.reserve(3001, "pinned").await.unwrap();

        let allocated = ports.list_allocated().await.unwrap();
        assert_eq!(allocated.get(&3001).map(String::as_str), Some("pinned"));
    }

    #[tokio::test]
    async fn test_no_port_held_twice() {
        let (ports, _) = allocator(3000, 3009).await;
        let mut held = HashSet::new();
        for round in 0..5 {
            for i in 0..10 {
                let port = ports.allocate(&format!("s{}-{}", round, i)).await.unwrap();
                assert!(held.insert(port), "port {} handed out twice", port);
            }
            assert!(ports.allocate("extra").await.is_err());
            for port in held.drain() {
                ports.release(port).await.unwrap();
            }
        }
    }
}
