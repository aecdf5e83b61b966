use super::{KeyTtl, ResourceStore};
use crate::error::{Result, SpinError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
    ZSet(HashMap<String, f64>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::List(l) => l.is_empty(),
            Value::Hash(h) => h.is_empty(),
            Value::ZSet(z) => z.is_empty(),
        }
    }
}

#[derive(Default)]
struct Inner {
    data: HashMap<String, Value>,
    expires: HashMap<String, Instant>,
}

impl Inner {
    /// Drop `key` if its TTL has passed; returns whether it was dropped
    fn expire_if_due(&mut self, key: &str, now: Instant) -> bool {
        match self.expires.get(key) {
            Some(at) if *at <= now => {
                self.expires.remove(key);
                self.data.remove(key);
                true
            }
            _ => false,
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        self.expires.remove(key);
        self.data.remove(key).is_some()
    }

    /// Collections vanish once their last element is removed
    fn drop_if_empty(&mut self, key: &str) {
        if self.data.get(key).is_some_and(Value::is_empty) {
            self.remove(key);
        }
    }

    fn list_mut(&mut self, key: &str) -> Result<&mut VecDeque<String>> {
        match self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()))
        {
            Value::List(list) => Ok(list),
            _ => Err(wrong_type(key)),
        }
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut HashMap<String, String>> {
        match self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(HashMap::new()))
        {
            Value::Hash(hash) => Ok(hash),
            _ => Err(wrong_type(key)),
        }
    }

    fn zset_mut(&mut self, key: &str) -> Result<&mut HashMap<String, f64>> {
        match self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::ZSet(HashMap::new()))
        {
            Value::ZSet(zset) => Ok(zset),
            _ => Err(wrong_type(key)),
        }
    }
}

fn wrong_type(key: &str) -> SpinError {
    SpinError::store(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

/// Process-local resource store
///
/// State does not survive a restart; use [`super::SqliteStore`] for that.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    expired: broadcast::Sender<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (expired, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Inner::default()),
            expired,
        }
    }

    /// Run `f` against the store after lazily expiring `key`
    fn access<R>(&self, key: &str, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock();
        if inner.expire_if_due(key, Instant::now()) {
            trace!(key, "Key expired on access");
            let _ = self.expired.send(key.to_string());
        }
        f(&mut *inner)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.access(key, |inner| match inner.data.get(key) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.access(key, |inner| {
            inner.expires.remove(key);
            inner.data.insert(key.to_string(), Value::Str(value.to_string()));
            Ok(())
        })
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.access(key, |inner| {
            inner.data.insert(key.to_string(), Value::Str(value.to_string()));
            inner.expires.insert(key.to_string(), Instant::now() + ttl);
            Ok(())
        })
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.access(key, |inner| Ok(inner.remove(key)))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.access(key, |inner| Ok(inner.data.contains_key(key)))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.access(key, |inner| {
            if !inner.data.contains_key(key) {
                return Ok(KeyTtl::Missing);
            }
            Ok(match inner.expires.get(key) {
                Some(at) => KeyTtl::Expires(at.saturating_duration_since(Instant::now())),
                None => KeyTtl::Persistent,
            })
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.access(key, |inner| {
            if !inner.data.contains_key(key) {
                return Ok(false);
            }
            inner.expires.insert(key.to_string(), Instant::now() + ttl);
            Ok(true)
        })
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<usize> {
        self.access(key, |inner| {
            let list = inner.list_mut(key)?;
            list.extend(values.iter().cloned());
            let len = list.len();
            inner.drop_if_empty(key);
            Ok(len)
        })
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        self.access(key, |inner| {
            if !inner.data.contains_key(key) {
                return Ok(None);
            }
            let value = inner.list_mut(key)?.pop_front();
            inner.drop_if_empty(key);
            Ok(value)
        })
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.access(key, |inner| match inner.data.get(key) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<usize> {
        self.access(key, |inner| {
            if !inner.data.contains_key(key) {
                return Ok(0);
            }
            let list = inner.list_mut(key)?;
            let before = list.len();
            list.retain(|v| v != value);
            let removed = before - list.len();
            inner.drop_if_empty(key);
            Ok(removed)
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.access(key, |inner| {
            inner
                .hash_mut(key)?
                .insert(field.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        self.access(key, |inner| {
            let hash = inner.hash_mut(key)?;
            for (field, value) in fields {
                hash.insert(field.clone(), value.clone());
            }
            inner.drop_if_empty(key);
            Ok(())
        })
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.access(key, |inner| match inner.data.get(key) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.access(key, |inner| match inner.data.get(key) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        self.access(key, |inner| match inner.data.get(key) {
            None => Ok(Vec::new()),
            Some(Value::Hash(hash)) => Ok(hash.keys().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        self.access(key, |inner| {
            if !inner.data.contains_key(key) {
                return Ok(false);
            }
            let removed = inner.hash_mut(key)?.remove(field).is_some();
            inner.drop_if_empty(key);
            Ok(removed)
        })
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.access(key, |inner| {
            inner.zset_mut(key)?.insert(member.to_string(), score);
            Ok(())
        })
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        self.access(key, |inner| {
            if !inner.data.contains_key(key) {
                return Ok(false);
            }
            let removed = inner.zset_mut(key)?.remove(member).is_some();
            inner.drop_if_empty(key);
            Ok(removed)
        })
    }

    async fn zrange(&self, key: &str) -> Result<Vec<(String, f64)>> {
        self.access(key, |inner| match inner.data.get(key) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(zset)) => {
                let mut members: Vec<(String, f64)> =
                    zset.iter().map(|(m, s)| (m.clone(), *s)).collect();
                members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                Ok(members)
            }
            Some(_) => Err(wrong_type(key)),
        })
    }

    fn subscribe_expired(&self) -> broadcast::Receiver<String> {
        self.expired.subscribe()
    }

    async fn purge_expired(&self) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let due: Vec<String> = inner
            .expires
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &due {
            inner.remove(key);
            trace!(key = %key, "Key expired");
            let _ = self.expired.send(key.clone());
        }
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_string_set_get_del() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.ttl("k").await.unwrap(), KeyTtl::Persistent);

        assert!(store.del("k").await.unwrap());
        assert!(!store.del("k").await.unwrap());
        assert_eq!(store.ttl("k").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn test_set_clears_ttl() {
        let store = MemoryStore::new();
        store.set_ex("k", "1", Duration::from_secs(60)).await.unwrap();
        assert!(matches!(store.ttl("k").await.unwrap(), KeyTtl::Expires(_)));

        store.set("k", "2").await.unwrap();
        assert_eq!(store.ttl("k").await.unwrap(), KeyTtl::Persistent);
    }

    #[tokio::test]
    async fn test_expired_key_is_absent_and_published() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe_expired();

        store.set_ex("idle", "1", Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!store.exists("idle").await.unwrap());
        assert_eq!(rx.recv().await.unwrap(), "idle");
        // Already gone, nothing left to purge
        assert!(store.purge_expired().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired_publishes_each_key_once() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe_expired();

        store.set_ex("a", "1", Duration::from_millis(10)).await.unwrap();
        store.set_ex("b", "1", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let purged = store.purge_expired().await.unwrap();
        assert_eq!(purged, vec!["a".to_string()]);
        assert_eq!(rx.recv().await.unwrap(), "a");
        assert!(rx.try_recv().is_err());
        assert!(store.exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_expire_missing_key() {
        let store = MemoryStore::new();
        assert!(!store.expire("nope", Duration::from_secs(1)).await.unwrap());
        store.hset("h", "f", "v").await.unwrap();
        assert!(store.expire("h", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_fifo() {
        let store = MemoryStore::new();
        assert_eq!(store.rpush("l", &strings(&["1", "2", "3"])).await.unwrap(), 3);
        assert_eq!(store.lpop("l").await.unwrap(), Some("1".to_string()));
        assert_eq!(store.llen("l").await.unwrap(), 2);

        store.rpush("l", &strings(&["2"])).await.unwrap();
        assert_eq!(store.lrem("l", "2").await.unwrap(), 2);
        assert_eq!(store.lpop("l").await.unwrap(), Some("3".to_string()));
        assert_eq!(store.lpop("l").await.unwrap(), None);
        assert!(!store.exists("l").await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_ops() {
        let store = MemoryStore::new();
        store
            .hset_many("h", &[("a".into(), "1".into()), ("b".into(), "2".into())])
            .await
            .unwrap();
        store.hset("h", "c", "3").await.unwrap();

        assert_eq!(store.hget("h", "b").await.unwrap(), Some("2".to_string()));
        let mut keys = store.hkeys("h").await.unwrap();
        keys.sort();
        assert_eq!(keys, strings(&["a", "b", "c"]));
        assert_eq!(store.hgetall("h").await.unwrap().len(), 3);

        assert!(store.hdel("h", "a").await.unwrap());
        assert!(!store.hdel("h", "a").await.unwrap());
        assert!(!store.hdel("missing", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_zset_ordering() {
        let store = MemoryStore::new();
        store.zadd("z", "late", 30.0).await.unwrap();
        store.zadd("z", "early", 10.0).await.unwrap();
        store.zadd("z", "mid", 20.0).await.unwrap();
        store.zadd("z", "early", 25.0).await.unwrap();

        let members: Vec<String> = store
            .zrange("z")
            .await
            .unwrap()
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(members, strings(&["mid", "early", "late"]));

        assert!(store.zrem("z", "mid").await.unwrap());
        assert_eq!(store.zrange("z").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_wrong_type_is_store_error() {
        let store = MemoryStore::new();
        store.set("s", "v").await.unwrap();
        let err = store.rpush("s", &strings(&["x"])).await.unwrap_err();
        assert!(matches!(err, SpinError::Store(_)));
        assert!(store.hget("s", "f").await.is_err());
        // Failed op leaves the original value intact
        assert_eq!(store.get("s").await.unwrap(), Some("v".to_string()));
    }
}
