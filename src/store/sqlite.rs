//! SQLite-backed resource store
//!
//! Keeps the same key/list/hash/sorted-set semantics as the memory store but
//! persists them, so runtime records, the port pool and idle timers survive a
//! daemon restart. Expiry times are stored as epoch milliseconds.

use super::{KeyTtl, ResourceStore};
use crate::error::{Result, SpinError};
use crate::spinlet::now_ms;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

const KIND_STRING: &str = "string";
const KIND_LIST: &str = "list";
const KIND_HASH: &str = "hash";
const KIND_ZSET: &str = "zset";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    expired: broadcast::Sender<String>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let store = Self::with_connection(conn)?;
        info!("Resource store opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        run_migrations(&conn)?;
        let (expired, _) = broadcast::channel(1024);
        Ok(Self {
            conn: Mutex::new(conn),
            expired,
        })
    }

    /// Run `f` inside a transaction after lazily expiring `key`
    fn access<R>(&self, key: &str, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let expired = expire_if_due(&tx, key, now_ms())?;
        let result = f(&tx)?;
        tx.commit()?;

        if expired {
            debug!(key, "Key expired on access");
            let _ = self.expired.send(key.to_string());
        }
        Ok(result)
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < SCHEMA_VERSION {
        info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

        if current_version < 1 {
            migrate_v1(conn)?;
        }
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS store_keys (
            key TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            value TEXT,
            expires_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_store_keys_expires ON store_keys(expires_at)
            WHERE expires_at IS NOT NULL;

        CREATE TABLE IF NOT EXISTS list_items (
            key TEXT NOT NULL REFERENCES store_keys(key) ON DELETE CASCADE,
            seq INTEGER NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (key, seq)
        );

        CREATE TABLE IF NOT EXISTS hash_fields (
            key TEXT NOT NULL REFERENCES store_keys(key) ON DELETE CASCADE,
            field TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (key, field)
        );

        CREATE TABLE IF NOT EXISTS zset_members (
            key TEXT NOT NULL REFERENCES store_keys(key) ON DELETE CASCADE,
            member TEXT NOT NULL,
            score REAL NOT NULL,
            PRIMARY KEY (key, member)
        );

        INSERT INTO schema_migrations (version) VALUES (1);
        ",
    )?;

    debug!("Applied migration v1: resource store tables");
    Ok(())
}

fn ttl_to_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn expire_if_due(conn: &Connection, key: &str, now: i64) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM store_keys WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
        params![key, now],
    )?;
    Ok(removed > 0)
}

fn kind_of(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT kind FROM store_keys WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

/// Check the key holds `kind`; false when the key does not exist
fn check_kind(conn: &Connection, key: &str, kind: &str) -> Result<bool> {
    match kind_of(conn, key)? {
        None => Ok(false),
        Some(k) if k == kind => Ok(true),
        Some(_) => Err(wrong_type(key)),
    }
}

/// Create the key row for a collection if needed
fn ensure_kind(conn: &Connection, key: &str, kind: &str) -> Result<()> {
    if !check_kind(conn, key, kind)? {
        conn.execute(
            "INSERT INTO store_keys (key, kind) VALUES (?1, ?2)",
            params![key, kind],
        )?;
    }
    Ok(())
}

/// Collections vanish once their last element is removed
fn drop_if_empty(conn: &Connection, key: &str, table: &str) -> Result<()> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE key = ?1", table),
        params![key],
        |row| row.get(0),
    )?;
    if count == 0 {
        conn.execute("DELETE FROM store_keys WHERE key = ?1", params![key])?;
    }
    Ok(())
}

fn wrong_type(key: &str) -> SpinError {
    SpinError::store(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

#[async_trait]
impl ResourceStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.access(key, |conn| {
            if !check_kind(conn, key, KIND_STRING)? {
                return Ok(None);
            }
            Ok(conn.query_row(
                "SELECT value FROM store_keys WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )?)
        })
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.access(key, |conn| {
            conn.execute("DELETE FROM store_keys WHERE key = ?1", params![key])?;
            conn.execute(
                "INSERT INTO store_keys (key, kind, value) VALUES (?1, ?2, ?3)",
                params![key, KIND_STRING, value],
            )?;
            Ok(())
        })
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = now_ms().saturating_add(ttl_to_ms(ttl));
        self.access(key, |conn| {
            conn.execute("DELETE FROM store_keys WHERE key = ?1", params![key])?;
            conn.execute(
                "INSERT INTO store_keys (key, kind, value, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![key, KIND_STRING, value, expires_at],
            )?;
            Ok(())
        })
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.access(key, |conn| {
            Ok(conn.execute("DELETE FROM store_keys WHERE key = ?1", params![key])? > 0)
        })
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.access(key, |conn| Ok(kind_of(conn, key)?.is_some()))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.access(key, |conn| {
            let row: Option<Option<i64>> = conn
                .query_row(
                    "SELECT expires_at FROM store_keys WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(match row {
                None => KeyTtl::Missing,
                Some(None) => KeyTtl::Persistent,
                Some(Some(at)) => {
                    let remaining = (at - now_ms()).max(0) as u64;
                    KeyTtl::Expires(Duration::from_millis(remaining))
                }
            })
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let expires_at = now_ms().saturating_add(ttl_to_ms(ttl));
        self.access(key, |conn| {
            let updated = conn.execute(
                "UPDATE store_keys SET expires_at = ?2 WHERE key = ?1",
                params![key, expires_at],
            )?;
            Ok(updated > 0)
        })
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<usize> {
        self.access(key, |conn| {
            if values.is_empty() {
                check_kind(conn, key, KIND_LIST)?;
            } else {
                ensure_kind(conn, key, KIND_LIST)?;
                let mut next: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(seq), 0) + 1 FROM list_items WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )?;
                let mut stmt =
                    conn.prepare("INSERT INTO list_items (key, seq, value) VALUES (?1, ?2, ?3)")?;
                for value in values {
                    stmt.execute(params![key, next, value])?;
                    next += 1;
                }
            }
            let len: i64 = conn.query_row(
                "SELECT COUNT(*) FROM list_items WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )?;
            Ok(len as usize)
        })
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        self.access(key, |conn| {
            if !check_kind(conn, key, KIND_LIST)? {
                return Ok(None);
            }
            let head: Option<(i64, String)> = conn
                .query_row(
                    "SELECT seq, value FROM list_items WHERE key = ?1 ORDER BY seq LIMIT 1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((seq, value)) = head else {
                return Ok(None);
            };
            conn.execute(
                "DELETE FROM list_items WHERE key = ?1 AND seq = ?2",
                params![key, seq],
            )?;
            drop_if_empty(conn, key, "list_items")?;
            Ok(Some(value))
        })
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.access(key, |conn| {
            if !check_kind(conn, key, KIND_LIST)? {
                return Ok(0);
            }
            let len: i64 = conn.query_row(
                "SELECT COUNT(*) FROM list_items WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )?;
            Ok(len as usize)
        })
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<usize> {
        self.access(key, |conn| {
            if !check_kind(conn, key, KIND_LIST)? {
                return Ok(0);
            }
            let removed = conn.execute(
                "DELETE FROM list_items WHERE key = ?1 AND value = ?2",
                params![key, value],
            )?;
            drop_if_empty(conn, key, "list_items")?;
            Ok(removed)
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.access(key, |conn| {
            ensure_kind(conn, key, KIND_HASH)?;
            conn.execute(
                "INSERT INTO hash_fields (key, field, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
                params![key, field, value],
            )?;
            Ok(())
        })
    }

    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.access(key, |conn| {
            ensure_kind(conn, key, KIND_HASH)?;
            let mut stmt = conn.prepare(
                "INSERT INTO hash_fields (key, field, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
            )?;
            for (field, value) in fields {
                stmt.execute(params![key, field, value])?;
            }
            Ok(())
        })
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.access(key, |conn| {
            if !check_kind(conn, key, KIND_HASH)? {
                return Ok(None);
            }
            Ok(conn
                .query_row(
                    "SELECT value FROM hash_fields WHERE key = ?1 AND field = ?2",
                    params![key, field],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.access(key, |conn| {
            if !check_kind(conn, key, KIND_HASH)? {
                return Ok(HashMap::new());
            }
            let mut stmt = conn.prepare("SELECT field, value FROM hash_fields WHERE key = ?1")?;
            let rows = stmt.query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let mut fields = HashMap::new();
            for row in rows {
                let (field, value): (String, String) = row?;
                fields.insert(field, value);
            }
            Ok(fields)
        })
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        self.access(key, |conn| {
            if !check_kind(conn, key, KIND_HASH)? {
                return Ok(Vec::new());
            }
            let mut stmt = conn.prepare("SELECT field FROM hash_fields WHERE key = ?1")?;
            let rows = stmt.query_map(params![key], |row| row.get(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
        })
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        self.access(key, |conn| {
            if !check_kind(conn, key, KIND_HASH)? {
                return Ok(false);
            }
            let removed = conn.execute(
                "DELETE FROM hash_fields WHERE key = ?1 AND field = ?2",
                params![key, field],
            )?;
            drop_if_empty(conn, key, "hash_fields")?;
            Ok(removed > 0)
        })
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.access(key, |conn| {
            ensure_kind(conn, key, KIND_ZSET)?;
            conn.execute(
                "INSERT INTO zset_members (key, member, score) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key, member) DO UPDATE SET score = excluded.score",
                params![key, member, score],
            )?;
            Ok(())
        })
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        self.access(key, |conn| {
            if !check_kind(conn, key, KIND_ZSET)? {
                return Ok(false);
            }
            let removed = conn.execute(
                "DELETE FROM zset_members WHERE key = ?1 AND member = ?2",
                params![key, member],
            )?;
            drop_if_empty(conn, key, "zset_members")?;
            Ok(removed > 0)
        })
    }

    async fn zrange(&self, key: &str) -> Result<Vec<(String, f64)>> {
        self.access(key, |conn| {
            if !check_kind(conn, key, KIND_ZSET)? {
                return Ok(Vec::new());
            }
            let mut stmt = conn.prepare(
                "SELECT member, score FROM zset_members WHERE key = ?1 ORDER BY score, member",
            )?;
            let rows = stmt.query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?;
            Ok(rows.collect::<rusqlite::Result<Vec<(String, f64)>>>()?)
        })
    }

    fn subscribe_expired(&self) -> broadcast::Receiver<String> {
        self.expired.subscribe()
    }

    async fn purge_expired(&self) -> Result<Vec<String>> {
        let due: Vec<String> = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let now = now_ms();
            let due = {
                let mut stmt = tx.prepare(
                    "SELECT key FROM store_keys WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                )?;
                let rows = stmt.query_map(params![now], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<String>>>()?
            };
            tx.execute(
                "DELETE FROM store_keys WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )?;
            tx.commit()?;
            due
        };

        for key in &due {
            debug!(key = %key, "Key expired");
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
    async fn test_strings_and_ttl() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.ttl("k").await.unwrap(), KeyTtl::Persistent);

        assert!(store.expire("k", Duration::from_secs(60)).await.unwrap());
        match store.ttl("k").await.unwrap() {
            KeyTtl::Expires(d) => assert!(d <= Duration::from_secs(60) && d > Duration::from_secs(55)),
            other => panic!("unexpected ttl {:?}", other),
        }

        store.set("k", "w").await.unwrap();
        assert_eq!(store.ttl("k").await.unwrap(), KeyTtl::Persistent);
        assert!(store.del("k").await.unwrap());
        assert_eq!(store.ttl("k").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn test_expiry_publishes() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut rx = store.subscribe_expired();

        store.set_ex("a", "1", Duration::from_millis(10)).await.unwrap();
        store.set_ex("b", "1", Duration::from_millis(10)).await.unwrap();
        store.set_ex("c", "1", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(rx.recv().await.unwrap(), "a");

        let purged = store.purge_expired().await.unwrap();
        assert_eq!(purged, vec!["b".to_string()]);
        assert_eq!(rx.recv().await.unwrap(), "b");
        assert!(store.exists("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_ops() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.rpush("l", &strings(&["1", "2", "3", "2"])).await.unwrap(), 4);
        assert_eq!(store.lpop("l").await.unwrap(), Some("1".to_string()));
        assert_eq!(store.lrem("l", "2").await.unwrap(), 2);
        assert_eq!(store.llen("l").await.unwrap(), 1);
        assert_eq!(store.lpop("l").await.unwrap(), Some("3".to_string()));
        assert_eq!(store.lpop("l").await.unwrap(), None);
        assert!(!store.exists("l").await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_and_zset_ops() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .hset_many("h", &[("a".into(), "1".into()), ("b".into(), "2".into())])
            .await
            .unwrap();
        store.hset("h", "a", "10").await.unwrap();
        assert_eq!(store.hget("h", "a").await.unwrap(), Some("10".to_string()));
        assert_eq!(store.hgetall("h").await.unwrap().len(), 2);
        assert!(store.hdel("h", "a").await.unwrap());
        assert_eq!(store.hkeys("h").await.unwrap(), strings(&["b"]));

        store.zadd("z", "x", 2.0).await.unwrap();
        store.zadd("z", "y", 1.0).await.unwrap();
        let order: Vec<String> = store.zrange("z").await.unwrap().into_iter().map(|(m, _)| m).collect();
        assert_eq!(order, strings(&["y", "x"]));
        assert!(store.zrem("z", "x").await.unwrap());
        assert!(!store.zrem("z", "x").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.hset("h", "f", "v").await.unwrap();
        assert!(matches!(store.get("h").await, Err(SpinError::Store(_))));
        assert!(store.zadd("h", "m", 1.0).await.is_err());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("spinhost.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.rpush("pool", &strings(&["3000", "3001"])).await.unwrap();
            store.hset("alloc", "3002", "web-1").await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.llen("pool").await.unwrap(), 2);
        assert_eq!(store.hget("alloc", "3002").await.unwrap(), Some("web-1".to_string()));
    }
}
