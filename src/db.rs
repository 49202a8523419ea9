//! SQLite cache backend.
//!
//! Stores the same key/field/expiry model as the in-memory cache in a
//! SQLite database, so seeded and learned entries survive a restart.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use log::debug;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::cache::{CachePort, Ttl};
use crate::errors::DnsError;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS cache_keys (
        key TEXT PRIMARY KEY,
        expires_at INTEGER
    ) WITHOUT ROWID;
    CREATE TABLE IF NOT EXISTS cache_fields (
        key TEXT NOT NULL,
        field TEXT NOT NULL,
        value BLOB NOT NULL,
        PRIMARY KEY (key, field)
    ) WITHOUT ROWID;
";

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Remove `key` and its fields if its expiry has passed.
fn drop_if_expired(tx: &Transaction<'_>, key: &str, now: i64) -> Result<(), DnsError> {
    let removed = tx.execute(
        "DELETE FROM cache_keys WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
        params![key, now],
    )?;
    if removed > 0 {
        tx.execute("DELETE FROM cache_fields WHERE key = ?1", params![key])?;
    }
    Ok(())
}

fn delete_all(tx: &Transaction<'_>, key: &str) -> Result<(), DnsError> {
    tx.execute("DELETE FROM cache_fields WHERE key = ?1", params![key])?;
    tx.execute("DELETE FROM cache_keys WHERE key = ?1", params![key])?;
    Ok(())
}

/// Cache backend over a pool of SQLite connections.
#[derive(Clone)]
pub struct SqliteCache {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteCache {
    /// Open (or create) the cache database at `path`.
    pub fn open(path: &str) -> Result<Self, DnsError> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn: &mut Connection| {
            conn.busy_timeout(BUSY_TIMEOUT)
        });
        Self::with_pool(Pool::new(manager)?)
    }

    /// A private in-memory database, gone when the cache is dropped.
    pub fn in_memory() -> Result<Self, DnsError> {
        let manager = SqliteConnectionManager::memory();
        // Every in-memory connection is its own database, so keep exactly one.
        Self::with_pool(Pool::builder().max_size(1).build(manager)?)
    }

    fn with_pool(pool: Pool<SqliteConnectionManager>) -> Result<Self, DnsError> {
        pool.get()?.execute_batch(SCHEMA)?;
        Ok(Self { pool })
    }
}

impl CachePort for SqliteCache {
    fn get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, DnsError> {
        let conn = self.pool.get()?;
        let value = conn
            .query_row(
                "SELECT f.value FROM cache_fields f JOIN cache_keys k ON k.key = f.key
                 WHERE f.key = ?1 AND f.field = ?2
                   AND (k.expires_at IS NULL OR k.expires_at > ?3)",
                params![key, field, now_ms()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, DnsError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT f.field, f.value FROM cache_fields f JOIN cache_keys k ON k.key = f.key
             WHERE f.key = ?1 AND (k.expires_at IS NULL OR k.expires_at > ?2)",
        )?;
        let rows = stmt.query_map(params![key, now_ms()], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut fields = HashMap::new();
        for row in rows {
            let (field, value): (String, Vec<u8>) = row?;
            fields.insert(field, value);
        }
        Ok(fields)
    }

    fn put(&self, key: &str, field: &str, value: &[u8]) -> Result<(), DnsError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        drop_if_expired(&tx, key, now_ms())?;
        tx.execute(
            "INSERT OR IGNORE INTO cache_keys (key, expires_at) VALUES (?1, NULL)",
            params![key],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO cache_fields (key, field, value) VALUES (?1, ?2, ?3)",
            params![key, field, value],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_ttl(&self, key: &str) -> Result<Option<Ttl>, DnsError> {
        let conn = self.pool.get()?;
        let expires_at: Option<Option<i64>> = conn
            .query_row(
                "SELECT expires_at FROM cache_keys WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        let now = now_ms();
        Ok(match expires_at {
            None => None,
            Some(None) => Some(Ttl::Persistent),
            Some(Some(at)) if at <= now => None,
            Some(Some(at)) => {
                let left_ms = (at - now) as u64;
                Some(Ttl::Expires(left_ms.div_ceil(1000)))
            }
        })
    }

    fn set_ttl(&self, key: &str, ttl: Ttl) -> Result<(), DnsError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let now = now_ms();
        drop_if_expired(&tx, key, now)?;
        match ttl {
            Ttl::Persistent => {
                tx.execute(
                    "UPDATE cache_keys SET expires_at = NULL WHERE key = ?1",
                    params![key],
                )?;
            }
            Ttl::Expires(0) => delete_all(&tx, key)?,
            Ttl::Expires(secs) => {
                let ms = i64::try_from(secs).unwrap_or(i64::MAX).saturating_mul(1000);
                tx.execute(
                    "UPDATE cache_keys SET expires_at = ?2 WHERE key = ?1",
                    params![key, now.saturating_add(ms)],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_key(&self, key: &str) -> Result<(), DnsError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        delete_all(&tx, key)?;
        tx.commit()?;
        Ok(())
    }

    fn delete_field(&self, key: &str, field: &str) -> Result<(), DnsError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM cache_fields WHERE key = ?1 AND field = ?2",
            params![key, field],
        )?;
        tx.execute(
            "DELETE FROM cache_keys WHERE key = ?1
             AND NOT EXISTS (SELECT 1 FROM cache_fields WHERE key = ?1)",
            params![key],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, DnsError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let now = now_ms();
        tx.execute(
            "DELETE FROM cache_fields WHERE key IN
             (SELECT key FROM cache_keys WHERE expires_at IS NOT NULL AND expires_at <= ?1)",
            params![now],
        )?;
        let removed = tx.execute(
            "DELETE FROM cache_keys WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?;
        tx.commit()?;
        debug!("SQLite cache cleanup removed {} expired keys", removed);
        Ok(removed)
    }
}
