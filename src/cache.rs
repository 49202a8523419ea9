//! Cache port and in-memory cache.
//!
//! The relay talks to its cache only through [`CachePort`], a hash-store
//! interface: each key (a dotted domain name) holds named fields (record
//! type tags such as `"A"`) and at most one expiry for the whole key.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use log::{debug, info};
use lru::LruCache;

use crate::config::ServerConfig;
use crate::db::SqliteCache;
use crate::errors::DnsError;

/// Interval for sweeping expired cache entries.
pub const CACHE_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Field holding a 4-byte IPv4 address.
pub const FIELD_A: &str = "A";

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Never expires.
    Persistent,
    /// Expires after this many seconds.
    Expires(u64),
}

/// Operations the resolution pipeline needs from a cache backend.
///
/// Implementations must be safe to call from many tasks at once; every
/// operation is atomic with respect to the key it touches.
pub trait CachePort: Send + Sync {
    /// Value of one field, `None` if the key or field is missing.
    fn get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, DnsError>;

    /// All fields of a key; empty if the key is missing.
    fn get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, DnsError>;

    /// Store a field. A missing key is created without expiry.
    fn put(&self, key: &str, field: &str, value: &[u8]) -> Result<(), DnsError>;

    /// Remaining lifetime, `None` if the key is missing.
    fn get_ttl(&self, key: &str) -> Result<Option<Ttl>, DnsError>;

    /// Change the lifetime of an existing key. `Expires(0)` removes it.
    fn set_ttl(&self, key: &str, ttl: Ttl) -> Result<(), DnsError>;

    fn delete_key(&self, key: &str) -> Result<(), DnsError>;

    fn delete_field(&self, key: &str, field: &str) -> Result<(), DnsError>;

    /// Drop every expired key, returning how many went.
    fn purge_expired(&self) -> Result<usize, DnsError>;
}

/// Available cache backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEngine {
    Memory,
    Sqlite,
}

impl FromStr for CacheEngine {
    type Err = DnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(CacheEngine::Memory),
            "sqlite" => Ok(CacheEngine::Sqlite),
            other => Err(DnsError::Config(format!("Unknown cache engine: {}", other))),
        }
    }
}

/// Build the backend selected in the configuration.
pub fn open_cache(config: &ServerConfig) -> Result<Arc<dyn CachePort>, DnsError> {
    match config.cache_engine {
        CacheEngine::Memory => {
            info!("Using in-memory cache with capacity {}", config.cache_capacity);
            Ok(Arc::new(MemoryCache::new(config.cache_capacity)))
        }
        CacheEngine::Sqlite => {
            info!("Using SQLite cache at {}", config.db_path);
            Ok(Arc::new(SqliteCache::open(&config.db_path)?))
        }
    }
}

type Fields = HashMap<String, Vec<u8>>;

#[derive(Debug)]
struct ExpiringEntry {
    fields: Fields,
    expires_at: Instant,
}

impl ExpiringEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Persistent keys live in a plain map and are never evicted; keys with an
/// expiry live in an LRU bounded by the configured capacity.
struct Store {
    persistent: HashMap<String, Fields>,
    expiring: LruCache<String, ExpiringEntry>,
}

impl Store {
    /// Fields of a live key, dropping it first if it has expired.
    fn fields_mut(&mut self, key: &str, now: Instant) -> Option<&mut Fields> {
        if self.persistent.contains_key(key) {
            return self.persistent.get_mut(key);
        }
        if self.expiring.peek(key).is_some_and(|e| e.is_expired(now)) {
            self.expiring.pop(key);
            return None;
        }
        self.expiring.get_mut(key).map(|e| &mut e.fields)
    }

    fn remove(&mut self, key: &str) -> Option<Fields> {
        self.persistent
            .remove(key)
            .or_else(|| self.expiring.pop(key).map(|e| e.fields))
    }
}

/// In-memory cache for the relay.
pub struct MemoryCache {
    store: Mutex<Store>,
}

impl MemoryCache {
    /// Create a cache keeping at most `capacity` expiring keys.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store: Mutex::new(Store {
                persistent: HashMap::new(),
                expiring: LruCache::new(capacity),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Store>, DnsError> {
        self.store
            .lock()
            .map_err(|_| DnsError::CacheUnavailable("cache lock poisoned".into()))
    }

    /// Number of live and not yet swept keys.
    pub fn len(&self) -> usize {
        self.lock()
            .map(|s| s.persistent.len() + s.expiring.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CachePort for MemoryCache {
    fn get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, DnsError> {
        let mut store = self.lock()?;
        Ok(store
            .fields_mut(key, Instant::now())
            .and_then(|fields| fields.get(field).cloned()))
    }

    fn get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, DnsError> {
        let mut store = self.lock()?;
        Ok(store
            .fields_mut(key, Instant::now())
            .map(|fields| fields.clone())
            .unwrap_or_default())
    }

    fn put(&self, key: &str, field: &str, value: &[u8]) -> Result<(), DnsError> {
        let mut store = self.lock()?;
        match store.fields_mut(key, Instant::now()) {
            Some(fields) => {
                fields.insert(field.to_string(), value.to_vec());
            }
            None => {
                let mut fields = Fields::new();
                fields.insert(field.to_string(), value.to_vec());
                store.persistent.insert(key.to_string(), fields);
            }
        }
        Ok(())
    }

    fn get_ttl(&self, key: &str) -> Result<Option<Ttl>, DnsError> {
        let mut store = self.lock()?;
        let now = Instant::now();
        if store.persistent.contains_key(key) {
            return Ok(Some(Ttl::Persistent));
        }
        let remaining = store
            .expiring
            .peek(key)
            .map(|entry| entry.expires_at.saturating_duration_since(now));
        match remaining {
            Some(left) if left.is_zero() => {
                store.expiring.pop(key);
                Ok(None)
            }
            Some(left) => Ok(Some(Ttl::Expires(ceil_secs(left)))),
            None => Ok(None),
        }
    }

    fn set_ttl(&self, key: &str, ttl: Ttl) -> Result<(), DnsError> {
        let mut store = self.lock()?;
        let now = Instant::now();
        if store.fields_mut(key, now).is_none() {
            return Ok(());
        }
        let Some(fields) = store.remove(key) else {
            return Ok(());
        };
        match ttl {
            Ttl::Persistent => {
                store.persistent.insert(key.to_string(), fields);
            }
            Ttl::Expires(0) => {}
            Ttl::Expires(secs) => {
                let entry = ExpiringEntry {
                    fields,
                    expires_at: now + Duration::from_secs(secs),
                };
                if let Some((evicted, _)) = store.expiring.push(key.to_string(), entry) {
                    if evicted != key {
                        debug!("Evicted {} from cache", evicted);
                    }
                }
            }
        }
        Ok(())
    }

    fn delete_key(&self, key: &str) -> Result<(), DnsError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn delete_field(&self, key: &str, field: &str) -> Result<(), DnsError> {
        let mut store = self.lock()?;
        let now_empty = match store.fields_mut(key, Instant::now()) {
            Some(fields) => {
                fields.remove(field);
                fields.is_empty()
            }
            None => false,
        };
        if now_empty {
            store.remove(key);
        }
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, DnsError> {
        let mut store = self.lock()?;
        let now = Instant::now();
        let expired: Vec<String> = store
            .expiring
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            store.expiring.pop(key);
        }
        debug!("Cache cleanup removed {} expired keys", expired.len());
        Ok(expired.len())
    }
}

/// Whole seconds left, rounded up so a live key never reports zero.
fn ceil_secs(remaining: Duration) -> u64 {
    let secs = remaining.as_secs();
    if remaining.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
