//! Time-boxed cache in front of network calls.
//!
//! Entries live in an injected [`KvStore`] under keys derived from a SHA-256
//! of the caller's key, so repository URLs and tokens never appear in the
//! store verbatim. A producer that fails is never cached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::store::KvStore;
use crate::plugin::{UpdaterError, UpdaterResult};

/// Prefix shared by every key this layer owns.
pub const CACHE_PREFIX: &str = "mrp_api_cache_";

/// Default TTL (1 hour).
pub const DEFAULT_TTL_SECS: u64 = 3600;

/// Source of "now" as unix seconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// A stored cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Fingerprint key (hashed).
    pub key: String,
    /// Opaque payload.
    pub value: serde_json::Value,
    /// Unix timestamp of storage.
    pub stored_at: i64,
    /// TTL at the time of storage.
    pub ttl_seconds: u64,
}

impl CacheEntry {
    /// Expiry timestamp, clamped at the end of representable time.
    fn expires_at(&self) -> i64 {
        self.stored_at.saturating_add(i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX))
    }

    fn is_fresh(&self, now: i64) -> bool {
        self.ttl_seconds > 0 && now <= self.expires_at()
    }

    fn remaining(&self, now: i64) -> u64 {
        u64::try_from(self.expires_at().saturating_sub(now)).unwrap_or(0)
    }
}

/// Observability snapshot for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheInfo {
    /// Whether a fresh entry exists.
    pub exists: bool,
    /// Last successful refresh.
    pub last_update: Option<DateTime<Utc>>,
    /// Seconds since the last refresh.
    pub age_seconds: Option<u64>,
    /// Seconds until the entry expires (only when it exists).
    pub expires_in: Option<u64>,
}

/// TTL cache over a [`KvStore`].
pub struct ApiCache {
    store: Arc<dyn KvStore>,
    ttl_secs: AtomicU64,
    clock: Clock,
}

impl ApiCache {
    /// Create a cache with the given TTL.
    pub fn new(store: Arc<dyn KvStore>, ttl_secs: u64) -> Self {
        Self::with_clock(store, ttl_secs, Arc::new(|| Utc::now().timestamp()))
    }

    /// Create a cache with a custom clock.
    pub fn with_clock(store: Arc<dyn KvStore>, ttl_secs: u64, clock: Clock) -> Self {
        Self { store, ttl_secs: AtomicU64::new(ttl_secs), clock }
    }

    /// Current TTL.
    pub fn ttl(&self) -> u64 {
        self.ttl_secs.load(Ordering::Relaxed)
    }

    /// Change the TTL for entries stored from now on. Zero disables serving from cache.
    pub fn set_ttl(&self, ttl_secs: u64) {
        self.ttl_secs.store(ttl_secs, Ordering::Relaxed);
    }

    fn entry_key(key: &str) -> String {
        format!("{CACHE_PREFIX}{}", fingerprint(key))
    }

    fn last_update_key(key: &str) -> String {
        format!("{CACHE_PREFIX}last_update_{}", fingerprint(key))
    }

    fn fresh_entry(&self, key: &str) -> UpdaterResult<Option<CacheEntry>> {
        if self.ttl() == 0 {
            return Ok(None);
        }

        let Some(raw) = self.store.get(&Self::entry_key(key))? else {
            return Ok(None);
        };

        let entry: CacheEntry = match serde_json::from_value(raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key, error = %e, "Dropping unreadable cache entry");
                return Ok(None);
            }
        };

        Ok(entry.is_fresh((self.clock)()).then_some(entry))
    }

    /// Return the cached value for `key`, or run `producer` and cache its result.
    ///
    /// `producer` runs only on a miss, on an expired entry, or when
    /// `force_refresh` is set. Its error is returned unchanged and nothing is
    /// stored.
    pub fn get_or_fetch<T, F>(&self, key: &str, producer: F, force_refresh: bool) -> UpdaterResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> UpdaterResult<T>,
    {
        if !force_refresh {
            if let Some(entry) = self.fresh_entry(key)? {
                match serde_json::from_value::<T>(entry.value) {
                    Ok(value) => {
                        tracing::debug!(key, "Cache hit");
                        return Ok(value);
                    }
                    Err(e) => tracing::warn!(key, error = %e, "Cached value has unexpected shape"),
                }
            }
        }

        tracing::debug!(key, force_refresh, "Cache miss");
        let value = producer()?;

        let ttl = self.ttl();
        if ttl > 0 {
            let now = (self.clock)();
            let entry = CacheEntry {
                key: fingerprint(key),
                value: serde_json::to_value(&value).map_err(|e| UpdaterError::Json(e.to_string()))?,
                stored_at: now,
                ttl_seconds: ttl,
            };
            let raw = serde_json::to_value(&entry).map_err(|e| UpdaterError::Json(e.to_string()))?;
            self.store.set(&Self::entry_key(key), raw)?;
            self.store.set(&Self::last_update_key(key), serde_json::Value::from(now))?;
        }

        Ok(value)
    }

    /// Drop the entry for one key.
    pub fn invalidate(&self, key: &str) -> UpdaterResult<()> {
        self.store.delete(&Self::entry_key(key))?;
        tracing::debug!(key, "Cache invalidated");
        Ok(())
    }

    /// Drop every entry this layer owns, fresh or not. Returns the number of keys removed.
    pub fn clear_all(&self) -> UpdaterResult<usize> {
        let keys = self.store.keys_with_prefix(CACHE_PREFIX)?;
        for key in &keys {
            self.store.delete(key)?;
        }
        tracing::info!(removed = keys.len(), "Cache cleared");
        Ok(keys.len())
    }

    /// Existence, age and remaining TTL for `key`.
    pub fn cache_info(&self, key: &str) -> UpdaterResult<CacheInfo> {
        let now = (self.clock)();
        let entry = self.fresh_entry(key)?;
        let last_update = self.store.get(&Self::last_update_key(key))?.and_then(|v| v.as_i64());

        Ok(CacheInfo {
            exists: entry.is_some(),
            last_update: last_update.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            age_seconds: last_update.map(|ts| now.saturating_sub(ts).max(0) as u64),
            expires_in: entry.map(|e| e.remaining(now)),
        })
    }
}

/// Hex SHA-256 of a request fingerprint.
pub fn fingerprint(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MemoryStore;
    use std::cell::Cell;
    use std::sync::atomic::AtomicI64;

    fn cache_at(store: Arc<MemoryStore>, ttl: u64, now: Arc<AtomicI64>) -> ApiCache {
        ApiCache::with_clock(store, ttl, Arc::new(move || now.load(Ordering::SeqCst)))
    }

    #[test]
    fn test_producer_runs_once_within_ttl() {
        let now = Arc::new(AtomicI64::new(1_000));
        let cache = cache_at(Arc::new(MemoryStore::new()), 60, now);
        let calls = Cell::new(0);

        for _ in 0..2 {
            let value: String = cache
                .get_or_fetch(
                    "plugins_list_a",
                    || {
                        calls.set(calls.get() + 1);
                        Ok("fresh".to_string())
                    },
                    false,
                )
                .unwrap();
            assert_eq!(value, "fresh");
        }

        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_failed_producer_is_not_cached() {
        let now = Arc::new(AtomicI64::new(1_000));
        let store = Arc::new(MemoryStore::new());
        let cache = cache_at(store.clone(), 60, now);
        let calls = Cell::new(0);

        let result: UpdaterResult<String> = cache.get_or_fetch(
            "k",
            || {
                calls.set(calls.get() + 1);
                Err(UpdaterError::Network("down".into()))
            },
            false,
        );
        assert!(result.is_err());
        assert!(store.is_empty());

        let value: String = cache
            .get_or_fetch(
                "k",
                || {
                    calls.set(calls.get() + 1);
                    Ok("ok".to_string())
                },
                false,
            )
            .unwrap();
        assert_eq!(value, "ok");
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_expiry_and_force_refresh() {
        let now = Arc::new(AtomicI64::new(1_000));
        let cache = cache_at(Arc::new(MemoryStore::new()), 60, now.clone());
        let calls = Cell::new(0);
        let fetch = |force: bool| -> u32 {
            cache
                .get_or_fetch(
                    "k",
                    || {
                        calls.set(calls.get() + 1);
                        Ok(calls.get())
                    },
                    force,
                )
                .unwrap()
        };

        assert_eq!(fetch(false), 1);
        assert_eq!(fetch(true), 2);
        assert_eq!(fetch(false), 2);

        now.store(1_061, Ordering::SeqCst);
        assert_eq!(fetch(false), 3);
    }

    #[test]
    fn test_zero_ttl_never_serves_from_cache() {
        let now = Arc::new(AtomicI64::new(1_000));
        let cache = cache_at(Arc::new(MemoryStore::new()), 60, now);
        cache.set_ttl(0);
        let calls = Cell::new(0);

        for _ in 0..3 {
            let _: bool = cache
                .get_or_fetch(
                    "k",
                    || {
                        calls.set(calls.get() + 1);
                        Ok(true)
                    },
                    false,
                )
                .unwrap();
        }
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_invalidate_and_clear_all() {
        let now = Arc::new(AtomicI64::new(1_000));
        let store = Arc::new(MemoryStore::new());
        store.set("unrelated", serde_json::json!(1)).unwrap();
        let cache = cache_at(store.clone(), 60, now);

        let _: u8 = cache.get_or_fetch("a", || Ok(1), false).unwrap();
        let _: u8 = cache.get_or_fetch("b", || Ok(2), false).unwrap();
        assert!(cache.cache_info("a").unwrap().exists);

        cache.invalidate("a").unwrap();
        assert!(!cache.cache_info("a").unwrap().exists);
        assert!(cache.cache_info("b").unwrap().exists);

        cache.clear_all().unwrap();
        assert!(!cache.cache_info("b").unwrap().exists);
        assert_eq!(store.get("unrelated").unwrap(), Some(serde_json::json!(1)));
    }

    #[test]
    fn test_cache_info_reports_age_and_expiry() {
        let now = Arc::new(AtomicI64::new(1_000));
        let cache = cache_at(Arc::new(MemoryStore::new()), 100, now.clone());

        let info = cache.cache_info("k").unwrap();
        assert!(!info.exists);
        assert!(info.last_update.is_none());

        let _: u8 = cache.get_or_fetch("k", || Ok(7), false).unwrap();
        now.store(1_030, Ordering::SeqCst);

        let info = cache.cache_info("k").unwrap();
        assert!(info.exists);
        assert_eq!(info.age_seconds, Some(30));
        assert_eq!(info.expires_in, Some(70));
        assert_eq!(info.last_update.unwrap().timestamp(), 1_000);
    }

    #[test]
    fn test_huge_ttl_does_not_wrap() {
        let now = Arc::new(AtomicI64::new(1_000));
        let cache = cache_at(Arc::new(MemoryStore::new()), u64::MAX, now.clone());
        let calls = Cell::new(0);
        let produce = || {
            calls.set(calls.get() + 1);
            Ok(5u8)
        };

        assert_eq!(cache.get_or_fetch("k", produce, false).unwrap(), 5);
        now.store(i64::MAX, Ordering::SeqCst);
        assert_eq!(cache.get_or_fetch("k", produce, false).unwrap(), 5);
        assert_eq!(calls.get(), 1);

        now.store(2_000, Ordering::SeqCst);
        let info = cache.cache_info("k").unwrap();
        assert!(info.exists);
        assert_eq!(info.expires_in, Some((i64::MAX - 2_000) as u64));
    }

    #[test]
    fn test_keys_are_hashed() {
        let now = Arc::new(AtomicI64::new(1_000));
        let store = Arc::new(MemoryStore::new());
        let cache = cache_at(store.clone(), 60, now);

        let _: u8 = cache.get_or_fetch("plugins_list_secret-token", || Ok(1), false).unwrap();
        let keys = store.keys_with_prefix(CACHE_PREFIX).unwrap();
        assert!(keys.iter().all(|k| !k.contains("secret-token")));
        assert_eq!(fingerprint("a").len(), 64);
    }
}
