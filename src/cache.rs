//! TTL-keyed cache of live quota buckets.
//!
//! Repeated requests for the same tenant+resource reuse one bucket
//! instance, which keeps the period and async counting state stable across
//! a burst and gives each reconciler task exactly one owner. All map
//! mutations go through one mutex with scoped guards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::bucket::QuotaBucket;
use crate::clock::Clock;

/// Separates tenant from resource in cache keys.
pub const CACHE_KEY_DELIMITER: &str = "|";

#[derive(Debug)]
struct CacheEntry {
    bucket: Arc<QuotaBucket>,
    expires_at: DateTime<Utc>,
}

/// Cloneable handle to the shared bucket cache.
#[derive(Debug, Clone)]
pub struct BucketCache {
    inner: Arc<Mutex<HashMap<String, CacheEntry>>>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl BucketCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));
        Self { inner: Arc::new(Mutex::new(HashMap::new())), ttl, clock }
    }

    /// Look up a bucket. A hit refreshes the entry's expiry; an expired
    /// entry is evicted (stopping its reconciler) and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Arc<QuotaBucket>> {
        let now = self.clock.now();
        let mut map = self.inner.lock().expect("bucket cache lock poisoned");
        match map.get_mut(key) {
            None => return None,
            Some(entry) if entry.expires_at <= now => {
                // Stop must happen before removal so no task writes into an
                // unreachable bucket.
                entry.bucket.stop_reconciler();
            }
            Some(entry) => {
                entry.expires_at = now + self.ttl;
                return Some(Arc::clone(&entry.bucket));
            }
        }
        map.remove(key);
        debug!(key = %key, "expired bucket evicted from cache");
        None
    }

    /// Atomic lookup-or-construct. The builder runs while the map lock is
    /// held, so two concurrent first requests for a key cannot race two
    /// buckets (and two reconciler tasks) into existence. Returns the
    /// bucket and whether this call inserted it; a builder error leaves
    /// the cache untouched.
    pub fn get_or_try_insert<F, E>(
        &self,
        key: &str,
        build: F,
    ) -> Result<(Arc<QuotaBucket>, bool), E>
    where
        F: FnOnce() -> Result<Arc<QuotaBucket>, E>,
    {
        let now = self.clock.now();
        let mut map = self.inner.lock().expect("bucket cache lock poisoned");
        let expired = match map.get_mut(key) {
            Some(entry) if entry.expires_at <= now => {
                entry.bucket.stop_reconciler();
                true
            }
            Some(entry) => {
                entry.expires_at = now + self.ttl;
                return Ok((Arc::clone(&entry.bucket), false));
            }
            None => false,
        };
        if expired {
            map.remove(key);
            debug!(key = %key, "expired bucket evicted from cache");
        }

        let bucket = build()?;
        map.insert(
            key.to_string(),
            CacheEntry { bucket: Arc::clone(&bucket), expires_at: now + self.ttl },
        );
        Ok((bucket, true))
    }

    /// Insert or overwrite the entry for the bucket's key. A replaced
    /// bucket gets its reconciler stopped so no task is leaked.
    pub fn put(&self, bucket: Arc<QuotaBucket>) {
        let key = bucket.cache_key();
        let expires_at = self.clock.now() + self.ttl;
        let mut map = self.inner.lock().expect("bucket cache lock poisoned");
        if let Some(old) = map.insert(key, CacheEntry { bucket: Arc::clone(&bucket), expires_at }) {
            if !Arc::ptr_eq(&old.bucket, &bucket) {
                old.bucket.stop_reconciler();
            }
        }
    }

    /// Remove the entry. The reconciler is stopped before removal; the
    /// bucket itself stays valid until the task observes the signal.
    pub fn evict(&self, key: &str) -> bool {
        let mut map = self.inner.lock().expect("bucket cache lock poisoned");
        if let Some(entry) = map.get(key) {
            entry.bucket.stop_reconciler();
        }
        map.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("bucket cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
