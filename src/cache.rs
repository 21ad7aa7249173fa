//! DNS response cache with TTL-based expiration.

use lru::LruCache;
use rustc_hash::FxBuildHasher;
use std::num::NonZeroUsize;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Default upper bound on stored responses.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

struct CacheEntry {
    response: Vec<u8>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// TTL-based response cache keyed by query signature.
///
/// Lookups take the read lock and run concurrently; they `peek`, so the
/// eviction order is insertion order and never depends on reads. Expired
/// entries are dropped lazily by `get` when the write lock is free, and in
/// bulk by [`DnsCache::cleanup_expired`].
pub struct DnsCache {
    entries: RwLock<LruCache<String, CacheEntry, FxBuildHasher>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::with_max_entries(DEFAULT_MAX_ENTRIES)
    }

    /// Create a cache holding at most `max_entries` responses (0 = unbounded).
    ///
    /// Inserting a new key into a full cache discards the oldest insertion.
    pub fn with_max_entries(max_entries: usize) -> Self {
        let entries = match NonZeroUsize::new(max_entries) {
            Some(cap) => LruCache::with_hasher(cap, FxBuildHasher),
            None => LruCache::unbounded_with_hasher(FxBuildHasher),
        };
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Look up an unexpired response.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();

        {
            let Ok(entries) = self.entries.read() else {
                return None;
            };
            match entries.peek(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(entry.response.clone()),
                Some(_) => {}
            }
        }

        self.remove_if_expired(key, now);
        None
    }

    /// Drop `key` if it is still expired as of `now`.
    ///
    /// Never waits for the write lock; a contended entry is left for the sweep.
    /// The expiry is re-checked under the lock so an entry refreshed by a
    /// concurrent `set` survives.
    fn remove_if_expired(&self, key: &str, now: Instant) {
        let Ok(mut entries) = self.entries.try_write() else {
            return;
        };
        if entries.peek(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.pop(key);
        }
    }

    /// Store a response, replacing any previous entry for `key`.
    pub fn set(&self, key: &str, response: &[u8], ttl: Duration) {
        let entry = CacheEntry {
            response: response.to_vec(),
            expires_at: Instant::now() + ttl,
        };

        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        entries.put(key.to_owned(), entry);
    }

    /// Remove every entry that has expired, returning how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();

        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key.as_str());
        }
        expired.len()
    }

    /// Remove everything, returning how many entries were dropped.
    pub fn clear(&self) -> usize {
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let removed = entries.len();
        entries.clear();
        removed
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}
