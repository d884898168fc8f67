//! TTL cache of resolved handles.
//!
//! Eviction is TTL-only plus explicit invalidation; there is no size bound.
//! Expired entries are dropped when read and swept on every insert, so the
//! map never outgrows the set of handles loaded within one TTL.
//! Entries are never shared across function ids.

use crate::runtime::FunctionHandle;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tiered_core::Version;
use tokio::time::Instant;

/// Cache key: function id plus the requested version (`None` = latest)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Function id
    pub id: String,
    /// Requested version
    pub version: Option<Version>,
}

impl CacheKey {
    /// Create a key
    #[must_use]
    pub fn new(id: impl Into<String>, version: Option<Version>) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}@{}", self.id, v),
            None => write!(f, "{}@latest", self.id),
        }
    }
}

#[derive(Clone)]
struct CacheEntry {
    handle: Arc<FunctionHandle>,
    inserted_at: Instant,
}

/// Handle cache
pub struct HandleCache {
    entries: DashMap<CacheKey, CacheEntry>,
    ttl: Duration,
}

impl HandleCache {
    /// Create a cache; a zero TTL disables caching
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Configured TTL
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh handle for `key`, dropping it if expired
    #[must_use]
    pub fn get(&self, key: &CacheKey, now: Instant) -> Option<Arc<FunctionHandle>> {
        {
            let entry = self.entries.get(key)?;
            if now.saturating_duration_since(entry.inserted_at) < self.ttl {
                return Some(Arc::clone(&entry.handle));
            }
        }
        // The read guard is released above; removing under it would deadlock the shard.
        self.entries
            .remove_if(key, |_, e| now.saturating_duration_since(e.inserted_at) >= self.ttl);
        None
    }

    /// Store a handle, sweeping out anything that has expired by `now`
    pub fn insert(&self, key: CacheKey, handle: Arc<FunctionHandle>, now: Instant) {
        if self.ttl.is_zero() {
            return;
        }
        let purged = self.purge_expired(now);
        if purged > 0 {
            tracing::debug!(purged, "Purged expired handles");
        }
        self.entries.insert(
            key,
            CacheEntry {
                handle,
                inserted_at: now,
            },
        );
    }

    /// Remove every entry for a function id; returns how many were removed
    pub fn invalidate(&self, id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.id != id);
        before.saturating_sub(self.entries.len())
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.inserted_at) < self.ttl);
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, fresh or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
