//! Loader metrics.
//!
//! Process-wide counters. Individual loads only ever increment them; they
//! are cleared solely by an explicit [`crate::ResilientLoader::reset_metrics`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of loader counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoaderMetrics {
    /// Loads requested, including cache hits and coalesced waits
    pub total_loads: u64,
    /// Loads that produced a handle
    pub successful_loads: u64,
    /// Loads that ended in a terminal error
    pub failed_loads: u64,
    /// Retries performed against storage
    pub total_retries: u64,
    /// Rollbacks performed
    pub rollback_count: u64,
    /// Loads answered from cache
    pub cache_hits: u64,
    /// Loads that missed the cache
    pub cache_misses: u64,
    /// Loads that joined an in-flight resolution
    pub coalesced_requests: u64,
    /// Loads served from the fallback version
    pub degraded_loads: u64,
    /// Loads rejected by an open or saturated breaker
    pub circuit_rejections: u64,
}

impl LoaderMetrics {
    /// Success rate (0.0 - 1.0); 1.0 when nothing was loaded yet
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let settled = self.successful_loads + self.failed_loads;
        if settled == 0 {
            return 1.0;
        }
        self.successful_loads as f64 / settled as f64
    }

    /// Cache hit rate (0.0 - 1.0)
    #[must_use]
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / lookups as f64
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Stored entries
    pub entries: usize,
    /// Cache hits
    pub hits: u64,
    /// Cache misses
    pub misses: u64,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
    /// Entry lifetime
    pub ttl_ms: u64,
}

/// Lock-free counter set behind [`LoaderMetrics`]
#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    total_loads: AtomicU64,
    successful_loads: AtomicU64,
    failed_loads: AtomicU64,
    total_retries: AtomicU64,
    rollback_count: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    coalesced_requests: AtomicU64,
    degraded_loads: AtomicU64,
    circuit_rejections: AtomicU64,
}

macro_rules! counter {
    ($name:ident, $field:ident) => {
        pub(crate) fn $name(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl MetricsRecorder {
    counter!(record_load, total_loads);
    counter!(record_success, successful_loads);
    counter!(record_failure, failed_loads);
    counter!(record_rollback, rollback_count);
    counter!(record_cache_hit, cache_hits);
    counter!(record_cache_miss, cache_misses);
    counter!(record_coalesced, coalesced_requests);
    counter!(record_degraded, degraded_loads);
    counter!(record_rejection, circuit_rejections);

    pub(crate) fn record_retries(&self, retries: u32) {
        self.total_retries
            .fetch_add(u64::from(retries), Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> LoaderMetrics {
        LoaderMetrics {
            total_loads: self.total_loads.load(Ordering::Relaxed),
            successful_loads: self.successful_loads.load(Ordering::Relaxed),
            failed_loads: self.failed_loads.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            rollback_count: self.rollback_count.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            degraded_loads: self.degraded_loads.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        for counter in [
            &self.total_loads,
            &self.successful_loads,
            &self.failed_loads,
            &self.total_retries,
            &self.rollback_count,
            &self.cache_hits,
            &self.cache_misses,
            &self.coalesced_requests,
            &self.degraded_loads,
            &self.circuit_rejections,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let recorder = MetricsRecorder::default();
        recorder.record_load();
        recorder.record_load();
        recorder.record_success();
        recorder.record_failure();
        recorder.record_retries(3);
        recorder.record_cache_hit();

        let m = recorder.snapshot();
        assert_eq!(m.total_loads, 2);
        assert_eq!(m.total_retries, 3);
        assert_eq!(m.success_rate(), 0.5);
        assert_eq!(m.cache_hit_rate(), 1.0);
    }

    #[test]
    fn test_reset() {
        let recorder = MetricsRecorder::default();
        recorder.record_rollback();
        recorder.record_degraded();
        recorder.reset();
        assert_eq!(recorder.snapshot(), LoaderMetrics::default());
    }

    #[test]
    fn test_empty_rates() {
        let m = LoaderMetrics::default();
        assert_eq!(m.success_rate(), 1.0);
        assert_eq!(m.cache_hit_rate(), 0.0);
    }
}
