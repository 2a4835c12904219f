//! Cache activity counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters, updated by the cache manager.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
    revalidations: AtomicU64,
    revalidation_failures: AtomicU64,
    fetch_failures: AtomicU64,
    storage_errors: AtomicU64,
    corrupt_entries: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Fresh hits.
    pub hits: u64,
    /// Stale values served.
    pub stale_hits: u64,
    /// Reads that had to fetch.
    pub misses: u64,
    /// Reads that waited on another caller's fetch.
    pub joined: u64,
    /// Background revalidations started.
    pub revalidations: u64,
    /// Background revalidations whose fetch failed.
    pub revalidation_failures: u64,
    /// Foreground fetches that failed.
    pub fetch_failures: u64,
    /// Swallowed storage errors.
    pub storage_errors: u64,
    /// Undecodable entries removed.
    pub corrupt_entries: u64,
}

impl StatsSnapshot {
    /// Fraction of reads served from cache (fresh or stale).
    pub fn hit_ratio(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        let total = served + self.misses + self.joined;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

macro_rules! counters {
    ($($name:ident => $field:ident),+ $(,)?) => {
        impl CacheStats {
            $(
                pub(crate) fn $name(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )+

            /// Copy the current values.
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)+
                }
            }

            /// Reset all counters to zero.
            pub fn reset(&self) {
                $(self.$field.store(0, Ordering::Relaxed);)+
            }
        }
    };
}

counters! {
    record_hit => hits,
    record_stale_hit => stale_hits,
    record_miss => misses,
    record_joined => joined,
    record_revalidation => revalidations,
    record_revalidation_failure => revalidation_failures,
    record_fetch_failure => fetch_failures,
    record_storage_error => storage_errors,
    record_corrupt_entry => corrupt_entries,
}
