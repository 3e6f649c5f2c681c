//! Cache usage statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found an existing entry.
    pub hits: u64,
    /// Lookups that had to create an entry.
    pub misses: u64,
    /// Fetches that started remote work.
    pub fetches: u64,
    /// Fetches that joined an identical in-flight fetch instead.
    pub dedup_joins: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of installed overlays across all targets.
    pub overlay_count: u64,
    /// Overlay targets with a recorded watermark.
    pub tracked_targets: u64,
    /// Entries dropped once nothing used them.
    pub evictions: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub fetches: AtomicU64,
    pub dedup_joins: AtomicU64,
    pub evictions: AtomicU64,
}

impl StatsCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(
        &self,
        entry_count: u64,
        overlay_count: u64,
        tracked_targets: u64,
    ) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            dedup_joins: self.dedup_joins.load(Ordering::Relaxed),
            entry_count,
            overlay_count,
            tracked_targets,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
