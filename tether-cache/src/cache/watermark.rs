//! Watermarks for overlay settlement.
//!
//! Every authoritative update advances a per-target watermark taken from a
//! cache-wide sequence, and raises the target's server version when the
//! update carries one. A confirmed overlay is retired once the target's
//! watermark shows its write: by server version when both sides report one,
//! otherwise by the first authoritative update after confirmation.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tether_core::{CacheKey, ServerVersion};

/// A point in a target's update history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermark {
    /// Monotonically increasing across the whole cache.
    pub sequence: u64,
    /// Highest server version the target's authoritative data reflects.
    pub version: Option<ServerVersion>,
}

impl Watermark {
    /// Whether data at this watermark includes a write confirmed at
    /// `version` while the target stood at sequence `after`.
    pub fn confirms(&self, after: u64, version: Option<ServerVersion>) -> bool {
        match (version, self.version) {
            (Some(wanted), Some(seen)) => seen >= wanted,
            _ => self.sequence > after,
        }
    }
}

/// Per-target watermarks backed by a shared sequence.
#[derive(Debug, Default)]
pub struct WatermarkRegistry {
    sequence: AtomicU64,
    marks: DashMap<CacheKey, Watermark>,
}

impl WatermarkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current watermark for a target; zero if it never received an
    /// authoritative update.
    pub fn current(&self, target: &CacheKey) -> Watermark {
        self.marks
            .get(target)
            .map(|m| *m.value())
            .unwrap_or_default()
    }

    /// Advance the target's watermark and return the new value. The server
    /// version never moves backwards.
    pub fn advance(&self, target: &CacheKey, version: Option<ServerVersion>) -> Watermark {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut mark = self.marks.entry(target.clone()).or_default();
        mark.sequence = sequence;
        mark.version = mark.version.max(version);
        *mark
    }

    pub fn forget(&self, target: &CacheKey) {
        self.marks.remove(target);
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}
