//! Hydration bridge between the server render and the interactive session.
//!
//! During a server render every settled query result is recorded. The set is
//! serialized into a [`HydrationPayload`], shipped with the rendered output and
//! loaded on the interactive side, where each key can be claimed exactly once
//! instead of being fetched again. Closing the bridge discards whatever was
//! not claimed.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tether_core::{CacheKey, TetherResult, TransportError};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HydratedEntry {
    pub key: CacheKey,
    pub value: Value,
}

/// Serialized hand-off from one server render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HydrationPayload {
    pub request_id: String,
    pub entries: Vec<HydratedEntry>,
}

impl HydrationPayload {
    pub fn to_json(&self) -> TetherResult<String> {
        serde_json::to_string(self).map_err(|e| {
            TransportError::Decode {
                reason: format!("hydration payload: {}", e),
            }
            .into()
        })
    }

    pub fn from_json(text: &str) -> TetherResult<Self> {
        serde_json::from_str(text).map_err(|e| {
            TransportError::Decode {
                reason: format!("hydration payload: {}", e),
            }
            .into()
        })
    }
}

#[derive(Debug, Default)]
pub struct HydrationBridge {
    recorded: DashMap<CacheKey, Value>,
    closed: AtomicBool,
}

impl HydrationBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_payload(payload: HydrationPayload) -> Self {
        let bridge = Self::new();
        for entry in payload.entries {
            bridge.recorded.insert(entry.key, entry.value);
        }
        debug!(
            request_id = %payload.request_id,
            entries = bridge.recorded.len(),
            "hydration payload loaded"
        );
        bridge
    }

    /// Record a result computed during the server render. Later records for
    /// the same key win. Returns `false` once the bridge is closed.
    pub fn record(&self, key: &CacheKey, value: Value) -> bool {
        if key.is_skip() || self.is_closed() {
            return false;
        }
        self.recorded.insert(key.clone(), value);
        true
    }

    /// Take the recorded value for `key`. Each key can be claimed once.
    pub fn claim(&self, key: &CacheKey) -> Option<Value> {
        if self.is_closed() {
            return None;
        }
        self.recorded.remove(key).map(|(_, value)| value)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        !self.is_closed() && self.recorded.contains_key(key)
    }

    /// End the hydration window. Returns how many unclaimed records were
    /// discarded.
    pub fn close(&self) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let discarded = self.recorded.len();
        self.recorded.clear();
        debug!(discarded, "hydration window closed");
        discarded
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.recorded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorded.is_empty()
    }

    /// Snapshot the recorded set in key order.
    pub fn to_payload(&self, request_id: impl Into<String>) -> HydrationPayload {
        let mut entries: Vec<HydratedEntry> = self
            .recorded
            .iter()
            .map(|e| HydratedEntry {
                key: e.key().clone(),
                value: e.value().clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        HydrationPayload {
            request_id: request_id.into(),
            entries,
        }
    }

    pub fn into_payload(self, request_id: impl Into<String>) -> HydrationPayload {
        self.to_payload(request_id)
    }
}
