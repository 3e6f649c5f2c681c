//! Cache entries and the read-only snapshots handed to callers.

use chrono::Utc;
use serde_json::Value;
use tether_core::{
    CacheKey, ConnectionState, DataSource, QueryStatus, ServerVersion, TetherError, TetherResult,
    Timestamp,
};

/// An authoritative result held back while an optimistic write to the same
/// target is in flight.
#[derive(Debug, Clone)]
pub struct HeldUpdate {
    pub value: Value,
    pub source: DataSource,
    pub version: Option<ServerVersion>,
}

/// Mutable per-key state owned by the cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: QueryStatus,
    /// Last known result. Retained while a refresh is pending.
    pub value: Option<Value>,
    /// Present iff `status == Error`.
    pub error: Option<TetherError>,
    pub data_source: Option<DataSource>,
    pub subscriber_count: usize,
    /// Number of push-delivered updates; never decreases.
    pub update_count: u64,
    pub last_updated: Timestamp,
    pub connection: ConnectionState,
    /// Server version of `value`, when the backend reported one.
    pub version: Option<ServerVersion>,
    /// Newest result not yet shown; see [`HeldUpdate`].
    pub held: Option<HeldUpdate>,
}

impl CacheEntry {
    /// A freshly requested entry: nothing known yet, a fetch is about to start.
    pub fn pending() -> Self {
        Self {
            status: QueryStatus::Pending,
            value: None,
            error: None,
            data_source: None,
            subscriber_count: 0,
            update_count: 0,
            last_updated: Utc::now(),
            connection: ConnectionState::Closed,
            version: None,
            held: None,
        }
    }
}

/// Point-in-time view of an entry with overlays already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    key: CacheKey,
    status: QueryStatus,
    value: Option<Value>,
    visible: Option<Value>,
    error: Option<TetherError>,
    data_source: Option<DataSource>,
    subscriber_count: usize,
    update_count: u64,
    last_updated: Timestamp,
    connection: ConnectionState,
    version: Option<ServerVersion>,
    overlaid: bool,
}

impl EntrySnapshot {
    pub(crate) fn from_entry(
        key: CacheKey,
        entry: &CacheEntry,
        visible: Option<Value>,
        overlaid: bool,
    ) -> Self {
        Self {
            key,
            status: entry.status,
            value: entry.value.clone(),
            visible,
            error: entry.error.clone(),
            data_source: entry.data_source,
            subscriber_count: entry.subscriber_count,
            update_count: entry.update_count,
            last_updated: entry.last_updated,
            connection: entry.connection,
            version: entry.version,
            overlaid,
        }
    }

    /// The snapshot of the skip sentinel: idle, empty, never fetched.
    pub fn idle() -> Self {
        Self {
            key: CacheKey::Skip,
            status: QueryStatus::Idle,
            value: None,
            visible: None,
            error: None,
            data_source: None,
            subscriber_count: 0,
            update_count: 0,
            last_updated: Utc::now(),
            connection: ConnectionState::Closed,
            version: None,
            overlaid: false,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// The value a caller should render.
    ///
    /// Function-level errors hide the value. Transport-level errors keep the
    /// last known value visible.
    pub fn data(&self) -> Option<&Value> {
        match (&self.status, &self.error) {
            (QueryStatus::Error, Some(err)) if !err.is_transport() => None,
            _ => self.visible.as_ref(),
        }
    }

    /// Authoritative value without overlays.
    pub fn authoritative(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn error(&self) -> Option<&TetherError> {
        self.error.as_ref()
    }

    /// `Ok(data)` unless the entry is in a function-level error state.
    pub fn result(&self) -> TetherResult<Option<Value>> {
        match (&self.status, &self.error) {
            (QueryStatus::Error, Some(err)) if !err.is_transport() => Err(err.clone()),
            _ => Ok(self.visible.clone()),
        }
    }

    pub fn data_source(&self) -> Option<DataSource> {
        self.data_source
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn last_updated(&self) -> Timestamp {
        self.last_updated
    }

    /// Whether any optimistic overlay contributed to `data()`.
    pub fn is_overlaid(&self) -> bool {
        self.overlaid
    }

    pub fn version(&self) -> Option<ServerVersion> {
        self.version
    }
}
