//! Tether Core - Shared Types
//!
//! Pure data structures shared by the cache engine and the client runtime.
//! This crate contains ONLY data types, canonicalization and validation - no
//! I/O and no async code.

pub mod config;
pub mod enums;
pub mod error;
pub mod function;
pub mod identity;
pub mod key;
pub mod options;

pub use config::{IdentityConfig, PaginationConfig, ReconnectConfig, SyncConfig};
pub use enums::{ConnectionState, DataSource, FunctionKind, PaginationStatus, QueryStatus, SortOrder};
pub use error::{
    CacheError, ConfigError, FunctionError, IdentityError, OverlayError, TetherError,
    TetherResult, TransportError, ValidationError,
};
pub use function::{FunctionCall, FunctionName, QueryArgs};
pub use identity::{AuthToken, SessionCredential, SessionFingerprint};
pub use key::{canonical_json, CacheKey, PageKey, QueryKey};
pub use options::{
    ItemIdentity, ItemsTransform, PaginatedQueryOptions, QueryOptions, ValueTransform,
};

// ============================================================================
// SHARED ALIASES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier for an installed optimistic overlay.
///
/// UUIDv7 so overlays sort by installation time.
pub type OverlayId = uuid::Uuid;

/// Generate a new timestamp-sortable overlay id.
pub fn new_overlay_id() -> OverlayId {
    uuid::Uuid::now_v7()
}

/// Position in the backend's commit order.
///
/// A query result at version `v` reflects every write committed at or
/// below `v`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct ServerVersion(pub u64);

impl std::fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}
