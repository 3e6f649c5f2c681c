//! Query cache with an explicit lifecycle.
//!
//! Entries move through `Pending -> Success | Error` and back to `Pending` on
//! refresh, never losing their last known value. Reads return an
//! [`EntrySnapshot`] that carries status, provenance and connection state
//! alongside the visible value, so callers can tell a live result from a
//! stale one.
//!
//! # Example
//!
//! ```ignore
//! let cache = QueryCache::new();
//! let key = CacheKey::query(&FunctionName::new("messages:list")?, &json!({}));
//!
//! // Identical concurrent fetches share one remote call.
//! let snapshot = cache.fetch(&key, DataSource::Fetch, || backend.call()).await?;
//!
//! if snapshot.connection() == ConnectionState::Reconnecting {
//!     tracing::warn!(key = %key, "showing the last value while reconnecting");
//! }
//! ```

pub mod entry;
pub mod query_cache;
pub mod stats;
pub mod watermark;

pub use entry::{CacheEntry, EntrySnapshot, HeldUpdate};
pub use query_cache::{CacheEvent, ChangeListener, ChangeSubscription, QueryCache};
pub use stats::CacheStats;
pub use watermark::{Watermark, WatermarkRegistry};
