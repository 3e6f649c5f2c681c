//! Tether Cache - Synchronous Sync Engine
//!
//! The state side of Tether: the query cache and its lifecycle rules, the
//! identity cache, the hydration bridge, the pagination state machine and the
//! optimistic overlay algebra. Nothing in this crate performs I/O; remote work
//! is passed in as futures by `tether-client`.

pub mod cache;
pub mod hydration;
pub mod identity;
pub mod overlay;
pub mod pagination;
pub mod single_flight;

pub use cache::{
    CacheEntry, CacheEvent, CacheStats, ChangeListener, ChangeSubscription, EntrySnapshot,
    QueryCache, Watermark,
};
pub use hydration::{HydratedEntry, HydrationBridge, HydrationPayload};
pub use identity::IdentityCache;
pub use overlay::{compare_json, OverlayApi, OverlayLayer, OverlayPhase, Patch};
pub use pagination::{Page, PageRequest, PageResult, PaginationState};
pub use single_flight::{Flight, SingleFlight};
