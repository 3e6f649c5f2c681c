//! Tether Client - Async Runtime
//!
//! Binds the synchronous engine in `tether-cache` to a remote backend:
//! live subscriptions shared per key, server-render hydration, paginated
//! lists and optimistic mutations. The backend and token source are traits;
//! [`transport`] provides HTTP and WebSocket implementations.

/// Lifecycle logging: `info!` when the caller asked for verbose output,
/// `debug!` otherwise.
macro_rules! lifecycle {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

pub mod backend;
pub mod client;
pub mod config;
pub mod context;
pub mod multiplexer;
pub mod mutation;
pub mod paginated;
pub mod query;
pub mod telemetry;
pub mod transport;

pub use backend::{Backend, CallOutcome, SubscriptionEvent, SubscriptionStream, TokenProvider};
pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, ConfigLoadError};
pub use context::RenderContext;
pub use multiplexer::{RetryPolicy, SubscriptionHandle, SubscriptionMultiplexer};
pub use mutation::{Mutation, MutationOptions, OptimisticUpdate};
pub use paginated::PaginatedQuery;
pub use query::Query;
pub use telemetry::{init_tracing, TelemetryConfig};
pub use transport::{HttpBackend, HttpTokenProvider, RemoteBackend, WsBackend};

pub use tether_cache::{HydrationPayload, OverlayApi};
