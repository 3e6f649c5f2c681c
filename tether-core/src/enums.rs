//! Enum types for query lifecycle, pagination and transport state

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// QUERY LIFECYCLE
// ============================================================================

/// Lifecycle status of a cache entry.
///
/// `Idle` is reserved for the skip sentinel: a real key never sits idle, it is
/// created `Pending` by the consumer that is about to fetch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Idle,
    Pending,
    Success,
    Error,
}

impl QueryStatus {
    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// `Success -> Pending` is an explicit refresh and `Error -> Pending` a
    /// retry. Push-driven results may land on any non-idle entry. An entry
    /// that is already loading cannot start loading again, and nothing
    /// returns to `Idle`.
    pub fn can_transition_to(self, next: QueryStatus) -> bool {
        use QueryStatus::*;
        match (self, next) {
            (Idle, Pending) => true,
            (Idle, _) | (_, Idle) => false,
            (Pending, Pending) => false,
            (Pending, Success | Error) => true,
            (Success | Error, Pending | Success | Error) => true,
        }
    }

    /// True once a result (value or error) has been observed.
    pub fn is_settled(self) -> bool {
        matches!(self, QueryStatus::Success | QueryStatus::Error)
    }
}

/// Where the current value of an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Transferred from the server render without a remote call.
    Hydrated,
    /// Delivered by a live push channel.
    Subscription,
    /// Served from an entry another consumer already populated.
    CacheReuse,
    /// Result of a one-shot remote call (server render or refresh).
    Fetch,
}

impl DataSource {
    /// Authoritative sources advance the entry's watermark and settle overlays.
    pub fn is_authoritative(self) -> bool {
        matches!(self, DataSource::Subscription | DataSource::Fetch)
    }
}

/// State of the push channel feeding an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No channel is open for the key.
    #[default]
    Closed,
    /// Channel open and delivering updates.
    Live,
    /// Transport dropped; the last value is shown while reconnecting.
    Reconnecting,
}

// ============================================================================
// PAGINATION
// ============================================================================

/// Overall status of a paginated query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaginationStatus {
    LoadingFirstPage,
    CanLoadMore,
    LoadingMore,
    Exhausted,
    Error,
}

impl PaginationStatus {
    pub fn is_loading(self) -> bool {
        matches!(
            self,
            PaginationStatus::LoadingFirstPage | PaginationStatus::LoadingMore
        )
    }
}

/// Sort direction for position-preserving optimistic inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

// ============================================================================
// FUNCTIONS
// ============================================================================

/// Kind of remote function being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    Query,
    Mutation,
}

impl FunctionKind {
    /// Path segment used by HTTP transports.
    pub fn as_path(self) -> &'static str {
        match self {
            FunctionKind::Query => "query",
            FunctionKind::Mutation => "mutation",
        }
    }
}

fn normalize_token(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            QueryStatus::Idle => "idle",
            QueryStatus::Pending => "pending",
            QueryStatus::Success => "success",
            QueryStatus::Error => "error",
        };
        write!(f, "{}", value)
    }
}

impl FromStr for QueryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "idle" => Ok(QueryStatus::Idle),
            "pending" | "loading" => Ok(QueryStatus::Pending),
            "success" => Ok(QueryStatus::Success),
            "error" => Ok(QueryStatus::Error),
            _ => Err(format!("Invalid QueryStatus: {}", s)),
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            DataSource::Hydrated => "hydrated",
            DataSource::Subscription => "subscription",
            DataSource::CacheReuse => "cache-reuse",
            DataSource::Fetch => "fetch",
        };
        write!(f, "{}", value)
    }
}

impl fmt::Display for PaginationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            PaginationStatus::LoadingFirstPage => "LoadingFirstPage",
            PaginationStatus::CanLoadMore => "CanLoadMore",
            PaginationStatus::LoadingMore => "LoadingMore",
            PaginationStatus::Exhausted => "Exhausted",
            PaginationStatus::Error => "Error",
        };
        write!(f, "{}", value)
    }
}

impl FromStr for PaginationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "loadingfirstpage" => Ok(PaginationStatus::LoadingFirstPage),
            "canloadmore" => Ok(PaginationStatus::CanLoadMore),
            "loadingmore" => Ok(PaginationStatus::LoadingMore),
            "exhausted" => Ok(PaginationStatus::Exhausted),
            "error" => Ok(PaginationStatus::Error),
            _ => Err(format!("Invalid PaginationStatus: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_only_leads_to_pending() {
        assert!(QueryStatus::Idle.can_transition_to(QueryStatus::Pending));
        assert!(!QueryStatus::Success.can_transition_to(QueryStatus::Idle));
        assert!(QueryStatus::Success.can_transition_to(QueryStatus::Pending));
        assert!(QueryStatus::Error.can_transition_to(QueryStatus::Pending));
        assert!(QueryStatus::Pending.can_transition_to(QueryStatus::Error));
    }

    #[test]
    fn test_loading_entry_cannot_start_loading_again() {
        assert!(!QueryStatus::Pending.can_transition_to(QueryStatus::Pending));
        assert!(!QueryStatus::Idle.can_transition_to(QueryStatus::Success));
        assert!(QueryStatus::Success.can_transition_to(QueryStatus::Success));
        assert!(QueryStatus::Success.can_transition_to(QueryStatus::Error));
        assert!(QueryStatus::Error.can_transition_to(QueryStatus::Success));
    }

    #[test]
    fn test_status_round_trips_through_display() {
        for status in [
            QueryStatus::Idle,
            QueryStatus::Pending,
            QueryStatus::Success,
            QueryStatus::Error,
        ] {
            assert_eq!(status.to_string().parse::<QueryStatus>(), Ok(status));
        }
        assert_eq!(
            "can_load_more".parse::<PaginationStatus>(),
            Ok(PaginationStatus::CanLoadMore)
        );
        assert!("bogus".parse::<PaginationStatus>().is_err());
    }

    #[test]
    fn test_authoritative_sources() {
        assert!(DataSource::Subscription.is_authoritative());
        assert!(DataSource::Fetch.is_authoritative());
        assert!(!DataSource::Hydrated.is_authoritative());
        assert!(!DataSource::CacheReuse.is_authoritative());
    }
}
