//! Error types for Tether operations

use crate::enums::QueryStatus;
use serde_json::Value;
use thiserror::Error;

/// Transport-level failures: the channel or the network, never the function.
///
/// These are recovered locally (reconnect) and only surface once retries are
/// exhausted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("Failed to send request: {reason}")]
    Send { reason: String },

    #[error("Failed to decode backend payload: {reason}")]
    Decode { reason: String },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Channel closed: {reason}")]
    ChannelClosed { reason: String },

    #[error("Gave up after {attempts} reconnect attempts: {last_reason}")]
    RetriesExhausted { attempts: u32, last_reason: String },
}

/// The remote function itself reported failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FunctionError {
    #[error("Function {function} failed: {message}")]
    Failed {
        function: String,
        message: String,
        data: Option<Value>,
    },
}

/// Token lookup or validation failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Token lookup failed: {reason}")]
    LookupFailed { reason: String },

    #[error("Token rejected by backend: {reason}")]
    Rejected { reason: String },
}

/// An optimistic mutation failed and its overlay was rolled back.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OverlayError {
    #[error("Optimistic update for {function} rolled back: {cause}")]
    RolledBack {
        function: String,
        cause: Box<TetherError>,
    },
}

/// Cache lifecycle violations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Invalid transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: QueryStatus,
        to: QueryStatus,
    },

    #[error("Operation {operation} is not permitted on the skip key")]
    SkipKey { operation: &'static str },

    #[error("Fetch for {key} was superseded")]
    Superseded { key: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Validation errors for caller-supplied identifiers and arguments.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid function name {name:?}: {reason}")]
    InvalidFunctionName { name: String, reason: String },

    #[error("Invalid arguments: {reason}")]
    InvalidArgs { reason: String },
}

/// Master error type for all Tether errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TetherError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Function(#[from] FunctionError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("{0}")]
    Overlay(#[from] OverlayError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl TetherError {
    /// Shorthand for a backend-reported function failure.
    pub fn function(function: impl Into<String>, message: impl Into<String>) -> Self {
        TetherError::Function(FunctionError::Failed {
            function: function.into(),
            message: message.into(),
            data: None,
        })
    }

    /// Transport failures keep the last good value visible.
    pub fn is_transport(&self) -> bool {
        matches!(self, TetherError::Transport(_))
    }

    /// Function-level failures (including identity failures on authenticated
    /// calls) flip an entry to `Error` and hide its value.
    pub fn is_function(&self) -> bool {
        matches!(self, TetherError::Function(_) | TetherError::Identity(_))
    }

    /// The innermost human-readable message.
    pub fn message(&self) -> String {
        match self {
            TetherError::Function(FunctionError::Failed { message, .. }) => message.clone(),
            TetherError::Overlay(OverlayError::RolledBack { cause, .. }) => cause.message(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for Tether operations.
pub type TetherResult<T> = Result<T, TetherError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_error_display_contains_message() {
        let err = TetherError::function("messages:list", "boom");
        let msg = format!("{}", err);
        assert!(msg.contains("messages:list"));
        assert!(msg.contains("boom"));
        assert_eq!(err.message(), "boom");
        assert!(err.is_function());
        assert!(!err.is_transport());
    }

    #[test]
    fn test_transport_error_display_retries_exhausted() {
        let err = TransportError::RetriesExhausted {
            attempts: 5,
            last_reason: "connection reset".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("5"));
        assert!(msg.contains("connection reset"));
        assert!(TetherError::from(err).is_transport());
    }

    #[test]
    fn test_overlay_error_unwraps_cause_message() {
        let err = TetherError::from(OverlayError::RolledBack {
            function: "messages:send".to_string(),
            cause: Box::new(TetherError::function("messages:send", "quota exceeded")),
        });
        assert!(err.to_string().contains("rolled back"));
        assert_eq!(err.message(), "quota exceeded");
        assert!(!err.is_transport());
    }

    #[test]
    fn test_identity_errors_are_function_class() {
        let err = TetherError::from(IdentityError::LookupFailed {
            reason: "auth service down".to_string(),
        });
        assert!(err.is_function());
    }

    #[test]
    fn test_tether_error_from_variants() {
        let cache = TetherError::from(CacheError::SkipKey { operation: "fetch" });
        assert!(matches!(cache, TetherError::Cache(_)));

        let config = TetherError::from(ConfigError::MissingRequired {
            field: "ws_endpoint".to_string(),
        });
        assert!(matches!(config, TetherError::Config(_)));

        let validation = TetherError::from(ValidationError::InvalidArgs {
            reason: "not an object".to_string(),
        });
        assert!(matches!(validation, TetherError::Validation(_)));
    }
}
