//! Configuration types for the sync engine.
//!
//! `SyncConfig::default()` is the programmatic baseline. When loaded from a
//! config file every field is required (see `tether-client::config`).

use crate::error::{ConfigError, TetherError, TetherResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnect policy for subscription channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
    /// Consecutive failed attempts before the entry is surfaced as an error.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 250,
            max_ms: 10_000,
            multiplier: 2.0,
            jitter_ms: 100,
            max_attempts: 8,
        }
    }
}

/// Identity cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    /// Lifetime of a cached token.
    pub token_ttl_ms: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            token_ttl_ms: 60_000,
        }
    }
}

impl IdentityConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_millis(self.token_ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaginationConfig {
    pub default_initial_num_items: usize,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_initial_num_items: 10,
        }
    }
}

/// Master configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    pub reconnect: ReconnectConfig,
    pub identity: IdentityConfig,
    pub pagination: PaginationConfig,
    /// Upper bound on how long a confirmed overlay waits for the
    /// authoritative update before it is dropped anyway.
    pub overlay_settle_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            identity: IdentityConfig::default(),
            pagination: PaginationConfig::default(),
            overlay_settle_timeout_ms: 5_000,
        }
    }
}

impl SyncConfig {
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_identity(mut self, identity: IdentityConfig) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_token_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.identity.token_ttl_ms = ttl_ms;
        self
    }

    pub fn with_pagination(mut self, pagination: PaginationConfig) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn with_overlay_settle_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.overlay_settle_timeout_ms = timeout_ms;
        self
    }

    pub fn overlay_settle_timeout(&self) -> Duration {
        Duration::from_millis(self.overlay_settle_timeout_ms)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - reconnect delays are positive and `max_ms >= initial_ms`
    /// - reconnect multiplier >= 1.0 and `max_attempts > 0`
    /// - token TTL, default page size and settle timeout are positive
    pub fn validate(&self) -> TetherResult<()> {
        if self.reconnect.initial_ms == 0 {
            return Err(invalid(
                "reconnect.initial_ms",
                self.reconnect.initial_ms,
                "must be > 0",
            ));
        }
        if self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(invalid(
                "reconnect.max_ms",
                self.reconnect.max_ms,
                "must be >= reconnect.initial_ms",
            ));
        }
        if !(self.reconnect.multiplier >= 1.0) {
            return Err(invalid(
                "reconnect.multiplier",
                self.reconnect.multiplier,
                "must be >= 1.0",
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(invalid(
                "reconnect.max_attempts",
                self.reconnect.max_attempts,
                "must be > 0",
            ));
        }
        if self.identity.token_ttl_ms == 0 {
            return Err(invalid(
                "identity.token_ttl_ms",
                self.identity.token_ttl_ms,
                "must be > 0",
            ));
        }
        if self.pagination.default_initial_num_items == 0 {
            return Err(invalid(
                "pagination.default_initial_num_items",
                self.pagination.default_initial_num_items,
                "must be > 0",
            ));
        }
        if self.overlay_settle_timeout_ms == 0 {
            return Err(invalid(
                "overlay_settle_timeout_ms",
                self.overlay_settle_timeout_ms,
                "must be > 0",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> TetherError {
    TetherError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builders_apply() {
        let config = SyncConfig::default()
            .with_token_ttl_ms(1_000)
            .with_overlay_settle_timeout_ms(250);
        assert_eq!(config.identity.token_ttl(), Duration::from_millis(1_000));
        assert_eq!(config.overlay_settle_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_rejects_inverted_backoff_bounds() {
        let config = SyncConfig::default().with_reconnect(ReconnectConfig {
            initial_ms: 500,
            max_ms: 100,
            ..ReconnectConfig::default()
        });
        match config.validate() {
            Err(TetherError::Config(ConfigError::InvalidValue { field, .. })) => {
                assert_eq!(field, "reconnect.max_ms");
            }
            other => panic!("expected invalid max_ms, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_nan_multiplier() {
        let config = SyncConfig::default().with_reconnect(ReconnectConfig {
            multiplier: f64::NAN,
            ..ReconnectConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_page_size() {
        let config = SyncConfig::default().with_pagination(PaginationConfig {
            default_initial_num_items: 0,
        });
        assert!(config.validate().is_err());
    }
}
