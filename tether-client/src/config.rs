//! Configuration loading for a Tether client process.
//!
//! All fields are required unless explicitly marked optional. No defaults.

use crate::telemetry::TelemetryConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_core::{SyncConfig, TetherError};

pub const CONFIG_ENV: &str = "TETHER_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub http_endpoint: String,
    pub ws_endpoint: String,
    pub auth_endpoint: String,
    pub request_timeout_ms: u64,
    pub sync: SyncConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Missing configuration file path (use --config or TETHER_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("Invalid sync config: {0}")]
    Sync(#[from] TetherError),
}

impl ClientConfig {
    pub fn load() -> Result<Self, ConfigLoadError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigLoadError::MissingConfigPath)?;
        Self::from_path(&path)
    }

    /// Read, parse and validate one file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigLoadError> {
        let contents = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        require_url("http_endpoint", &self.http_endpoint, &["http://", "https://"])?;
        require_url("ws_endpoint", &self.ws_endpoint, &["ws://", "wss://"])?;
        require_url("auth_endpoint", &self.auth_endpoint, &["http://", "https://"])?;
        if self.request_timeout_ms == 0 {
            return Err(ConfigLoadError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if let Some(filter) = &self.telemetry.filter {
            if filter.trim().is_empty() {
                return Err(ConfigLoadError::InvalidValue {
                    field: "telemetry.filter",
                    reason: "must not be empty when set".to_string(),
                });
            }
        }
        self.sync.validate()?;
        Ok(())
    }
}

fn require_url(field: &'static str, value: &str, schemes: &[&str]) -> Result<(), ConfigLoadError> {
    if value.trim().is_empty() {
        return Err(ConfigLoadError::InvalidValue {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    if !schemes.iter().any(|scheme| value.starts_with(scheme)) {
        return Err(ConfigLoadError::InvalidValue {
            field,
            reason: format!("must start with one of {}", schemes.join(", ")),
        });
    }
    Ok(())
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
