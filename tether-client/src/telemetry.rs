//! Tracing subscriber setup.

use serde::Deserialize;
use tether_core::{ConfigError, TetherError, TetherResult};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable consulted before the configured filter.
pub const LOG_ENV: &str = "TETHER_LOG";

pub const DEFAULT_FILTER: &str = "tether_client=info,tether_cache=info";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Filter directives used when `TETHER_LOG` is unset.
    pub filter: Option<String>,
}

impl TelemetryConfig {
    fn env_filter(&self) -> TetherResult<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV) {
            return Ok(filter);
        }
        let directives = self.filter.as_deref().unwrap_or(DEFAULT_FILTER);
        EnvFilter::try_new(directives).map_err(|e| {
            TetherError::Config(ConfigError::InvalidValue {
                field: "telemetry.filter".to_string(),
                value: directives.to_string(),
                reason: e.to_string(),
            })
        })
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> TetherResult<()> {
    let filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    installed.map_err(|e| {
        TetherError::Config(ConfigError::InvalidValue {
            field: "telemetry".to_string(),
            value: if config.json { "json" } else { "pretty" }.to_string(),
            reason: format!("failed to install tracing subscriber: {}", e),
        })
    })
}
