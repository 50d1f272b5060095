//! Engine configuration.
//!
//! Each subsystem owns its config struct next to its implementation; this
//! module aggregates them and reads the environment-supplied API settings.

use crate::error::{CascadeResult, ConfigError};
use crate::querier::QuerierSchedulerConfig;
use crate::reactor::DispatchConfig;
use crate::sensor::{ContainerConfig, PartitionPolicy};

/// Environment variable naming the management API base URL.
pub const ENV_API_URL: &str = "CASCADE_API_URL";

/// Environment variable carrying the management API auth token.
pub const ENV_AUTH_TOKEN: &str = "CASCADE_AUTH_TOKEN";

/// Connection settings for the management API collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    /// Base URL, e.g. `https://cascade.internal:9101/v1`.
    pub base_url: String,

    /// Bearer token presented on every call.
    pub auth_token: String,
}

impl ApiConfig {
    /// Reads the API settings from the environment.
    pub fn from_env() -> CascadeResult<Self> {
        Ok(Self {
            base_url: require_env(ENV_API_URL)?,
            auth_token: require_env(ENV_AUTH_TOKEN)?,
        })
    }
}

fn require_env(name: &str) -> CascadeResult<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnvVar {
            name: name.to_string(),
        }
        .into()),
    }
}

/// Aggregate engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Trigger dispatch queue settings.
    pub dispatch: DispatchConfig,

    /// Sensor supervision settings.
    pub container: ContainerConfig,

    /// Querier scheduler settings.
    pub querier: QuerierSchedulerConfig,

    /// Which sensors this process runs.
    pub partition: PartitionPolicy,
}
