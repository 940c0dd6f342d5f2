//! Application configuration.
//!
//! Loaded from YAML files and environment variables into a single Config
//! struct.

mod agent;
mod server;

pub use agent::{
    AgentConfig, ClusterConfig, ForwarderConfig, HomeNetworkConfig, OAuth2Config, TlsConfig,
    DEFAULT_DATA_PLANE_ADDRESS, DEFAULT_TOKEN_URL,
};
pub use server::{ServerConfig, DEFAULT_PORT};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "pba.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "PBA_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PBA";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "PBA_LOG";

use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener for cluster peers.
    pub server: ServerConfig,
    /// Packet Broker Agent.
    pub agent: AgentConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `pba.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("agent.home_network.dev_addr_prefixes")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Create config for testing.
    #[cfg(test)]
    pub fn for_test() -> Self {
        Self::default()
    }
}
