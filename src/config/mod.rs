//! Application configuration.
//!
//! Aggregates the configuration of every component into a single [`Config`]
//! that can be loaded from YAML files or environment variables.

mod backends;
mod engine;
mod server;

pub use backends::{ArtefactsConfig, DevConfig, SecretsConfig};
pub use engine::{EngineConfig, RegistryConfig};
pub use server::ServerConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "provisioner.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "PROVISIONER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PROVISIONER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "PROVISIONER_LOG";

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// RPC surface.
    pub server: ServerConfig,
    /// Namespace for real resources across environments.
    pub cluster_id: String,
    /// Provisioner plugin bindings.
    pub registry: RegistryConfig,
    /// Local backends used by the developer-mode handlers.
    pub dev: DevConfig,
    /// Task polling and retry.
    pub engine: EngineConfig,
    /// Secrets cache and leader election.
    pub secrets: SecretsConfig,
    /// Artefact store.
    pub artefacts: ArtefactsConfig,
    /// Path to the project TOML.
    pub project_config: Option<String>,
    /// JSON schema deployed at start-up.
    pub bootstrap_schema: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cluster_id: "local".to_string(),
            registry: RegistryConfig::default(),
            dev: DevConfig::default(),
            engine: EngineConfig::default(),
            secrets: SecretsConfig::default(),
            artefacts: ArtefactsConfig::default(),
            project_config: None,
            bootstrap_schema: None,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `provisioner.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_id.is_empty() {
            return Err(ConfigError::Invalid("cluster_id must not be empty".to_string()));
        }
        if self.engine.poll_min_delay_ms == 0 || self.engine.poll_min_delay_ms > self.engine.poll_max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "engine poll delays out of order: min {}ms, max {}ms",
                self.engine.poll_min_delay_ms, self.engine.poll_max_delay_ms
            )));
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
