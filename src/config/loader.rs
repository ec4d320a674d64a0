//! Configuration Loader
//!
//! Environment-aware loading built on the `config` crate. Sources are merged in
//! order, later ones winning:
//!
//! 1. compiled defaults ([`AgentBusConfig::default`])
//! 2. `<config_dir>/base.toml` (optional)
//! 3. `<config_dir>/<environment>.toml` (optional)
//! 4. `AGENTBUS__<SECTION>__<KEY>` environment variables
//!
//! The environment name comes from `AGENTBUS_ENV` and defaults to `development`.
//! The config directory comes from `AGENTBUS_CONFIG_DIR` and defaults to
//! `config/agentbus`.

use std::collections::HashMap;
use std::path::PathBuf;

use config::{Config, Environment, File, FileFormat};
use tracing::{debug, info};

use super::error::ConfigResult;
use super::AgentBusConfig;

pub const ENV_PREFIX: &str = "AGENTBUS";
const DEFAULT_ENVIRONMENT: &str = "development";
const DEFAULT_CONFIG_DIR: &str = "config/agentbus";

#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    config_dir: Option<PathBuf>,
    environment: Option<String>,
    env_overrides: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Use this map instead of the process environment for `AGENTBUS__*` overrides
    pub fn with_env_overrides(mut self, vars: HashMap<String, String>) -> Self {
        self.env_overrides = Some(vars);
        self
    }

    pub fn detect_environment() -> String {
        std::env::var("AGENTBUS_ENV").unwrap_or_else(|_| DEFAULT_ENVIRONMENT.to_string())
    }

    fn config_directory(&self) -> PathBuf {
        self.config_dir.clone().unwrap_or_else(|| {
            std::env::var("AGENTBUS_CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR))
        })
    }

    pub fn load(&self) -> ConfigResult<AgentBusConfig> {
        let environment = self
            .environment
            .clone()
            .unwrap_or_else(Self::detect_environment);
        let config_dir = self.config_directory();

        debug!(
            environment = %environment,
            config_dir = %config_dir.display(),
            "Loading configuration"
        );

        let env_source = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .source(self.env_overrides.clone());

        let config: AgentBusConfig = Config::builder()
            .add_source(Config::try_from(&AgentBusConfig::default())?)
            .add_source(
                File::from(config_dir.join("base.toml"))
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                File::from(config_dir.join(format!("{environment}.toml")))
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(env_source)
            .build()?
            .try_deserialize()?;

        config.validate()?;

        let sanitized = config.sanitized();
        info!(
            environment = %environment,
            provider = ?sanitized.transport.provider,
            redis_url = sanitized.transport.redis_url.as_deref().unwrap_or("-"),
            "Configuration loaded"
        );

        Ok(config)
    }
}
