//! TOML configuration
//!
//! Every section and field has a default, so an empty file (or no file at all)
//! yields a usable configuration pointing at `127.0.0.1:1500`.
//!
//! ```toml
//! [hsm]
//! host = "10.0.0.5"
//! port = "1500"
//! pool_size = 4
//!
//! [pool]
//! dial_timeout_ms = 3000
//!
//! [reconnect]
//! max_attempts = 8
//! ```

use crate::connection::{ConnectionSettings, ReconnectConfig, ReconnectPolicy};
use crate::transport::{BrokerConfig, LinkSettings, PoolConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HsmConfig {
    #[serde(default)]
    pub hsm: HsmSection,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Endpoint and connection-level settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HsmSection {
    #[serde(default = "default_host")]
    pub host: String,
    /// Kept as a string, as entered by operators; must be numeric
    #[serde(default = "default_port")]
    pub port: String,
    /// Sockets in the pool; 0 is treated as 1 at connect time
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Default per-command timeout for the CLI
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> String {
    "1500".to_string()
}

fn default_pool_size() -> u32 {
    1
}

fn default_grace_period_ms() -> u64 {
    100
}

fn default_command_timeout_ms() -> u64 {
    5000
}

impl Default for HsmSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            pool_size: default_pool_size(),
            grace_period_ms: default_grace_period_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HsmConfig {
    /// Load and validate a configuration file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: HsmConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hsm.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("hsm.host must not be empty".to_string()));
        }
        validate_port(&self.hsm.port)?;
        if self.hsm.pool_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "hsm.pool_size must be at least 1".to_string(),
            ));
        }
        if self.broker.worker_count == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.worker_count must be at least 1".to_string(),
            ));
        }
        if self.broker.queue_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.queue_size must be at least 1".to_string(),
            ));
        }
        ReconnectPolicy::validate(&self.reconnect)
            .map_err(|reason| ConfigError::InvalidConfig(format!("reconnect: {reason}")))?;
        Ok(())
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            pool: self.pool.clone(),
            broker: self.broker.clone(),
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            link: self.link_settings(),
            reconnect: self.reconnect.clone(),
            grace_period: Duration::from_millis(self.hsm.grace_period_ms),
            ..Default::default()
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.hsm.command_timeout_ms)
    }
}

fn validate_port(port: &str) -> Result<(), ConfigError> {
    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(()),
        _ => Err(ConfigError::InvalidConfig(format!(
            "hsm.port '{port}' must be a number between 1 and 65535"
        ))),
    }
}
