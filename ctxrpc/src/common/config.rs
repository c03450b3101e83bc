use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

pub trait LoggingConfigLoader {
    fn get_file_logger_config(&self) -> FileLoggerConfig;

    fn get_console_logger_config(&self) -> ConsoleLoggerConfig;
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct FileLoggerConfig {
    pub level: Option<String>,
    pub file: Option<String>,
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct ConsoleLoggerConfig {
    pub level: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default, derive_builder::Builder)]
pub struct LoggingConfig {
    #[builder(setter(into, strip_option), default = None)]
    #[serde(default)]
    file_logger: Option<FileLoggerConfig>,
    #[builder(setter(into, strip_option), default = None)]
    #[serde(default)]
    console_logger: Option<ConsoleLoggerConfig>,
}

impl LoggingConfigLoader for &LoggingConfig {
    fn get_file_logger_config(&self) -> FileLoggerConfig {
        self.file_logger.clone().unwrap_or_default()
    }

    fn get_console_logger_config(&self) -> ConsoleLoggerConfig {
        self.console_logger.clone().unwrap_or_default()
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn default_name() -> String {
    "rpc".to_string()
}

/// Per-connection settings shared by both ends of a channel.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RpcConfig {
    /// Label attached to every tracing span of the connection.
    #[serde(default = "default_name")]
    pub name: String,
    /// How often a server broadcasts an untargeted heartbeat.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Client side: dispose the connection when nothing at all is received
    /// for this long. Unset means no liveness check.
    #[serde(default)]
    pub liveness_timeout_ms: Option<u64>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            liveness_timeout_ms: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl RpcConfig {
    pub fn new_from_str(config_str: &str) -> Result<Self, anyhow::Error> {
        let config = toml::de::from_str::<RpcConfig>(config_str)
            .with_context(|| format!("failed to parse config file: {}", config_str))?;
        if config.heartbeat_interval_ms == 0 {
            anyhow::bail!("heartbeat_interval_ms must be greater than zero");
        }
        Ok(config)
    }

    pub fn new(config_path: &PathBuf) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {:?}", config_path))?;
        Self::new_from_str(&config_str)
    }

    /// A zero interval falls back to the default.
    pub fn heartbeat_interval(&self) -> Duration {
        if self.heartbeat_interval_ms == 0 {
            tracing::warn!(
                default_ms = DEFAULT_HEARTBEAT_INTERVAL_MS,
                "heartbeat_interval_ms is zero, using default"
            );
            return Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS);
        }
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Option<Duration> {
        self.liveness_timeout_ms.map(Duration::from_millis)
    }

    pub fn dump(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}
