//! Configuration structures for tag communication.
//!
//! Supports TOML deserialization with sensible defaults for
//! development and explicit values for production deployment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default AMS port of the first TwinCAT 3 PLC runtime.
pub const DEFAULT_ADS_PORT: u16 = 851;

/// Top-level communication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    /// Transport selection and addressing.
    pub transport: TransportConfig,

    /// Tag listener strategy.
    pub listener: ListenerConfig,

    /// Polling manager timing.
    pub polling: PollingConfig,

    /// DataChannel handshake timing.
    pub data_channel: DataChannelConfig,

    /// Tags to track.
    pub tags: Vec<TagDefinition>,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Transport driver.
    pub driver: TransportDriver,

    /// AMS net id of the target (e.g. "5.12.34.56.1.1").
    pub ams_net_id: String,

    /// AMS port of the PLC runtime.
    pub port: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            driver: TransportDriver::Simulated,
            ams_net_id: String::from("127.0.0.1.1.1"),
            port: DEFAULT_ADS_PORT,
        }
    }
}

/// Supported transport drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportDriver {
    /// In-memory simulated PLC.
    #[default]
    Simulated,
}

/// Refresh strategy of a tag listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ListenerMode {
    /// Dedicated thread reads all active tags every refresh period.
    #[default]
    Polling,
    /// PLC-side change notifications per tag.
    Notification,
}

/// Tag listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Which refresh strategy to use.
    pub mode: ListenerMode,

    /// Hard ceiling on notification subscriptions.
    pub max_subscriptions: usize,

    /// Cycle time requested for PLC-side notifications.
    #[serde(with = "humantime_serde")]
    pub notification_cycle: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            mode: ListenerMode::Polling,
            max_subscriptions: 500,
            notification_cycle: Duration::from_millis(10),
        }
    }
}

/// Polling manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Period between two polling cycles.
    #[serde(with = "humantime_serde")]
    pub refresh_rate: Duration,

    /// Downtime budget before the polling thread gives up.
    #[serde(with = "humantime_serde")]
    pub reconnect_timeout: Duration,

    /// Number of cycles aggregated into one performance summary.
    pub performance_samples: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            refresh_rate: Duration::from_millis(100),
            reconnect_timeout: Duration::from_secs(30),
            performance_samples: 100,
        }
    }
}

/// DataChannel handshake configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataChannelConfig {
    /// Interval between two handshake reads.
    #[serde(with = "humantime_serde")]
    pub polling_rate: Duration,

    /// Time allowed for the PLC to acknowledge one send attempt.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Payload resends allowed after `InvalidDataReceived`.
    pub max_retries: u32,

    /// Time allowed for a queued controller write to complete.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self {
            polling_rate: Duration::from_millis(20),
            timeout: Duration::from_secs(5),
            max_retries: 5,
            write_timeout: Duration::from_secs(2),
        }
    }
}

/// Declarative tag description used by the daemon and tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagDefinition {
    /// Scope (POU or GVL name), may be empty.
    #[serde(default)]
    pub scope: String,

    /// Variable name within the scope.
    pub name: String,

    /// IEC 61131-3 type name or UDT name.
    pub data_type: String,

    /// Memory area, if the PLC distinguishes several.
    #[serde(default)]
    pub area: String,

    /// Whether the tag takes part in refresh cycles.
    #[serde(default = "default_active")]
    pub active: bool,

    /// Manual bit size override.
    #[serde(default)]
    pub bit_size: Option<i64>,

    /// Struct members, in declaration order.
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

/// Struct member of a [`TagDefinition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Member name.
    pub name: String,
    /// Member type name.
    pub data_type: String,
}

fn default_active() -> bool {
    true
}

impl CommConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Reject values the runtime cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.polling.refresh_rate.is_zero() {
            return Err(ConfigError::Invalid("polling.refresh_rate must be > 0".into()));
        }
        if self.data_channel.polling_rate.is_zero() {
            return Err(ConfigError::Invalid(
                "data_channel.polling_rate must be > 0".into(),
            ));
        }
        if self.listener.max_subscriptions == 0 {
            return Err(ConfigError::Invalid(
                "listener.max_subscriptions must be > 0".into(),
            ));
        }
        if let Some(tag) = self.tags.iter().find(|t| t.name.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "tag with data type {} has an empty name",
                tag.data_type
            )));
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Semantically invalid value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
