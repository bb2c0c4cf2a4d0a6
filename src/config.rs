//! Device client configuration
//!
//! Loaded once from TOML at startup and passed by value into the connection
//! manager, publish loop and command responder.

use crate::encoder::EncoderKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Main device configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub device: DeviceSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub publish: PublishSection,
    #[serde(default)]
    pub commands: CommandsSection,
    #[serde(default)]
    pub appmode: AppModeSection,
}

/// Device identity and telemetry stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Client id prefix; the device index is appended (`urn:lo:nsid:{namespace}:{id}`)
    #[serde(default = "default_urn_prefix")]
    pub urn_prefix: String,
    /// Timeseries the messages belong to
    pub stream: String,
    /// Data indexing model
    pub model: String,
    /// Number of devices simulated by this process
    #[serde(default = "default_device_count")]
    pub count: u32,
}

/// MQTT section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL: `mqtt://` for plain transport, `mqtts://` for TLS
    pub broker_url: String,
    /// Environment variable containing the API key
    pub api_key_env: String,
    /// Minimum gap between two publishes on one connection
    #[serde(default = "default_min_publish_interval")]
    pub min_publish_interval_ms: u64,
}

/// Which payload to publish and how often
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishSection {
    #[serde(default)]
    pub encoder: EncoderKind,
    #[serde(default)]
    pub mode: PublishMode,
    #[serde(default = "default_cadence")]
    pub cadence_secs: u64,
    #[serde(default = "default_data_topic")]
    pub data_topic: String,
    #[serde(default = "default_raw_topic_prefix")]
    pub raw_topic_prefix: String,
    /// Raw topic suffix for payloads the broker decodes as a number
    #[serde(default = "default_decodable_suffix")]
    pub decodable_suffix: String,
    /// Raw topic suffix for payloads the broker must not decode
    #[serde(default = "default_opaque_suffix")]
    pub opaque_suffix: String,
    /// Blob published by the opaque-raw encoder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<PathBuf>,
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            encoder: EncoderKind::default(),
            mode: PublishMode::default(),
            cadence_secs: default_cadence(),
            data_topic: default_data_topic(),
            raw_topic_prefix: default_raw_topic_prefix(),
            decodable_suffix: default_decodable_suffix(),
            opaque_suffix: default_opaque_suffix(),
            image_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    Once,
    #[default]
    Periodic,
}

/// Remote command handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_command_topic")]
    pub topic: String,
    #[serde(default = "default_response_topic")]
    pub response_topic: String,
    /// Upper bound on concurrently dispatched acknowledgments
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
}

impl Default for CommandsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            topic: default_command_topic(),
            response_topic: default_response_topic(),
            max_in_flight: default_max_in_flight(),
            drain_timeout_ms: default_drain_timeout(),
        }
    }
}

/// Second connection consuming a FIFO with application rights
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppModeSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fifo")]
    pub fifo: String,
}

impl Default for AppModeSection {
    fn default() -> Self {
        Self {
            enabled: false,
            fifo: default_fifo(),
        }
    }
}

fn default_urn_prefix() -> String {
    "urn:lo:nsid:samples:device".to_string()
}

fn default_device_count() -> u32 {
    1
}

fn default_min_publish_interval() -> u64 {
    500
}

fn default_cadence() -> u64 {
    10
}

fn default_data_topic() -> String {
    "dev/data".to_string()
}

fn default_raw_topic_prefix() -> String {
    "dev/v1/data/binary/".to_string()
}

fn default_decodable_suffix() -> String {
    "test".to_string()
}

fn default_opaque_suffix() -> String {
    "none".to_string()
}

fn default_command_topic() -> String {
    "dev/cmd".to_string()
}

fn default_response_topic() -> String {
    "dev/cmd/res".to_string()
}

/// Upper bound on concurrent acknowledgment workers
pub const MAX_IN_FLIGHT_LIMIT: usize = 1024;

fn default_max_in_flight() -> usize {
    16
}

fn default_drain_timeout() -> u64 {
    2000
}

fn default_fifo() -> String {
    "DeviceToDevice".to_string()
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DeviceConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.stream.is_empty() || self.device.model.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "device.stream and device.model must not be empty".to_string(),
            ));
        }
        if !self.device.urn_prefix.starts_with("urn:") {
            return Err(ConfigError::InvalidConfig(format!(
                "device.urn_prefix '{}' must start with 'urn:'",
                self.device.urn_prefix
            )));
        }
        if self.device.count == 0 {
            return Err(ConfigError::InvalidConfig(
                "device.count must be at least 1".to_string(),
            ));
        }
        if self.publish.cadence_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "publish.cadence_secs must be at least 1".to_string(),
            ));
        }
        if !(1..=MAX_IN_FLIGHT_LIMIT).contains(&self.commands.max_in_flight) {
            return Err(ConfigError::InvalidConfig(format!(
                "commands.max_in_flight must be between 1 and {MAX_IN_FLIGHT_LIMIT}"
            )));
        }

        let secured = self.is_secured()?;
        if self.appmode.enabled && !secured {
            return Err(ConfigError::InvalidConfig(
                "appmode requires an mqtts:// broker: the API key has more than device rights"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Whether the broker URL selects the TLS transport
    pub fn is_secured(&self) -> Result<bool, ConfigError> {
        let url = Url::parse(&self.mqtt.broker_url)
            .map_err(|_| ConfigError::InvalidBrokerUrl(self.mqtt.broker_url.clone()))?;
        match url.scheme() {
            "mqtts" | "ssl" => Ok(true),
            "mqtt" | "tcp" => Ok(false),
            _ => Err(ConfigError::InvalidBrokerUrl(self.mqtt.broker_url.clone())),
        }
    }

    /// Resolve the API key from its environment variable
    pub fn api_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.mqtt.api_key_env)
            .map_err(|_| ConfigError::EnvVarNotFound(self.mqtt.api_key_env.clone()))
    }

    pub fn min_publish_interval(&self) -> Duration {
        Duration::from_millis(self.mqtt.min_publish_interval_ms)
    }

    pub fn cadence(&self) -> Duration {
        Duration::from_secs(self.publish.cadence_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.commands.drain_timeout_ms)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
stream = "device1stream"
model = "devtype1"

[mqtt]
broker_url = "mqtt://localhost:1883"
api_key_env = "LO_API_KEY"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
