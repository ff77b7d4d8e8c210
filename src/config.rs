//! Client configuration
//!
//! Configuration is immutable once a session starts; changing any field
//! requires building a new client. Every section has defaults matching the
//! command-line subscriber, so an empty TOML file is a valid configuration.

use crate::client::health_monitor::HealthMonitor;
use crate::client::reconnect::ReconnectConfig;
use crate::protocol::{validate_topic_name, ProtocolVersion, QoS};
use crate::transport::BrokerAddress;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Complete client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    /// Last Will registered with the broker at connect time
    pub will: Option<WillSection>,
}

/// Broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL, e.g. `tcp://127.0.0.1:1883`
    #[serde(default = "default_server")]
    pub server: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            server: default_server(),
            username_env: None,
            password_env: None,
        }
    }
}

fn default_server() -> String {
    "tcp://127.0.0.1:1883".to_string()
}

/// Session section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    /// Session identity; empty means "generate one"
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    /// Default subscribe QoS
    #[serde(default)]
    pub qos: u8,
    /// Keep-alive interval in seconds (0 disables pings)
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// PINGRESP deadline in milliseconds
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// CONNACK deadline in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// 4 = MQTT 3.1.1, 3 = MQTT 3.1
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u8,
    /// Largest inbound packet accepted, in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            clean_session: true,
            qos: 0,
            keep_alive_secs: default_keep_alive_secs(),
            ping_timeout_ms: default_ping_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            protocol_version: default_protocol_version(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_ping_timeout_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_protocol_version() -> u8 {
    4
}

fn default_max_packet_size() -> usize {
    crate::protocol::codec::MAX_PACKET_SIZE
}

/// Reconnection section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Enable the reconnection supervisor
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    /// Give up after this many failed attempts (None = retry forever)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_interval_ms: default_max_interval_ms(),
            max_attempts: None,
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_interval_ms() -> u64 {
    10_000
}

/// Last Will section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WillSection {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field against protocol limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        BrokerAddress::parse(&self.broker.server)?;

        let session = &self.session;
        let protocol = ProtocolVersion::from_level(session.protocol_version).ok_or_else(|| {
            ConfigError::InvalidConfig(format!(
                "protocol_version must be 3 or 4, got {}",
                session.protocol_version
            ))
        })?;
        QoS::try_from(session.qos).map_err(ConfigError::InvalidConfig)?;
        if session.keep_alive_secs > u64::from(u16::MAX) {
            return Err(ConfigError::InvalidConfig(format!(
                "keep_alive_secs must be at most 65535, got {}",
                session.keep_alive_secs
            )));
        }
        if session.ping_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "ping_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if session.client_id.len() > usize::from(u16::MAX) {
            return Err(ConfigError::InvalidConfig(
                "client_id exceeds 65535 bytes".to_string(),
            ));
        }
        if protocol == ProtocolVersion::V31 && session.client_id.len() > 23 {
            return Err(ConfigError::InvalidConfig(
                "MQTT 3.1 client_id must be at most 23 bytes".to_string(),
            ));
        }

        HealthMonitor::validate_connection_config(&self.reconnect_config())
            .map_err(|e| ConfigError::InvalidConfig(format!("reconnect: {e}")))?;

        if let Some(will) = &self.will {
            validate_topic_name(&will.topic)
                .map_err(|e| ConfigError::InvalidConfig(format!("will topic: {e}")))?;
            QoS::try_from(will.qos).map_err(ConfigError::InvalidConfig)?;
        }

        Ok(())
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion::from_level(self.session.protocol_version).unwrap_or(ProtocolVersion::V311)
    }

    pub fn default_qos(&self) -> QoS {
        QoS::try_from(self.session.qos).unwrap_or(QoS::AtMostOnce)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.session.keep_alive_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.session.ping_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.session.connect_timeout_ms)
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
            multiplier: self.reconnect.multiplier,
            max_interval: Duration::from_millis(self.reconnect.max_interval_ms),
            max_attempts: self.reconnect.max_attempts,
        }
    }

    /// Get MQTT username from environment variable
    pub fn username(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn password(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.password_env.as_ref())
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }
}

const CLIENT_ID_LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Build `{prefix}|{12 random letters}` from the caller's generator
pub fn generate_client_id<R: Rng + ?Sized>(prefix: &str, rng: &mut R) -> String {
    let suffix: String = (0..12)
        .map(|_| char::from(CLIENT_ID_LETTERS[rng.gen_range(0..CLIENT_ID_LETTERS.len())]))
        .collect();
    format!("{prefix}|{suffix}")
}
