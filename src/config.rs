//! Pipeline configuration
//!
//! Loaded from TOML, or built from the legacy environment variables. Secrets
//! never live in the file: credential fields name the environment variables
//! that hold them, and those are read at connect time.

use crate::broadcast::DEFAULT_CHANNEL_CAPACITY;
use crate::ingestion::ReconnectConfig;
use crate::protocol::{TopicError, TopicFilters};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid topic configuration: {0}")]
    InvalidTopic(#[from] TopicError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub mqtt: MqttSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub observers: ObserverSection,
    #[serde(default)]
    pub liveness: LivenessSection,
    #[serde(default)]
    pub resolver: ResolverSection,
    #[serde(default)]
    pub database: DatabaseSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// `mqtt://host:port` or `mqtts://host:port`
    pub broker_url: String,
    /// Environment variable holding the username
    pub username_env: Option<String>,
    /// Environment variable holding the password
    pub password_env: Option<String>,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_mqtt_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
    #[serde(default)]
    pub topics: TopicsSection,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            client_id_prefix: default_client_id_prefix(),
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            channel_capacity: default_mqtt_channel_capacity(),
            max_packet_size: default_max_packet_size(),
            topics: TopicsSection::default(),
        }
    }
}

fn default_client_id_prefix() -> String {
    "seano-ingest".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

/// The three subscribe requests are queued before the event loop is polled
pub const MIN_MQTT_CHANNEL_CAPACITY: usize = 3;

fn default_mqtt_channel_capacity() -> usize {
    100
}

fn default_max_packet_size() -> u32 {
    256 * 1024
}

/// Subscription templates, one per message class
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopicsSection {
    pub raw_log: String,
    pub sensor_log: String,
    pub vehicle_log: String,
}

impl Default for TopicsSection {
    fn default() -> Self {
        Self {
            raw_log: "seano/+/raw_log".to_string(),
            sensor_log: "seano/+/sensor_log".to_string(),
            vehicle_log: "seano/+/vehicle_log".to_string(),
        }
    }
}

impl TopicsSection {
    pub fn filters(&self) -> Result<TopicFilters, TopicError> {
        TopicFilters::from_templates(&self.raw_log, &self.sensor_log, &self.vehicle_log)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSection {
    /// Delay between attempts once `backoff_pattern_ms` is exhausted
    pub delay_ms: u64,
    /// Optional per-attempt delays used before settling on `delay_ms`
    pub backoff_pattern_ms: Vec<u64>,
    /// None retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            delay_ms: 5000,
            backoff_pattern_ms: Vec::new(),
            max_attempts: None,
        }
    }
}

impl ReconnectSection {
    pub fn to_reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: self.max_attempts,
            backoff_pattern: self.backoff_pattern_ms.clone(),
            sustained_delay: self.delay_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObserverSection {
    pub enabled: bool,
    pub bind: String,
    pub channel_capacity: usize,
}

impl Default for ObserverSection {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:8000".to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ObserverSection {
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|_| ConfigError::InvalidConfig(format!("invalid observer bind address '{}'", self.bind)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LivenessSection {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Bump link freshness from sensor_log and vehicle_log ingestion
    pub touch_on_ingest: bool,
}

impl Default for LivenessSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5,
            timeout_secs: 30,
            touch_on_ingest: true,
        }
    }
}

impl LivenessSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResolverSection {
    /// Positive-lookup cache size; 0 queries the store for every message
    pub cache_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseSection {
    /// Environment variable holding the `postgres://` URL
    pub url_env: String,
    pub max_pool_size: usize,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url_env: "DATABASE_URL".to_string(),
            max_pool_size: 16,
        }
    }
}

impl DatabaseSection {
    pub fn url(&self) -> Result<String, ConfigError> {
        std::env::var(&self.url_env).map_err(|_| ConfigError::EnvVarNotFound(self.url_env.clone()))
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from the legacy variable set using `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let use_tls = match lookup("MQTT_USE_TLS") {
            Some(value) => parse_bool(&value).ok_or_else(|| {
                ConfigError::InvalidConfig(format!("MQTT_USE_TLS must be a boolean, got '{value}'"))
            })?,
            None => true,
        };
        let host = lookup("MQTT_BROKER").unwrap_or_else(|| "localhost".to_string());
        let port = match lookup("MQTT_PORT") {
            Some(value) => value.parse::<u16>().map_err(|_| {
                ConfigError::InvalidConfig(format!("MQTT_PORT must be a port number, got '{value}'"))
            })?,
            None if use_tls => 8883,
            None => 1883,
        };
        let scheme = if use_tls { "mqtts" } else { "mqtt" };

        let defaults = TopicsSection::default();
        let topics = TopicsSection {
            raw_log: lookup("MQTT_TOPIC_RAW_LOG").unwrap_or(defaults.raw_log),
            sensor_log: lookup("MQTT_TOPIC_SENSOR_LOG").unwrap_or(defaults.sensor_log),
            vehicle_log: lookup("MQTT_TOPIC_VEHICLE_LOG").unwrap_or(defaults.vehicle_log),
        };

        let mut observers = ObserverSection::default();
        if let Some(bind) = lookup("OBSERVER_BIND") {
            observers.bind = bind;
        }

        let config = PipelineConfig {
            mqtt: MqttSection {
                broker_url: format!("{scheme}://{host}:{port}"),
                username_env: Some("MQTT_USERNAME".to_string()),
                password_env: Some("MQTT_PASSWORD".to_string()),
                topics,
                ..MqttSection::default()
            },
            reconnect: ReconnectSection::default(),
            observers,
            liveness: LivenessSection::default(),
            resolver: ResolverSection::default(),
            database: DatabaseSection::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.broker_url.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("mqtt.broker_url is empty".to_string()));
        }
        self.mqtt.topics.filters()?;

        if self.mqtt.channel_capacity < MIN_MQTT_CHANNEL_CAPACITY {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.channel_capacity must be at least {MIN_MQTT_CHANNEL_CAPACITY}, one slot per subscription"
            )));
        }
        if self.mqtt.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.keep_alive_secs must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_attempts must be greater than 0 or omitted for unlimited".to_string(),
            ));
        }
        if self.liveness.interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "liveness.interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.liveness.timeout_secs < self.liveness.interval_secs {
            return Err(ConfigError::InvalidConfig(format!(
                "liveness.timeout_secs ({}) must be at least liveness.interval_secs ({})",
                self.liveness.timeout_secs, self.liveness.interval_secs
            )));
        }
        if self.observers.channel_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "observers.channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.observers.enabled {
            self.observers.bind_addr()?;
        }
        Ok(())
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidConfig(e.to_string()))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
