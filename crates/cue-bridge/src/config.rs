//! Bridge Configuration
//!
//! Loaded from a TOML file (`cue-bridge.toml` by default), then overridden by
//! `CUE_BRIDGE_*` environment variables and finally by command-line flags.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::registry::TopicScheme;
use crate::types::{Error, Result};

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub sdk: SdkConfig,
}

/// Broker connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name; required
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Fixed client id; a random one is generated per process when unset
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    10
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            client_id: None,
            keep_alive_secs: default_keep_alive(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl MqttConfig {
    /// Credentials are only sent when both parts are set
    pub fn credentials(&self) -> Option<(String, String)> {
        if self.username.is_empty() || self.password.is_empty() {
            None
        } else {
            Some((self.username.clone(), self.password.clone()))
        }
    }

    pub fn client_id(&self) -> String {
        match &self.client_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Topic layout and periodic behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Re-read device colours this often (0 disables)
    #[serde(default)]
    pub refresh_interval_secs: u64,
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_node_id() -> String {
    "icue2mqtt".to_string()
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            discovery_prefix: default_discovery_prefix(),
            node_id: default_node_id(),
            refresh_interval_secs: 0,
        }
    }
}

impl BridgeSettings {
    pub fn topic_scheme(&self) -> TopicScheme {
        TopicScheme::new(&self.discovery_prefix, &self.node_id)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }
}

/// Lighting SDK options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkConfig {
    #[serde(default)]
    pub exclusive_control: bool,
    #[serde(default = "default_handshake_retry")]
    pub handshake_retry_secs: u64,
    /// Devices exposed by the in-memory backend
    #[serde(default)]
    pub devices: Vec<VirtualDeviceConfig>,
}

fn default_handshake_retry() -> u64 {
    10
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            exclusive_control: false,
            handshake_retry_secs: default_handshake_retry(),
            devices: Vec::new(),
        }
    }
}

impl SdkConfig {
    pub fn handshake_retry(&self) -> Duration {
        Duration::from_secs(self.handshake_retry_secs)
    }
}

/// One `[[sdk.devices]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualDeviceConfig {
    pub model: String,
    #[serde(default = "default_leds")]
    pub leds: usize,
    /// Initial colour of every LED
    #[serde(default)]
    pub color: [u8; 3],
}

fn default_leds() -> usize {
    1
}

impl BridgeConfig {
    /// Load configuration from `path`, falling back to defaults if the file
    /// does not exist
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).await?;
        let config = Self::from_toml(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `CUE_BRIDGE_*` environment overrides
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(host) = var("CUE_BRIDGE_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = var("CUE_BRIDGE_MQTT_PORT").and_then(|s| s.parse().ok()) {
            self.mqtt.port = port;
        }
        if let Some(username) = var("CUE_BRIDGE_MQTT_USERNAME") {
            self.mqtt.username = username;
        }
        if let Some(password) = var("CUE_BRIDGE_MQTT_PASSWORD") {
            self.mqtt.password = password;
        }
        if let Some(node_id) = var("CUE_BRIDGE_NODE_ID") {
            self.bridge.node_id = node_id;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.mqtt.host.trim().is_empty() {
            return Err(Error::Config("No MQTT broker host configured".to_string()));
        }
        if self.mqtt.port == 0 {
            return Err(Error::Config("MQTT broker port must be non-zero".to_string()));
        }
        if self.mqtt.reconnect_delay_secs == 0 {
            return Err(Error::Config("reconnect_delay_secs must be at least 1".to_string()));
        }
        for (name, value) in [
            ("discovery_prefix", &self.bridge.discovery_prefix),
            ("node_id", &self.bridge.node_id),
        ] {
            if value.is_empty() || value.contains(['/', '+', '#']) {
                return Err(Error::Config(format!("Invalid {name}: {value:?}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[tokio::test]
    async fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[mqtt]
host = "broker.local"
username = "user"
password = "secret"

[bridge]
refresh_interval_secs = 5

[[sdk.devices]]
model = "K70 RGB"
leds = 104
color = [255, 0, 0]
"#
        )
        .unwrap();

        let config = BridgeConfig::load(file.path()).await.unwrap();
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.credentials(), Some(("user".into(), "secret".into())));
        assert_eq!(config.bridge.node_id, "icue2mqtt");
        assert_eq!(config.bridge.refresh_interval(), Some(Duration::from_secs(5)));
        assert_eq!(config.sdk.devices.len(), 1);
        assert_eq!(config.sdk.devices[0].leds, 104);
        config.validate().unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::load(dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.mqtt.reconnect_delay(), Duration::from_secs(10));
        assert_eq!(config.sdk.handshake_retry(), Duration::from_secs(10));
        assert!(config.bridge.refresh_interval().is_none());
    }

    #[tokio::test]
    async fn test_invalid_toml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[mqtt\nhost = 1").unwrap();
        let err = BridgeConfig::load(file.path()).await.unwrap_err();
        assert!(matches!(err, Error::TomlParse(_)));
    }

    #[test]
    fn test_missing_host_is_fatal() {
        let err = BridgeConfig::default().validate().unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: No MQTT broker host configured");
    }

    #[test]
    fn test_topic_unsafe_node_id_is_rejected() {
        let mut config = BridgeConfig::default();
        config.mqtt.host = "localhost".to_string();
        config.bridge.node_id = "a/b".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CUE_BRIDGE_MQTT_HOST", "10.0.0.2"),
            ("CUE_BRIDGE_MQTT_PORT", "8883"),
            ("CUE_BRIDGE_MQTT_USERNAME", "ha"),
            ("CUE_BRIDGE_NODE_ID", "desk"),
        ]
        .into_iter()
        .collect();

        let mut config = BridgeConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.mqtt.host, "10.0.0.2");
        assert_eq!(config.mqtt.port, 8883);
        // Password missing, so no credentials are sent
        assert_eq!(config.mqtt.credentials(), None);
        assert_eq!(
            config.bridge.topic_scheme().aggregate().state,
            "homeassistant/light/desk/all_icue/state"
        );
    }

    #[test]
    fn test_client_id() {
        let mut mqtt = MqttConfig::default();
        assert_ne!(mqtt.client_id(), mqtt.client_id());
        mqtt.client_id = Some("fixed".to_string());
        assert_eq!(mqtt.client_id(), "fixed");
    }
}
