//! Application configuration loaded from a TOML file.
//!
//! Only `[mqtt]` is mandatory. Every other section falls back to defaults, and
//! discovery stays disabled unless `[home_assistant]` enables it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::discovery::{DeviceInfo, DiscoverySettings, DEFAULT_DISCOVERY_PREFIX};
use crate::mqtt::config::{ConnectionConfig, DEFAULT_CLIENT_ID, DEFAULT_PORT};

pub const DEFAULT_DEVICE_TOPIC_PREFIX: &str = "relaycontrol";
const MEMORY_BACKEND: &str = "memory";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration has no [mqtt] section")]
    MissingMqtt,

    #[error("mqtt.host must not be empty")]
    MissingHost,

    #[error("mqtt.{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("relay_control entry without guid")]
    MissingGuid,

    #[error("Invalid QoS level {qos} for relay '{relay}'")]
    InvalidQos { relay: String, qos: u8 },

    #[error("Relay '{0}' has no backend configured")]
    MissingBackend(String),

    #[error("Relay '{0}' configures more than one backend")]
    ConflictingBackends(String),

    #[error("Relay '{relay}' uses unknown backend '{backend}'")]
    UnknownBackend { relay: String, backend: String },
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct AppConfig {
    pub mqtt: Option<MqttSection>,
    pub home_assistant: Option<HomeAssistantSection>,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub settings: SettingsSection,
    #[serde(default)]
    pub relay_control: Vec<RelayConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct MqttSection {
    #[serde(default)]
    pub host: String,
    pub port: Option<u16>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    pub reconnect_timeout: Option<u64>,
    pub connection_timeout: Option<u64>,
    pub disconnect_timeout: Option<u64>,
    pub initial_connection_attempts: Option<u32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct HomeAssistantSection {
    #[serde(default)]
    pub discovery: bool,
    pub discovery_prefix: Option<String>,
    pub device_topic_prefix: Option<String>,
    pub device_unique_id: Option<String>,
    pub device_model: Option<String>,
    pub device_name: Option<String>,
    pub device_manufacturer: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct LoggingSection {
    pub level: Option<String>,
    pub filename: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct SettingsSection {
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub guid: String,
    pub entity_id: Option<String>,
    pub name: Option<String>,
    pub icon: Option<String>,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
    #[serde(default = "default_channel")]
    pub channel: u8,
    pub serial_port: Option<SerialPortConfig>,
    pub gpio: Option<GpioConfig>,
    pub backend: Option<String>,
}

fn default_channel() -> u8 {
    1
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SerialPortConfig {
    pub port: String,
    pub baud: Option<u32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct GpioConfig {
    pub pin: u8,
    #[serde(default)]
    pub active_low: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayBackendConfig {
    Serial(SerialPortConfig),
    Gpio(GpioConfig),
    Memory,
}

impl RelayConfig {
    /// Exactly one of `serial_port`, `gpio` or `backend = "memory"`.
    pub fn backend_config(&self) -> Result<RelayBackendConfig, ConfigError> {
        let mut selected = Vec::new();
        if let Some(serial) = &self.serial_port {
            selected.push(RelayBackendConfig::Serial(serial.clone()));
        }
        if let Some(gpio) = &self.gpio {
            selected.push(RelayBackendConfig::Gpio(gpio.clone()));
        }
        match self.backend.as_deref() {
            Some(MEMORY_BACKEND) => selected.push(RelayBackendConfig::Memory),
            Some(other) => {
                return Err(ConfigError::UnknownBackend {
                    relay: self.guid.clone(),
                    backend: other.to_string(),
                })
            }
            None => {}
        }

        match selected.len() {
            0 => Err(ConfigError::MissingBackend(self.guid.clone())),
            1 => Ok(selected.remove(0)),
            _ => Err(ConfigError::ConflictingBackends(self.guid.clone())),
        }
    }
}

impl AppConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Using configuration file: {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        debug!(
            "Configuration loaded with {} relays",
            config.relay_control.len()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mqtt = self.mqtt.as_ref().ok_or(ConfigError::MissingMqtt)?;
        if mqtt.host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        for (key, value) in [
            ("keep_alive_seconds", mqtt.keep_alive_seconds),
            ("reconnect_timeout", mqtt.reconnect_timeout),
            ("connection_timeout", mqtt.connection_timeout),
            ("disconnect_timeout", mqtt.disconnect_timeout),
        ] {
            if value == Some(0) {
                return Err(ConfigError::ZeroInterval(key));
            }
        }

        for relay in &self.relay_control {
            if relay.guid.trim().is_empty() {
                return Err(ConfigError::MissingGuid);
            }
            if relay.qos > 2 {
                return Err(ConfigError::InvalidQos {
                    relay: relay.guid.clone(),
                    qos: relay.qos,
                });
            }
            relay.backend_config()?;
        }
        Ok(())
    }

    pub fn connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        let mqtt = self.mqtt.as_ref().ok_or(ConfigError::MissingMqtt)?;
        let defaults = ConnectionConfig::default();
        let seconds = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_secs).unwrap_or(default)
        };

        let credentials = match (&mqtt.username, &mqtt.password) {
            (None, None) => None,
            (user, password) => Some((
                user.clone().unwrap_or_default(),
                password.clone().unwrap_or_default(),
            )),
        };

        Ok(ConnectionConfig {
            host: mqtt.host.clone(),
            port: mqtt.port.unwrap_or(DEFAULT_PORT),
            client_id: mqtt
                .client_id
                .clone()
                .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            credentials,
            keep_alive: seconds(mqtt.keep_alive_seconds, defaults.keep_alive),
            reconnect_interval: seconds(mqtt.reconnect_timeout, defaults.reconnect_interval),
            connect_timeout: seconds(mqtt.connection_timeout, defaults.connect_timeout),
            disconnect_timeout: seconds(mqtt.disconnect_timeout, defaults.disconnect_timeout),
            initial_attempts: mqtt
                .initial_connection_attempts
                .unwrap_or(defaults.initial_attempts),
        })
    }

    pub fn discovery_settings(&self) -> DiscoverySettings {
        let Some(ha) = &self.home_assistant else {
            return DiscoverySettings::default();
        };
        let defaults = DeviceInfo::default();
        DiscoverySettings {
            enabled: ha.discovery,
            discovery_prefix: ha
                .discovery_prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_DISCOVERY_PREFIX.to_string()),
            device: DeviceInfo {
                name: ha.device_name.clone().unwrap_or(defaults.name),
                model: ha.device_model.clone().unwrap_or(defaults.model),
                sw_version: defaults.sw_version,
                manufacturer: ha.device_manufacturer.clone().unwrap_or(defaults.manufacturer),
                identifiers: ha.device_unique_id.clone().unwrap_or(defaults.identifiers),
            },
        }
    }

    pub fn device_topic_prefix(&self) -> String {
        self.home_assistant
            .as_ref()
            .and_then(|ha| ha.device_topic_prefix.clone())
            .unwrap_or_else(|| DEFAULT_DEVICE_TOPIC_PREFIX.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[mqtt]
host = "broker.local"
port = 1884
username = "user"
password = "secret"
keep_alive_seconds = 7
initial_connection_attempts = 3

[home_assistant]
discovery = true
device_topic_prefix = "devices/relaycontrol"
device_name = "Relay Control"

[logging]
level = "debug"

[[relay_control]]
guid = "relay1"
entity_id = "relay_1"
name = "Relay 1"
qos = 1
[relay_control.serial_port]
port = "/dev/ttyUSB0"
baud = 9600

[[relay_control]]
guid = "relay2"
entity_id = "relay_2"
backend = "memory"
"#;

    #[test]
    fn full_configuration_maps_to_runtime_settings() {
        let config = AppConfig::parse(FULL).unwrap();

        let connection = config.connection_config().unwrap();
        assert_eq!(connection.host, "broker.local");
        assert_eq!(connection.port, 1884);
        assert_eq!(connection.keep_alive, Duration::from_secs(7));
        assert_eq!(connection.reconnect_interval, Duration::from_secs(60));
        assert_eq!(connection.initial_attempts, 3);
        assert_eq!(
            connection.credentials,
            Some(("user".to_string(), "secret".to_string()))
        );

        let discovery = config.discovery_settings();
        assert!(discovery.enabled);
        assert_eq!(discovery.discovery_prefix, "homeassistant");
        assert_eq!(discovery.device.name, "Relay Control");
        assert_eq!(discovery.device.model, "none");
        assert_eq!(config.device_topic_prefix(), "devices/relaycontrol");

        assert_eq!(
            config.relay_control[0].backend_config().unwrap(),
            RelayBackendConfig::Serial(SerialPortConfig {
                port: "/dev/ttyUSB0".to_string(),
                baud: Some(9600)
            })
        );
        assert_eq!(
            config.relay_control[1].backend_config().unwrap(),
            RelayBackendConfig::Memory
        );
        assert_eq!(config.relay_control[1].channel, 1);
    }

    #[test]
    fn mqtt_section_is_mandatory() {
        let result = AppConfig::parse("[logging]\nlevel = \"info\"\n");
        assert!(matches!(result, Err(ConfigError::MissingMqtt)));
    }

    #[test]
    fn invalid_relays_are_rejected() {
        let qos = "[mqtt]\nhost = \"h\"\n[[relay_control]]\nguid = \"r\"\nqos = 3\nbackend = \"memory\"\n";
        assert!(matches!(
            AppConfig::parse(qos),
            Err(ConfigError::InvalidQos { qos: 3, .. })
        ));

        let none = "[mqtt]\nhost = \"h\"\n[[relay_control]]\nguid = \"r\"\n";
        assert!(matches!(
            AppConfig::parse(none),
            Err(ConfigError::MissingBackend(_))
        ));
    }

    #[test]
    fn discovery_defaults_to_disabled() {
        let config = AppConfig::parse("[mqtt]\nhost = \"h\"\n").unwrap();
        assert!(!config.discovery_settings().enabled);
        assert_eq!(config.device_topic_prefix(), DEFAULT_DEVICE_TOPIC_PREFIX);
        assert_eq!(config.connection_config().unwrap().port, DEFAULT_PORT);
        assert_eq!(config.connection_config().unwrap().credentials, None);
    }

    #[test]
    fn zero_intervals_are_rejected() {
        for key in [
            "keep_alive_seconds",
            "reconnect_timeout",
            "connection_timeout",
            "disconnect_timeout",
        ] {
            let content = format!("[mqtt]\nhost = \"h\"\n{} = 0\n", key);
            match AppConfig::parse(&content) {
                Err(ConfigError::ZeroInterval(rejected)) => assert_eq!(rejected, key),
                other => panic!("{} = 0 accepted: {:?}", key, other),
            }
        }
    }

    #[test]
    fn password_without_username_is_sent() {
        let config = AppConfig::parse("[mqtt]\nhost = \"h\"\npassword = \"token\"\n").unwrap();
        assert_eq!(
            config.connection_config().unwrap().credentials,
            Some((String::new(), "token".to_string()))
        );
    }
}
