//! # Devices
//!
//! Every entity relaycontrol exposes on the bus implements [`Device`]. A device
//! has a fixed identity, derives its topics from a shared prefix, turns command
//! payloads into hardware actions and reports its state as a payload string.
//!
//! Devices never publish themselves. State changes are pushed as
//! [`StateChange`] entries onto the registry's queue and published from the
//! connection task.

pub mod backend;
pub mod error;
pub mod switch;

use async_trait::async_trait;
use rumqttc::QoS;
use std::fmt;

pub use backend::{GpioRelay, MemoryRelay, RelayBackend, SerialRelay};
pub use error::{BackendError, DeviceError};
pub use switch::{DeviceIdentity, RelayState, RelaySwitch};

pub const PAYLOAD_ON: &str = "on";
pub const PAYLOAD_OFF: &str = "off";
pub const PAYLOAD_AVAILABLE: &str = "available";
pub const PAYLOAD_NOT_AVAILABLE: &str = "offline";
pub const DEFAULT_ICON: &str = "mdi:switch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Switch,
    Sensor,
    Cover,
}

impl DeviceKind {
    /// Component name used in discovery topics.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Switch => "switch",
            DeviceKind::Sensor => "sensor",
            DeviceKind::Cover => "cover",
        }
    }

    pub fn accepts_commands(&self) -> bool {
        !matches!(self, DeviceKind::Sensor)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topics derived from `{prefix}/{unique_id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    pub state: String,
    pub command: String,
    pub availability: String,
}

impl DeviceTopics {
    pub fn new(prefix: &str, unique_id: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        let state = if prefix.is_empty() {
            unique_id.to_string()
        } else {
            format!("{}/{}", prefix, unique_id)
        };
        Self {
            command: format!("{}/set", state),
            availability: format!("{}/available", state),
            state,
        }
    }
}

/// A device's new state, waiting to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub unique_id: String,
    pub payload: String,
}

#[async_trait]
pub trait Device: Send + Sync {
    fn unique_id(&self) -> &str;

    fn entity_id(&self) -> &str;

    fn name(&self) -> &str;

    fn icon(&self) -> &str {
        DEFAULT_ICON
    }

    fn kind(&self) -> DeviceKind;

    fn topics(&self) -> &DeviceTopics;

    fn payload_on(&self) -> &str {
        PAYLOAD_ON
    }

    fn payload_off(&self) -> &str {
        PAYLOAD_OFF
    }

    fn payload_available(&self) -> &str {
        PAYLOAD_AVAILABLE
    }

    fn payload_not_available(&self) -> &str {
        PAYLOAD_NOT_AVAILABLE
    }

    fn qos(&self) -> QoS {
        QoS::AtMostOnce
    }

    fn retain(&self) -> bool {
        false
    }

    /// Applies a command payload. Repeating the same payload must leave the
    /// device in the same state.
    async fn run_command(&self, command: &str) -> Result<(), DeviceError>;

    /// Canonical state payload, `None` while the state is unknown.
    fn current_state(&self) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_derive_from_prefix_and_unique_id() {
        let topics = DeviceTopics::new("devices/relaycontrol/", "relay1");
        assert_eq!(topics.state, "devices/relaycontrol/relay1");
        assert_eq!(topics.command, "devices/relaycontrol/relay1/set");
        assert_eq!(topics.availability, "devices/relaycontrol/relay1/available");
    }

    #[test]
    fn sensors_take_no_commands() {
        assert!(DeviceKind::Switch.accepts_commands());
        assert!(DeviceKind::Cover.accepts_commands());
        assert!(!DeviceKind::Sensor.accepts_commands());
        assert_eq!(DeviceKind::Cover.to_string(), "cover");
    }
}
