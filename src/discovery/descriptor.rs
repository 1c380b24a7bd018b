//! Discovery documents in the Home Assistant MQTT discovery format.

use serde::Serialize;

use crate::devices::{Device, DeviceKind};
use crate::mqtt::message_manager::qos_level;

pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";
pub const PAYLOAD_STOP: &str = "stop";

/// The physical device all entities are grouped under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub model: String,
    pub sw_version: String,
    pub manufacturer: String,
    pub identifiers: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            name: "MQTT Helper".to_string(),
            model: "none".to_string(),
            sw_version: env!("CARGO_PKG_VERSION").to_string(),
            manufacturer: "relaycontrol".to_string(),
            identifiers: "relaycontrol".to_string(),
        }
    }
}

/// Serialized field order is the order of declaration. Fields that do not
/// apply to a device kind are left out of the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryDescriptor {
    pub name: String,
    pub uniq_id: String,
    pub state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_open: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_close: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_stop: Option<String>,
    pub icon: String,
    pub availability_topic: String,
    pub payload_available: String,
    pub payload_not_available: String,
    pub qos: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retain: Option<bool>,
    pub dev: DeviceInfo,
}

impl DiscoveryDescriptor {
    pub fn for_device(device: &dyn Device, dev: &DeviceInfo) -> Self {
        let topics = device.topics();
        let mut descriptor = Self {
            name: device.name().to_string(),
            uniq_id: device.unique_id().to_string(),
            state_topic: topics.state.clone(),
            command_topic: None,
            payload_on: None,
            payload_off: None,
            payload_open: None,
            payload_close: None,
            payload_stop: None,
            icon: device.icon().to_string(),
            availability_topic: topics.availability.clone(),
            payload_available: device.payload_available().to_string(),
            payload_not_available: device.payload_not_available().to_string(),
            qos: qos_level(device.qos()),
            retain: None,
            dev: dev.clone(),
        };

        match device.kind() {
            DeviceKind::Switch => {
                descriptor.command_topic = Some(topics.command.clone());
                descriptor.payload_on = Some(device.payload_on().to_string());
                descriptor.payload_off = Some(device.payload_off().to_string());
                descriptor.retain = Some(device.retain());
            }
            DeviceKind::Cover => {
                descriptor.command_topic = Some(topics.command.clone());
                descriptor.payload_open = Some(device.payload_on().to_string());
                descriptor.payload_close = Some(device.payload_off().to_string());
                descriptor.payload_stop = Some(PAYLOAD_STOP.to_string());
                descriptor.retain = Some(device.retain());
            }
            DeviceKind::Sensor => {}
        }
        descriptor
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// `{prefix}/{kind}/{entity_id}/config`
pub fn discovery_topic(prefix: &str, kind: DeviceKind, entity_id: &str) -> String {
    format!("{}/{}/{}/config", prefix, kind.as_str(), entity_id)
}
