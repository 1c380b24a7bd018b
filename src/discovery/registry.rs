use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::descriptor::{discovery_topic, DeviceInfo, DiscoveryDescriptor, DEFAULT_DISCOVERY_PREFIX};
use super::error::RegistryError;
use crate::devices::{Device, StateChange};
use crate::mqtt::{Bus, ConnectionHooks, MqttMessage, OutboundMessage};

const STATE_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverySettings {
    /// Gates discovery, availability and state publications
    pub enabled: bool,
    pub discovery_prefix: String,
    pub device: DeviceInfo,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            discovery_prefix: DEFAULT_DISCOVERY_PREFIX.to_string(),
            device: DeviceInfo::default(),
        }
    }
}

/// Two devices claimed the same command topic; only `kept` receives commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConflict {
    pub topic: String,
    pub kept: String,
    pub ignored: String,
}

/// Holds the devices and connects them to the bus.
///
/// The registry is handed to the connection manager as its hooks, which is
/// what fixes the device list before the first connect.
pub struct DeviceRegistry {
    settings: DiscoverySettings,
    devices: Vec<Arc<dyn Device>>,
    topic_index: HashMap<String, usize>,
    conflicts: Vec<TopicConflict>,
    state_tx: mpsc::Sender<StateChange>,
    state_rx: mpsc::Receiver<StateChange>,
}

impl DeviceRegistry {
    pub fn new(settings: DiscoverySettings) -> Self {
        let (state_tx, state_rx) = mpsc::channel(STATE_QUEUE_CAPACITY);
        Self {
            settings,
            devices: Vec::new(),
            topic_index: HashMap::new(),
            conflicts: Vec::new(),
            state_tx,
            state_rx,
        }
    }

    /// Queue devices report their state changes on.
    pub fn state_sender(&self) -> mpsc::Sender<StateChange> {
        self.state_tx.clone()
    }

    pub fn register_devices(&mut self, devices: impl IntoIterator<Item = Arc<dyn Device>>) {
        for device in devices {
            debug!(
                "Registering {} '{}' ({})",
                device.kind(),
                device.name(),
                device.unique_id()
            );
            self.devices.push(device);
        }
    }

    pub fn devices(&self) -> &[Arc<dyn Device>] {
        &self.devices
    }

    pub fn discovery_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Maps command topics to devices. On a duplicate topic the device
    /// registered first keeps it; the conflict is logged and returned.
    pub fn build_topic_index(&mut self) -> Vec<TopicConflict> {
        self.topic_index.clear();
        let mut conflicts = Vec::new();

        for (position, device) in self.devices.iter().enumerate() {
            if !device.kind().accepts_commands() {
                continue;
            }
            match self.topic_index.entry(device.topics().command.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(position);
                }
                Entry::Occupied(slot) => {
                    let kept = &self.devices[*slot.get()];
                    warn!(
                        "Duplicate device topic: '{}' for {} and {}",
                        slot.key(),
                        device.name(),
                        kept.name()
                    );
                    conflicts.push(TopicConflict {
                        topic: slot.key().clone(),
                        kept: kept.unique_id().to_string(),
                        ignored: device.unique_id().to_string(),
                    });
                }
            }
        }

        self.conflicts = conflicts.clone();
        conflicts
    }

    pub fn topic_conflicts(&self) -> &[TopicConflict] {
        &self.conflicts
    }

    pub fn device_for_topic(&self, topic: &str) -> Option<Arc<dyn Device>> {
        self.topic_index
            .get(topic)
            .and_then(|position| self.devices.get(*position))
            .cloned()
    }

    async fn subscribe_command_topics(&self, bus: &mut dyn Bus) {
        for device in self.devices.iter().filter(|d| d.kind().accepts_commands()) {
            // Failures are logged by the bus and healed by the next replay.
            let _ = bus.subscribe(&device.topics().command).await;
        }
    }

    /// Announces every device. A device that cannot be announced does not
    /// stop the others; its error is returned.
    pub async fn publish_discovery(&self, bus: &mut dyn Bus) -> Vec<RegistryError> {
        let mut failures = Vec::new();
        for device in &self.devices {
            if let Err(e) = self.publish_device_discovery(bus, device.as_ref()).await {
                error!("{}", e);
                failures.push(e);
            }
        }
        failures
    }

    async fn publish_device_discovery(
        &self,
        bus: &mut dyn Bus,
        device: &dyn Device,
    ) -> Result<(), RegistryError> {
        if device.entity_id().trim().is_empty() {
            return Err(RegistryError::MissingEntityId {
                unique_id: device.unique_id().to_string(),
            });
        }

        let topic = discovery_topic(
            &self.settings.discovery_prefix,
            device.kind(),
            device.entity_id(),
        );
        debug!("Adding discovery info under topic: {}", topic);

        let payload = DiscoveryDescriptor::for_device(device, &self.settings.device)
            .to_json()
            .map_err(|e| RegistryError::Serialize {
                unique_id: device.unique_id().to_string(),
                reason: e.to_string(),
            })?;
        debug!("Discovery payload: {}", payload);

        bus.publish(OutboundMessage::retained(topic, payload, QoS::AtMostOnce))
            .await
            .map_err(|source| RegistryError::Publish {
                unique_id: device.unique_id().to_string(),
                source,
            })?;
        info!("Published discovery for '{}'", device.name());
        Ok(())
    }

    async fn publish_availability(&self, bus: &mut dyn Bus, available: bool) {
        for device in &self.devices {
            let payload = if available {
                device.payload_available()
            } else {
                device.payload_not_available()
            };
            let topic = &device.topics().availability;
            debug!(
                "Setting device '{}' availability topic '{}' to '{}'",
                device.name(),
                topic,
                payload
            );
            if let Err(e) = bus
                .publish(OutboundMessage::retained(topic.clone(), payload, QoS::AtMostOnce))
                .await
            {
                error!("Unable to publish availability of '{}': {}", device.name(), e);
            }
        }
    }

    async fn publish_current_states(&self, bus: &mut dyn Bus) {
        for device in &self.devices {
            let Some(state) = device.current_state() else {
                continue;
            };
            debug!("Setting state for '{}' to '{}'", device.name(), state);
            let message =
                OutboundMessage::retained(device.topics().state.clone(), state, device.qos());
            if let Err(e) = bus.publish(message).await {
                error!("Unable to publish state of '{}': {}", device.name(), e);
            }
        }
    }

    fn state_message(&self, change: &StateChange) -> Option<OutboundMessage> {
        if !self.settings.enabled {
            debug!(
                "Discovery disabled, not publishing state of '{}'",
                change.unique_id
            );
            return None;
        }
        let Some(device) = self
            .devices
            .iter()
            .find(|device| device.unique_id() == change.unique_id)
        else {
            warn!("State change for unknown device '{}'", change.unique_id);
            return None;
        };
        Some(OutboundMessage::retained(
            device.topics().state.clone(),
            change.payload.clone(),
            device.qos(),
        ))
    }

    async fn drain_state_changes(&mut self, bus: &mut dyn Bus) {
        while let Ok(change) = self.state_rx.try_recv() {
            if let Some(message) = self.state_message(&change) {
                if let Err(e) = bus.publish(message).await {
                    error!("Unable to publish state of '{}': {}", change.unique_id, e);
                }
            }
        }
    }

    /// Queued changes are superseded by the full state snapshot sent on connect.
    fn discard_state_changes(&mut self) {
        let mut discarded = 0;
        while self.state_rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!("Discarded {} queued state changes", discarded);
        }
    }
}

#[async_trait]
impl ConnectionHooks for DeviceRegistry {
    async fn on_connected(&mut self, bus: &mut dyn Bus, first_connect: bool) {
        if first_connect {
            self.subscribe_command_topics(bus).await;
            self.build_topic_index();
        }

        if !self.settings.enabled {
            debug!("Discovery disabled, skipping announcements");
            return;
        }

        self.discard_state_changes();
        self.publish_discovery(bus).await;
        self.publish_availability(bus, true).await;
        self.publish_current_states(bus).await;
    }

    async fn on_still_connected(&mut self, bus: &mut dyn Bus) {
        if !self.settings.enabled {
            return;
        }
        self.publish_availability(bus, true).await;
        self.publish_current_states(bus).await;
    }

    async fn on_pre_disconnect(&mut self, bus: &mut dyn Bus) {
        if !self.settings.enabled {
            return;
        }
        self.publish_availability(bus, false).await;
    }

    async fn on_message(&mut self, bus: &mut dyn Bus, message: MqttMessage) {
        info!(
            "Topic '{}' updated with '{}'",
            message.topic(),
            message.content()
        );
        let Some(device) = self.device_for_topic(message.topic()) else {
            debug!("No device listens on '{}'", message.topic());
            return;
        };

        info!(
            "Device '{}' running command '{}'",
            device.name(),
            message.content()
        );
        if let Err(e) = device.run_command(message.content()).await {
            warn!("Command for '{}' failed: {}", device.name(), e);
        }
        self.drain_state_changes(bus).await;
    }

    async fn next_outbound(&mut self) -> Option<OutboundMessage> {
        loop {
            let change = self.state_rx.recv().await?;
            if let Some(message) = self.state_message(&change) {
                return Some(message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{DeviceError, DeviceKind, DeviceTopics};
    use crate::mqtt::ConnectionError;
    use serde_json::Value;
    use std::sync::Mutex;

    struct StubDevice {
        unique_id: String,
        entity_id: String,
        kind: DeviceKind,
        topics: DeviceTopics,
        commands: Mutex<Vec<String>>,
    }

    impl StubDevice {
        fn new(unique_id: &str, entity_id: &str, kind: DeviceKind) -> Self {
            Self::with_prefix(unique_id, entity_id, kind, "devices")
        }

        fn with_prefix(unique_id: &str, entity_id: &str, kind: DeviceKind, prefix: &str) -> Self {
            Self {
                unique_id: unique_id.to_string(),
                entity_id: entity_id.to_string(),
                kind,
                topics: DeviceTopics::new(prefix, unique_id),
                commands: Mutex::new(Vec::new()),
            }
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Device for StubDevice {
        fn unique_id(&self) -> &str {
            &self.unique_id
        }

        fn entity_id(&self) -> &str {
            &self.entity_id
        }

        fn name(&self) -> &str {
            &self.unique_id
        }

        fn kind(&self) -> DeviceKind {
            self.kind
        }

        fn topics(&self) -> &DeviceTopics {
            &self.topics
        }

        async fn run_command(&self, command: &str) -> Result<(), DeviceError> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(())
        }

        fn current_state(&self) -> Option<String> {
            None
        }
    }

    #[derive(Default)]
    struct RecordingBus {
        subscribed: Vec<String>,
        published: Vec<OutboundMessage>,
    }

    #[async_trait]
    impl Bus for RecordingBus {
        async fn subscribe(&mut self, topic: &str) -> Result<(), ConnectionError> {
            self.subscribed.push(topic.to_string());
            Ok(())
        }

        async fn publish(&mut self, message: OutboundMessage) -> Result<(), ConnectionError> {
            self.published.push(message);
            Ok(())
        }
    }

    fn enabled() -> DiscoverySettings {
        DiscoverySettings {
            enabled: true,
            ..DiscoverySettings::default()
        }
    }

    fn descriptor_json(device: &dyn Device) -> Value {
        let json = DiscoveryDescriptor::for_device(device, &DeviceInfo::default())
            .to_json()
            .unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn switch_descriptor_has_all_keys_in_order() {
        let device = StubDevice::new("relay1", "relay_1", DeviceKind::Switch);
        let json = DiscoveryDescriptor::for_device(&device, &DeviceInfo::default())
            .to_json()
            .unwrap();

        let keys = [
            "\"name\"",
            "\"uniq_id\"",
            "\"state_topic\"",
            "\"command_topic\"",
            "\"payload_on\"",
            "\"payload_off\"",
            "\"icon\"",
            "\"availability_topic\"",
            "\"payload_available\"",
            "\"payload_not_available\"",
            "\"qos\"",
            "\"retain\"",
            "\"dev\"",
        ];
        let positions: Vec<usize> = keys.iter().map(|key| json.find(key).unwrap()).collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));

        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["payload_on"], "on");
        assert_eq!(value["payload_not_available"], "offline");
        assert_eq!(value["icon"], "mdi:switch");
        assert_eq!(value["dev"]["name"], "MQTT Helper");
        assert_eq!(value["dev"]["model"], "none");
    }

    #[test]
    fn cover_and_sensor_descriptors_follow_their_kind() {
        let cover = descriptor_json(&StubDevice::new("blind", "blind", DeviceKind::Cover));
        assert_eq!(cover["payload_open"], "on");
        assert_eq!(cover["payload_close"], "off");
        assert_eq!(cover["payload_stop"], "stop");
        assert!(cover.get("payload_on").is_none());

        let sensor = descriptor_json(&StubDevice::new("temp", "temp", DeviceKind::Sensor));
        assert!(sensor.get("command_topic").is_none());
        assert!(sensor.get("payload_on").is_none());
        assert!(sensor.get("retain").is_none());
        assert_eq!(sensor["state_topic"], "devices/temp");
    }

    #[tokio::test]
    async fn first_connect_announces_each_device_once() {
        let mut registry = DeviceRegistry::new(enabled());
        registry.register_devices([
            Arc::new(StubDevice::new("a", "a", DeviceKind::Switch)) as Arc<dyn Device>,
            Arc::new(StubDevice::new("b", "b", DeviceKind::Sensor)),
        ]);
        let mut bus = RecordingBus::default();

        registry.on_connected(&mut bus, true).await;

        assert_eq!(bus.subscribed, vec!["devices/a/set".to_string()]);
        let topics: Vec<&str> = bus.published.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(
            topics,
            vec![
                "homeassistant/switch/a/config",
                "homeassistant/sensor/b/config",
                "devices/a/available",
                "devices/b/available",
            ]
        );
        assert!(bus.published.iter().all(|m| m.retain));
    }

    #[tokio::test]
    async fn reconnect_does_not_resubscribe_or_rebuild() {
        let mut registry = DeviceRegistry::new(enabled());
        registry.register_devices([
            Arc::new(StubDevice::new("a", "a", DeviceKind::Switch)) as Arc<dyn Device>
        ]);
        let mut bus = RecordingBus::default();

        registry.on_connected(&mut bus, true).await;
        registry.on_connected(&mut bus, false).await;

        assert_eq!(bus.subscribed.len(), 1);
        assert_eq!(
            bus.published
                .iter()
                .filter(|m| m.topic == "homeassistant/switch/a/config")
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn disabled_discovery_only_subscribes() {
        let mut registry = DeviceRegistry::new(DiscoverySettings::default());
        registry.register_devices([
            Arc::new(StubDevice::new("a", "a", DeviceKind::Switch)) as Arc<dyn Device>
        ]);
        let mut bus = RecordingBus::default();

        registry.on_connected(&mut bus, true).await;
        registry.on_still_connected(&mut bus).await;
        registry.on_pre_disconnect(&mut bus).await;

        assert_eq!(bus.subscribed, vec!["devices/a/set".to_string()]);
        assert!(bus.published.is_empty());
    }

    #[tokio::test]
    async fn missing_entity_id_only_affects_that_device() {
        let registry = {
            let mut registry = DeviceRegistry::new(enabled());
            registry.register_devices([
                Arc::new(StubDevice::new("broken", "", DeviceKind::Switch)) as Arc<dyn Device>,
                Arc::new(StubDevice::new("fine", "fine", DeviceKind::Switch)),
            ]);
            registry
        };
        let mut bus = RecordingBus::default();

        let failures = registry.publish_discovery(&mut bus).await;

        assert_eq!(
            failures,
            vec![RegistryError::MissingEntityId {
                unique_id: "broken".to_string()
            }]
        );
        assert_eq!(bus.published.len(), 1);
        assert_eq!(bus.published[0].topic, "homeassistant/switch/fine/config");
    }

    #[tokio::test]
    async fn duplicate_command_topic_goes_to_first_device() {
        let first = Arc::new(StubDevice::with_prefix("dup", "one", DeviceKind::Switch, "x"));
        let second = Arc::new(StubDevice::with_prefix("dup", "two", DeviceKind::Switch, "x"));
        let mut registry = DeviceRegistry::new(enabled());
        registry.register_devices([first.clone() as Arc<dyn Device>, second.clone()]);
        let mut bus = RecordingBus::default();

        registry.on_connected(&mut bus, true).await;
        registry
            .on_message(&mut bus, MqttMessage::from_topic("x/dup/set".into(), "on".into()))
            .await;

        assert_eq!(registry.topic_conflicts().len(), 1);
        assert_eq!(registry.topic_conflicts()[0].topic, "x/dup/set");
        assert_eq!(first.commands(), vec!["on".to_string()]);
        assert!(second.commands().is_empty());
    }

    #[tokio::test]
    async fn pre_disconnect_marks_devices_offline() {
        let mut registry = DeviceRegistry::new(enabled());
        registry.register_devices([
            Arc::new(StubDevice::new("a", "a", DeviceKind::Switch)) as Arc<dyn Device>
        ]);
        let mut bus = RecordingBus::default();

        registry.on_pre_disconnect(&mut bus).await;

        assert_eq!(bus.published.len(), 1);
        assert_eq!(bus.published[0].topic, "devices/a/available");
        assert_eq!(bus.published[0].payload, "offline");
    }

    #[tokio::test]
    async fn queued_state_changes_become_retained_state_publishes() {
        let mut registry = DeviceRegistry::new(enabled());
        registry.register_devices([
            Arc::new(StubDevice::new("a", "a", DeviceKind::Switch)) as Arc<dyn Device>
        ]);
        let changes = registry.state_sender();
        changes
            .send(StateChange {
                unique_id: "ghost".to_string(),
                payload: "on".to_string(),
            })
            .await
            .unwrap();
        changes
            .send(StateChange {
                unique_id: "a".to_string(),
                payload: "off".to_string(),
            })
            .await
            .unwrap();

        let message = registry.next_outbound().await.unwrap();

        assert_eq!(message.topic, "devices/a");
        assert_eq!(message.payload, "off");
        assert!(message.retain);
    }
}
