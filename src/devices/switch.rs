use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::backend::RelayBackend;
use super::error::DeviceError;
use super::{Device, DeviceKind, DeviceTopics, StateChange, DEFAULT_ICON};
use crate::persistence::SettingsStore;

const LAST_RELAY_STATE: &str = "LastRelayState";
const STATE_OPEN: &str = "open";
const STATE_CLOSED: &str = "closed";

/// Identity a device is announced with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub unique_id: String,
    pub entity_id: String,
    pub name: String,
    pub icon: Option<String>,
}

/// Relay position. `Open` is the energized ("on") position, matching the
/// wording of the persisted settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayState {
    #[default]
    Unknown,
    Open,
    Closed,
}

impl RelayState {
    fn persisted(&self) -> Option<&'static str> {
        match self {
            RelayState::Open => Some(STATE_OPEN),
            RelayState::Closed => Some(STATE_CLOSED),
            RelayState::Unknown => None,
        }
    }
}

/// A `switch` entity driving one relay.
pub struct RelaySwitch {
    identity: DeviceIdentity,
    topics: DeviceTopics,
    qos: QoS,
    retain: bool,
    backend: Box<dyn RelayBackend>,
    state: Mutex<RelayState>,
    settings: Arc<SettingsStore>,
    changes: mpsc::Sender<StateChange>,
}

impl RelaySwitch {
    pub fn new(
        identity: DeviceIdentity,
        topic_prefix: &str,
        backend: Box<dyn RelayBackend>,
        settings: Arc<SettingsStore>,
        changes: mpsc::Sender<StateChange>,
    ) -> Self {
        debug!(
            "Device {} uses {}",
            identity.unique_id,
            backend.describe()
        );
        Self {
            topics: DeviceTopics::new(topic_prefix, &identity.unique_id),
            identity,
            qos: QoS::AtMostOnce,
            retain: false,
            backend,
            state: Mutex::new(RelayState::Unknown),
            settings,
            changes,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn relay_state(&self) -> RelayState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn settings_key(&self) -> String {
        SettingsStore::key(&self.identity.unique_id, LAST_RELAY_STATE)
    }

    /// Re-applies the last persisted position, if any.
    pub async fn resume_last_state(&self) -> Result<(), DeviceError> {
        match self.settings.get(&self.settings_key()).await.as_deref() {
            Some(STATE_OPEN) => self.apply(RelayState::Open).await,
            Some(STATE_CLOSED) => self.apply(RelayState::Closed).await,
            Some(other) => {
                warn!(
                    "Ignoring unknown persisted state '{}' for {}",
                    other, self.identity.unique_id
                );
                Ok(())
            }
            None => {
                debug!("No persisted state for {}", self.identity.unique_id);
                Ok(())
            }
        }
    }

    /// Drives the relay, then persists and reports the new position. The
    /// change is reported even if persisting fails.
    async fn apply(&self, target: RelayState) -> Result<(), DeviceError> {
        let on = target == RelayState::Open;
        info!(
            "{} relay {}",
            if on { "Opening" } else { "Closing" },
            self.identity.unique_id
        );
        self.backend.switch(on).await?;
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = target;

        let persisted = self.persist(target).await;
        self.notify();
        persisted
    }

    async fn persist(&self, target: RelayState) -> Result<(), DeviceError> {
        if let Some(value) = target.persisted() {
            self.settings.set(&self.settings_key(), value).await;
            self.settings.flush().await?;
        }
        Ok(())
    }

    fn notify(&self) {
        let Some(payload) = self.current_state() else {
            return;
        };
        let change = StateChange {
            unique_id: self.identity.unique_id.clone(),
            payload,
        };
        if let Err(e) = self.changes.try_send(change) {
            warn!(
                "State change of {} not queued: {}",
                self.identity.unique_id, e
            );
        }
    }
}

#[async_trait]
impl Device for RelaySwitch {
    fn unique_id(&self) -> &str {
        &self.identity.unique_id
    }

    fn entity_id(&self) -> &str {
        &self.identity.entity_id
    }

    fn name(&self) -> &str {
        &self.identity.name
    }

    fn icon(&self) -> &str {
        self.identity.icon.as_deref().unwrap_or(DEFAULT_ICON)
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Switch
    }

    fn topics(&self) -> &DeviceTopics {
        &self.topics
    }

    fn qos(&self) -> QoS {
        self.qos
    }

    fn retain(&self) -> bool {
        self.retain
    }

    async fn run_command(&self, command: &str) -> Result<(), DeviceError> {
        let command = command.trim();
        if command.eq_ignore_ascii_case(self.payload_on()) {
            self.apply(RelayState::Open).await
        } else if command.eq_ignore_ascii_case(self.payload_off()) {
            self.apply(RelayState::Closed).await
        } else {
            warn!(
                "Unhandled command '{}' for {}",
                command, self.identity.unique_id
            );
            Err(DeviceError::UnsupportedCommand(command.to_string()))
        }
    }

    fn current_state(&self) -> Option<String> {
        match self.relay_state() {
            RelayState::Open => Some(self.payload_on().to_string()),
            RelayState::Closed => Some(self.payload_off().to_string()),
            RelayState::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::backend::MemoryRelay;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            unique_id: "relay1".to_string(),
            entity_id: "relay_1".to_string(),
            name: "Relay 1".to_string(),
            icon: None,
        }
    }

    fn switch_with(
        relay: &MemoryRelay,
        settings: Arc<SettingsStore>,
    ) -> (RelaySwitch, mpsc::Receiver<StateChange>) {
        let (tx, rx) = mpsc::channel(8);
        let switch = RelaySwitch::new(identity(), "devices", Box::new(relay.clone()), settings, tx);
        (switch, rx)
    }

    #[tokio::test]
    async fn commands_switch_persist_and_report() {
        let relay = MemoryRelay::new();
        let settings = Arc::new(SettingsStore::ephemeral());
        let (switch, mut changes) = switch_with(&relay, settings.clone());
        assert_eq!(switch.current_state(), None);

        switch.run_command("ON").await.unwrap();

        assert_eq!(relay.switched(), vec![true]);
        assert_eq!(switch.current_state().as_deref(), Some("on"));
        assert_eq!(
            settings.get("relay1.LastRelayState").await.as_deref(),
            Some("open")
        );
        assert_eq!(
            changes.try_recv().unwrap(),
            StateChange {
                unique_id: "relay1".to_string(),
                payload: "on".to_string()
            }
        );
    }

    #[tokio::test]
    async fn repeated_command_reasserts_and_reports_again() {
        let relay = MemoryRelay::new();
        let (switch, mut changes) = switch_with(&relay, Arc::new(SettingsStore::ephemeral()));

        switch.run_command("off").await.unwrap();
        switch.run_command("off").await.unwrap();

        assert_eq!(relay.switched(), vec![false, false]);
        assert_eq!(changes.try_recv().unwrap().payload, "off");
        assert_eq!(changes.try_recv().unwrap().payload, "off");
        assert_eq!(switch.relay_state(), RelayState::Closed);
    }

    #[tokio::test]
    async fn unknown_payload_changes_nothing() {
        let relay = MemoryRelay::new();
        let (switch, mut changes) = switch_with(&relay, Arc::new(SettingsStore::ephemeral()));

        let result = switch.run_command("toggle").await;

        assert!(matches!(result, Err(DeviceError::UnsupportedCommand(_))));
        assert!(relay.switched().is_empty());
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn backend_failure_keeps_previous_state() {
        let relay = MemoryRelay::new();
        let (switch, mut changes) = switch_with(&relay, Arc::new(SettingsStore::ephemeral()));
        switch.run_command("on").await.unwrap();
        let _ = changes.try_recv();

        relay.set_failing(true);
        assert!(matches!(
            switch.run_command("off").await,
            Err(DeviceError::Backend(_))
        ));
        assert_eq!(switch.current_state().as_deref(), Some("on"));
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn resume_reapplies_persisted_state() {
        let settings = Arc::new(SettingsStore::ephemeral());
        settings.set("relay1.LastRelayState", "closed").await;
        let relay = MemoryRelay::new();
        let (switch, mut changes) = switch_with(&relay, settings);

        switch.resume_last_state().await.unwrap();

        assert_eq!(relay.switched(), vec![false]);
        assert_eq!(changes.try_recv().unwrap().payload, "off");
    }
}
