//! In-process broker double.
//!
//! [`MemoryTransport`] implements [`Transport`] against a shared [`MemoryBroker`]
//! that records everything the client does and lets the caller script failures
//! (unreachable or unresponsive broker, dropped link, refused subscriptions,
//! failing disconnects) and inject inbound publishes. Used by the test-suite and by `--dry-run`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::error::TransportError;
use super::message_manager::{InboundMessage, OutboundMessage};
use super::transport::Transport;

const INBOUND_CAPACITY: usize = 256;

#[derive(Debug)]
struct BrokerState {
    reachable: bool,
    stalled: bool,
    failing_disconnect: bool,
    connected: bool,
    connect_attempts: u32,
    pings: u32,
    disconnects: u32,
    active: BTreeSet<String>,
    subscribe_log: Vec<String>,
    refused: HashSet<String>,
    published: Vec<OutboundMessage>,
    retained: HashMap<String, String>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            stalled: false,
            failing_disconnect: false,
            connected: false,
            connect_attempts: 0,
            pings: 0,
            disconnects: 0,
            active: BTreeSet::new(),
            subscribe_log: Vec::new(),
            refused: HashSet::new(),
            published: Vec::new(),
            retained: HashMap::new(),
        }
    }
}

/// Control and inspection side of the in-memory broker.
#[derive(Clone, Debug)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    inbound: mpsc::Sender<InboundMessage>,
}

impl MemoryBroker {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// While unreachable every connect attempt fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// While stalled, connect, ping and disconnect never complete.
    pub fn set_stalled(&self, stalled: bool) {
        self.state().stalled = stalled;
    }

    /// While set, disconnect requests are answered with an error.
    pub fn set_failing_disconnect(&self, failing: bool) {
        self.state().failing_disconnect = failing;
    }

    /// Silently drops the current session, as a broker restart would.
    pub fn drop_link(&self) {
        let mut state = self.state();
        state.connected = false;
        state.active.clear();
    }

    pub fn refuse_subscription(&self, topic: impl Into<String>) {
        self.state().refused.insert(topic.into());
    }

    pub fn accept_subscription(&self, topic: &str) {
        self.state().refused.remove(topic);
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    pub fn pings(&self) -> u32 {
        self.state().pings
    }

    pub fn disconnects(&self) -> u32 {
        self.state().disconnects
    }

    /// Subscriptions of the current session.
    pub fn active_subscriptions(&self) -> BTreeSet<String> {
        self.state().active.clone()
    }

    /// Every subscribe request ever received, in order, including refused ones.
    pub fn subscribe_log(&self) -> Vec<String> {
        self.state().subscribe_log.clone()
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<OutboundMessage> {
        self.state()
            .published
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    pub fn retained(&self, topic: &str) -> Option<String> {
        self.state().retained.get(topic).cloned()
    }

    pub fn clear_published(&self) {
        self.state().published.clear();
    }

    /// Publishes from another client. Delivered only if the session has a matching subscription.
    pub async fn deliver(&self, topic: &str, payload: &str) -> bool {
        let matched = {
            let state = self.state();
            state.connected && state.active.iter().any(|filter| topic_matches(filter, topic))
        };
        if !matched {
            debug!("No subscriber for '{}', message discarded", topic);
            return false;
        }
        self.inbound
            .send(InboundMessage::new(topic, payload.as_bytes().to_vec()))
            .await
            .is_ok()
    }
}

pub struct MemoryTransport {
    broker: MemoryBroker,
}

impl MemoryTransport {
    pub fn new() -> (Self, mpsc::Receiver<InboundMessage>, MemoryBroker) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let broker = MemoryBroker {
            state: Arc::new(Mutex::new(BrokerState::default())),
            inbound: inbound_tx,
        };
        let transport = MemoryTransport {
            broker: broker.clone(),
        };
        (transport, inbound_rx, broker)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let stalled = {
            let mut state = self.broker.state();
            state.connect_attempts += 1;
            state.stalled
        };
        if stalled {
            return std::future::pending().await;
        }

        let mut state = self.broker.state();
        if !state.reachable {
            state.connected = false;
            return Err(TransportError::Network("broker unreachable".to_string()));
        }
        state.connected = true;
        state.active.clear();
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        let (stalled, connected) = {
            let mut state = self.broker.state();
            state.pings += 1;
            (state.stalled, state.connected)
        };
        if stalled {
            return std::future::pending().await;
        }
        if connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.subscribe_log.push(topic.to_string());
        if state.refused.contains(topic) {
            return Err(TransportError::Client(format!("subscription to '{}' refused", topic)));
        }
        state.active.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.active.remove(topic);
        Ok(())
    }

    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if message.retain {
            if message.payload.is_empty() {
                state.retained.remove(&message.topic);
            } else {
                state
                    .retained
                    .insert(message.topic.clone(), message.payload.clone());
            }
        }
        state.published.push(message.clone());
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let stalled = {
            let mut state = self.broker.state();
            state.disconnects += 1;
            if state.failing_disconnect {
                return Err(TransportError::Client("disconnect refused".to_string()));
            }
            state.stalled
        };
        if stalled {
            return std::future::pending().await;
        }

        let mut state = self.broker.state();
        state.connected = false;
        state.active.clear();
        Ok(())
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
