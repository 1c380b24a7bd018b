//! Managed broker connection with statum lifecycle
//!
//! One task owns the [`Transport`] and everything that touches it: caller
//! requests, keep-alive probing, reconnects, subscription replay and inbound
//! dispatch. Callers talk to it through a cloneable [`ConnectionHandle`]; every
//! request is queued and answered over a oneshot channel, so a keep-alive
//! driven reconnect can never interleave with a caller driven `connect()`.
//!
//! # Manager lifecycle
//!
//! ```text
//! Idle ──► Running ──► Stopped
//! ```
//!
//! # Link state (observable through [`ConnectionHandle::watch_state`])
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected
//!      ▲               │              │
//!      └───────────────┴──────────────┘
//!        (attempt failed / probe failed / disconnect)
//! ```
//!
//! # Hooks
//!
//! A single [`ConnectionHooks`] implementation can be registered. It is invoked
//! from inside the owning task with a [`Bus`] that publishes and subscribes on
//! the live transport directly, which keeps hook traffic ordered with respect
//! to the connection events that triggered it.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use statum::{machine, state};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::ConnectionConfig;
use super::error::{ConnectionError, TransportError};
use super::message_manager::{InboundMessage, MqttMessage, OutboundMessage};
use super::subscriptions::SubscriptionSet;
use super::transport::Transport;

const ACTION_CAPACITY: usize = 64;
const MESSAGE_BROADCAST_CAPACITY: usize = 128;

/// Runs a hook with a [`Link`] borrowed from the manager's own fields.
macro_rules! run_hook {
    ($manager:ident, $hook:ident ( $($arg:expr),* )) => {{
        let connected = $manager.is_connected();
        if let Some(hooks) = $manager.hooks.as_mut() {
            let mut link = Link {
                transport: $manager.transport.as_mut(),
                subscriptions: &mut $manager.subscriptions,
                config: &$manager.config,
                connected,
            };
            hooks.$hook(&mut link $(, $arg)*).await;
        }
    }};
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Publish/subscribe access available to hooks while they run.
#[async_trait]
pub trait Bus: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<(), ConnectionError>;

    async fn publish(&mut self, message: OutboundMessage) -> Result<(), ConnectionError>;
}

/// Extension points of the connection lifecycle.
#[async_trait]
pub trait ConnectionHooks: Send {
    /// After subscriptions were replayed and the keep-alive timer armed.
    /// `first_connect` is true only for the first successful connect of the manager.
    async fn on_connected(&mut self, _bus: &mut dyn Bus, _first_connect: bool) {}

    /// After every successful keep-alive probe.
    async fn on_still_connected(&mut self, _bus: &mut dyn Bus) {}

    /// Before the transport is disconnected gracefully.
    async fn on_pre_disconnect(&mut self, _bus: &mut dyn Bus) {}

    async fn on_message(&mut self, bus: &mut dyn Bus, message: MqttMessage);

    /// Messages the hooks want published outside of any connection event.
    /// Returning `None` closes this source for the rest of the manager's life.
    async fn next_outbound(&mut self) -> Option<OutboundMessage> {
        std::future::pending().await
    }
}

/// The manager's transport as seen by hooks and by caller requests.
struct Link<'a> {
    transport: &'a mut dyn Transport,
    subscriptions: &'a mut SubscriptionSet,
    config: &'a ConnectionConfig,
    connected: bool,
}

impl Link<'_> {
    async fn replay_subscriptions(&mut self) {
        for topic in self.subscriptions.to_vec() {
            info!("Resubscribing to topic: '{}'", topic);
            if let Err(e) = bounded(
                "subscribe",
                self.config.connect_timeout,
                self.transport.subscribe(&topic),
            )
            .await
            {
                error!("Unable to resubscribe to topic '{}': {}", topic, e);
            }
        }
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), ConnectionError> {
        self.subscriptions.remove(topic);
        if !self.connected {
            debug!("Not connected, removed '{}' from replay only", topic);
            return Ok(());
        }
        bounded(
            "unsubscribe",
            self.config.connect_timeout,
            self.transport.unsubscribe(topic),
        )
        .await
        .map(|_| debug!("Unsubscribed from topic: '{}'", topic))
        .map_err(|e| {
            warn!("Unable to unsubscribe from topic '{}': {}", topic, e);
            e.into()
        })
    }
}

#[async_trait]
impl<'a> Bus for Link<'a> {
    async fn subscribe(&mut self, topic: &str) -> Result<(), ConnectionError> {
        if self.subscriptions.insert(topic) {
            debug!("Recorded '{}' for replay", topic);
        }
        if !self.connected {
            info!("Not connected, subscription to '{}' deferred until connect", topic);
            return Ok(());
        }

        info!("Subscribing to topic: '{}'", topic);
        match bounded(
            "subscribe",
            self.config.connect_timeout,
            self.transport.subscribe(topic),
        )
        .await
        {
            Ok(()) => {
                info!("Subscribed to topic: '{}'", topic);
                Ok(())
            }
            Err(e) => {
                error!("Unable to subscribe to topic '{}': {}", topic, e);
                Err(e.into())
            }
        }
    }

    async fn publish(&mut self, message: OutboundMessage) -> Result<(), ConnectionError> {
        if !self.connected {
            debug!("Not connected, dropping publish to '{}'", message.topic);
            return Err(ConnectionError::NotConnected);
        }

        debug!(
            "Publishing topic '{}' with value '{}'",
            message.topic, message.payload
        );
        bounded(
            "publish",
            self.config.connect_timeout,
            self.transport.publish(&message),
        )
        .await
        .map_err(|e| {
            warn!("Unable to publish to '{}': {}", message.topic, e);
            e.into()
        })
    }
}

async fn bounded<F>(operation: &'static str, limit: Duration, call: F) -> Result<(), TransportError>
where
    F: Future<Output = Result<(), TransportError>>,
{
    match time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            operation,
            millis: limit.as_millis(),
        }),
    }
}

/// [`bounded`], but abandoned as soon as `shutdown` is signalled.
async fn bounded_or_cancelled<F>(
    operation: &'static str,
    limit: Duration,
    shutdown: &CancellationToken,
    call: F,
) -> Result<(), ConnectionError>
where
    F: Future<Output = Result<(), TransportError>>,
{
    tokio::select! {
        _ = shutdown.cancelled() => Err(ConnectionError::Cancelled),
        result = bounded(operation, limit, call) => result.map_err(ConnectionError::from),
    }
}

async fn next_outbound(hooks: &mut Option<Box<dyn ConnectionHooks>>) -> Option<OutboundMessage> {
    match hooks {
        Some(hooks) => hooks.next_outbound().await,
        None => None,
    }
}

#[derive(Debug)]
enum ConnectionAction {
    Connect {
        response_tx: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Subscribe {
        topic: String,
        response_tx: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Unsubscribe {
        topic: String,
        response_tx: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Publish {
        message: OutboundMessage,
        response_tx: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Disconnect {
        response_tx: oneshot::Sender<()>,
    },
    Subscriptions {
        response_tx: oneshot::Sender<Vec<String>>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

#[state]
#[derive(Debug, Clone)]
pub enum ManagerState {
    Idle,    // Built, handle handed out, task not started
    Running, // Serving requests and timers
    Stopped, // Disconnected for good
}

#[machine]
pub struct ConnectionManager<S: ManagerState> {
    config: ConnectionConfig,
    transport: Box<dyn Transport>,
    inbound: mpsc::Receiver<InboundMessage>,
    actions: mpsc::Receiver<ConnectionAction>,
    hooks: Option<Box<dyn ConnectionHooks>>,
    subscriptions: SubscriptionSet,
    status: watch::Sender<ConnectionState>,
    messages: broadcast::Sender<MqttMessage>,
    shutdown: CancellationToken,
    keep_alive_at: Option<Instant>,
    has_connected: bool,
    outbound_open: bool,
}

impl<S: ManagerState> ConnectionManager<S> {
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn is_connected(&self) -> bool {
        *self.status.borrow() == ConnectionState::Connected
    }
}

impl ConnectionManager<Idle> {
    pub fn create(
        config: ConnectionConfig,
        transport: Box<dyn Transport>,
        inbound: mpsc::Receiver<InboundMessage>,
        hooks: Option<Box<dyn ConnectionHooks>>,
        shutdown: CancellationToken,
    ) -> (Self, ConnectionHandle) {
        let (actions_tx, actions_rx) = mpsc::channel(ACTION_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ConnectionState::Disconnected);
        let (messages_tx, _) = broadcast::channel(MESSAGE_BROADCAST_CAPACITY);

        let handle = ConnectionHandle {
            actions: actions_tx,
            state: status_rx,
            messages: messages_tx.clone(),
        };

        let manager = Self::new(
            config,
            transport,
            inbound,
            actions_rx,
            hooks,
            SubscriptionSet::new(),
            status_tx,
            messages_tx,
            shutdown,
            None,  // keep_alive_at
            false, // has_connected
            true,  // outbound_open
        );
        (manager, handle)
    }

    pub fn start(self) -> ConnectionManager<Running> {
        info!("Starting connection manager for {}", self.config.url());
        self.transition()
    }

    /// Builds, starts and spawns the manager task.
    pub fn spawn(
        config: ConnectionConfig,
        transport: Box<dyn Transport>,
        inbound: mpsc::Receiver<InboundMessage>,
        hooks: Option<Box<dyn ConnectionHooks>>,
        shutdown: CancellationToken,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (manager, handle) = Self::create(config, transport, inbound, hooks, shutdown);
        let running = manager.start();
        let task = tokio::spawn(async move {
            let stopped = running.run_until_shutdown().await;
            info!("Connection manager for {} stopped", stopped.config.url());
        });
        (handle, task)
    }
}

impl ConnectionManager<Running> {
    /// Serves requests, keep-alive ticks, inbound messages and hook output until
    /// a shutdown request arrives, the shutdown token fires or every handle is dropped.
    pub async fn run_until_shutdown(mut self) -> ConnectionManager<Stopped> {
        loop {
            let keep_alive_at = self.keep_alive_at;
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signalled");
                    self.disconnect().await;
                    break;
                }
                action = self.actions.recv() => match action {
                    Some(ConnectionAction::Shutdown { response_tx }) => {
                        info!("Shutdown requested");
                        self.disconnect().await;
                        let _ = response_tx.send(());
                        break;
                    }
                    Some(action) => self.handle_action(action).await,
                    None => {
                        debug!("All connection handles dropped");
                        self.disconnect().await;
                        break;
                    }
                },
                Some(inbound) = self.inbound.recv() => self.dispatch(inbound).await,
                _ = time::sleep_until(keep_alive_at.unwrap_or_else(Instant::now)), if keep_alive_at.is_some() => {
                    self.keep_alive_tick().await;
                }
                outbound = next_outbound(&mut self.hooks), if self.outbound_open => match outbound {
                    Some(message) => {
                        // Failures are logged by the link.
                        let _ = self.publish(message).await;
                    }
                    None => {
                        debug!("Hook outbound source closed");
                        self.outbound_open = false;
                    }
                },
            }
        }

        self.transition()
    }

    async fn handle_action(&mut self, action: ConnectionAction) {
        match action {
            ConnectionAction::Connect { response_tx } => {
                let result = self.connect().await;
                respond(response_tx, result);
            }
            ConnectionAction::Subscribe { topic, response_tx } => {
                let result = self.link().subscribe(&topic).await;
                respond(response_tx, result);
            }
            ConnectionAction::Unsubscribe { topic, response_tx } => {
                let result = self.link().unsubscribe(&topic).await;
                respond(response_tx, result);
            }
            ConnectionAction::Publish {
                message,
                response_tx,
            } => {
                let result = self.publish(message).await;
                respond(response_tx, result);
            }
            ConnectionAction::Disconnect { response_tx } => {
                self.disconnect().await;
                respond(response_tx, ());
            }
            ConnectionAction::Subscriptions { response_tx } => {
                respond(response_tx, self.subscriptions.to_vec());
            }
            ConnectionAction::Shutdown { response_tx } => {
                // Handled in run_until_shutdown before dispatch.
                respond(response_tx, ());
            }
        }
    }

    fn link(&mut self) -> Link<'_> {
        let connected = self.is_connected();
        Link {
            transport: self.transport.as_mut(),
            subscriptions: &mut self.subscriptions,
            config: &self.config,
            connected,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.status.send_replace(state);
        if previous != state {
            debug!("Connection state {:?} -> {:?}", previous, state);
        }
    }

    fn arm_keep_alive(&mut self, after: Duration) {
        self.keep_alive_at = Some(Instant::now() + after);
    }

    async fn publish(&mut self, message: OutboundMessage) -> Result<(), ConnectionError> {
        self.link().publish(message).await
    }

    async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            debug!("Already connected to {}", self.config.url());
            return Ok(());
        }
        self.connect_with_retries(self.config.initial_attempts).await
    }

    /// One attempt plus up to `retries` more, each separated by the reconnect
    /// interval. Attempts and backoff waits end early when shutdown is signalled.
    async fn connect_with_retries(&mut self, retries: u32) -> Result<(), ConnectionError> {
        let mut remaining = retries;
        let mut attempts = 0;

        loop {
            if self.shutdown.is_cancelled() {
                info!("Shutdown signalled, not connecting");
                return Err(ConnectionError::Cancelled);
            }
            attempts += 1;
            info!("Connecting to MQTT server: {}", self.config.url());
            self.set_state(ConnectionState::Connecting);

            let attempt = bounded_or_cancelled(
                "connect",
                self.config.connect_timeout,
                &self.shutdown,
                self.transport.connect(),
            )
            .await;

            match attempt {
                Ok(()) => {
                    info!("Connected to MQTT server");
                    self.on_established().await;
                    return Ok(());
                }
                Err(ConnectionError::Cancelled) => {
                    info!("Shutdown signalled, abandoning connection attempt");
                    self.set_state(ConnectionState::Disconnected);
                    return Err(ConnectionError::Cancelled);
                }
                Err(e) => {
                    warn!("Unable to connect to MQTT server: {}", e);
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            if remaining == 0 {
                return Err(ConnectionError::Exhausted { attempts });
            }
            remaining -= 1;

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signalled, abandoning connection attempts");
                    return Err(ConnectionError::Cancelled);
                }
                _ = time::sleep(self.config.reconnect_interval) => {}
            }
            info!(
                "Attempting to reconnect to server. {} retries remaining after this attempt.",
                remaining
            );
        }
    }

    async fn on_established(&mut self) {
        self.set_state(ConnectionState::Connected);
        let first_connect = !self.has_connected;
        self.has_connected = true;

        self.link().replay_subscriptions().await;
        self.arm_keep_alive(self.config.keep_alive);

        run_hook!(self, on_connected(first_connect));
    }

    /// Not re-armed once shutdown is signalled.
    async fn keep_alive_tick(&mut self) {
        self.keep_alive_at = None;
        if self.shutdown.is_cancelled() {
            return;
        }
        debug!("Sending keep alive ping to server");

        let probe = bounded_or_cancelled(
            "ping",
            self.config.connect_timeout,
            &self.shutdown,
            self.transport.ping(),
        )
        .await;

        match probe {
            Ok(()) => {
                self.arm_keep_alive(self.config.keep_alive);
                run_hook!(self, on_still_connected());
            }
            Err(ConnectionError::Cancelled) => {
                debug!("Shutdown signalled during keep alive");
            }
            Err(e) => {
                info!("Keep alive failed ({}), attempting to reconnect", e);
                self.set_state(ConnectionState::Disconnected);
                match self.connect_with_retries(0).await {
                    Ok(()) => info!("Reconnected"),
                    Err(ConnectionError::Cancelled) => {
                        debug!("Shutdown signalled, reconnects stopped");
                    }
                    Err(e) => {
                        warn!(
                            "Reconnect failed ({}), next attempt in {:?}",
                            e, self.config.reconnect_interval
                        );
                        self.arm_keep_alive(self.config.reconnect_interval);
                    }
                }
            }
        }
    }

    /// Never fails: errors are logged and the link is considered down afterwards.
    async fn disconnect(&mut self) {
        self.keep_alive_at = None;
        if !self.has_connected {
            debug!("Never connected, nothing to disconnect");
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        run_hook!(self, on_pre_disconnect());

        info!("Cleanly disconnecting from server");
        match bounded(
            "disconnect",
            self.config.disconnect_timeout,
            self.transport.disconnect(),
        )
        .await
        {
            Ok(()) => info!("Disconnected from server"),
            Err(e) => warn!("Error while disconnecting: {}", e),
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn dispatch(&mut self, inbound: InboundMessage) {
        let message = MqttMessage::decode(inbound);
        debug!("Processing message: {}", message);

        // Observers are optional, a send error only means nobody listens.
        let _ = self.messages.send(message.clone());

        if self.hooks.is_none() {
            debug!(
                "No message hook registered, dropping message on '{}'",
                message.topic()
            );
            return;
        }
        run_hook!(self, on_message(message));
    }
}

fn respond<T>(response_tx: oneshot::Sender<T>, value: T) {
    if response_tx.send(value).is_err() {
        debug!("Requester went away before the response was sent");
    }
}

/// Cloneable front-end of a running [`ConnectionManager`].
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    actions: mpsc::Sender<ConnectionAction>,
    state: watch::Receiver<ConnectionState>,
    messages: broadcast::Sender<MqttMessage>,
}

impl ConnectionHandle {
    async fn request<T>(
        &self,
        action: impl FnOnce(oneshot::Sender<T>) -> ConnectionAction,
    ) -> Result<T, ConnectionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.actions
            .send(action(response_tx))
            .await
            .map_err(|_| ConnectionError::ManagerStopped)?;
        response_rx.await.map_err(|_| ConnectionError::ManagerStopped)
    }

    /// Connects using the startup attempt budget. Fails with
    /// [`ConnectionError::Exhausted`] or [`ConnectionError::Cancelled`].
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.request(|response_tx| ConnectionAction::Connect { response_tx })
            .await?
    }

    /// The topic is kept for replay even when the live request fails.
    pub async fn subscribe(&self, topic: impl Into<String>) -> Result<(), ConnectionError> {
        let topic = topic.into();
        self.request(|response_tx| ConnectionAction::Subscribe { topic, response_tx })
            .await?
    }

    pub async fn unsubscribe(&self, topic: impl Into<String>) -> Result<(), ConnectionError> {
        let topic = topic.into();
        self.request(|response_tx| ConnectionAction::Unsubscribe { topic, response_tx })
            .await?
    }

    pub async fn publish(&self, message: OutboundMessage) -> Result<(), ConnectionError> {
        self.request(|response_tx| ConnectionAction::Publish {
            message,
            response_tx,
        })
        .await?
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self
            .request(|response_tx| ConnectionAction::Disconnect { response_tx })
            .await
        {
            warn!("Disconnect request not delivered: {}", e);
        }
    }

    /// Disconnects and stops the manager task for good.
    pub async fn shutdown(&self) {
        if let Err(e) = self
            .request(|response_tx| ConnectionAction::Shutdown { response_tx })
            .await
        {
            debug!("Connection manager already stopped: {}", e);
        }
    }

    pub async fn subscriptions(&self) -> Result<Vec<String>, ConnectionError> {
        self.request(|response_tx| ConnectionAction::Subscriptions { response_tx })
            .await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Every decoded inbound message, whether or not a hook handled it.
    pub fn watch_messages(&self) -> broadcast::Receiver<MqttMessage> {
        self.messages.subscribe()
    }
}
