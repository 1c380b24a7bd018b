//! rumqttc backed [`Transport`].
//!
//! Every `connect()` builds a fresh `AsyncClient`/`EventLoop` pair, waits for the
//! broker's ConnAck and then hands the event loop to a poller task. The poller
//! forwards incoming publishes and stops at the first network error instead of
//! letting rumqttc reconnect on its own; reconnecting is driven by the
//! connection manager so that subscription replay and hooks stay in one place.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::config::ConnectionConfig;
use super::error::TransportError;
use super::message_manager::{InboundMessage, OutboundMessage};
use super::transport::Transport;

const REQUEST_CAPACITY: usize = 100;
const INBOUND_CAPACITY: usize = 256;
const MIN_PROTOCOL_KEEP_ALIVE: Duration = Duration::from_secs(5);

pub struct MqttHandler {
    options: MqttOptions,
    client: Option<AsyncClient>,
    poller: Option<JoinHandle<()>>,
    link_up: Arc<AtomicBool>,
    inbound: mpsc::Sender<InboundMessage>,
}

impl MqttHandler {
    /// Creates the transport together with the receiver that inbound messages arrive on.
    pub fn new(config: &ConnectionConfig) -> (Self, mpsc::Receiver<InboundMessage>) {
        let mut mqtt_options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        mqtt_options
            .set_keep_alive(config.keep_alive.max(MIN_PROTOCOL_KEEP_ALIVE))
            .set_clean_session(true);
        if let Some((user, password)) = &config.credentials {
            mqtt_options.set_credentials(user.clone(), password.clone());
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let handler = MqttHandler {
            options: mqtt_options,
            client: None,
            poller: None,
            link_up: Arc::new(AtomicBool::new(false)),
            inbound: inbound_tx,
        };
        (handler, inbound_rx)
    }

    fn teardown(&mut self) {
        self.link_up.store(false, Ordering::SeqCst);
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.client = None;
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        match &self.client {
            Some(client) if self.link_up.load(Ordering::SeqCst) => Ok(client),
            _ => Err(TransportError::NotConnected),
        }
    }

    async fn establish(mut event_loop: EventLoop) -> Result<EventLoop, TransportError> {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ConnAck { code, .. }))) => {
                    if code == ConnectReturnCode::Success {
                        debug!("Broker accepted connection");
                        return Ok(event_loop);
                    }
                    return Err(TransportError::Rejected(format!("{:?}", code)));
                }
                Ok(notification) => {
                    trace!("Bootstrap notification: {:?}", notification);
                }
                Err(e) => return Err(TransportError::Network(e.to_string())),
            }
        }
    }

    async fn run(
        mut event_loop: EventLoop,
        inbound: mpsc::Sender<InboundMessage>,
        link_up: Arc<AtomicBool>,
    ) {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!(
                        "Received publish on '{}' ({} bytes)",
                        publish.topic,
                        publish.payload.len()
                    );
                    let message = InboundMessage::new(publish.topic, publish.payload.to_vec());
                    if inbound.send(message).await.is_err() {
                        warn!("Inbound message receiver dropped, stopping event loop");
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    info!("Broker closed the session");
                    break;
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("Disconnect sent to broker");
                    break;
                }
                Ok(notification) => {
                    trace!("MQTT notification: {:?}", notification);
                }
                Err(e) => {
                    warn!("MQTT event loop error: {}", e);
                    break;
                }
            }
        }
        link_up.store(false, Ordering::SeqCst);
        debug!("MQTT event loop stopped");
    }
}

#[async_trait]
impl Transport for MqttHandler {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.teardown();

        let (client, event_loop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        let event_loop = Self::establish(event_loop).await?;

        self.link_up.store(true, Ordering::SeqCst);
        let inbound = self.inbound.clone();
        let link_up = self.link_up.clone();
        self.poller = Some(tokio::spawn(Self::run(event_loop, inbound, link_up)));
        self.client = Some(client);
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.client()?;
        match &self.poller {
            Some(poller) if !poller.is_finished() => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .subscribe(topic, rumqttc::QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        self.client()?
            .publish(
                message.topic.clone(),
                message.qos,
                message.retain,
                message.payload.clone().into_bytes(),
            )
            .await
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        self.link_up.store(false, Ordering::SeqCst);

        if let Err(e) = client.disconnect().await {
            self.teardown();
            return Err(TransportError::Client(e.to_string()));
        }

        // Stays in place while awaited so teardown and Drop can still abort it.
        if let Some(poller) = self.poller.as_mut() {
            if let Err(e) = poller.await {
                warn!("MQTT event loop task failed: {}", e);
            }
        }
        self.poller = None;
        Ok(())
    }
}

impl Drop for MqttHandler {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}
