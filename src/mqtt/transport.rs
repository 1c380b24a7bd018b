//! Transport seam between the connection manager and the wire.
//!
//! A transport only moves bytes. Timeouts, retries, replay and logging of
//! failures are the connection manager's job, so implementations should return
//! errors promptly and never retry on their own.

use async_trait::async_trait;

use super::error::TransportError;
use super::message_manager::OutboundMessage;

#[async_trait]
pub trait Transport: Send {
    /// Opens a fresh session, replacing any previous one.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Lightweight liveness probe.
    async fn ping(&mut self) -> Result<(), TransportError>;

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
