//! # MQTT Connection Module
//!
//! Keeps a single broker connection alive for the lifetime of the process and
//! gives the rest of relaycontrol a small, ordered surface to talk to it.
//!
//! ## Why This Module Exists
//!
//! Relays are controlled by a home automation system over MQTT. The controller
//! must survive broker restarts and flaky links without operator attention:
//! - Startup connects retry within a bounded attempt budget
//! - A periodic keep-alive probe notices dead links and reconnects
//! - Every subscription is replayed after a reconnect
//! - Hooks let the device registry announce itself on (re)connect and go
//!   offline before a clean disconnect
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Connection parameters and defaults
//! ├── connection.rs       - Manager task, handle, hooks and the Bus seam
//! ├── error.rs            - Transport and connection error types
//! ├── memory.rs           - In-process broker double
//! ├── message_manager.rs  - Inbound/outbound message representation
//! ├── mqtt_handler.rs     - rumqttc transport
//! ├── subscriptions.rs    - Replay set
//! └── transport.rs        - Transport trait
//! ```
//!
//! ## Design Philosophy
//!
//! - **One owner**: the manager task is the only code that touches the
//!   transport, so reconnects, keep-alives and caller requests are serialized
//! - **Transports stay dumb**: timeouts, retries and replay live in the manager,
//!   a transport just moves bytes
//! - **Record first**: a subscription is remembered before it is sent, so a
//!   failed or deferred subscribe is healed by the next reconnect

pub mod config;
pub mod connection;
pub mod error;
pub mod memory;
pub mod message_manager;
pub mod mqtt_handler;
pub mod subscriptions;
pub mod transport;

pub use config::ConnectionConfig;
pub use connection::{Bus, ConnectionHandle, ConnectionHooks, ConnectionManager, ConnectionState};
pub use error::{ConnectionError, TransportError};
pub use memory::{MemoryBroker, MemoryTransport};
pub use message_manager::{InboundMessage, MqttMessage, OutboundMessage};
pub use mqtt_handler::MqttHandler;
pub use subscriptions::SubscriptionSet;
pub use transport::Transport;
