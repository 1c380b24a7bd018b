//! # Discovery
//!
//! The [`DeviceRegistry`] is the bridge between devices and the connection
//! manager. It implements [`ConnectionHooks`](crate::mqtt::ConnectionHooks):
//!
//! - first connect: subscribe command topics, build the topic index
//! - every connect: discovery documents, availability, current state
//! - keep-alive: refresh availability and state
//! - inbound message: route to the device owning the command topic
//! - before disconnect: mark every device offline
//!
//! Announcements follow the Home Assistant MQTT discovery convention.

pub mod descriptor;
pub mod error;
pub mod registry;

pub use descriptor::{discovery_topic, DeviceInfo, DiscoveryDescriptor, DEFAULT_DISCOVERY_PREFIX};
pub use error::RegistryError;
pub use registry::{DeviceRegistry, DiscoverySettings, TopicConflict};
