//! relaycontrol exposes relays on an MQTT broker.
//!
//! A managed connection ([`mqtt`]) keeps the broker link alive, a device
//! registry ([`discovery`]) announces relays the Home Assistant way and routes
//! commands, and [`devices`] drive the hardware.

pub mod config;
pub mod devices;
pub mod discovery;
pub mod mqtt;
pub mod persistence;
