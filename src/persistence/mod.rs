//! # Persistence Module
//!
//! ## Why This Module Exists
//! Relays must come back in the state they were left in after a restart or power
//! loss. Devices record their last state here and re-apply it on startup.
//!
//! ## Design Philosophy
//! The module follows a "fail-safe" approach: a missing or corrupted settings
//! file degrades to an empty store instead of preventing startup. Only writing
//! can fail, and those failures are surfaced to the device that asked.

pub mod settings;

pub use settings::{SettingsError, SettingsStore};
