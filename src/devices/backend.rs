//! Relay hardware backends.
//!
//! A backend only knows how to drive the contact to on or off. Remembering the
//! state, persisting it and reporting it is the owning device's job.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rppal::gpio::{Gpio, OutputPin};
use tracing::{debug, info, warn};

use super::error::BackendError;

const FRAME_START: u8 = 0xA0;
const SERIAL_WRITE_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_BAUD: u32 = 9600;

#[async_trait]
pub trait RelayBackend: Send + Sync {
    async fn switch(&self, on: bool) -> Result<(), BackendError>;

    /// Human readable target for logs.
    fn describe(&self) -> String;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// USB/serial relay boards speaking the common `A0 <channel> <state> <sum>` protocol.
///
/// The port is opened lazily on the first command and reopened after a write
/// failure, so a board plugged in after startup is picked up.
pub struct SerialRelay {
    path: String,
    baud: u32,
    channel: u8,
    port: Arc<Mutex<Option<Box<dyn serialport::SerialPort>>>>,
}

impl SerialRelay {
    pub fn new(path: impl Into<String>, baud: Option<u32>, channel: u8) -> Self {
        let relay = Self {
            path: path.into(),
            baud: baud.unwrap_or(DEFAULT_BAUD),
            channel,
            port: Arc::new(Mutex::new(None)),
        };
        debug!(
            "Using serial port {} at {} baud, channel {}",
            relay.path, relay.baud, relay.channel
        );
        relay
    }

    /// Command frame for one channel; the last byte is the wrapping sum of the others.
    pub fn frame(channel: u8, on: bool) -> [u8; 4] {
        let state = u8::from(on);
        [
            FRAME_START,
            channel,
            state,
            FRAME_START.wrapping_add(channel).wrapping_add(state),
        ]
    }

    fn write_frame(
        port: &Mutex<Option<Box<dyn serialport::SerialPort>>>,
        path: &str,
        baud: u32,
        frame: [u8; 4],
    ) -> Result<(), BackendError> {
        let mut guard = lock(port);
        if guard.is_none() {
            info!("Serial port {} is closed, opening before writing", path);
            let opened = serialport::new(path, baud)
                .timeout(SERIAL_WRITE_TIMEOUT)
                .open()
                .map_err(|e| BackendError::Open {
                    target: path.to_string(),
                    reason: e.to_string(),
                })?;
            *guard = Some(opened);
        }

        let Some(serial) = guard.as_mut() else {
            return Err(BackendError::Open {
                target: path.to_string(),
                reason: "port vanished after open".to_string(),
            });
        };

        let written = serial.write_all(&frame).and_then(|_| serial.flush());
        if let Err(e) = written {
            warn!("Write to {} failed, port will be reopened: {}", path, e);
            *guard = None;
            return Err(BackendError::Write {
                target: path.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RelayBackend for SerialRelay {
    async fn switch(&self, on: bool) -> Result<(), BackendError> {
        let frame = Self::frame(self.channel, on);
        let port = self.port.clone();
        let path = self.path.clone();
        let baud = self.baud;

        tokio::task::spawn_blocking(move || Self::write_frame(&port, &path, baud, frame))
            .await
            .map_err(|e| BackendError::Task(e.to_string()))?
    }

    fn describe(&self) -> String {
        format!("serial {} channel {}", self.path, self.channel)
    }
}

/// Relay driven directly from a Raspberry Pi GPIO line.
pub struct GpioRelay {
    pin_number: u8,
    active_low: bool,
    pin: Mutex<OutputPin>,
}

impl GpioRelay {
    pub fn open(pin_number: u8, active_low: bool) -> Result<Self, BackendError> {
        let open_error = |reason: String| BackendError::Open {
            target: format!("GPIO{}", pin_number),
            reason,
        };
        let gpio = Gpio::new().map_err(|e| open_error(e.to_string()))?;
        let mut pin = gpio
            .get(pin_number)
            .map_err(|e| open_error(e.to_string()))?
            .into_output();
        // The relay keeps its position when the process exits.
        pin.set_reset_on_drop(false);

        Ok(Self {
            pin_number,
            active_low,
            pin: Mutex::new(pin),
        })
    }
}

#[async_trait]
impl RelayBackend for GpioRelay {
    async fn switch(&self, on: bool) -> Result<(), BackendError> {
        let mut pin = lock(&self.pin);
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("GPIO{}", self.pin_number)
    }
}

/// Backend without hardware, for dry runs and tests.
#[derive(Clone, Debug, Default)]
pub struct MemoryRelay {
    switched: Arc<Mutex<Vec<bool>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every switch request so far, oldest first.
    pub fn switched(&self) -> Vec<bool> {
        lock(&self.switched).clone()
    }

    pub fn is_on(&self) -> Option<bool> {
        lock(&self.switched).last().copied()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RelayBackend for MemoryRelay {
    async fn switch(&self, on: bool) -> Result<(), BackendError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BackendError::Write {
                target: self.describe(),
                reason: "simulated failure".to_string(),
            });
        }
        lock(&self.switched).push(on);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory relay".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_frames_match_board_protocol() {
        assert_eq!(SerialRelay::frame(1, true), [0xA0, 0x01, 0x01, 0xA2]);
        assert_eq!(SerialRelay::frame(1, false), [0xA0, 0x01, 0x00, 0xA1]);
        assert_eq!(SerialRelay::frame(2, true), [0xA0, 0x02, 0x01, 0xA3]);
    }

    #[tokio::test]
    async fn serial_relay_reports_unopenable_port() {
        let relay = SerialRelay::new("/dev/does-not-exist-relaycontrol", None, 1);
        let result = relay.switch(true).await;
        assert!(matches!(result, Err(BackendError::Open { .. })));
    }

    #[tokio::test]
    async fn memory_relay_records_and_fails_on_demand() {
        let relay = MemoryRelay::new();
        relay.switch(true).await.unwrap();
        relay.switch(false).await.unwrap();
        assert_eq!(relay.switched(), vec![true, false]);

        relay.set_failing(true);
        assert!(relay.switch(true).await.is_err());
        assert_eq!(relay.is_on(), Some(false));
    }
}
