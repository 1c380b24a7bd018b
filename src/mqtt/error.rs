use thiserror::Error;

/// Failures reported by a [`Transport`](super::transport::Transport) implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Broker rejected connection: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Client request failed: {0}")]
    Client(String),

    #[error("Transport is not connected")]
    NotConnected,

    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: &'static str, millis: u128 },
}

/// Errors surfaced by the connection manager to its callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Unable to connect after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("Connection attempt cancelled by shutdown")]
    Cancelled,

    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connection manager is no longer running")]
    ManagerStopped,
}
