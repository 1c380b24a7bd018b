use std::time::Duration;

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_CLIENT_ID: &str = "relaycontrol";

/// Resolved connection parameters. Built once at startup and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    /// Interval between application level liveness probes
    pub keep_alive: Duration,
    /// Wait between failed connect attempts, and before the next probe after a failed reconnect
    pub reconnect_interval: Duration,
    /// Bound for a single connect attempt and for every ping/publish/subscribe call
    pub connect_timeout: Duration,
    pub disconnect_timeout: Duration,
    /// Retries after the first failed startup attempt
    pub initial_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            credentials: None,
            keep_alive: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(2),
            initial_attempts: 10,
        }
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn url(&self) -> String {
        format!("mqtt://{}:{}", self.host, self.port)
    }
}
