use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use relaycontrol::config::{AppConfig, LoggingSection, RelayBackendConfig, RelayConfig};
use relaycontrol::devices::{
    Device, DeviceIdentity, GpioRelay, MemoryRelay, RelayBackend, RelaySwitch, SerialRelay,
};
use relaycontrol::discovery::DeviceRegistry;
use relaycontrol::mqtt::message_manager::qos_from_level;
use relaycontrol::mqtt::{
    ConnectionError, ConnectionHandle, ConnectionManager, MemoryTransport, MqttHandler, Transport,
};
use relaycontrol::persistence::SettingsStore;

const EXIT_ERROR: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "relaycontrol", version, about = "Relay control over MQTT with Home Assistant discovery")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Use an in-process broker and in-memory relays instead of real hardware
    #[arg(long)]
    dry_run: bool,

    /// Overrides [logging].level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup()?;

    let config = AppConfig::load(&cli.config).await?;
    setup_logging(&config.logging, cli.log_level.as_deref())?;
    if cli.dry_run {
        info!("Dry run: no broker connection, no hardware access");
    }

    let settings = Arc::new(open_settings(&config).await);
    let mut registry = DeviceRegistry::new(config.discovery_settings());
    let devices = build_switches(&config, &registry, settings, cli.dry_run).await?;
    registry.register_devices(devices);

    let connection = config.connection_config()?;
    let (transport, inbound): (Box<dyn Transport>, _) = if cli.dry_run {
        let (transport, inbound, _broker) = MemoryTransport::new();
        (Box::new(transport), inbound)
    } else {
        let (transport, inbound) = MqttHandler::new(&connection);
        (Box::new(transport), inbound)
    };

    let shutdown = CancellationToken::new();
    let (handle, manager_task) = ConnectionManager::spawn(
        connection,
        transport,
        inbound,
        Some(Box::new(registry)),
        shutdown.clone(),
    );
    log_link_state(&handle);

    let signal_token = shutdown.clone();
    let signals = tokio::spawn(async move {
        wait_for_signal().await;
        signal_token.cancel();
    });

    info!("Using MQTT broker. Starting client.");
    match handle.connect().await {
        Ok(()) => info!("Running until Ctrl+C or SIGTERM"),
        Err(ConnectionError::Cancelled) => {
            info!("Startup cancelled before a connection was established");
            handle.shutdown().await;
            return Ok(());
        }
        Err(e) => {
            error!("Failed to connect to the server: {}", e);
            handle.shutdown().await;
            std::process::exit(EXIT_ERROR);
        }
    }

    shutdown.cancelled().await;
    handle.shutdown().await;
    if let Err(e) = manager_task.await {
        warn!("Connection manager task ended abnormally: {}", e);
    }
    signals.abort();
    info!("Shutdown complete");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

/// `--log-level` wins over `[logging].level`. RUST_LOG is left to the environment.
fn log_level(cli_level: Option<&str>, config_level: Option<&str>) -> Result<Level> {
    let level_name = cli_level.or(config_level).unwrap_or("info");
    level_name
        .parse()
        .map_err(|e| eyre!("Invalid log level '{}': {}", level_name, e))
}

fn setup_logging(logging: &LoggingSection, cli_level: Option<&str>) -> Result<()> {
    let level = log_level(cli_level, logging.level.as_deref())?;

    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match &logging.filename {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| eyre!("Unable to open log file {}: {}", path.display(), e))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => builder.pretty().init(),
    }
    Ok(())
}

async fn open_settings(config: &AppConfig) -> SettingsStore {
    match config.settings.path.clone().or_else(SettingsStore::default_path) {
        Some(path) => SettingsStore::load(path).await,
        None => {
            warn!("No location for the settings file, relay state will not survive a restart");
            SettingsStore::ephemeral()
        }
    }
}

fn open_backend(relay: &RelayConfig, dry_run: bool) -> Result<Box<dyn RelayBackend>> {
    if dry_run {
        return Ok(Box::new(MemoryRelay::new()));
    }
    let backend: Box<dyn RelayBackend> = match relay.backend_config()? {
        RelayBackendConfig::Serial(serial) => {
            Box::new(SerialRelay::new(serial.port, serial.baud, relay.channel))
        }
        RelayBackendConfig::Gpio(gpio) => Box::new(GpioRelay::open(gpio.pin, gpio.active_low)?),
        RelayBackendConfig::Memory => Box::new(MemoryRelay::new()),
    };
    Ok(backend)
}

async fn build_switches(
    config: &AppConfig,
    registry: &DeviceRegistry,
    settings: Arc<SettingsStore>,
    dry_run: bool,
) -> Result<Vec<Arc<dyn Device>>> {
    let prefix = config.device_topic_prefix();
    let mut devices: Vec<Arc<dyn Device>> = Vec::new();

    for relay in &config.relay_control {
        let qos = qos_from_level(relay.qos)
            .ok_or_else(|| eyre!("Invalid QoS {} for relay '{}'", relay.qos, relay.guid))?;
        let identity = DeviceIdentity {
            unique_id: relay.guid.clone(),
            entity_id: relay.entity_id.clone().unwrap_or_default(),
            name: relay.name.clone().unwrap_or_else(|| relay.guid.clone()),
            icon: relay.icon.clone(),
        };
        let switch = RelaySwitch::new(
            identity,
            &prefix,
            open_backend(relay, dry_run)?,
            settings.clone(),
            registry.state_sender(),
        )
        .with_qos(qos)
        .with_retain(relay.retain);

        if let Err(e) = switch.resume_last_state().await {
            warn!("Unable to resume state of '{}': {}", relay.guid, e);
        }
        debug!("Relay '{}' ready", relay.guid);
        devices.push(Arc::new(switch));
    }
    info!("Configured {} relays", devices.len());
    Ok(devices)
}

fn log_link_state(handle: &ConnectionHandle) {
    let mut state = handle.watch_state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            debug!("MQTT link is {:?}", current);
        }
    });
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT (Ctrl+C)"),
                    _ = terminate.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Unable to listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT (Ctrl+C)");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received SIGINT (Ctrl+C)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_level_overrides_config() {
        assert_eq!(log_level(Some("debug"), Some("warn")).unwrap(), Level::DEBUG);
        assert_eq!(log_level(None, Some("warn")).unwrap(), Level::WARN);
        assert_eq!(log_level(None, None).unwrap(), Level::INFO);
    }

    #[test]
    fn rust_log_directives_do_not_affect_the_level() {
        std::env::set_var("RUST_LOG", "info,relaycontrol=debug");
        assert_eq!(log_level(None, Some("error")).unwrap(), Level::ERROR);
        assert!(log_level(Some("loud"), None).is_err());
    }
}
