//! EV Bridge Node - OCPP 1.6 charge point to MQTT
//!
//! Runs the OCPP central-system listener for one charge point and exposes it
//! on an MQTT broker with Home Assistant discovery.
//!
//! # Usage
//!
//! ```bash
//! # Start with ./config.json
//! evbridge-node
//!
//! # Explicit config, different listener port
//! evbridge-node --config /etc/evbridge/config.json --port 9100
//!
//! # Override the charge point identity and log verbosity
//! evbridge-node --identity Garage --log-level debug
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use evbridge_ocpp::config::{LoggingConfig, MqttConfig, DEFAULT_CONFIG_PATH};
use evbridge_ocpp::{BridgeConfig, CommandBridge, MqttBus, OcppServer, SessionRegistry};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// OCPP 1.6 charge point bridge to MQTT
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Listener host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Listener port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Charge point identity (overrides config)
    #[arg(short, long)]
    identity: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Console layer always; file layer when configured.
///
/// The returned guard flushes the file writer and must outlive logging.
fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let console = fmt::layer()
        .with_target(false)
        .with_filter(env_filter(&logging.to_console_level));

    let (file, guard) = match &logging.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            std::fs::create_dir_all(dir)?;
            let name = path
                .file_name()
                .ok_or_else(|| format!("logging.file {:?} has no file name", path))?;

            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter(&logging.level));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry().with(console).with(file).try_init()?;
    Ok(guard)
}

fn load_config(args: &Args) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    let mut config = if args.config.exists() {
        BridgeConfig::load(&args.config)?
    } else {
        eprintln!("Config file {:?} not found, using defaults", args.config);
        BridgeConfig::default()
    };

    if let Some(host) = &args.host {
        config = config.with_host(host);
    }
    if let Some(port) = args.port {
        config = config.with_port(port);
    }
    if let Some(identity) = &args.identity {
        config = config.with_identity(identity);
    }
    if let Some(level) = &args.log_level {
        config = config.with_log_level(level);
    }
    config.validate()?;
    Ok(config)
}

/// Connect the bus on the blocking pool; `MqttBus::connect` waits for ConnAck
async fn connect_bus(
    mqtt: &MqttConfig,
    bridge: CommandBridge,
) -> Result<MqttBus, Box<dyn std::error::Error + Send + Sync>> {
    let mqtt = mqtt.clone();
    let bus = tokio::task::spawn_blocking(move || {
        MqttBus::connect(
            &mqtt,
            Arc::new(move |topic: &str, payload: &str| bridge.handle(topic, payload)),
        )
    })
    .await??;
    Ok(bus)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let _guard = match init_logging(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║            EV Bridge Node - OCPP 1.6 to MQTT bridge          ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Charger:  {:<50} ║", truncate(&config.ocpp.charge_point_id, 50));
    println!("║  Listen:   {:<50} ║", truncate(&config.server_config().bind_addr(), 50));
    println!("║  Broker:   {:<50} ║", truncate(&format!("{}:{}", config.mqtt.broker, config.mqtt.port), 50));
    println!("║  Writes:   {:<50} ║", if config.allow_writeback { "enabled" } else { "disabled" });
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    if !config.allow_writeback {
        warn!("allow_writeback is off: bus commands will be ignored");
    }

    let registry = Arc::new(SessionRegistry::new());
    let bridge = CommandBridge::new(registry.clone(), config.allow_writeback);

    let bus = match connect_bus(&config.mqtt, bridge).await {
        Ok(bus) => bus,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Starting OCPP server...");

    let server = OcppServer::new(config.server_config(), registry, Arc::new(bus));
    if let Err(e) = server.run().await {
        error!("OCPP server stopped: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("CP1", 10), "CP1");
        assert_eq!(truncate("a-very-long-identity", 10), "a-very-...");
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "evbridge-node",
            "--config",
            "/nonexistent/config.json",
            "--port",
            "9100",
            "--identity",
            "Garage",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.ocpp.port, 9100);
        assert_eq!(config.ocpp.charge_point_id, "Garage");
        assert_eq!(config.ocpp.host, "0.0.0.0");
    }

    #[tokio::test]
    async fn test_bus_connect_failure_leaves_runtime_responsive() {
        // Port 1 on loopback refuses connections
        let mqtt = MqttConfig {
            broker: "127.0.0.1".into(),
            port: 1,
            ..Default::default()
        };
        let bridge = CommandBridge::new(Arc::new(SessionRegistry::new()), false);

        let ticker = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        });
        let result = connect_bus(&mqtt, bridge).await;

        assert!(result.is_err());
        assert!(ticker.await.is_ok());
    }
}
