use anyhow::Context;
use clap::{App, Arg};
use hdc::channels::ChannelKind;
use hdc::config::{Config, DEFAULT_CONFIG_FILE};
use hdc::daemon::{self, DaemonError};
use hdc::line_io::{Level, SimulatedLines, SysfsLines};
use hdc::mqtt::{self, MqttSettings};
use hdc::protocol::BusClient;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_ERROR_STATUS: i32 = 3;
/// Probe reading served by `--simulate`, in millidegrees.
const SIMULATED_TEMPERATURE: &str = "21500";

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let matches = App::new("hdc")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Hardware data collector: debounced line telemetry over MQTT")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Configuration file")
                .takes_value(true)
                .default_value(DEFAULT_CONFIG_FILE),
        )
        .arg(
            Arg::with_name("log-level")
                .short("l")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warning, error, critical)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("simulate")
                .long("simulate")
                .help("Run against simulated lines instead of sysfs GPIO"),
        )
        .get_matches();

    let path = PathBuf::from(matches.value_of("config").unwrap_or(DEFAULT_CONFIG_FILE));
    let config = Config::load(&path).with_context(|| format!("loading {}", path.display()));
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            init_tracing(matches.value_of("log-level"));
            error!("{:#}", e);
            return CONFIG_ERROR_STATUS;
        }
    };

    init_tracing(matches.value_of("log-level").or(config.loglevel.as_deref()));
    info!("Starting '{}' ({})", config.name, config.description);

    let settings = MqttSettings::new(&config.name, &config.mqtt_broker, config.mqtt_port, config.mqtt_timeout());
    let (client, transport) = mqtt::connect(&settings);
    let client: Arc<dyn BusClient> = Arc::new(client);

    let result = if matches.is_present("simulate") {
        warn!("Running against simulated lines");
        match simulated_lines(&config) {
            Ok(lines) => daemon::run(&config, lines, client, transport, daemon::shutdown_signal()).await,
            Err(e) => Err(e),
        }
    } else {
        let lines = SysfsLines::new(&config.gpio_path);
        daemon::run(&config, lines, client, transport, daemon::shutdown_signal()).await
    };

    match result {
        Ok(exit) => {
            info!("Exiting with {:?}", exit);
            exit.exit_code()
        }
        Err(DaemonError::Config(e)) => {
            error!("Invalid configuration: {}", e);
            CONFIG_ERROR_STATUS
        }
        Err(DaemonError::Line(e)) => {
            error!("Could not set up lines: {}", e);
            CONFIG_ERROR_STATUS
        }
    }
}

/// Quiet inputs, a healthy probe rail and readable probes.
fn simulated_lines(config: &Config) -> Result<SimulatedLines, DaemonError> {
    let lines = SimulatedLines::new();
    for acquisition in config.resolve_acquisitions()? {
        match acquisition.kind() {
            ChannelKind::TempSensor => lines.set_temperature(&acquisition.line(), Some(SIMULATED_TEMPERATURE)),
            // the fault line is active-low
            ChannelKind::TempFault => lines.set_level(&acquisition.line(), Level::Active),
            _ => {}
        }
    }
    Ok(lines)
}

fn level_directive(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" | "critical" => Some("error"),
        _ => None,
    }
}

/// Explicit level first, then `RUST_LOG`, then `warn`.
fn init_tracing(level: Option<&str>) {
    let directive = level.map(|name| (name, level_directive(name)));
    let filter = match directive {
        Some((_, Some(directive))) => EnvFilter::new(directive),
        _ => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some((name, None)) = directive {
        warn!("Log level '{}' not recognized, defaulting to WARNING", name);
    }
}
