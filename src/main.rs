//! Serial NATS Bridge - command-line interface
//!
//! Lists USB serial devices, reads and writes them, and runs the
//! device-to-broker bridge until interrupted.

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use serial_bridge_core::cli::{
    format_output, format_summary, parse_payload, print_exit_codes, CliResult, ExitCodes,
    OutputFormat,
};
use serial_bridge_core::config::{self, BridgeConfig, LoggingSettings};
use serial_bridge_core::core::broker::{BrokerBridge, BrokerTransport, MemoryBroker, NatsTransport};
use serial_bridge_core::core::device::{
    DeviceId, DeviceRegistry, LoopbackDevice, LoopbackHost, SystemUsbHost, UsbHost,
};
use serial_bridge_core::core::orchestrator::{OrchestrationState, Orchestrator};
use serial_bridge_core::utils::BridgePump;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Serial NATS Bridge CLI
#[derive(Parser, Debug)]
#[command(name = "serial-nats-bridge", version, about = "Bridge USB-UART devices to a NATS broker", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use an in-memory device and broker instead of hardware and network
    #[arg(long, global = true)]
    simulate: bool,

    /// Broker URL override
    #[arg(long, global = true)]
    broker_url: Option<String>,

    /// Broker user name override
    #[arg(short, long, global = true)]
    username: Option<String>,

    /// Broker password override
    #[arg(long, global = true, env = "BRIDGE_BROKER_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Device to use (e.g. 7-0); defaults to the first one found
    #[arg(short, long, global = true)]
    device: Option<String>,

    /// Payload output format
    #[arg(short, long, value_enum, global = true, default_value_t = OutputFormat::Hex)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List USB serial devices
    List,

    /// Open the device and read once
    Read,

    /// Open the device and write a payload (`hex:0102` or text; defaults to the device name)
    Write {
        /// Payload to write
        payload: Option<String>,
    },

    /// Pump device reads to the broker until Ctrl-C
    Run,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show exit code table
    ExitCodes,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => return report(CliResult::from(e)),
    };
    let _guard = init_tracing(&config.logging);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => return report(CliResult::error(ExitCodes::INTERNAL_ERROR, e.to_string())),
    };

    let result = runtime.block_on(run(&cli, config));
    report(result.unwrap_or_else(CliResult::from))
}

fn report(result: CliResult) -> ExitCode {
    match &result {
        CliResult::Success(Some(msg)) => println!("{msg}"),
        CliResult::Error(code, msg) => {
            error!(code, "{msg}");
            eprintln!("Error: {msg}");
        }
        CliResult::Success(None) => {}
    }
    result.to_exit_code()
}

fn load_config(cli: &Cli) -> anyhow::Result<BridgeConfig> {
    let mut config = match &cli.config {
        Some(path) => BridgeConfig::load_from(path)?,
        None => BridgeConfig::load()?,
    };
    if let Some(url) = &cli.broker_url {
        config.broker.url.clone_from(url);
    }
    if let Some(username) = &cli.username {
        config.broker.username.clone_from(username);
    }
    if let Some(password) = &cli.password {
        config.broker.password.clone_from(password);
    }
    Ok(config)
}

fn init_tracing(settings: &LoggingSettings) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &settings.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "serial-nats-bridge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let builder = builder.with_writer(writer).with_ansi(false);
            if settings.json {
                builder.json().init();
            } else {
                builder.init();
            }
            Some(guard)
        }
        None => {
            let builder = builder.with_writer(std::io::stderr);
            if settings.json {
                builder.json().init();
            } else {
                builder.init();
            }
            None
        }
    }
}

async fn run(cli: &Cli, config: BridgeConfig) -> anyhow::Result<CliResult> {
    match &cli.command {
        Commands::List => list_devices(cli, &config).await,
        Commands::Read => read_device(cli, &config).await,
        Commands::Write { payload } => write_device(cli, &config, payload.as_deref()).await,
        Commands::Run => run_bridge(cli, &config).await,
        Commands::Config { action } => handle_config(cli, &config, action),
        Commands::ExitCodes => {
            print_exit_codes();
            Ok(CliResult::success())
        }
    }
}

fn build_host(cli: &Cli, config: &BridgeConfig) -> Arc<dyn UsbHost> {
    if cli.simulate {
        let host = LoopbackHost::new();
        host.attach(LoopbackDevice::new("Simulated FT232R").echo(true));
        Arc::new(host)
    } else {
        Arc::new(SystemUsbHost::new(config.device.baud_rate))
    }
}

/// Device-only commands get a broker that is never connected
fn build_transport(
    cli: &Cli,
    config: &BridgeConfig,
    broker: bool,
) -> anyhow::Result<Arc<dyn BrokerTransport>> {
    if cli.simulate || !broker {
        return Ok(Arc::new(MemoryBroker::new()));
    }
    let pem = config.broker.load_trust_material()?;
    let transport = NatsTransport::new(config.broker.nats_options(), &pem)?;
    Ok(Arc::new(transport))
}

fn build_orchestrator(cli: &Cli, config: &BridgeConfig, broker: bool) -> anyhow::Result<Orchestrator> {
    let registry = DeviceRegistry::new(build_host(cli, config))
        .io_timeout(config.device.io_timeout())
        .read_buffer_size(config.device.read_buffer_size);
    let bridge = BrokerBridge::new(build_transport(cli, config, broker)?, config.broker.subjects());
    Ok(Orchestrator::new(Arc::new(registry), Arc::new(bridge))
        .forward_inbound(config.device.forward_inbound))
}

async fn list_devices(cli: &Cli, config: &BridgeConfig) -> anyhow::Result<CliResult> {
    let registry = Arc::new(DeviceRegistry::new(build_host(cli, config)));
    let devices = tokio::task::spawn_blocking(move || registry.list_devices()).await??;

    if devices.is_empty() {
        return Ok(CliResult::success_with_message("No USB serial devices found."));
    }

    if cli.format == OutputFormat::Json {
        let json: Vec<serde_json::Value> = devices
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id,
                    "name": d.name,
                    "chip": d.chip.to_string(),
                    "port": d.port_number,
                    "connected": d.is_connected(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        println!("{:<10} {:<10} NAME", "ID", "CHIP");
        for device in &devices {
            println!(
                "{:<10} {:<10} {}",
                device.id.as_str(),
                device.chip.to_string(),
                device.name
            );
        }
    }
    Ok(CliResult::success())
}

/// Enumerate, select and open a device, asking for permission once if needed
async fn open_selected(cli: &Cli, orchestrator: &Orchestrator) -> Result<(), CliResult> {
    let state = orchestrator.snapshot();
    if let Some(err) = &state.last_error {
        return Err(CliResult::error(ExitCodes::HARDWARE_ERROR, err.clone()));
    }
    if let Some(id) = &cli.device {
        let state = orchestrator.select_device(&DeviceId::from(id.as_str()));
        if state.selected_device.as_ref().map(DeviceId::as_str) != Some(id.as_str()) {
            return Err(CliResult::error(
                ExitCodes::DEVICE_NOT_FOUND,
                state.last_error.clone().unwrap_or_default(),
            ));
        }
    }
    let Some(id) = orchestrator.snapshot().selected_device.clone() else {
        return Err(CliResult::error(ExitCodes::DEVICE_NOT_FOUND, "No USB serial devices found."));
    };

    let mut state = orchestrator.connect_device().await;
    if state.device_requires_permission {
        warn!(device = %id, "permission required, requesting access");
        let answer = orchestrator.request_permission(id).await;
        if !answer.device_permission_granted {
            return Err(CliResult::error(
                ExitCodes::PERMISSION_DENIED,
                answer.last_error.clone().unwrap_or_else(|| "permission denied".to_string()),
            ));
        }
        state = orchestrator.connect_device().await;
    }
    device_outcome(&state)
}

fn device_outcome(state: &OrchestrationState) -> Result<(), CliResult> {
    match &state.last_error {
        None => Ok(()),
        Some(msg) if state.device_requires_permission => {
            Err(CliResult::error(ExitCodes::PERMISSION_DENIED, msg.clone()))
        }
        Some(msg) if !state.device_connected => {
            Err(CliResult::error(ExitCodes::CONNECTION_CLOSED, msg.clone()))
        }
        Some(msg) => Err(CliResult::error(ExitCodes::HARDWARE_ERROR, msg.clone())),
    }
}

async fn read_device(cli: &Cli, config: &BridgeConfig) -> anyhow::Result<CliResult> {
    let orchestrator = build_orchestrator(cli, config, false)?;
    orchestrator.refresh_devices().await;
    if let Err(result) = open_selected(cli, &orchestrator).await {
        return Ok(result);
    }

    let state = orchestrator.read_from_device().await;
    if let Err(result) = device_outcome(&state) {
        return Ok(result);
    }
    println!("{}", format_summary(state.last_bytes_read.as_ref(), cli.format));
    orchestrator.disconnect_device().await;
    Ok(CliResult::success())
}

async fn write_device(
    cli: &Cli,
    config: &BridgeConfig,
    payload: Option<&str>,
) -> anyhow::Result<CliResult> {
    let orchestrator = build_orchestrator(cli, config, false)?;
    orchestrator.refresh_devices().await;
    if let Err(result) = open_selected(cli, &orchestrator).await {
        return Ok(result);
    }

    let data = match payload {
        Some(arg) => match parse_payload(arg) {
            Ok(data) => Bytes::from(data),
            Err(e) => return Ok(CliResult::error(ExitCodes::INVALID_ARGS, e.to_string())),
        },
        None => {
            let state = orchestrator.snapshot();
            let name = state
                .selected_device
                .as_ref()
                .and_then(|id| state.devices.iter().find(|d| &d.id == id))
                .map(|d| d.name.clone())
                .unwrap_or_default();
            Bytes::from(name)
        }
    };

    let state = orchestrator.write_to_device(data).await;
    if let Err(result) = device_outcome(&state) {
        return Ok(result);
    }
    if let Some(written) = &state.last_bytes_written {
        println!("wrote {} bytes: {}", written.len, format_output(&written.data, cli.format));
    }
    orchestrator.disconnect_device().await;
    Ok(CliResult::success())
}

async fn run_bridge(cli: &Cli, config: &BridgeConfig) -> anyhow::Result<CliResult> {
    let orchestrator = build_orchestrator(cli, config, true)?;
    let state = orchestrator.load().await;
    if !state.broker_status.is_connected() {
        return Ok(CliResult::error(
            ExitCodes::BROKER_CONNECT_FAILED,
            state
                .broker_last_error
                .clone()
                .unwrap_or_else(|| format!("broker is {}", state.broker_status)),
        ));
    }
    if let Err(result) = open_selected(cli, &orchestrator).await {
        orchestrator.disconnect_broker().await;
        return Ok(result);
    }

    let pump = BridgePump::new(orchestrator.clone(), config.device.poll_interval());
    let cancel = pump.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
        }
        cancel.cancel();
    });

    let stats = pump.run().await;
    orchestrator.disconnect_device().await;
    orchestrator.disconnect_broker().await;

    Ok(CliResult::success_with_message(format!(
        "published {} payloads ({} bytes), {} read errors, {} publish errors",
        stats.published, stats.bytes_published, stats.read_errors, stats.publish_errors
    )))
}

fn handle_config(cli: &Cli, config: &BridgeConfig, action: &ConfigAction) -> anyhow::Result<CliResult> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => config::config_file().ok_or(config::ConfigError::NoConfigDir)?,
    };
    match action {
        ConfigAction::Show => {
            let mut shown = config.clone();
            if !shown.broker.password.is_empty() {
                shown.broker.password = "********".to_string();
            }
            println!("{}", toml::to_string_pretty(&shown)?);
            Ok(CliResult::success())
        }
        ConfigAction::Path => Ok(CliResult::success_with_message(path.display().to_string())),
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                return Ok(CliResult::error(
                    ExitCodes::CONFIG_ERROR,
                    format!("{} already exists, use --force to overwrite", path.display()),
                ));
            }
            let mut fresh = BridgeConfig::default();
            if cli.config.is_none() {
                config::init_directories().context("creating application directories")?;
                fresh.logging.directory = config::log_dir();
            }
            fresh
                .save_to(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            Ok(CliResult::success_with_message(format!("Wrote {}", path.display())))
        }
    }
}
