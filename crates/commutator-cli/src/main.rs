//! `commutator` – serial device ↔ MQTT bridge.
//!
//! 1. Loads `commutator.toml`, or the file named by `--config` /
//!    `COMMUTATOR_CONFIG` (see [`config`]).
//! 2. Connects to the MQTT broker; failure here is fatal.
//! 3. Opens every configured serial device and registers it.
//! 4. Forwards device output to the broker and broker commands to devices
//!    until **Ctrl-C**, then shuts down cleanly.

mod config;

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use commutator_hal::{SerialOpener, StaticDiscovery};
use commutator_middleware::{MqttBroker, inbound_queue};
use commutator_runtime::{Commutator, init_tracing};
use commutator_types::CommutatorError;
use config::Cli;
use tracing::{error, warn};

fn main() -> ExitCode {
    // Tracing first: the OTLP exporter must be installed before the runtime
    // spawns any task.
    let _telemetry = init_tracing("commutator");

    let path = Cli::parse().config_path();
    print_banner();

    let cfg = match config::load_from(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };
    println!("  Config loaded from {}", path.display().to_string().bold());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{}: {}", "Runtime error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            eprintln!("{}: {}", "Fatal".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: config::Config) -> Result<(), CommutatorError> {
    let settings = cfg.mqtt_settings();
    print!("\n  Connecting to {}:{} … ", settings.host, settings.port);
    std::io::stdout().flush().ok();
    let (inbound_tx, inbound_rx) = inbound_queue(cfg.bridge.inbound_queue);
    let broker = match MqttBroker::connect(settings, inbound_tx).await {
        Ok(broker) => {
            println!("{}", "connected".green());
            Arc::new(broker)
        }
        Err(e) => {
            println!("{}", "failed".red());
            return Err(e);
        }
    };

    let bridge = Commutator::new(cfg.commutator_config(), broker);
    let report = bridge
        .discover(&StaticDiscovery::new(cfg.discovered_devices()), &SerialOpener)
        .await;

    println!("\n  Devices:");
    for identity in &report.registered {
        println!("    {} {}", "✓".green().bold(), identity.to_string().bold());
    }
    for (device, e) in &report.skipped {
        println!("    {} {} ({}): {}", "✗".yellow().bold(), device.identity, device.port.dimmed(), e);
    }
    if report.registered.is_empty() {
        warn!("no device could be opened; every inbound command will be dropped");
    }

    let running = bridge.start(inbound_rx).await?;
    let stop = running.shutdown_signal();

    let handler_stop = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        handler_stop.trigger();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; the bridge can only be stopped by killing the process");
    }

    println!("\n  Bridge running. Press {} to stop.\n", "Ctrl-C".bold().cyan());
    stop.wait().await;

    let closed = running.shutdown().await;
    println!("{}", format!("  ✓ {closed} connection(s) closed.").green());
    println!("{}", "  ✓ Exiting commutator.".green());
    Ok(())
}

fn print_banner() {
    println!();
    println!("  {} {}", "commutator".bold().cyan(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Serial device ↔ MQTT bridge");
    println!();
}
