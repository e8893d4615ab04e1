//! Skymonitor control daemon (skymonitord)
//!
//! Standalone safety-monitor service for the observatory enclosure. Polls the
//! weather station over HTTP (or a legacy serial feed), derives dew point and
//! sky indicators, and drives the fan and dew-heater relays with fail-safe
//! logic: whenever the data cannot be trusted the fans run and the heater is
//! off. A small loopback HTTP API exposes status and manual actuator control
//! to the dashboard.
//!
//! # Safety Model
//! - **Fail-safe posture**: fan ON, heater OFF at startup, on stale/invalid
//!   data, and on shutdown
//! - **Manual overrides**: accepted via the API but re-validated against the
//!   safety rules every cycle; rain, critical temperatures and the heater
//!   minimum-off-time always win
//! - **Endpoint fallback**: consecutive primary fetch failures switch to the
//!   fallback endpoint, with periodic primary re-probes

mod control_loop;
mod controller;
mod http;
mod relay;
mod sensor;
mod server;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_SETTINGS_PATH: &str = "settings.json";
const DEFAULT_STATE_PATH: &str = "state.json";

fn print_help() {
    eprintln!("skymonitord {} - Skymonitor safety control daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    skymonitord [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -s, --settings PATH  Settings file (default: {})", DEFAULT_SETTINGS_PATH);
    eprintln!("        --state PATH     State snapshot file (default: {})", DEFAULT_STATE_PATH);
    eprintln!("    -v, --version        Print version");
    eprintln!("    -h, --help           Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    SKYMONITOR_LOG       Log level (trace, debug, info, warn, error)");
}

fn print_version() {
    println!("skymonitord {}", VERSION);
}

fn init_logging(log_level: &str) {
    // Prefer journald on systemd hosts, fall back to stdout
    let journald_available = std::path::Path::new("/run/systemd/journal/socket").exists();

    if journald_available {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(log_level))
                    .init();
                return;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(log_level)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // PHASE 1: Parse arguments
    let args: Vec<String> = std::env::args().collect();
    let mut settings_path = PathBuf::from(DEFAULT_SETTINGS_PATH);
    let mut state_path = PathBuf::from(DEFAULT_STATE_PATH);

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                print_version();
                return Ok(());
            }
            "-s" | "--settings" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --settings requires a path argument");
                    std::process::exit(1);
                }
                settings_path = PathBuf::from(&args[i]);
            }
            "--state" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --state requires a path argument");
                    std::process::exit(1);
                }
                state_path = PathBuf::from(&args[i]);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    // PHASE 2: Initialize logging
    let log_level = std::env::var("SKYMONITOR_LOG").unwrap_or_else(|_| "info".to_string());
    init_logging(&log_level);

    info!("STARTUP: skymonitord {} starting", VERSION);
    info!("STARTUP: Settings file: {:?}", settings_path);
    info!("STARTUP: Log level: {}", log_level);

    // PHASE 3: Relay hardware in the fail-safe posture before anything else
    let relay = Arc::new(relay::RelayDriver::probe());
    relay.apply_failsafe();
    info!("STARTUP: Safe defaults applied (fans ON, heater OFF)");

    // PHASE 4: Signal handler. The relays must land fail-safe even on an
    // abrupt termination.
    let relay_for_signal = relay.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        relay_for_signal.apply_failsafe();
        eprintln!("SIGNAL: shutdown requested - relays set to safe defaults");
        std::process::exit(0);
    }) {
        warn!("Failed to set signal handler: {}. Shutdown via signals may not be clean.", e);
    }

    // PHASE 5: Control state and loop
    let settings = sm_core::load_settings(&settings_path);
    let port = settings.control_port;

    let shared = Arc::new(Mutex::new(controller::ControlState::new(
        chrono::Utc::now(),
    )));
    let shutdown = Arc::new(AtomicBool::new(false));
    let notify = Arc::new(Notify::new());

    let loop_handle = tokio::spawn(control_loop::run_control_loop(
        shared.clone(),
        relay.clone(),
        settings_path.clone(),
        state_path,
        shutdown.clone(),
        notify.clone(),
    ));

    // PHASE 6: Serve the status API until shutdown
    let ctx = server::ApiContext {
        state: shared,
        relay: relay.clone(),
        settings_path,
    };
    let result = server::run_server(port, ctx).await;

    // PHASE 7: Stop the control loop and leave the relays fail-safe
    shutdown.store(true, Ordering::SeqCst);
    notify.notify_one();
    let _ = loop_handle.await;
    relay.apply_failsafe();
    info!("SHUTDOWN: Daemon terminated, relays left in safe defaults");

    if let Err(e) = result {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
