// src/main.rs

//! The main entry point for the manager daemon.

use anyhow::Result;
use onionbalance::config::Config;
use onionbalance::daemon::Daemon;
use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("onionbalance version {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config" || arg == "-c")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .or_else(|| env::var("ONIONBALANCE_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let verbosity = args
        .iter()
        .position(|arg| arg == "--verbosity" || arg == "-v")
        .and_then(|i| args.get(i + 1))
        .cloned();

    let initial_log_level = verbosity
        .or_else(|| env::var("ONIONBALANCE_LOG_LEVEL").ok())
        .or_else(|| env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());

    let (writer, use_ansi) = match env::var("ONIONBALANCE_LOG_LOCATION") {
        Ok(path) => match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => (BoxMakeWriter::new(file), false),
            Err(e) => {
                eprintln!("Failed to open log file \"{path}\": {e}");
                std::process::exit(1);
            }
        },
        Err(_) => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(use_ansi).with_writer(writer))
        .init();
    let _reload_handle = Arc::new(reload_handle);

    let mut config = match Config::from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{}\": {e}", config_path.display());
            std::process::exit(1);
        }
    };

    if let Some(ip) = args.iter().position(|a| a == "--ip" || a == "-i").and_then(|i| args.get(i + 1)) {
        match ip.parse() {
            Ok(addr) => config.tor_address = addr,
            Err(_) => {
                eprintln!("Invalid --ip value: {ip}");
                std::process::exit(1);
            }
        }
    }

    if let Some(port) = args.iter().position(|a| a == "--port" || a == "-p").and_then(|i| args.get(i + 1)) {
        match port.parse() {
            Ok(port) => config.tor_control_port = port,
            Err(_) => {
                eprintln!("Invalid --port value: {port}");
                std::process::exit(1);
            }
        }
    }

    let services = match config.build_services() {
        Ok(services) => services,
        Err(e) => {
            eprintln!("Failed to initialize services: {e}");
            std::process::exit(1);
        }
    };

    let daemon = match Daemon::new(config, services).await {
        Ok(daemon) => daemon,
        Err(e) => {
            eprintln!("Failed to start: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = daemon.run().await {
        error!("fatal runtime error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
