//! netwatch daemon - Main entry point
//!
//! Runs discovery and health monitoring and streams events to WebSocket clients.

mod api;
mod config;
mod server;
mod state;
mod ws;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "netwatch")]
#[command(about = "Network device discovery and monitoring daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "netwatch.toml")]
    config: PathBuf,

    /// Bind address for web server
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run a single scan and exit
    #[arg(long)]
    scan_once: bool,

    /// Write a default configuration file to --config and exit
    #[arg(long)]
    write_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("netwatch v{}", env!("CARGO_PKG_VERSION"));

    if args.write_default_config {
        config::save_default_config(&args.config)?;
        info!(path = %args.config.display(), "Wrote default configuration");
        return Ok(());
    }

    // Load configuration
    let mut config = config::load_config(&args.config)?;

    // Override bind address if specified
    if let Some(bind) = args.bind {
        config.daemon.bind = bind;
    }

    // Create application state
    let state = state::AppState::new(config.clone()).await?;
    info!(range = %state.range().await, "Configuration loaded");

    if args.scan_once {
        // Single scan mode
        info!("Running single discovery scan");
        let summary = state.scanner.scan_once().await?;
        println!(
            "Scanned {} in {} ms: {} devices ({} new)",
            summary.range, summary.duration_ms, summary.found, summary.new
        );
        for degraded in &summary.degraded {
            println!("  ! {} unavailable: {}", degraded.source, degraded.reason);
        }
        for device in state.devices().await? {
            println!(
                "  - {} at {}{}{}",
                device.id,
                device.ip,
                device
                    .hostname
                    .as_deref()
                    .map(|h| format!(" ({})", h))
                    .unwrap_or_default(),
                device
                    .vendor
                    .as_deref()
                    .map(|v| format!(" [{}]", v))
                    .unwrap_or_default(),
            );
        }
    } else {
        // Daemon mode - run web server, discovery and monitoring
        server::run(state, &config.daemon.bind).await?;
    }

    Ok(())
}
