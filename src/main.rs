//! gamewire - binary command RPC server
//!
//! Serves the lobby handlers over the configured listeners until interrupted.

mod handlers;

use clap::Parser;
use gamewire_server::{Config, Server};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gamewire")]
#[command(about = "Binary command RPC server for game-style socket protocols", version)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "GAMEWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Event-loop listener address
    #[arg(long)]
    tcp_bind: Option<SocketAddr>,

    /// Blocking-socket listener address
    #[arg(long)]
    socket_bind: Option<SocketAddr>,

    /// Websocket listener address
    #[arg(long)]
    ws_bind: Option<SocketAddr>,

    /// Worker threads (0 = available parallelism)
    #[arg(short, long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // A file that was asked for must load; otherwise defaults plus environment.
    let mut config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(mut config) => {
                tracing::info!("Loaded config from {}", path.display());
                config.apply_env_overrides();
                config
            }
            Err(e) => {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
        },
        None => {
            tracing::info!("Using default configuration");
            Config::from_env()
        }
    };

    if let Some(addr) = args.tcp_bind {
        config.network.tcp_addr = Some(addr);
    }
    if let Some(addr) = args.socket_bind {
        config.network.socket_addr = Some(addr);
    }
    if let Some(addr) = args.ws_bind {
        config.network.websocket_addr = Some(addr);
    }
    if let Some(workers) = args.workers {
        config.workers.pool_size = workers;
    }

    let registry = handlers::lobby()?;
    tracing::info!("Starting gamewire server");
    tracing::info!("  Handlers: {}", registry.len());
    tracing::info!("  Workers: {}", config.workers.effective_pool_size());
    tracing::info!("  Idle heartbeat: {}s", config.network.idle_heartbeat_secs);

    let server = Server::new(config, registry)?;
    server.start()?;

    if let Some(addr) = server.tcp_addr() {
        tracing::info!("  Event loop: {}", addr);
    }
    if let Some(addr) = server.socket_addr() {
        tracing::info!("  Blocking socket: {}", addr);
    }
    if let Some(addr) = server.websocket_addr() {
        tracing::info!("  Websocket: {}", addr);
    }
    if server.config().metrics.enabled {
        tracing::info!("  Metrics: http://{}/metrics", server.config().metrics.bind_addr);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping server...");

    // Joining worker threads blocks; keep it off the runtime workers.
    tokio::task::spawn_blocking(move || server.stop()).await?;

    tracing::info!("Server stopped");
    Ok(())
}
