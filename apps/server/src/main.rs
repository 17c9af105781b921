//! Syncroom Server - standalone gateway binary for the synchronized
//! watch-room server.
//!
//! Wires the core engines via [`syncroom_core::bootstrap_services`] and
//! serves the `/sync` WebSocket endpoint until a shutdown signal arrives.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use syncroom_core::{bootstrap_services, start_server, Collaborators};
use tokio::signal;

use crate::config::ServerConfig;

/// Syncroom Server - gateway for synchronized multi-tenant media playback.
#[derive(Parser, Debug)]
#[command(name = "syncroom-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "SYNCROOM_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "SYNCROOM_BIND_PORT")]
    port: Option<u16>,

    /// Redis connection URL (overrides config file).
    #[arg(short = 'r', long, env = "SYNCROOM_REDIS_URL")]
    redis_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Syncroom Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(redis_url) = args.redis_url {
        config.redis_url = Some(redis_url);
    }

    log::info!(
        "Configuration: bind={}:{}, redis={}",
        config.bind_host,
        config.bind_port,
        config.redis_url.as_deref().unwrap_or("(in-memory)")
    );

    let services = bootstrap_services(
        config.redis_url.as_deref(),
        &config.redis_key_prefix,
        Collaborators::default(),
    )
    .await
    .context("Failed to bootstrap services")?;

    log::info!("Services bootstrapped successfully");

    let app_state = services.app_state(config.ping_timeout_ms, config.ping_interval_ms);
    let bind_addr = SocketAddr::new(config.bind_host, config.bind_port);
    let cors_origins = config.cors_origins.clone();

    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state, bind_addr, cors_origins).await {
            log::error!("Server error: {}", e);
        }
    });

    log::info!("WebSocket gateway listening on {}", bind_addr);

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    services.shutdown().await;
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
