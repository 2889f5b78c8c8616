//! regmux server binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use regmux_config::ServerConfig;
use regmux_server::builder::AppBuilder;

/// Multi-tenant MCP registry aggregator.
#[derive(Debug, Parser)]
#[command(name = "regmux-server", version, about)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "regmux.yaml")]
    config: PathBuf,

    /// Listen address for the HTTP API.
    #[arg(long, default_value = "0.0.0.0:8080")]
    address: SocketAddr,

    /// Override the configured data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig::load(&args.config)?;
    info!(config = %args.config.display(), registry = %config.registry_name,
          "configuration loaded");

    let mut builder = AppBuilder::new()
        .with_config(config)?
        .with_address(args.address);
    if let Some(data_dir) = args.data_dir {
        builder = builder.with_data_directory(data_dir)?;
    }
    let app = builder.build().await?;

    // Shutdown signals cancel the shared token; the coordinator drains
    // in-flight syncs and the HTTP server finishes open requests.
    let shutdown = app.shutdown_token();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {},
                _ = sigterm.recv() => {},
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        shutdown.cancel();
    });

    app.run().await.context("server exited with an error")
}
