//! cortexd - standalone Cortex daemon.
//!
//! Loads configuration, assembles a mesh over the in-process loopback
//! transport and an in-memory world backend, and runs until Ctrl+C or SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use mesh_core::{LoopbackTransport, Mesh, MeshConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use world_engine::InMemoryBackend;

/// The Cortex coordination daemon
#[derive(Parser, Debug)]
#[command(name = "cortexd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run in verbose mode (debug logging)
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(path: Option<PathBuf>) -> Result<MeshConfig> {
    let path = path.unwrap_or_else(|| PathBuf::from("cortex.toml"));
    if !path.exists() {
        info!("No configuration at {}, using defaults", path.display());
        return Ok(MeshConfig::default());
    }
    info!("Loading configuration from {}", path.display());
    MeshConfig::load(&path).with_context(|| format!("Failed to load {}", path.display()))
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT (Ctrl+C)"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .init();

    let config = load_config(args.config).context("Failed to load configuration")?;

    let mesh = Mesh::new(
        config,
        Arc::new(LoopbackTransport::new()),
        Arc::new(InMemoryBackend::new()),
    )
    .context("Failed to assemble mesh")?;
    let handle = mesh.start().await;
    info!("cortexd ready");

    wait_for_signal().await?;

    info!("Shutdown signal received...");
    handle.shutdown().await;
    info!("cortexd shutdown complete.");

    Ok(())
}
