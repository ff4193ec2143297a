//! Edge Agent
//!
//! Keeps this node's shadow in sync with the cloud and drives the local
//! orchestration engine toward the desired applications.
//!
//! ## Architecture
//!
//! - **Registry**: state store, node/device shadows, engine and the lazily
//!   connected cloud link
//! - **Syncer**: reporting, desiring and receiving loops
//! - **Supervisor**: owns the loops and stops them on shutdown

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use edge_agent::config::Config;
use edge_agent::state::StateStore;
use edge_agent::{MockEngine, Registry, Supervisor, Syncer};

/// Grace period for background tasks on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Edge agent - syncs the node shadow with the cloud.
#[derive(Debug, Parser)]
#[command(name = "edge-agent")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory that relative paths in the configuration resolve against.
    #[arg(long, env = "EDGE_PREFIX")]
    prefix: Option<PathBuf>,

    /// Configuration file (TOML).
    #[arg(short, long, env = "EDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level regardless of configuration.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref(), cli.prefix.as_deref())?;

    let level = if cli.debug { "debug" } else { config.log_level.as_str() };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node = %config.node.name,
        namespace = %config.node.namespace,
        link = ?config.link.kind,
        data_dir = %config.data_dir.display(),
        "Starting edge agent"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data dir: {}", config.data_dir.display()))?;
    let store = Arc::new(StateStore::open(config.state_path()).context("Failed to open state store")?);

    // No production engine is wired in yet; the mock logs what it would do.
    let engine = Arc::new(MockEngine::new());
    let registry = Registry::new(config, store, engine)?;

    let link = registry.link().await.context("Failed to build cloud link")?;
    let syncer = Arc::new(Syncer::new(
        registry.config().sync.clone(),
        Arc::clone(registry.node()),
        registry.devices().clone(),
        link,
        Arc::clone(registry.engine()),
        registry.collector(),
    ));

    let mut supervisor = Supervisor::new(SHUTDOWN_GRACE);
    syncer.start(&mut supervisor);

    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        },
        finished = supervisor.wait_any() => match finished {
            Some(name) => warn!(task = %name, "Task exited unexpectedly"),
            None => warn!("No tasks running"),
        },
    }

    supervisor.stop_all().await;
    registry.close().await;

    info!("Edge agent shutdown complete");
    Ok(())
}
