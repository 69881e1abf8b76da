//! Port forwarder binary
//!
//! Loads rules from the store, starts every running rule and serves until
//! SIGINT/SIGTERM, then stops all rules and exits.

use anyhow::{Context, Result};
use std::sync::Arc;

use forward_rs::business::{MemoryStore, RuleManager, TomlStore};
use forward_rs::config::{CliArgs, RuntimeConfig};
use forward_rs::core::{Forwarder, RuleStore};
use forward_rs::logger::{self, log};

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT")?;
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM")?;

        tokio::select! {
            _ = sigint.recv() => {
                log::info!("SIGINT received, shutting down...");
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for ctrl-c")?;
        log::info!("Shutdown signal received...");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse_args();
    cli.validate()?;

    logger::init_logger(&cli.log_mode);

    log::info!(
        listen_host = %cli.listen_host,
        admin_port = ?cli.admin_port,
        stats_interval = ?cli.stats_interval,
        "Starting port forwarder"
    );

    let store: Arc<dyn RuleStore> = match &cli.rules_file {
        Some(path) => Arc::new(
            TomlStore::open(path)
                .with_context(|| format!("Failed to open rules file {}", path.display()))?,
        ),
        None => {
            log::warn!("No rules file configured, rules are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let config = RuntimeConfig::from_cli(&cli)?;
    let forwarder = Forwarder::builder().store(store).config(config).build()?;
    let manager = RuleManager::new(Arc::new(forwarder));

    let started = manager.restore().await;
    log::info!(rules = started, "Port forwarder running");

    wait_for_shutdown().await?;

    manager.shutdown().await;
    log::info!("Port forwarder stopped");
    Ok(())
}
