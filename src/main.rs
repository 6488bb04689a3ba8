//! EmberKV server entry point.
//!
//! Startup order matters: the engine is rebuilt from disk before the listener
//! binds, so no client can observe a partially recovered keyspace.

use anyhow::Context;
use clap::Parser;
use emberkv::commands::CommandHandler;
use emberkv::config::{Cli, Config};
use emberkv::connection::{serve, ConnectionStats};
use emberkv::persistence::{recover, Persistence, Snapshotter};
use emberkv::storage::{ExpirySweeper, StorageEngine};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn print_banner(config: &Config) {
    println!(
        r#"
  ___           _             _  ____   __
 | __|_ __  ___| |__  ___ _ _| |/ /\ \ / /
 | _|| '  \/ -_) '_ \/ -_) '_| ' <  \ V /
 |___|_|_|_\___|_.__/\___|_| |_|\_\  \_/

EmberKV v{} - In-Memory Key-Value Server
──────────────────────────────────────────────────────────────
Listening on {}
Data directory {} (appendonly: {}, fsync: {})

Use Ctrl+C to shutdown gracefully.
"#,
        emberkv::VERSION,
        config.bind_address(),
        config.dir.display(),
        config.appendonly,
        config.appendfsync,
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_cli(&cli).context("invalid configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    if config.maxmemory > 0 {
        warn!(
            maxmemory = config.maxmemory,
            policy = %config.maxmemory_policy,
            "maxmemory is accepted but not enforced"
        );
    }

    let storage = Arc::new(StorageEngine::new());
    let persistence = Arc::new(Persistence::new(config.persistence()?));
    let handler = CommandHandler::new(Arc::clone(&storage), Arc::clone(&persistence));

    let report = recover(&handler)
        .await
        .context("failed to recover persisted state")?;
    info!(
        keys = storage.len(),
        snapshot_keys = report.snapshot_keys,
        replayed = report.replayed,
        last_seq = report.last_seq,
        "Storage engine ready"
    );

    let sweeper = ExpirySweeper::start(Arc::clone(&storage), config.expiry());
    let snapshotter = Snapshotter::start(Arc::clone(&persistence), Arc::clone(&storage));

    let stats = Arc::new(ConnectionStats::new());

    let listener = TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;
    print_banner(&config);
    info!("Listening on {}", config.bind_address());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(serve(
        listener,
        handler,
        Arc::clone(&stats),
        config.idle_timeout(),
        shutdown_rx,
    ));

    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, stopping server...");

    // Every client is gone once the server task returns.
    let _ = shutdown_tx.send(true);
    if let Err(e) = server.await {
        error!(error = %e, "Server task failed");
    }

    sweeper.shutdown().await;
    snapshotter.shutdown().await;
    if let Err(e) = persistence.shutdown(&storage).await {
        error!(error = %e, "Final flush failed; recent writes may only be in the WAL");
    }

    info!(
        connections = stats.connections_accepted.load(Ordering::Relaxed),
        commands = stats.commands_processed.load(Ordering::Relaxed),
        "Server shutdown complete"
    );
    Ok(())
}
