//! Ledger Engine service
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────────┐    ┌──────────┐
//! │  Config  │───▶│  Store   │───▶│ LedgerEngine │◀───│ Gateway  │
//! │  (YAML)  │    │ (PG/mem) │    │              │    │  (HTTP)  │
//! └──────────┘    └──────────┘    └──────┬───────┘    └──────────┘
//!                                        │
//!                                 ┌──────▼───────┐
//!                                 │ Maintenance  │
//!                                 │ (outbox/exp) │
//!                                 └──────────────┘
//! ```

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use ledger_engine::config::AppConfig;
use ledger_engine::engine::{Collaborators, LedgerEngine};
use ledger_engine::logging::init_logging;
use ledger_engine::store::{LedgerStore, MemoryStore, PgStore};
use ledger_engine::worker::{MaintenanceWorker, WorkerConfig};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    std::env::var("RUN_MODE").unwrap_or_else(|_| "dev".to_string())
}

async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn LedgerStore>> {
    match &config.postgres_url {
        Some(url) => {
            let store = PgStore::connect(url, config.postgres_max_connections)
                .await
                .context("connect to PostgreSQL")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("No postgres_url configured, using the in-memory store (data is lost on exit)");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env).with_context(|| format!("load config for env {}", env))?;
    let _log_guard = init_logging(&config);

    info!(
        env = %env,
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("GIT_HASH"),
        "Starting ledger engine"
    );

    let store = build_store(&config).await?;
    let engine = Arc::new(
        LedgerEngine::new(store, Collaborators::default(), config.engine.clone())
            .with_outbox(config.outbox.max_attempts, config.outbox.capacity),
    );

    let worker = MaintenanceWorker::new(engine.clone(), WorkerConfig::from(&config.outbox));
    let worker_handle = tokio::spawn(async move { worker.run().await });

    let result = ledger_engine::gateway::run_server(&config.gateway, engine, shutdown_signal()).await;

    worker_handle.abort();
    info!("Ledger engine stopped");
    result
}
