//! Maintenance Worker
//!
//! Background loop that keeps the post-commit side of the engine moving:
//! re-emits events parked in the outbox and expires lapsed withdrawal codes.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::OutboxConfig;
use crate::engine::LedgerEngine;
use crate::events::DrainStats;

/// Configuration for the maintenance worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pause between passes
    pub interval: Duration,
    /// Maximum parked events re-emitted per pass
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

impl From<&OutboxConfig> for WorkerConfig {
    fn from(outbox: &OutboxConfig) -> Self {
        Self {
            interval: outbox.drain_interval(),
            batch_size: outbox.batch_size,
        }
    }
}

/// What one pass did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub events: DrainStats,
    pub withdrawals_expired: usize,
}

pub struct MaintenanceWorker {
    engine: Arc<LedgerEngine>,
    config: WorkerConfig,
}

impl MaintenanceWorker {
    pub fn new(engine: Arc<LedgerEngine>, config: WorkerConfig) -> Self {
        Self { engine, config }
    }

    pub fn with_defaults(engine: Arc<LedgerEngine>) -> Self {
        Self::new(engine, WorkerConfig::default())
    }

    /// Run forever; abort the task to stop it
    pub async fn run(&self) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting maintenance worker"
        );

        loop {
            self.run_once().await;
            tokio::time::sleep(self.config.interval).await;
        }
    }

    /// Single pass. Failures are logged and retried next pass.
    pub async fn run_once(&self) -> PassStats {
        let mut stats = PassStats::default();

        if !self.engine.events().outbox().is_empty() {
            stats.events = self.engine.events().drain(self.config.batch_size).await;
            info!(
                delivered = stats.events.delivered,
                requeued = stats.events.requeued,
                dropped = stats.events.dropped,
                "Outbox drained"
            );
        }

        match self.engine.expire_withdrawals().await {
            Ok(n) => stats.withdrawals_expired = n,
            Err(e) => error!(error = %e, "Withdrawal expiry sweep failed"),
        }

        if stats == PassStats::default() {
            debug!("Maintenance pass found nothing to do");
        }
        stats
    }
}
