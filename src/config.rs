use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::error::LedgerError;
use crate::events::DEFAULT_OUTBOX_CAPACITY;

/// Longest a withdrawal code may stay redeemable: one day
pub const MAX_WITHDRAWAL_CODE_TTL_SECS: i64 = 86_400;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub gateway: GatewayConfig,
    /// PostgreSQL connection URL; the in-memory store is used when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub postgres_max_connections: u32,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
}

fn default_max_connections() -> u32 {
    50
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

/// Engine policy knobs
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub balance_cache_ttl_secs: u64,
    /// Lifetime of a withdrawal code
    pub withdrawal_code_ttl_secs: i64,
    pub withdrawal_code_len: usize,
    /// Agent commission on cash-out, e.g. `0.01` for 1%
    pub commission_rate: Decimal,
    /// Reserve the amount with a `hold_debit` while a transfer waits for review
    pub review_escrow_hold: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            balance_cache_ttl_secs: 30,
            withdrawal_code_ttl_secs: 900,
            withdrawal_code_len: 8,
            commission_rate: Decimal::new(1, 2),
            review_escrow_hold: false,
        }
    }
}

impl EngineConfig {
    /// Clamped to the valid range, for configs built without `validate`
    pub fn withdrawal_code_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            self.withdrawal_code_ttl_secs
                .clamp(1, MAX_WITHDRAWAL_CODE_TTL_SECS),
        )
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.commission_rate < Decimal::ZERO || self.commission_rate >= Decimal::ONE {
            return Err(LedgerError::Validation(format!(
                "commission_rate must be in [0, 1): {}",
                self.commission_rate
            )));
        }
        if !(4..=16).contains(&self.withdrawal_code_len) {
            return Err(LedgerError::Validation(format!(
                "withdrawal_code_len must be 4..=16: {}",
                self.withdrawal_code_len
            )));
        }
        if !(1..=MAX_WITHDRAWAL_CODE_TTL_SECS).contains(&self.withdrawal_code_ttl_secs) {
            return Err(LedgerError::Validation(format!(
                "withdrawal_code_ttl_secs must be 1..={}: {}",
                MAX_WITHDRAWAL_CODE_TTL_SECS, self.withdrawal_code_ttl_secs
            )));
        }
        Ok(())
    }
}

/// Outbox drain / maintenance worker settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OutboxConfig {
    pub drain_interval_ms: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
    /// Parked events kept before the oldest is dropped
    pub capacity: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            drain_interval_ms: 1000,
            batch_size: 100,
            max_attempts: 10,
            capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

impl OutboxConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.max_attempts == 0 || self.capacity == 0 || self.batch_size == 0 {
            return Err(LedgerError::Validation(
                "outbox max_attempts, capacity and batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, LedgerError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|e| {
            LedgerError::System(format!("Failed to read config file {}: {}", config_path, e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, LedgerError> {
        let config: AppConfig = serde_yaml::from_str(content)
            .map_err(|e| LedgerError::System(format!("Failed to parse config yaml: {}", e)))?;
        config.engine.validate()?;
        config.outbox.validate()?;
        Ok(config)
    }
}
