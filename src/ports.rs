//! External collaborators
//!
//! The engine consumes these through traits only. Each trait ships with the
//! default implementation used by the in-memory deployment and by tests.
//!
//! Notification and event-sink failures come back as plain strings: the
//! engine logs them and moves on, they never reach a caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use crate::core_types::{Currency, UserId, WalletId};
use crate::error::LedgerError;
use crate::events::DomainEvent;

// ============================================================================
// Rate lookup
// ============================================================================

/// Point-in-time conversion rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FxRate {
    pub rate: Decimal,
    pub as_of: DateTime<Utc>,
}

#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Rate converting one unit of `from` into `to`.
    /// Fails with `RateUnavailable` when the pair is not configured.
    async fn get_rate(&self, from: &Currency, to: &Currency) -> Result<FxRate, LedgerError>;
}

/// Fixed rate table
#[derive(Default)]
pub struct StaticRates {
    rates: RwLock<HashMap<(Currency, Currency), Decimal>>,
}

impl StaticRates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(self, from: &Currency, to: &Currency, rate: Decimal) -> Self {
        self.set_rate(from, to, rate);
        self
    }

    pub fn set_rate(&self, from: &Currency, to: &Currency, rate: Decimal) {
        let mut rates = self.rates.write().unwrap_or_else(|p| p.into_inner());
        rates.insert((from.clone(), to.clone()), rate);
    }
}

#[async_trait]
impl RateProvider for StaticRates {
    async fn get_rate(&self, from: &Currency, to: &Currency) -> Result<FxRate, LedgerError> {
        if from == to {
            return Ok(FxRate {
                rate: Decimal::ONE,
                as_of: Utc::now(),
            });
        }
        let rates = self.rates.read().unwrap_or_else(|p| p.into_inner());
        match rates.get(&(from.clone(), to.clone())) {
            Some(rate) => Ok(FxRate {
                rate: *rate,
                as_of: Utc::now(),
            }),
            None => Err(LedgerError::RateUnavailable(format!("{}->{}", from, to))),
        }
    }
}

// ============================================================================
// Risk verdict
// ============================================================================

/// What the risk collaborator is asked about
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferIntent {
    pub from_wallet: WalletId,
    pub to_wallet: WalletId,
    pub from_user: UserId,
    pub to_user: UserId,
    pub amount: Decimal,
    pub currency: Currency,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskVerdict {
    Allow,
    Review,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub verdict: RiskVerdict,
    pub flags: Vec<String>,
}

impl RiskAssessment {
    pub fn allow() -> Self {
        Self {
            verdict: RiskVerdict::Allow,
            flags: Vec::new(),
        }
    }
}

#[async_trait]
pub trait RiskEvaluator: Send + Sync {
    async fn evaluate(&self, intent: &TransferIntent) -> Result<RiskAssessment, LedgerError>;
}

/// Allows everything
pub struct AllowAll;

#[async_trait]
impl RiskEvaluator for AllowAll {
    async fn evaluate(&self, _intent: &TransferIntent) -> Result<RiskAssessment, LedgerError> {
        Ok(RiskAssessment::allow())
    }
}

/// Returns whatever verdict was last set
pub struct ScriptedRisk {
    next: Mutex<RiskAssessment>,
}

impl ScriptedRisk {
    pub fn new(verdict: RiskVerdict) -> Self {
        Self {
            next: Mutex::new(RiskAssessment {
                verdict,
                flags: Vec::new(),
            }),
        }
    }

    pub fn set(&self, verdict: RiskVerdict, flags: &[&str]) {
        let mut next = self.next.lock().unwrap_or_else(|p| p.into_inner());
        *next = RiskAssessment {
            verdict,
            flags: flags.iter().map(|f| f.to_string()).collect(),
        };
    }
}

#[async_trait]
impl RiskEvaluator for ScriptedRisk {
    async fn evaluate(&self, _intent: &TransferIntent) -> Result<RiskAssessment, LedgerError> {
        Ok(self.next.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }
}

// ============================================================================
// Limits
// ============================================================================

#[async_trait]
pub trait LimitChecker: Send + Sync {
    /// `Err(LimitExceeded)` when the user may not move `amount`
    async fn check_limits(&self, user: UserId, amount: Decimal) -> Result<(), LedgerError>;
}

pub struct NoLimits;

#[async_trait]
impl LimitChecker for NoLimits {
    async fn check_limits(&self, _user: UserId, _amount: Decimal) -> Result<(), LedgerError> {
        Ok(())
    }
}

/// Flat per-operation ceiling
pub struct PerOperationLimit {
    pub max: Decimal,
}

#[async_trait]
impl LimitChecker for PerOperationLimit {
    async fn check_limits(&self, user: UserId, amount: Decimal) -> Result<(), LedgerError> {
        if amount > self.max {
            return Err(LedgerError::LimitExceeded(format!(
                "user {} amount {} exceeds {}",
                user, amount, self.max
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Notification
// ============================================================================

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user: UserId, message: &str) -> Result<(), String>;
}

/// Writes notifications to the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user: UserId, message: &str) -> Result<(), String> {
        tracing::info!(user_id = user, message, "Notification");
        Ok(())
    }
}

// ============================================================================
// Domain event sink
// ============================================================================

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &DomainEvent) -> Result<(), String>;
}

/// Writes events to the log
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn emit(&self, event: &DomainEvent) -> Result<(), String> {
        tracing::debug!(
            event_id = %event.event_id,
            name = %event.name,
            payload = %event.payload,
            "Domain event"
        );
        Ok(())
    }
}

/// Keeps emitted events in memory; can be switched into a failing mode
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<DomainEvent>>,
    failing: AtomicBool,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.name).collect()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn emit(&self, event: &DomainEvent) -> Result<(), String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err("event sink unavailable".to_string());
        }
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event.clone());
        Ok(())
    }
}

// ============================================================================
// Clock
// ============================================================================

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}
