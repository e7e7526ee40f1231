//! Ledger Engine
//!
//! Entry point for every money movement. Each public operation:
//!
//! 1. validates its input (no writes yet)
//! 2. consults external collaborators (limits, risk, rates) outside any
//!    transaction
//! 3. runs ONE store transaction: idempotency lookup, wallet locks,
//!    balance re-check, record + entries, commit
//! 4. after commit: invalidates the balance cache for every touched wallet,
//!    then emits events and notifications (failures logged, never returned)
//!
//! Operations are split by flow: [`transfer`], [`fx`], [`deposit`],
//! [`withdrawal`], [`hold`], [`reversal`], [`review`], [`adjustment`], and
//! read-side helpers in [`wallet`].

pub mod adjustment;
pub mod deposit;
pub mod fx;
pub mod hold;
pub mod reversal;
pub mod review;
pub mod transfer;
pub mod wallet;
pub mod withdrawal;

pub use adjustment::AdjustmentRequest;
pub use deposit::DepositRequest;
pub use fx::{FxTransferReceipt, FxTransferRequest};
pub use hold::{AuthorizeOutcome, AuthorizeRequest, CaptureReceipt};
pub use reversal::ReversalRequest;
pub use review::ReviewDecision;
pub use transfer::TransferRequest;
pub use withdrawal::{WithdrawalApproval, WithdrawalRequest, WithdrawalTicket};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::config::EngineConfig;
use crate::core_types::{UserId, WalletId};
use crate::error::LedgerError;
use crate::events::{DEFAULT_OUTBOX_CAPACITY, DomainEvent, EventPublisher};
use crate::ledger::{Balance, BalanceCache};
use crate::ports::{
    AllowAll, Clock, EventSink, LimitChecker, LogEventSink, LogNotifier, NoLimits, Notifier,
    RateProvider, RiskEvaluator, StaticRates, SystemClock,
};
use crate::store::{LedgerStore, LedgerTx};

/// Default parked-event retry budget when none is configured
const DEFAULT_EVENT_ATTEMPTS: u32 = 10;

/// External collaborators consumed by the engine
pub struct Collaborators {
    pub rates: Arc<dyn RateProvider>,
    pub risk: Arc<dyn RiskEvaluator>,
    pub limits: Arc<dyn LimitChecker>,
    pub notifier: Arc<dyn Notifier>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            rates: Arc::new(StaticRates::new()),
            risk: Arc::new(AllowAll),
            limits: Arc::new(NoLimits),
            notifier: Arc::new(LogNotifier),
            events: Arc::new(LogEventSink),
            clock: Arc::new(SystemClock),
        }
    }
}

pub struct LedgerEngine {
    store: Arc<dyn LedgerStore>,
    rates: Arc<dyn RateProvider>,
    risk: Arc<dyn RiskEvaluator>,
    limits: Arc<dyn LimitChecker>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    events: EventPublisher,
    cache: BalanceCache,
    config: EngineConfig,
}

impl LedgerEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            rates: collaborators.rates,
            risk: collaborators.risk,
            limits: collaborators.limits,
            notifier: collaborators.notifier,
            clock: collaborators.clock,
            events: EventPublisher::new(collaborators.events, DEFAULT_EVENT_ATTEMPTS),
            cache: BalanceCache::new(config.balance_cache_ttl_secs),
            config,
        }
    }

    /// Override how many times a parked event is retried before it is dropped
    pub fn with_event_attempts(self, max_attempts: u32) -> Self {
        self.with_outbox(max_attempts, DEFAULT_OUTBOX_CAPACITY)
    }

    /// Retry budget and capacity of the event outbox
    pub fn with_outbox(mut self, max_attempts: u32, capacity: usize) -> Self {
        self.events = self.events.with_outbox(max_attempts, capacity);
        self
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    pub async fn health_check(&self) -> Result<(), LedgerError> {
        self.store.ping().await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn balance_cache(&self) -> &BalanceCache {
        &self.cache
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError> {
        self.store.begin().await
    }

    /// Post-commit bookkeeping: cache invalidation first, then events.
    /// Never fails.
    pub(crate) async fn finish(&self, touched: &[WalletId], events: Vec<DomainEvent>) {
        self.cache.invalidate(touched);
        for event in events {
            self.events.publish(event).await;
        }
    }

    pub(crate) fn event(&self, name: &str, payload: &impl Serialize) -> DomainEvent {
        let payload = serde_json::to_value(payload).unwrap_or_default();
        DomainEvent::new(name, payload, self.now())
    }

    /// Fire-and-forget notification
    pub(crate) async fn notify(&self, user: UserId, message: &str) {
        if let Err(e) = self.notifier.notify(user, message).await {
            warn!(user_id = user, error = %e, "Notification failed");
        }
    }
}

/// Balance derived from entries inside `tx`
pub(crate) async fn balance_in(
    tx: &mut dyn LedgerTx,
    wallet: WalletId,
) -> Result<Balance, LedgerError> {
    let totals = tx.entry_totals(wallet).await?;
    Balance::from_totals(&totals)
}

/// Fails with `InsufficientFunds` unless `wallet` has `amount` available.
/// Must run inside the transaction that performs the debit.
pub(crate) async fn require_available(
    tx: &mut dyn LedgerTx,
    wallet: WalletId,
    amount: Decimal,
) -> Result<Balance, LedgerError> {
    let balance = balance_in(tx, wallet).await?;
    if !balance.covers(amount) {
        return Err(LedgerError::InsufficientFunds(wallet));
    }
    Ok(balance)
}

pub(crate) fn require_text(value: &str, field: &str) -> Result<String, LedgerError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(LedgerError::Validation(format!("{} cannot be empty", field)));
    }
    Ok(value.to_string())
}
