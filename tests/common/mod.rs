//! Shared fixture for engine scenario tests
#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;

use ledger_engine::config::EngineConfig;
use ledger_engine::core_types::{Currency, DepositId, UserId, WalletId};
use ledger_engine::engine::{Collaborators, DepositRequest, LedgerEngine};
use ledger_engine::idempotency::IdempotencyKey;
use ledger_engine::models::WalletKind;
use ledger_engine::ports::{ManualClock, MemoryEventSink, RiskVerdict, ScriptedRisk, StaticRates};
use ledger_engine::store::MemoryStore;

pub struct World {
    pub engine: Arc<LedgerEngine>,
    pub store: MemoryStore,
    pub sink: Arc<MemoryEventSink>,
    pub clock: Arc<ManualClock>,
    pub risk: Arc<ScriptedRisk>,
    pub rates: Arc<StaticRates>,
}

pub fn ccy(code: &str) -> Currency {
    Currency::new(code).unwrap()
}

pub fn key(raw: &str) -> IdempotencyKey {
    IdempotencyKey::new(raw).unwrap()
}

pub fn world() -> World {
    world_with(EngineConfig::default())
}

pub fn world_with(config: EngineConfig) -> World {
    let store = MemoryStore::new();
    let sink = Arc::new(MemoryEventSink::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let risk = Arc::new(ScriptedRisk::new(RiskVerdict::Allow));
    let rates = Arc::new(StaticRates::new());
    let collaborators = Collaborators {
        rates: rates.clone(),
        risk: risk.clone(),
        events: sink.clone(),
        clock: clock.clone(),
        ..Collaborators::default()
    };
    let engine = Arc::new(
        LedgerEngine::new(Arc::new(store.clone()), collaborators, config).with_event_attempts(3),
    );
    World {
        engine,
        store,
        sink,
        clock,
        risk,
        rates,
    }
}

impl World {
    pub async fn wallet(&self, owner: UserId, currency: &str, kind: WalletKind) -> WalletId {
        self.engine
            .open_wallet(owner, ccy(currency), kind)
            .await
            .unwrap()
            .value
            .wallet_id
    }

    /// Open a user wallet and credit it through a deposit
    pub async fn funded(&self, owner: UserId, currency: &str, amount: Decimal) -> WalletId {
        let wallet = self.wallet(owner, currency, WalletKind::User).await;
        self.fund(wallet, currency, amount).await;
        wallet
    }

    pub async fn fund(&self, wallet: WalletId, currency: &str, amount: Decimal) {
        if amount <= Decimal::ZERO {
            return;
        }
        self.engine
            .post_deposit(DepositRequest {
                wallet_id: wallet,
                amount,
                currency: ccy(currency),
                source: "seed".into(),
                external_ref: DepositId::new().to_string(),
                idempotency_key: None,
            })
            .await
            .unwrap();
    }

    pub async fn total(&self, wallet: WalletId) -> Decimal {
        self.engine.compute_balance(wallet).await.unwrap().total
    }

    pub async fn available(&self, wallet: WalletId) -> Decimal {
        self.engine.compute_balance(wallet).await.unwrap().available
    }
}
