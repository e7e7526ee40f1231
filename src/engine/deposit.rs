//! Deposit Poster
//!
//! Credits confirmed external funds. Webhook redeliveries carry the same
//! `provider:external_ref` key and replay instead of double-crediting.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{LedgerEngine, require_text};
use crate::core_types::{Currency, DepositId, WalletId};
use crate::error::LedgerError;
use crate::events::names;
use crate::idempotency::{Attempt, Guarded, IdempotencyKey};
use crate::ledger::{EntryLink, EntryType, LedgerEntry};
use crate::models::Deposit;
use crate::money::ensure_positive;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRequest {
    pub wallet_id: WalletId,
    pub amount: Decimal,
    pub currency: Currency,
    /// Provider tag, e.g. `moncash`
    pub source: String,
    pub external_ref: String,
    /// Defaults to `source:external_ref`
    #[serde(default)]
    pub idempotency_key: Option<IdempotencyKey>,
}

impl LedgerEngine {
    pub async fn post_deposit(&self, req: DepositRequest) -> Result<Guarded<Deposit>, LedgerError> {
        let amount = ensure_positive(req.amount)?;
        let source = require_text(&req.source, "source")?;
        let external_ref = require_text(&req.external_ref, "external_ref")?;
        let key = match req.idempotency_key {
            Some(key) => key,
            None => IdempotencyKey::for_provider(&source, &external_ref)?,
        };

        let attempt = self
            .try_post_deposit(req.wallet_id, amount, &req.currency, source, external_ref, &key)
            .await?;
        let deposit = match attempt {
            Attempt::Done(done) => done,
            Attempt::LostRace => {
                let mut tx = self.begin().await?;
                let existing = tx.deposit_by_key(key.as_str()).await?.ok_or_else(|| {
                    LedgerError::System(format!("deposit key {} conflicted but is missing", key))
                })?;
                Guarded::replay(existing)
            }
        };
        if deposit.replayed {
            debug!(key = %key, deposit_id = %deposit.value.deposit_id, "Deposit replayed");
            return Ok(deposit);
        }

        let d = &deposit.value;
        self.finish(&[d.wallet_id], vec![self.event(names::DEPOSIT_POSTED, d)])
            .await;
        if let Ok(wallet) = self.get_wallet(d.wallet_id).await {
            self.notify(
                wallet.owner_id,
                &format!("Deposit of {} {} received", d.amount, d.currency),
            )
            .await;
        }
        Ok(deposit)
    }

    async fn try_post_deposit(
        &self,
        wallet_id: WalletId,
        amount: Decimal,
        currency: &Currency,
        source: String,
        external_ref: String,
        key: &IdempotencyKey,
    ) -> Result<Attempt<Deposit>, LedgerError> {
        let mut tx = self.begin().await?;
        if let Some(existing) = tx.deposit_by_key(key.as_str()).await? {
            return Ok(Attempt::Done(Guarded::replay(existing)));
        }

        let wallet = tx
            .lock_wallets(&[wallet_id])
            .await?
            .pop()
            .ok_or_else(|| LedgerError::NotFound(format!("wallet {}", wallet_id)))?;
        wallet.ensure_currency(currency)?;

        let now = self.now();
        let deposit = Deposit {
            deposit_id: DepositId::new(),
            wallet_id,
            amount,
            currency: currency.clone(),
            source,
            external_ref,
            idempotency_key: key.to_string(),
            created_at: now,
        };
        if !tx.insert_deposit(&deposit).await? {
            return Ok(Attempt::LostRace);
        }
        tx.insert_entry(
            &LedgerEntry::new(wallet_id, amount, EntryType::Deposit, now)
                .linked(EntryLink::Deposit(deposit.deposit_id))
                .with_reference(format!("{}:{}", deposit.source, deposit.external_ref)),
        )
        .await?;
        tx.commit().await?;

        info!(
            deposit_id = %deposit.deposit_id,
            wallet_id = %wallet_id,
            amount = %amount,
            source = %deposit.source,
            "Deposit posted"
        );
        Ok(Attempt::Done(Guarded::fresh(deposit)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use rust_decimal_macros::dec;

    fn webhook(wallet: WalletId, amount: Decimal, ext: &str) -> DepositRequest {
        DepositRequest {
            wallet_id: wallet,
            amount,
            currency: usd(),
            source: "moncash".into(),
            external_ref: ext.into(),
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn test_redelivery_credits_once() {
        let h = harness();
        let w = h.funded(1, Decimal::ZERO).await;

        let first = h.engine.post_deposit(webhook(w, dec!(75), "tx-9")).await.unwrap();
        let second = h.engine.post_deposit(webhook(w, dec!(75), "tx-9")).await.unwrap();
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.value, second.value);
        assert_eq!(first.value.idempotency_key, "moncash:tx-9");
        assert_eq!(h.engine.compute_balance(w).await.unwrap().total, dec!(75));
    }

    #[tokio::test]
    async fn test_deposit_validation() {
        let h = harness();
        let w = h.funded(1, Decimal::ZERO).await;
        assert_eq!(
            h.engine.post_deposit(webhook(w, dec!(-1), "a")).await,
            Err(LedgerError::InvalidAmount)
        );
        assert!(matches!(
            h.engine.post_deposit(webhook(w, dec!(1), "  ")).await,
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            h.engine
                .post_deposit(webhook(WalletId::new(), dec!(1), "b"))
                .await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lost_race_replays() {
        let h = harness();
        let w = h.funded(1, Decimal::ZERO).await;
        h.engine.post_deposit(webhook(w, dec!(5), "race")).await.unwrap();

        // The in-transaction lookup misses; the unique key still catches it
        h.store.simulate_stale_key_reads(1);
        let replay = h.engine.post_deposit(webhook(w, dec!(5), "race")).await.unwrap();
        assert!(replay.replayed);
        assert_eq!(h.engine.compute_balance(w).await.unwrap().total, dec!(5));
    }
}
