//! Cross-currency transfers
//!
//! The rate is looked up at call time, stored on the transfer, and never
//! looked up again for that transfer: replays and deferred review postings
//! read the recipient amount back from the ledger or the stored rate.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::LedgerEngine;
use super::transfer::TransferPlan;
use crate::core_types::{Currency, TransferId, UserId};
use crate::error::LedgerError;
use crate::events::names;
use crate::idempotency::IdempotencyKey;
use crate::ledger::{EntryLink, EntryType};
use crate::models::{FxLeg, Transfer, TransferStatus, WalletKind};
use crate::money::{convert, ensure_positive};
use crate::ports::TransferIntent;
use crate::store::LedgerTx;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FxTransferRequest {
    pub sender_user: UserId,
    pub recipient_user: UserId,
    pub source_currency: Currency,
    pub dest_currency: Currency,
    pub amount_source: Decimal,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FxTransferReceipt {
    pub transfer_id: TransferId,
    pub status: TransferStatus,
    pub rate_used: Decimal,
    pub amount_source: Decimal,
    pub source_currency: Currency,
    pub amount_dest: Decimal,
    pub dest_currency: Currency,
    pub created_at: DateTime<Utc>,
    /// True when this call replayed an earlier submission
    pub deduplicated: bool,
}

impl LedgerEngine {
    /// Convert and move funds from the sender's `source_currency` wallet to
    /// the recipient's `dest_currency` wallet
    pub async fn post_fx_transfer(
        &self,
        req: FxTransferRequest,
    ) -> Result<FxTransferReceipt, LedgerError> {
        let amount = ensure_positive(req.amount_source)?;
        if req.source_currency == req.dest_currency {
            return Err(LedgerError::Validation(
                "FX transfer requires two different currencies".to_string(),
            ));
        }

        let (from, to) = {
            let mut tx = self.begin().await?;
            if let Some(existing) = tx.transfer_by_key(req.idempotency_key.as_str()).await? {
                debug!(key = %req.idempotency_key, "FX transfer replayed");
                return fx_receipt(tx.as_mut(), existing, true).await;
            }
            let from = tx
                .find_wallet(req.sender_user, &req.source_currency, WalletKind::User)
                .await?
                .ok_or_else(|| {
                    LedgerError::NotFound(format!(
                        "{} wallet of user {}",
                        req.source_currency, req.sender_user
                    ))
                })?;
            let to = tx
                .find_wallet(req.recipient_user, &req.dest_currency, WalletKind::User)
                .await?
                .ok_or_else(|| {
                    LedgerError::NotFound(format!(
                        "{} wallet of user {}",
                        req.dest_currency, req.recipient_user
                    ))
                })?;
            (from, to)
        };

        self.limits.check_limits(from.owner_id, amount).await?;
        let rate = self
            .rates
            .get_rate(&req.source_currency, &req.dest_currency)
            .await?;
        if rate.rate <= Decimal::ZERO {
            return Err(LedgerError::RateUnavailable(format!(
                "non-positive rate {}->{}",
                req.source_currency, req.dest_currency
            )));
        }
        let credit = ensure_positive(convert(amount, rate.rate)?)?;

        let assessment = self
            .risk
            .evaluate(&TransferIntent {
                from_wallet: from.wallet_id,
                to_wallet: to.wallet_id,
                from_user: from.owner_id,
                to_user: to.owner_id,
                amount,
                currency: req.source_currency.clone(),
                idempotency_key: req.idempotency_key.to_string(),
            })
            .await?;

        let plan = TransferPlan {
            from,
            to,
            amount,
            currency: req.source_currency,
            fx: Some(FxLeg {
                rate: rate.rate,
                to_currency: req.dest_currency,
            }),
            credit,
            key: req.idempotency_key,
            assessment,
        };
        let transfer = self.execute_transfer(&plan).await?;
        if transfer.replayed {
            let mut tx = self.begin().await?;
            return fx_receipt(tx.as_mut(), transfer.value, true).await;
        }
        self.after_transfer(&plan, &transfer.value, names::FX_TRANSFER_POSTED)
            .await;
        Ok(receipt_from_parts(&transfer.value, plan.credit, false))
    }
}

/// Rebuild the receipt of a stored transfer. The destination amount comes
/// from the recipient's `transfer_in` entry when one exists.
async fn fx_receipt(
    tx: &mut dyn LedgerTx,
    transfer: Transfer,
    deduplicated: bool,
) -> Result<FxTransferReceipt, LedgerError> {
    if transfer.fx.is_none() {
        return Err(LedgerError::Conflict(format!(
            "idempotency key {} belongs to a same-currency transfer",
            transfer.idempotency_key
        )));
    }
    let credited = tx
        .entries_for_link(EntryLink::Transfer(transfer.transfer_id))
        .await?
        .into_iter()
        .find(|e| e.entry_type == EntryType::TransferIn)
        .map(|e| e.amount);
    let amount_dest = match credited {
        Some(amount) => amount,
        None => transfer.credit_amount()?,
    };
    Ok(receipt_from_parts(&transfer, amount_dest, deduplicated))
}

fn receipt_from_parts(
    transfer: &Transfer,
    amount_dest: Decimal,
    deduplicated: bool,
) -> FxTransferReceipt {
    let (rate_used, dest_currency) = match &transfer.fx {
        Some(leg) => (leg.rate, leg.to_currency.clone()),
        None => (Decimal::ONE, transfer.currency.clone()),
    };
    FxTransferReceipt {
        transfer_id: transfer.transfer_id,
        status: transfer.status,
        rate_used,
        amount_source: transfer.amount,
        source_currency: transfer.currency.clone(),
        amount_dest,
        dest_currency,
        created_at: transfer.created_at,
        deduplicated,
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::engine::{Collaborators, DepositRequest, LedgerEngine};
    use crate::config::EngineConfig;
    use crate::ports::StaticRates;
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn htg() -> Currency {
        Currency::new("HTG").unwrap()
    }

    async fn setup(rates: Arc<StaticRates>) -> LedgerEngine {
        let engine = LedgerEngine::new(
            Arc::new(MemoryStore::new()),
            Collaborators {
                rates,
                ..Collaborators::default()
            },
            EngineConfig::default(),
        );
        let usd_wallet = engine
            .open_wallet(1, usd(), WalletKind::User)
            .await
            .unwrap()
            .value;
        engine.open_wallet(2, htg(), WalletKind::User).await.unwrap();
        engine
            .post_deposit(DepositRequest {
                wallet_id: usd_wallet.wallet_id,
                amount: dec!(100),
                currency: usd(),
                source: "bank".into(),
                external_ref: "seed".into(),
                idempotency_key: None,
            })
            .await
            .unwrap();
        engine
    }

    fn fx_request(amount: Decimal, key: &str) -> FxTransferRequest {
        FxTransferRequest {
            sender_user: 1,
            recipient_user: 2,
            source_currency: usd(),
            dest_currency: htg(),
            amount_source: amount,
            idempotency_key: IdempotencyKey::new(key).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_replay_keeps_original_rate() {
        let rates = Arc::new(StaticRates::new().with_rate(&usd(), &htg(), dec!(131.255)));
        let engine = setup(rates.clone()).await;

        let first = engine.post_fx_transfer(fx_request(dec!(10), "fx-1")).await.unwrap();
        assert!(!first.deduplicated);
        assert_eq!(first.amount_dest, dec!(1312.55));

        rates.set_rate(&usd(), &htg(), dec!(140));
        let again = engine.post_fx_transfer(fx_request(dec!(10), "fx-1")).await.unwrap();
        assert!(again.deduplicated);
        assert_eq!(again.amount_dest, dec!(1312.55));
        assert_eq!(again.rate_used, dec!(131.255));
        assert_eq!(again.transfer_id, first.transfer_id);
    }

    #[tokio::test]
    async fn test_missing_rate() {
        let engine = setup(Arc::new(StaticRates::new())).await;
        assert!(matches!(
            engine.post_fx_transfer(fx_request(dec!(10), "fx-2")).await,
            Err(LedgerError::RateUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_same_currency_rejected() {
        let engine = setup(Arc::new(StaticRates::new())).await;
        let mut req = fx_request(dec!(10), "fx-3");
        req.dest_currency = usd();
        assert!(matches!(
            engine.post_fx_transfer(req).await,
            Err(LedgerError::Validation(_))
        ));
    }
}
