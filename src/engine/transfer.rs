//! Same-currency transfers
//!
//! Risk verdicts shape the outcome:
//! - `allow`  → transfer `completed` with its `transfer_out`/`transfer_in` pair
//! - `review` → transfer `pending_review`, no settled entries (optionally an
//!   escrow `hold_debit` on the sender)
//! - `block`  → transfer `blocked`, no entries

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{LedgerEngine, require_available};
use crate::core_types::{Currency, TransferId, WalletId};
use crate::error::LedgerError;
use crate::events::{DomainEvent, names};
use crate::idempotency::{Attempt, Guarded, IdempotencyKey};
use crate::ledger::{EntryLink, EntryType, LedgerEntry};
use crate::models::{FxLeg, Transfer, TransferStatus, Wallet};
use crate::money::ensure_positive;
use crate::ports::{RiskAssessment, RiskVerdict, TransferIntent};
use crate::store::LedgerTx;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_wallet: WalletId,
    pub to_wallet: WalletId,
    pub amount: Decimal,
    pub currency: Currency,
    pub idempotency_key: IdempotencyKey,
}

/// Everything decided before the write transaction opens
pub(crate) struct TransferPlan {
    pub from: Wallet,
    pub to: Wallet,
    pub amount: Decimal,
    pub currency: Currency,
    pub fx: Option<FxLeg>,
    /// Amount credited to `to`
    pub credit: Decimal,
    pub key: IdempotencyKey,
    pub assessment: RiskAssessment,
}

impl TransferPlan {
    fn status(&self) -> TransferStatus {
        match self.assessment.verdict {
            RiskVerdict::Allow => TransferStatus::Completed,
            RiskVerdict::Review => TransferStatus::PendingReview,
            RiskVerdict::Block => TransferStatus::Blocked,
        }
    }

    fn risk_ref(&self) -> Option<String> {
        if self.assessment.flags.is_empty() {
            None
        } else {
            Some(self.assessment.flags.join(","))
        }
    }
}

impl LedgerEngine {
    /// Move `amount` between two wallets of the same currency
    pub async fn post_transfer(
        &self,
        req: TransferRequest,
    ) -> Result<Guarded<Transfer>, LedgerError> {
        if req.from_wallet == req.to_wallet {
            return Err(LedgerError::SameWallet);
        }
        let amount = ensure_positive(req.amount)?;

        let (from, to) = {
            let mut tx = self.begin().await?;
            if let Some(existing) = tx.transfer_by_key(req.idempotency_key.as_str()).await? {
                debug!(key = %req.idempotency_key, transfer_id = %existing.transfer_id, "Transfer replayed");
                return Ok(Guarded::replay(existing));
            }
            let from = load_wallet(tx.as_mut(), req.from_wallet).await?;
            let to = load_wallet(tx.as_mut(), req.to_wallet).await?;
            (from, to)
        };
        from.ensure_currency(&req.currency)?;
        to.ensure_currency(&req.currency)?;

        self.limits.check_limits(from.owner_id, amount).await?;
        let assessment = self
            .risk
            .evaluate(&TransferIntent {
                from_wallet: from.wallet_id,
                to_wallet: to.wallet_id,
                from_user: from.owner_id,
                to_user: to.owner_id,
                amount,
                currency: req.currency.clone(),
                idempotency_key: req.idempotency_key.to_string(),
            })
            .await?;

        let plan = TransferPlan {
            from,
            to,
            amount,
            currency: req.currency,
            fx: None,
            credit: amount,
            key: req.idempotency_key,
            assessment,
        };
        let transfer = self.execute_transfer(&plan).await?;
        if !transfer.replayed {
            self.after_transfer(&plan, &transfer.value, names::TRANSFER_POSTED)
                .await;
        }
        Ok(transfer)
    }

    /// Write phase shared by same-currency and FX transfers
    pub(crate) async fn execute_transfer(
        &self,
        plan: &TransferPlan,
    ) -> Result<Guarded<Transfer>, LedgerError> {
        match self.try_write_transfer(plan).await? {
            Attempt::Done(done) => Ok(done),
            Attempt::LostRace => {
                debug!(key = %plan.key, "Transfer lost idempotency race, replaying");
                self.replay_transfer(&plan.key).await
            }
        }
    }

    async fn try_write_transfer(
        &self,
        plan: &TransferPlan,
    ) -> Result<Attempt<Transfer>, LedgerError> {
        let mut tx = self.begin().await?;
        if let Some(existing) = tx.transfer_by_key(plan.key.as_str()).await? {
            return Ok(Attempt::Done(Guarded::replay(existing)));
        }

        let status = plan.status();
        let (from_id, to_id) = (plan.from.wallet_id, plan.to.wallet_id);
        tx.lock_wallets(&[from_id, to_id]).await?;
        if status != TransferStatus::Blocked {
            require_available(tx.as_mut(), from_id, plan.amount).await?;
        }

        let now = self.now();
        let transfer = Transfer {
            transfer_id: TransferId::new(),
            from_wallet: from_id,
            to_wallet: to_id,
            amount: plan.amount,
            currency: plan.currency.clone(),
            status,
            idempotency_key: plan.key.to_string(),
            fx: plan.fx.clone(),
            risk_ref: plan.risk_ref(),
            review: None,
            created_at: now,
            updated_at: now,
        };
        if !tx.insert_transfer(&transfer).await? {
            return Ok(Attempt::LostRace);
        }

        let link = EntryLink::Transfer(transfer.transfer_id);
        match status {
            TransferStatus::Completed => {
                tx.insert_entry(
                    &LedgerEntry::new(from_id, -plan.amount, EntryType::TransferOut, now)
                        .linked(link),
                )
                .await?;
                tx.insert_entry(
                    &LedgerEntry::new(to_id, plan.credit, EntryType::TransferIn, now)
                        .linked(link),
                )
                .await?;
            }
            TransferStatus::PendingReview if self.config.review_escrow_hold => {
                tx.insert_entry(
                    &LedgerEntry::new(from_id, -plan.amount, EntryType::HoldDebit, now)
                        .linked(link)
                        .with_reference("review escrow"),
                )
                .await?;
            }
            _ => {}
        }
        tx.commit().await?;

        info!(
            transfer_id = %transfer.transfer_id,
            from_wallet = %from_id,
            to_wallet = %to_id,
            amount = %plan.amount,
            currency = %plan.currency,
            status = %status,
            "Transfer recorded"
        );
        Ok(Attempt::Done(Guarded::fresh(transfer)))
    }

    async fn replay_transfer(&self, key: &IdempotencyKey) -> Result<Guarded<Transfer>, LedgerError> {
        let mut tx = self.begin().await?;
        tx.transfer_by_key(key.as_str())
            .await?
            .map(Guarded::replay)
            .ok_or_else(|| {
                LedgerError::System(format!("transfer key {} conflicted but is missing", key))
            })
    }

    /// Cache, events and notifications after a fresh transfer commit
    pub(crate) async fn after_transfer(
        &self,
        plan: &TransferPlan,
        transfer: &Transfer,
        posted_event: &str,
    ) {
        let (touched, name): (Vec<WalletId>, &str) = match transfer.status {
            TransferStatus::Completed => {
                (vec![transfer.from_wallet, transfer.to_wallet], posted_event)
            }
            TransferStatus::PendingReview => {
                (vec![transfer.from_wallet], names::TRANSFER_PENDING_REVIEW)
            }
            _ => (Vec::new(), names::TRANSFER_BLOCKED),
        };
        let events: Vec<DomainEvent> = vec![self.event(name, transfer)];
        self.finish(&touched, events).await;

        match transfer.status {
            TransferStatus::Completed => {
                self.notify(
                    plan.from.owner_id,
                    &format!("You sent {} {}", transfer.amount, transfer.currency),
                )
                .await;
                let credit_ccy = plan
                    .fx
                    .as_ref()
                    .map(|fx| fx.to_currency.clone())
                    .unwrap_or_else(|| transfer.currency.clone());
                self.notify(
                    plan.to.owner_id,
                    &format!("You received {} {}", plan.credit, credit_ccy),
                )
                .await;
            }
            TransferStatus::PendingReview => {
                self.notify(plan.from.owner_id, "Your transfer is under review")
                    .await;
            }
            _ => {
                self.notify(plan.from.owner_id, "Your transfer was blocked")
                    .await;
            }
        }
    }
}

pub(crate) async fn load_wallet(
    tx: &mut dyn LedgerTx,
    wallet_id: WalletId,
) -> Result<Wallet, LedgerError> {
    tx.wallet(wallet_id)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("wallet {}", wallet_id)))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::models::WalletKind;
    use rust_decimal_macros::dec;

    fn request(from: WalletId, to: WalletId, amount: Decimal, key: &str) -> TransferRequest {
        TransferRequest {
            from_wallet: from,
            to_wallet: to,
            amount,
            currency: usd(),
            idempotency_key: IdempotencyKey::new(key).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_transfer_pair() {
        let h = harness();
        let a = h.funded(1, dec!(100)).await;
        let b = h.funded(2, Decimal::ZERO).await;

        let t = h
            .engine
            .post_transfer(request(a, b, dec!(40), "t-1"))
            .await
            .unwrap();
        assert!(!t.replayed);
        assert_eq!(t.value.status, TransferStatus::Completed);

        let entries = h.engine.transfer_entries(t.value.transfer_id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.iter().map(|e| e.amount).sum::<Decimal>(), Decimal::ZERO);

        assert_eq!(h.engine.compute_balance(a).await.unwrap().available, dec!(60));
        assert_eq!(h.engine.compute_balance(b).await.unwrap().total, dec!(40));
        assert!(h.sink.names().contains(&names::TRANSFER_POSTED.to_string()));
    }

    #[tokio::test]
    async fn test_validation_before_writes() {
        let h = harness();
        let a = h.funded(1, dec!(10)).await;
        let b = h.funded(2, Decimal::ZERO).await;

        assert_eq!(
            h.engine.post_transfer(request(a, a, dec!(1), "k1")).await,
            Err(LedgerError::SameWallet)
        );
        assert_eq!(
            h.engine.post_transfer(request(a, b, dec!(0), "k2")).await,
            Err(LedgerError::InvalidAmount)
        );
        let mut wrong = request(a, b, dec!(1), "k3");
        wrong.currency = Currency::new("HTG").unwrap();
        assert!(matches!(
            h.engine.post_transfer(wrong).await,
            Err(LedgerError::CurrencyMismatch { .. })
        ));
        assert_eq!(h.store.entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_insufficient_available() {
        let h = harness();
        let a = h.funded(1, dec!(10)).await;
        let b = h.funded(2, Decimal::ZERO).await;
        assert_eq!(
            h.engine.post_transfer(request(a, b, dec!(10.01), "k")).await,
            Err(LedgerError::InsufficientFunds(a))
        );
    }

    #[tokio::test]
    async fn test_currency_mismatch_between_wallets() {
        let h = harness();
        let a = h.funded(1, dec!(10)).await;
        let htg = h
            .engine
            .open_wallet(2, Currency::new("HTG").unwrap(), WalletKind::User)
            .await
            .unwrap()
            .value;
        assert!(matches!(
            h.engine
                .post_transfer(request(a, htg.wallet_id, dec!(1), "k"))
                .await,
            Err(LedgerError::CurrencyMismatch { .. })
        ));
    }
}
