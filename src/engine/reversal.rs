//! Reversal Engine
//!
//! Compensates a completed record with new entries; originals are never
//! touched. A target is reversed at most once: the same key replays, a
//! different key fails with `InvalidState`.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{LedgerEngine, require_available, require_text};
use crate::core_types::{ReversalId, UserId, WalletId};
use crate::error::LedgerError;
use crate::events::{DomainEvent, names};
use crate::idempotency::{Attempt, Guarded, IdempotencyKey};
use crate::ledger::{EntryLink, EntryType, LedgerEntry};
use crate::models::{Reversal, ReversalTarget, TransferStatus, WithdrawalStatus};
use crate::store::LedgerTx;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReversalRequest {
    pub target: ReversalTarget,
    pub reason: String,
    pub idempotency_key: IdempotencyKey,
}

/// Side effects of a committed reversal
struct Compensation {
    touched: Vec<WalletId>,
    notify: Option<UserId>,
    event: &'static str,
}

impl LedgerEngine {
    pub async fn reverse(&self, req: ReversalRequest) -> Result<Guarded<Reversal>, LedgerError> {
        let reason = require_text(&req.reason, "reason")?;

        let reversal = Reversal {
            reversal_id: ReversalId::new(),
            target: req.target,
            reason,
            idempotency_key: req.idempotency_key.to_string(),
            created_at: self.now(),
        };

        match self.try_reverse(&reversal).await? {
            Attempt::Done(done) => Ok(done),
            Attempt::LostRace => {
                let mut tx = self.begin().await?;
                match tx.reversal_by_key(req.idempotency_key.as_str()).await? {
                    Some(existing) => {
                        debug!(key = %req.idempotency_key, "Reversal lost race, replaying");
                        Ok(Guarded::replay(existing))
                    }
                    None => Err(LedgerError::InvalidState(format!(
                        "{} {} already reversed",
                        reversal.target.kind(),
                        reversal.target.id_string()
                    ))),
                }
            }
        }
    }

    async fn try_reverse(&self, reversal: &Reversal) -> Result<Attempt<Reversal>, LedgerError> {
        let mut tx = self.begin().await?;
        if let Some(existing) = tx.reversal_by_key(&reversal.idempotency_key).await? {
            debug!(key = %reversal.idempotency_key, "Reversal replayed");
            return Ok(Attempt::Done(Guarded::replay(existing)));
        }
        if tx.reversal_for_target(reversal.target).await?.is_some() {
            return Err(LedgerError::InvalidState(format!(
                "{} {} already reversed",
                reversal.target.kind(),
                reversal.target.id_string()
            )));
        }

        let compensation = match self.compensate(tx.as_mut(), reversal).await? {
            Some(c) => c,
            None => return Ok(Attempt::LostRace),
        };
        tx.commit().await?;
        drop(tx);

        info!(
            reversal_id = %reversal.reversal_id,
            target_type = %reversal.target.kind(),
            target_id = %reversal.target.id_string(),
            reason = %reversal.reason,
            "Reversal posted"
        );
        let events: Vec<DomainEvent> = vec![self.event(compensation.event, reversal)];
        self.finish(&compensation.touched, events).await;
        if let Some(user) = compensation.notify {
            self.notify(
                user,
                &format!("{} reversed: {}", reversal.target.kind(), reversal.reason),
            )
            .await;
        }
        Ok(Attempt::Done(Guarded::fresh(reversal.clone())))
    }

    /// Write the reversal record and its compensating entries.
    /// `None` when the reversal record lost the unique-key race.
    async fn compensate(
        &self,
        tx: &mut dyn LedgerTx,
        reversal: &Reversal,
    ) -> Result<Option<Compensation>, LedgerError> {
        let now = reversal.created_at;
        match reversal.target {
            ReversalTarget::Transfer(id) => {
                let transfer = tx
                    .transfer(id)
                    .await?
                    .ok_or_else(|| LedgerError::NotFound(format!("transfer {}", id)))?;
                if transfer.is_fx() {
                    return Err(LedgerError::InvalidState(
                        "fx transfer reversal unsupported".to_string(),
                    ));
                }
                if !transfer.status.can_reverse() {
                    return Err(LedgerError::InvalidState(format!(
                        "transfer {} is {}",
                        id, transfer.status
                    )));
                }
                let wallets = tx
                    .lock_wallets(&[transfer.from_wallet, transfer.to_wallet])
                    .await?;
                require_available(tx, transfer.to_wallet, transfer.amount).await?;
                if !tx.insert_reversal(reversal).await? {
                    return Ok(None);
                }

                let link = EntryLink::Transfer(id);
                tx.insert_entry(
                    &LedgerEntry::new(
                        transfer.from_wallet,
                        transfer.amount,
                        EntryType::TransferOutReversal,
                        now,
                    )
                    .linked(link)
                    .with_reference(reversal.reason.clone()),
                )
                .await?;
                tx.insert_entry(
                    &LedgerEntry::new(
                        transfer.to_wallet,
                        -transfer.amount,
                        EntryType::TransferInReversal,
                        now,
                    )
                    .linked(link)
                    .with_reference(reversal.reason.clone()),
                )
                .await?;
                if !tx
                    .update_transfer_status(
                        id,
                        TransferStatus::Completed,
                        TransferStatus::Reversed,
                        None,
                        now,
                    )
                    .await?
                {
                    return Err(LedgerError::InvalidState(format!(
                        "transfer {} changed concurrently",
                        id
                    )));
                }
                Ok(Some(Compensation {
                    touched: vec![transfer.from_wallet, transfer.to_wallet],
                    notify: wallets.first().map(|w| w.owner_id),
                    event: names::TRANSFER_REVERSED,
                }))
            }
            ReversalTarget::Deposit(id) => {
                let deposit = tx
                    .deposit(id)
                    .await?
                    .ok_or_else(|| LedgerError::NotFound(format!("deposit {}", id)))?;
                let wallets = tx.lock_wallets(&[deposit.wallet_id]).await?;
                require_available(tx, deposit.wallet_id, deposit.amount).await?;
                if !tx.insert_reversal(reversal).await? {
                    return Ok(None);
                }
                tx.insert_entry(
                    &LedgerEntry::new(
                        deposit.wallet_id,
                        -deposit.amount,
                        EntryType::DepositReversal,
                        now,
                    )
                    .linked(EntryLink::Deposit(id))
                    .with_reference(reversal.reason.clone()),
                )
                .await?;
                Ok(Some(Compensation {
                    touched: vec![deposit.wallet_id],
                    notify: wallets.first().map(|w| w.owner_id),
                    event: names::DEPOSIT_REVERSED,
                }))
            }
            ReversalTarget::Withdrawal(id) => {
                let withdrawal = tx
                    .withdrawal(id)
                    .await?
                    .ok_or_else(|| LedgerError::NotFound(format!("withdrawal {}", id)))?;
                if withdrawal.status != WithdrawalStatus::Completed {
                    return Err(LedgerError::InvalidState(format!(
                        "withdrawal {} is {}",
                        id, withdrawal.status
                    )));
                }
                tx.lock_wallets(&[withdrawal.wallet_id]).await?;
                if !tx.insert_reversal(reversal).await? {
                    return Ok(None);
                }
                // Agent keeps the commission; only the user is made whole
                tx.insert_entry(
                    &LedgerEntry::new(
                        withdrawal.wallet_id,
                        withdrawal.amount,
                        EntryType::WithdrawalReversal,
                        now,
                    )
                    .linked(EntryLink::Withdrawal(id))
                    .with_reference(reversal.reason.clone()),
                )
                .await?;
                let user = withdrawal.user_id;
                let wallet_id = withdrawal.wallet_id;
                let reversed = crate::models::Withdrawal {
                    status: WithdrawalStatus::Reversed,
                    ..withdrawal
                };
                if !tx
                    .update_withdrawal(&reversed, WithdrawalStatus::Completed)
                    .await?
                {
                    return Err(LedgerError::InvalidState(format!(
                        "withdrawal {} changed concurrently",
                        id
                    )));
                }
                Ok(Some(Compensation {
                    touched: vec![wallet_id],
                    notify: Some(user),
                    event: names::WITHDRAWAL_REVERSED,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::engine::TransferRequest;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn key(k: &str) -> IdempotencyKey {
        IdempotencyKey::new(k).unwrap()
    }

    #[tokio::test]
    async fn test_transfer_reversal_compensates() {
        let h = harness();
        let a = h.funded(1, dec!(100)).await;
        let b = h.funded(2, Decimal::ZERO).await;
        let t = h
            .engine
            .post_transfer(TransferRequest {
                from_wallet: a,
                to_wallet: b,
                amount: dec!(30),
                currency: usd(),
                idempotency_key: key("t"),
            })
            .await
            .unwrap()
            .value;

        let r = h
            .engine
            .reverse(ReversalRequest {
                target: ReversalTarget::Transfer(t.transfer_id),
                reason: "customer dispute".into(),
                idempotency_key: key("r-1"),
            })
            .await
            .unwrap();
        assert!(!r.replayed);

        let entries = h.engine.transfer_entries(t.transfer_id).await.unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries.iter().map(|e| e.amount).sum::<Decimal>(), Decimal::ZERO);
        assert_eq!(h.engine.compute_balance(a).await.unwrap().total, dec!(100));
        assert_eq!(h.engine.compute_balance(b).await.unwrap().total, Decimal::ZERO);
        assert_eq!(
            h.engine.get_transfer(t.transfer_id).await.unwrap().status,
            TransferStatus::Reversed
        );
    }

    #[tokio::test]
    async fn test_deposit_reversal_needs_funds() {
        let h = harness();
        let w = h.funded(1, Decimal::ZERO).await;
        let d = h
            .engine
            .post_deposit(crate::engine::DepositRequest {
                wallet_id: w,
                amount: dec!(40),
                currency: usd(),
                source: "bank".into(),
                external_ref: "x".into(),
                idempotency_key: None,
            })
            .await
            .unwrap()
            .value;
        let other = h.funded(2, Decimal::ZERO).await;
        h.engine
            .post_transfer(TransferRequest {
                from_wallet: w,
                to_wallet: other,
                amount: dec!(25),
                currency: usd(),
                idempotency_key: key("spend"),
            })
            .await
            .unwrap();

        let err = h
            .engine
            .reverse(ReversalRequest {
                target: ReversalTarget::Deposit(d.deposit_id),
                reason: "chargeback".into(),
                idempotency_key: key("rd"),
            })
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::InsufficientFunds(w));
    }

    #[tokio::test]
    async fn test_blank_reason_rejected() {
        let h = harness();
        let err = h
            .engine
            .reverse(ReversalRequest {
                target: ReversalTarget::Transfer(crate::core_types::TransferId::new()),
                reason: " ".into(),
                idempotency_key: key("r"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }
}
