//! Card authorization holds
//!
//! ```text
//! authorize ──ok──▶ authorized ──capture──▶ captured
//!     │                  └──────reverse──▶ reversed
//!     └──insufficient──▶ declined
//! ```
//!
//! A decline is a soft outcome: the transaction record is written, no ledger
//! entry is, and the caller gets `ok = false`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{LedgerEngine, balance_in};
use crate::core_types::{CardId, CardTxId, Currency};
use crate::error::LedgerError;
use crate::events::names;
use crate::idempotency::{Attempt, Guarded, IdempotencyKey};
use crate::ledger::{EntryLink, EntryType, LedgerEntry};
use crate::models::{CardTransaction, CardTxStatus};
use crate::money::ensure_positive;
use crate::store::LedgerTx;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizeRequest {
    pub card_id: CardId,
    pub amount: Decimal,
    pub currency: Currency,
    #[serde(default)]
    pub merchant: Option<String>,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizeOutcome {
    pub ok: bool,
    pub reason: Option<String>,
    pub transaction: CardTransaction,
}

impl AuthorizeOutcome {
    /// Rebuild the outcome from a stored record
    fn recorded(transaction: CardTransaction) -> Self {
        Self {
            ok: transaction.status != CardTxStatus::Declined,
            reason: transaction.decline_reason.clone(),
            transaction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureReceipt {
    pub card_tx_id: CardTxId,
    pub capture_amount: Decimal,
    pub authorized_amount: Decimal,
}

const DECLINE_INSUFFICIENT: &str = "insufficient_funds";
const DECLINE_CARD_INACTIVE: &str = "card_inactive";

/// Load a card transaction and require it to still be `authorized`
async fn authorized_tx(
    tx: &mut dyn LedgerTx,
    card_tx_id: CardTxId,
) -> Result<CardTransaction, LedgerError> {
    let card_tx = tx
        .card_tx(card_tx_id)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("card transaction {}", card_tx_id)))?;
    if card_tx.status != CardTxStatus::Authorized {
        return Err(LedgerError::InvalidState(format!(
            "card transaction {} is {}",
            card_tx_id, card_tx.status
        )));
    }
    Ok(card_tx)
}

impl LedgerEngine {
    /// Place a hold for `amount` on the card's wallet. A replayed key returns
    /// the recorded outcome, declines included, with the transaction in its
    /// current state.
    pub async fn authorize_hold(
        &self,
        req: AuthorizeRequest,
    ) -> Result<Guarded<AuthorizeOutcome>, LedgerError> {
        let amount = ensure_positive(req.amount)?;

        let outcome = match self.try_authorize(&req, amount).await? {
            Attempt::Done(done) => done,
            Attempt::LostRace => {
                let mut tx = self.begin().await?;
                let existing = tx
                    .card_tx_by_key(req.idempotency_key.as_str())
                    .await?
                    .ok_or_else(|| {
                        LedgerError::System(format!(
                            "authorization key {} conflicted but is missing",
                            req.idempotency_key
                        ))
                    })?;
                Guarded::replay(AuthorizeOutcome::recorded(existing))
            }
        };
        if outcome.replayed {
            debug!(
                key = %req.idempotency_key,
                card_tx_id = %outcome.value.transaction.card_tx_id,
                "Authorization replayed"
            );
            return Ok(outcome);
        }

        let card_tx = &outcome.value.transaction;
        if outcome.value.ok {
            self.finish(
                &[card_tx.wallet_id],
                vec![self.event(names::HOLD_AUTHORIZED, card_tx)],
            )
            .await;
        } else {
            self.finish(&[], vec![self.event(names::HOLD_DECLINED, card_tx)])
                .await;
        }
        Ok(outcome)
    }

    async fn try_authorize(
        &self,
        req: &AuthorizeRequest,
        amount: Decimal,
    ) -> Result<Attempt<AuthorizeOutcome>, LedgerError> {
        let mut tx = self.begin().await?;
        if let Some(existing) = tx.card_tx_by_key(req.idempotency_key.as_str()).await? {
            return Ok(Attempt::Done(Guarded::replay(AuthorizeOutcome::recorded(
                existing,
            ))));
        }
        let card = tx
            .card(req.card_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("card {}", req.card_id)))?;
        let wallet = tx
            .lock_wallets(&[card.wallet_id])
            .await?
            .pop()
            .ok_or_else(|| LedgerError::NotFound(format!("wallet {}", card.wallet_id)))?;
        wallet.ensure_currency(&req.currency)?;

        let now = self.now();
        let mut card_tx = CardTransaction {
            card_tx_id: CardTxId::new(),
            card_id: card.card_id,
            wallet_id: card.wallet_id,
            amount,
            currency: req.currency.clone(),
            status: CardTxStatus::Authorized,
            capture_amount: None,
            hold_entry_id: None,
            merchant: req.merchant.clone(),
            decline_reason: None,
            idempotency_key: req.idempotency_key.to_string(),
            created_at: now,
            updated_at: now,
        };

        let decline = if !card.active {
            Some(DECLINE_CARD_INACTIVE)
        } else if !balance_in(tx.as_mut(), card.wallet_id).await?.covers(amount) {
            Some(DECLINE_INSUFFICIENT)
        } else {
            None
        };

        if let Some(reason) = decline {
            card_tx.status = CardTxStatus::Declined;
            card_tx.decline_reason = Some(reason.to_string());
            if !tx.insert_card_tx(&card_tx).await? {
                return Ok(Attempt::LostRace);
            }
            tx.commit().await?;

            info!(card_tx_id = %card_tx.card_tx_id, card_id = %card.card_id, reason, "Authorization declined");
            return Ok(Attempt::Done(Guarded::fresh(AuthorizeOutcome::recorded(
                card_tx,
            ))));
        }

        let hold = LedgerEntry::new(card.wallet_id, -amount, EntryType::HoldDebit, now)
            .linked(EntryLink::CardTransaction(card_tx.card_tx_id));
        card_tx.hold_entry_id = Some(hold.entry_id);
        if !tx.insert_card_tx(&card_tx).await? {
            return Ok(Attempt::LostRace);
        }
        tx.insert_entry(&hold).await?;
        tx.commit().await?;

        info!(
            card_tx_id = %card_tx.card_tx_id,
            wallet_id = %card_tx.wallet_id,
            amount = %amount,
            "Hold authorized"
        );
        Ok(Attempt::Done(Guarded::fresh(AuthorizeOutcome::recorded(
            card_tx,
        ))))
    }

    /// Settle an authorization for `capture_amount` (defaults to the full
    /// authorized amount). The whole hold is released; only the captured
    /// amount is debited.
    pub async fn capture_hold(
        &self,
        card_tx_id: CardTxId,
        capture_amount: Option<Decimal>,
    ) -> Result<CaptureReceipt, LedgerError> {
        let mut tx = self.begin().await?;
        let authorized = authorized_tx(tx.as_mut(), card_tx_id).await?;
        let capture = capture_amount.unwrap_or(authorized.amount);
        if capture <= Decimal::ZERO || capture > authorized.amount {
            return Err(LedgerError::Validation(format!(
                "capture amount {} must be > 0 and <= authorized {}",
                capture, authorized.amount
            )));
        }

        tx.lock_wallets(&[authorized.wallet_id]).await?;
        let now = self.now();
        let link = EntryLink::CardTransaction(card_tx_id);
        tx.insert_entry(
            &LedgerEntry::new(authorized.wallet_id, authorized.amount, EntryType::HoldRelease, now)
                .linked(link),
        )
        .await?;
        tx.insert_entry(
            &LedgerEntry::new(authorized.wallet_id, -capture, EntryType::CardCapture, now)
                .linked(link)
                .with_reference(authorized.merchant.clone().unwrap_or_default()),
        )
        .await?;

        let captured = CardTransaction {
            status: CardTxStatus::Captured,
            capture_amount: Some(capture),
            updated_at: now,
            ..authorized
        };
        if !tx.update_card_tx(&captured, CardTxStatus::Authorized).await? {
            return Err(LedgerError::InvalidState(format!(
                "card transaction {} changed concurrently",
                card_tx_id
            )));
        }
        tx.commit().await?;
        drop(tx);

        info!(
            card_tx_id = %card_tx_id,
            authorized = %captured.amount,
            captured = %capture,
            "Hold captured"
        );
        self.finish(
            &[captured.wallet_id],
            vec![self.event(names::HOLD_CAPTURED, &captured)],
        )
        .await;
        Ok(CaptureReceipt {
            card_tx_id,
            capture_amount: capture,
            authorized_amount: captured.amount,
        })
    }

    /// Void an authorization, releasing the full hold
    pub async fn reverse_hold(&self, card_tx_id: CardTxId) -> Result<CardTransaction, LedgerError> {
        let mut tx = self.begin().await?;
        let authorized = authorized_tx(tx.as_mut(), card_tx_id).await?;
        tx.lock_wallets(&[authorized.wallet_id]).await?;

        let now = self.now();
        tx.insert_entry(
            &LedgerEntry::new(authorized.wallet_id, authorized.amount, EntryType::HoldRelease, now)
                .linked(EntryLink::CardTransaction(card_tx_id)),
        )
        .await?;
        let reversed = CardTransaction {
            status: CardTxStatus::Reversed,
            updated_at: now,
            ..authorized
        };
        if !tx.update_card_tx(&reversed, CardTxStatus::Authorized).await? {
            return Err(LedgerError::InvalidState(format!(
                "card transaction {} changed concurrently",
                card_tx_id
            )));
        }
        tx.commit().await?;
        drop(tx);

        info!(card_tx_id = %card_tx_id, amount = %reversed.amount, "Hold reversed");
        self.finish(
            &[reversed.wallet_id],
            vec![self.event(names::HOLD_REVERSED, &reversed)],
        )
        .await;
        Ok(reversed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_partial_capture_returns_difference() {
        let h = harness();
        let w = h.funded(1, dec!(150)).await;
        let card = h.engine.register_card(w).await.unwrap();

        let auth = h
            .engine
            .authorize_hold(AuthorizeRequest {
                card_id: card.card_id,
                amount: dec!(100),
                currency: usd(),
                merchant: Some("corner shop".into()),
                idempotency_key: IdempotencyKey::new("auth-partial").unwrap(),
            })
            .await
            .unwrap()
            .value;
        assert!(auth.ok);
        let after_auth = h.engine.compute_balance(w).await.unwrap();
        assert_eq!(after_auth.available, dec!(50));
        assert_eq!(after_auth.total, dec!(150));

        let receipt = h
            .engine
            .capture_hold(auth.transaction.card_tx_id, Some(dec!(60)))
            .await
            .unwrap();
        assert_eq!(receipt.capture_amount, dec!(60));
        assert_eq!(receipt.authorized_amount, dec!(100));

        let after_capture = h.engine.compute_balance(w).await.unwrap();
        assert_eq!(after_capture.available - after_auth.available, dec!(40));
        assert_eq!(after_capture.held, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_capture_bounds() {
        let h = harness();
        let w = h.funded(1, dec!(20)).await;
        let card = h.engine.register_card(w).await.unwrap();
        let auth = h
            .engine
            .authorize_hold(AuthorizeRequest {
                card_id: card.card_id,
                amount: dec!(10),
                currency: usd(),
                merchant: None,
                idempotency_key: IdempotencyKey::new("auth-bounds").unwrap(),
            })
            .await
            .unwrap()
            .value;
        let id = auth.transaction.card_tx_id;
        assert!(matches!(
            h.engine.capture_hold(id, Some(dec!(10.01))).await,
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            h.engine.capture_hold(id, Some(Decimal::ZERO)).await,
            Err(LedgerError::Validation(_))
        ));
        // Still authorized after the rejected attempts
        let full = h.engine.capture_hold(id, None).await.unwrap();
        assert_eq!(full.capture_amount, dec!(10));
    }

    #[tokio::test]
    async fn test_inactive_card_declines_softly() {
        let h = harness();
        let w = h.funded(1, dec!(20)).await;
        let card = h.engine.register_card(w).await.unwrap();
        {
            let mut tx = h.engine.begin().await.unwrap();
            let mut c = tx.card(card.card_id).await.unwrap().unwrap();
            c.active = false;
            tx.insert_card(&c).await.unwrap();
            tx.commit().await.unwrap();
        }
        let outcome = h
            .engine
            .authorize_hold(AuthorizeRequest {
                card_id: card.card_id,
                amount: dec!(1),
                currency: usd(),
                merchant: None,
                idempotency_key: IdempotencyKey::new("auth-inactive").unwrap(),
            })
            .await
            .unwrap()
            .value;
        assert!(!outcome.ok);
        assert_eq!(outcome.reason.as_deref(), Some(DECLINE_CARD_INACTIVE));
        assert_eq!(outcome.transaction.status, CardTxStatus::Declined);
    }

    fn request(card_id: CardId, amount: Decimal, key: &str) -> AuthorizeRequest {
        AuthorizeRequest {
            card_id,
            amount,
            currency: usd(),
            merchant: None,
            idempotency_key: IdempotencyKey::new(key).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_authorize_replay_holds_once() {
        let h = harness();
        let w = h.funded(1, dec!(100)).await;
        let card = h.engine.register_card(w).await.unwrap();

        let first = h.engine.authorize_hold(request(card.card_id, dec!(40), "pos-1")).await.unwrap();
        let again = h.engine.authorize_hold(request(card.card_id, dec!(40), "pos-1")).await.unwrap();
        assert!(!first.replayed);
        assert!(again.replayed);
        assert!(again.value.ok);
        assert_eq!(
            first.value.transaction.card_tx_id,
            again.value.transaction.card_tx_id
        );
        let balance = h.engine.compute_balance(w).await.unwrap();
        assert_eq!((balance.held, balance.available), (dec!(40), dec!(60)));

        h.store.simulate_stale_key_reads(1);
        let raced = h.engine.authorize_hold(request(card.card_id, dec!(40), "pos-1")).await.unwrap();
        assert!(raced.replayed);
        assert_eq!(h.engine.compute_balance(w).await.unwrap().held, dec!(40));
    }

    #[tokio::test]
    async fn test_declined_authorization_replays_decline() {
        let h = harness();
        let w = h.funded(1, dec!(10)).await;
        let card = h.engine.register_card(w).await.unwrap();

        let declined = h.engine.authorize_hold(request(card.card_id, dec!(25), "pos-2")).await.unwrap();
        assert!(!declined.value.ok);

        // Funds arriving later do not turn the recorded decline into a hold
        h.engine
            .post_deposit(crate::engine::DepositRequest {
                wallet_id: w,
                amount: dec!(50),
                currency: usd(),
                source: "bank".into(),
                external_ref: "top-up".into(),
                idempotency_key: None,
            })
            .await
            .unwrap();
        let again = h.engine.authorize_hold(request(card.card_id, dec!(25), "pos-2")).await.unwrap();
        assert!(again.replayed);
        assert!(!again.value.ok);
        assert_eq!(again.value.reason.as_deref(), Some(DECLINE_INSUFFICIENT));
        assert_eq!(
            again.value.transaction.card_tx_id,
            declined.value.transaction.card_tx_id
        );
        assert_eq!(h.engine.compute_balance(w).await.unwrap().held, Decimal::ZERO);
    }
}
