//! Admin adjustments
//!
//! A signed correction posted as a single `admin_adjustment` entry. It is
//! the one movement allowed to take `available` below zero. The key is
//! stored on the entry itself, so a replay returns the original entry.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{LedgerEngine, require_text};
use crate::core_types::WalletId;
use crate::error::LedgerError;
use crate::events::names;
use crate::idempotency::{Attempt, Guarded, IdempotencyKey};
use crate::ledger::{EntryType, LedgerEntry};
use crate::money::ensure_within_limit;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustmentRequest {
    pub wallet_id: WalletId,
    /// Signed; negative debits the wallet
    pub amount: Decimal,
    pub reference: String,
    pub idempotency_key: IdempotencyKey,
}

impl LedgerEngine {
    pub async fn post_adjustment(
        &self,
        req: AdjustmentRequest,
    ) -> Result<Guarded<LedgerEntry>, LedgerError> {
        if req.amount.is_zero() {
            return Err(LedgerError::InvalidAmount);
        }
        ensure_within_limit(req.amount)?;
        let reference = require_text(&req.reference, "reference")?;

        let entry = match self.try_adjust(&req, reference).await? {
            Attempt::Done(done) => done,
            Attempt::LostRace => {
                let mut tx = self.begin().await?;
                let existing = tx
                    .entry_by_key(req.idempotency_key.as_str())
                    .await?
                    .ok_or_else(|| {
                        LedgerError::System(format!(
                            "adjustment key {} conflicted but is missing",
                            req.idempotency_key
                        ))
                    })?;
                Guarded::replay(existing)
            }
        };
        if entry.replayed {
            debug!(key = %req.idempotency_key, entry_id = %entry.value.entry_id, "Adjustment replayed");
            return Ok(entry);
        }

        self.finish(
            &[entry.value.wallet_id],
            vec![self.event(names::LEDGER_ADJUSTED, &entry.value)],
        )
        .await;
        Ok(entry)
    }

    async fn try_adjust(
        &self,
        req: &AdjustmentRequest,
        reference: String,
    ) -> Result<Attempt<LedgerEntry>, LedgerError> {
        let mut tx = self.begin().await?;
        if let Some(existing) = tx.entry_by_key(req.idempotency_key.as_str()).await? {
            return Ok(Attempt::Done(Guarded::replay(existing)));
        }
        tx.lock_wallets(&[req.wallet_id]).await?;

        let entry = LedgerEntry::new(req.wallet_id, req.amount, EntryType::AdminAdjustment, self.now())
            .with_reference(reference)
            .with_key(req.idempotency_key.as_str());
        match tx.insert_entry(&entry).await {
            Ok(()) => {}
            Err(LedgerError::Conflict(_)) => return Ok(Attempt::LostRace),
            Err(e) => return Err(e),
        }
        tx.commit().await?;

        if req.amount.is_sign_negative() {
            warn!(wallet_id = %req.wallet_id, amount = %req.amount, "Debit adjustment posted without balance check");
        }
        info!(
            entry_id = %entry.entry_id,
            wallet_id = %req.wallet_id,
            amount = %req.amount,
            reference = ?entry.reference,
            "Adjustment posted"
        );
        Ok(Attempt::Done(Guarded::fresh(entry)))
    }
}
