//! Review / escrow gate for `pending_review` transfers

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{LedgerEngine, require_available, require_text};
use crate::core_types::TransferId;
use crate::error::LedgerError;
use crate::events::names;
use crate::ledger::{EntryLink, EntryType, LedgerEntry};
use crate::models::{ReviewInfo, Transfer, TransferStatus};
use crate::store::LedgerTx;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub reviewer: String,
    #[serde(default)]
    pub note: Option<String>,
}

/// Load a transfer that is still waiting for review
async fn pending_transfer(
    tx: &mut dyn LedgerTx,
    transfer_id: TransferId,
) -> Result<Transfer, LedgerError> {
    let transfer = tx
        .transfer(transfer_id)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("transfer {}", transfer_id)))?;
    if !transfer.status.can_review() {
        return Err(LedgerError::InvalidState(format!(
            "transfer {} is {}",
            transfer_id, transfer.status
        )));
    }
    Ok(transfer)
}

/// Amount still reserved for this transfer by its escrow hold
async fn escrowed(tx: &mut dyn LedgerTx, transfer_id: TransferId) -> Result<Decimal, LedgerError> {
    let entries = tx.entries_for_link(EntryLink::Transfer(transfer_id)).await?;
    let reserved: Decimal = entries
        .iter()
        .filter(|e| {
            matches!(
                e.entry_type,
                EntryType::HoldDebit | EntryType::HoldRelease | EntryType::HoldSeize
            )
        })
        .map(|e| e.amount)
        .sum();
    Ok((-reserved).max(Decimal::ZERO))
}

impl LedgerEngine {
    /// Post the deferred entries and complete the transfer
    pub async fn approve_review(
        &self,
        transfer_id: TransferId,
        decision: ReviewDecision,
    ) -> Result<Transfer, LedgerError> {
        let review = self.review_info(decision)?;

        let mut tx = self.begin().await?;
        let transfer = pending_transfer(tx.as_mut(), transfer_id).await?;
        tx.lock_wallets(&[transfer.from_wallet, transfer.to_wallet])
            .await?;

        let now = review.reviewed_at;
        let link = EntryLink::Transfer(transfer_id);
        let escrow = escrowed(tx.as_mut(), transfer_id).await?;
        if escrow > Decimal::ZERO {
            tx.insert_entry(
                &LedgerEntry::new(transfer.from_wallet, escrow, EntryType::HoldSeize, now)
                    .linked(link),
            )
            .await?;
        }
        // With the escrow seized, any shortfall is checked against live funds
        require_available(tx.as_mut(), transfer.from_wallet, transfer.amount).await?;

        tx.insert_entry(
            &LedgerEntry::new(transfer.from_wallet, -transfer.amount, EntryType::TransferOut, now)
                .linked(link),
        )
        .await?;
        tx.insert_entry(
            &LedgerEntry::new(
                transfer.to_wallet,
                transfer.credit_amount()?,
                EntryType::TransferIn,
                now,
            )
            .linked(link),
        )
        .await?;
        if !tx
            .update_transfer_status(
                transfer_id,
                TransferStatus::PendingReview,
                TransferStatus::Completed,
                Some(&review),
                now,
            )
            .await?
        {
            return Err(LedgerError::InvalidState(format!(
                "transfer {} changed concurrently",
                transfer_id
            )));
        }
        tx.commit().await?;
        drop(tx);

        let approved = Transfer {
            status: TransferStatus::Completed,
            review: Some(review),
            updated_at: now,
            ..transfer
        };
        info!(transfer_id = %transfer_id, reviewer = ?approved.review.as_ref().map(|r| &r.reviewer), "Transfer approved after review");
        self.finish(
            &[approved.from_wallet, approved.to_wallet],
            vec![self.event(names::TRANSFER_APPROVED, &approved)],
        )
        .await;
        Ok(approved)
    }

    /// Block the transfer and release any escrow back to the sender
    pub async fn reject_review(
        &self,
        transfer_id: TransferId,
        decision: ReviewDecision,
    ) -> Result<Transfer, LedgerError> {
        let review = self.review_info(decision)?;

        let mut tx = self.begin().await?;
        let transfer = pending_transfer(tx.as_mut(), transfer_id).await?;
        tx.lock_wallets(&[transfer.from_wallet]).await?;

        let now = review.reviewed_at;
        let escrow = escrowed(tx.as_mut(), transfer_id).await?;
        if escrow > Decimal::ZERO {
            tx.insert_entry(
                &LedgerEntry::new(transfer.from_wallet, escrow, EntryType::HoldRelease, now)
                    .linked(EntryLink::Transfer(transfer_id)),
            )
            .await?;
        }
        if !tx
            .update_transfer_status(
                transfer_id,
                TransferStatus::PendingReview,
                TransferStatus::Blocked,
                Some(&review),
                now,
            )
            .await?
        {
            return Err(LedgerError::InvalidState(format!(
                "transfer {} changed concurrently",
                transfer_id
            )));
        }
        tx.commit().await?;
        drop(tx);

        let rejected = Transfer {
            status: TransferStatus::Blocked,
            review: Some(review),
            updated_at: now,
            ..transfer
        };
        info!(transfer_id = %transfer_id, escrow_released = %escrow, "Transfer rejected after review");
        let touched = if escrow > Decimal::ZERO {
            vec![rejected.from_wallet]
        } else {
            Vec::new()
        };
        self.finish(&touched, vec![self.event(names::TRANSFER_REJECTED, &rejected)])
            .await;
        Ok(rejected)
    }

    fn review_info(&self, decision: ReviewDecision) -> Result<ReviewInfo, LedgerError> {
        Ok(ReviewInfo {
            reviewer: require_text(&decision.reviewer, "reviewer")?,
            note: decision
                .note
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            reviewed_at: self.now(),
        })
    }
}
