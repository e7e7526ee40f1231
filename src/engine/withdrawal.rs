//! Withdrawal / agent cash-out
//!
//! Two phases:
//! - request: `pending` withdrawal + one-time code, no ledger entries
//! - approve: the agent redeems the code; user wallet and agent float are
//!   debited and the agent earns its commission, all in one transaction
//!
//! Codes are single-use. Completed, reversed and expired codes are terminal.

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{LedgerEngine, require_available};
use crate::core_types::{Currency, UserId, WalletId, WithdrawalId};
use crate::error::LedgerError;
use crate::events::names;
use crate::idempotency::{Attempt, Guarded, IdempotencyKey};
use crate::ledger::{EntryLink, EntryType, LedgerEntry};
use crate::models::{WalletKind, Withdrawal, WithdrawalStatus};
use crate::money::{ensure_positive, split_commission};

/// Unambiguous characters only (no 0/O, 1/I)
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Fresh codes tried before giving up on a collision streak
const CODE_ATTEMPTS: usize = 5;

/// Pending withdrawals expired per sweep
const EXPIRY_BATCH: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub user_id: UserId,
    pub wallet_id: WalletId,
    pub amount: Decimal,
    pub currency: Currency,
    pub idempotency_key: IdempotencyKey,
}

/// What the user takes to the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalTicket {
    pub withdrawal_id: WithdrawalId,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&Withdrawal> for WithdrawalTicket {
    fn from(w: &Withdrawal) -> Self {
        Self {
            withdrawal_id: w.withdrawal_id,
            code: w.code.clone(),
            expires_at: w.expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalApproval {
    pub withdrawal_id: WithdrawalId,
    pub status: WithdrawalStatus,
    pub amount: Decimal,
    pub currency: Currency,
    pub fee_amount: Decimal,
    pub net_amount: Decimal,
}

fn generate_code(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn normalize_code(raw: &str) -> Result<String, LedgerError> {
    let code = raw.trim().to_ascii_uppercase();
    if code.is_empty() {
        return Err(LedgerError::Validation("code cannot be empty".to_string()));
    }
    Ok(code)
}

impl LedgerEngine {
    /// Phase one: issue a code. Funds stay in the wallet until approval.
    /// A replayed key returns the ticket issued the first time.
    pub async fn request_withdrawal(
        &self,
        req: WithdrawalRequest,
    ) -> Result<Guarded<WithdrawalTicket>, LedgerError> {
        let amount = ensure_positive(req.amount)?;

        let wallet = {
            let mut tx = self.begin().await?;
            if let Some(existing) = tx.withdrawal_by_key(req.idempotency_key.as_str()).await? {
                debug!(key = %req.idempotency_key, withdrawal_id = %existing.withdrawal_id, "Withdrawal request replayed");
                return Ok(Guarded::replay(WithdrawalTicket::from(&existing)));
            }
            super::transfer::load_wallet(tx.as_mut(), req.wallet_id).await?
        };
        if wallet.owner_id != req.user_id {
            return Err(LedgerError::Forbidden(format!(
                "wallet {} does not belong to user {}",
                wallet.wallet_id, req.user_id
            )));
        }
        wallet.ensure_currency(&req.currency)?;
        self.limits.check_limits(req.user_id, amount).await?;

        let ticket = match self.try_request(&req, wallet.wallet_id, amount).await? {
            Attempt::Done(done) => done,
            Attempt::LostRace => {
                let mut tx = self.begin().await?;
                let existing = tx
                    .withdrawal_by_key(req.idempotency_key.as_str())
                    .await?
                    .ok_or_else(|| {
                        LedgerError::System(format!(
                            "withdrawal key {} conflicted but is missing",
                            req.idempotency_key
                        ))
                    })?;
                Guarded::replay(existing)
            }
        };
        if ticket.replayed {
            debug!(key = %req.idempotency_key, withdrawal_id = %ticket.value.withdrawal_id, "Withdrawal request replayed");
            return Ok(ticket.map(|w| WithdrawalTicket::from(&w)));
        }

        let withdrawal = &ticket.value;
        self.finish(
            &[],
            vec![self.event(
                names::WITHDRAWAL_REQUESTED,
                &serde_json::json!({
                    "withdrawal_id": withdrawal.withdrawal_id,
                    "wallet_id": withdrawal.wallet_id,
                    "amount": withdrawal.amount,
                    "currency": withdrawal.currency,
                    "expires_at": withdrawal.expires_at,
                }),
            )],
        )
        .await;
        self.notify(
            req.user_id,
            &format!(
                "Withdrawal of {} {} requested; present your code before {}",
                withdrawal.amount, withdrawal.currency, withdrawal.expires_at
            ),
        )
        .await;

        Ok(ticket.map(|w| WithdrawalTicket::from(&w)))
    }

    async fn try_request(
        &self,
        req: &WithdrawalRequest,
        wallet_id: WalletId,
        amount: Decimal,
    ) -> Result<Attempt<Withdrawal>, LedgerError> {
        let mut tx = self.begin().await?;
        if let Some(existing) = tx.withdrawal_by_key(req.idempotency_key.as_str()).await? {
            return Ok(Attempt::Done(Guarded::replay(existing)));
        }
        tx.lock_wallets(&[wallet_id]).await?;
        require_available(tx.as_mut(), wallet_id, amount).await?;

        let now = self.now();
        let mut withdrawal = Withdrawal {
            withdrawal_id: WithdrawalId::new(),
            user_id: req.user_id,
            wallet_id,
            amount,
            currency: req.currency.clone(),
            code: String::new(),
            idempotency_key: req.idempotency_key.to_string(),
            expires_at: now + self.config.withdrawal_code_ttl(),
            status: WithdrawalStatus::Pending,
            agent_id: None,
            float_wallet_id: None,
            fee_amount: None,
            net_amount: None,
            created_at: now,
            completed_at: None,
        };
        let mut issued = false;
        for _ in 0..CODE_ATTEMPTS {
            withdrawal.code = generate_code(self.config.withdrawal_code_len);
            if tx.insert_withdrawal(&withdrawal).await? {
                issued = true;
                break;
            }
            // Either the key or the code is taken; only the code is worth retrying
            if tx
                .withdrawal_by_key(req.idempotency_key.as_str())
                .await?
                .is_some()
            {
                return Ok(Attempt::LostRace);
            }
            warn!(withdrawal_id = %withdrawal.withdrawal_id, "Withdrawal code collision, retrying");
        }
        if !issued {
            return Err(LedgerError::System(
                "could not allocate a unique withdrawal code".to_string(),
            ));
        }
        tx.commit().await?;

        info!(
            withdrawal_id = %withdrawal.withdrawal_id,
            wallet_id = %withdrawal.wallet_id,
            amount = %amount,
            expires_at = %withdrawal.expires_at,
            "Withdrawal requested"
        );
        Ok(Attempt::Done(Guarded::fresh(withdrawal)))
    }

    /// Phase two: the agent redeems `code`
    pub async fn approve_withdrawal(
        &self,
        agent_id: UserId,
        code: &str,
    ) -> Result<WithdrawalApproval, LedgerError> {
        let code = normalize_code(code)?;
        let now = self.now();

        let mut tx = self.begin().await?;
        let pending = tx
            .withdrawal_by_code(&code)
            .await?
            .ok_or_else(|| LedgerError::NotFound("withdrawal code".to_string()))?;

        match pending.status {
            WithdrawalStatus::Completed | WithdrawalStatus::Reversed => {
                return Err(LedgerError::AlreadyProcessed);
            }
            WithdrawalStatus::Expired => return Err(LedgerError::Expired),
            WithdrawalStatus::Pending => {}
        }

        if pending.is_expired_at(now) {
            let mut expired = pending.clone();
            expired.status = WithdrawalStatus::Expired;
            if tx.update_withdrawal(&expired, WithdrawalStatus::Pending).await? {
                tx.commit().await?;
                drop(tx);
                info!(withdrawal_id = %expired.withdrawal_id, "Withdrawal code expired at redemption");
                self.finish(&[], vec![self.event(names::WITHDRAWAL_EXPIRED, &expired)])
                    .await;
            }
            return Err(LedgerError::Expired);
        }

        let float = tx
            .find_wallet(agent_id, &pending.currency, WalletKind::DistributorFloat)
            .await?
            .ok_or_else(|| {
                LedgerError::NotFound(format!(
                    "{} float wallet of agent {}",
                    pending.currency, agent_id
                ))
            })?;
        let (user_wallet, float_wallet) = (pending.wallet_id, float.wallet_id);
        tx.lock_wallets(&[user_wallet, float_wallet]).await?;
        require_available(tx.as_mut(), user_wallet, pending.amount).await?;
        require_available(tx.as_mut(), float_wallet, pending.amount).await?;

        let (fee, net) = split_commission(pending.amount, self.config.commission_rate)?;
        let link = EntryLink::Withdrawal(pending.withdrawal_id);
        tx.insert_entry(
            &LedgerEntry::new(user_wallet, -pending.amount, EntryType::Withdrawal, now).linked(link),
        )
        .await?;
        tx.insert_entry(
            &LedgerEntry::new(float_wallet, -pending.amount, EntryType::CashoutFloatDebit, now)
                .linked(link),
        )
        .await?;
        if fee > Decimal::ZERO {
            tx.insert_entry(
                &LedgerEntry::new(float_wallet, fee, EntryType::CommissionCredit, now)
                    .linked(link),
            )
            .await?;
        }

        let completed = Withdrawal {
            status: WithdrawalStatus::Completed,
            agent_id: Some(agent_id),
            float_wallet_id: Some(float_wallet),
            fee_amount: Some(fee),
            net_amount: Some(net),
            completed_at: Some(now),
            ..pending
        };
        if !tx.update_withdrawal(&completed, WithdrawalStatus::Pending).await? {
            return Err(LedgerError::AlreadyProcessed);
        }
        tx.commit().await?;
        drop(tx);

        info!(
            withdrawal_id = %completed.withdrawal_id,
            agent_id,
            amount = %completed.amount,
            fee = %fee,
            net = %net,
            "Withdrawal completed"
        );
        self.finish(
            &[user_wallet, float_wallet],
            vec![self.event(names::WITHDRAWAL_COMPLETED, &completed)],
        )
        .await;
        self.notify(
            completed.user_id,
            &format!("Cash-out of {} {} completed", completed.amount, completed.currency),
        )
        .await;
        self.notify(
            agent_id,
            &format!("Commission of {} {} earned", fee, completed.currency),
        )
        .await;

        Ok(WithdrawalApproval {
            withdrawal_id: completed.withdrawal_id,
            status: completed.status,
            amount: completed.amount,
            currency: completed.currency,
            fee_amount: fee,
            net_amount: net,
        })
    }

    /// Mark every pending withdrawal whose code has lapsed as `expired`.
    /// No ledger writes. Returns the number expired.
    pub async fn expire_withdrawals(&self) -> Result<usize, LedgerError> {
        let now = self.now();
        let mut tx = self.begin().await?;
        let lapsed = tx.expired_withdrawals(now, EXPIRY_BATCH).await?;

        let mut expired = Vec::with_capacity(lapsed.len());
        for pending in lapsed {
            let w = Withdrawal {
                status: WithdrawalStatus::Expired,
                ..pending
            };
            if tx.update_withdrawal(&w, WithdrawalStatus::Pending).await? {
                expired.push(w);
            }
        }
        tx.commit().await?;
        drop(tx);

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired withdrawal codes");
        }
        let events = expired
            .iter()
            .map(|w| self.event(names::WITHDRAWAL_EXPIRED, w))
            .collect();
        self.finish(&[], events).await;
        Ok(expired.len())
    }
}
