//! In-memory ledger store
//!
//! A transaction owns the store mutex for its whole life and works on a
//! private copy of the state, published on commit. That gives serializable
//! isolation: concurrent operations queue behind one another, and a dropped
//! transaction leaves no trace.
//!
//! Intended for tests and single-process deployments; state is lost on exit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{LedgerStore, LedgerTx};
use crate::core_types::{
    CardId, CardTxId, Currency, DepositId, ReversalId, TransferId, UserId, WalletId,
    WithdrawalId,
};
use crate::error::LedgerError;
use crate::ledger::{EntryLink, EntryType, LedgerEntry};
use crate::money::checked_sum;
use crate::models::{
    Card, CardTransaction, CardTxStatus, Deposit, Reversal, ReversalTarget, ReviewInfo,
    Transfer, TransferStatus, Wallet, WalletKind, Withdrawal, WithdrawalStatus,
};

#[derive(Debug, Default, Clone)]
struct MemoryState {
    wallets: HashMap<WalletId, Wallet>,
    wallet_owners: HashMap<(UserId, Currency, WalletKind), WalletId>,
    entries: Vec<LedgerEntry>,
    entry_keys: HashMap<String, usize>,
    transfers: HashMap<TransferId, Transfer>,
    transfer_keys: HashMap<String, TransferId>,
    deposits: HashMap<DepositId, Deposit>,
    deposit_keys: HashMap<String, DepositId>,
    withdrawals: HashMap<WithdrawalId, Withdrawal>,
    withdrawal_codes: HashMap<String, WithdrawalId>,
    withdrawal_keys: HashMap<String, WithdrawalId>,
    reversals: HashMap<ReversalId, Reversal>,
    reversal_keys: HashMap<String, ReversalId>,
    reversal_targets: HashMap<ReversalTarget, ReversalId>,
    cards: HashMap<CardId, Card>,
    card_txs: HashMap<CardTxId, CardTransaction>,
    card_tx_keys: HashMap<String, CardTxId>,
}

/// In-memory [`LedgerStore`]
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    /// Fault injection: number of upcoming key lookups that report "absent"
    stale_key_reads: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` idempotency-key lookups miss, as a lookup racing a
    /// concurrent insert would. The unique-key insert still detects the
    /// duplicate.
    pub fn simulate_stale_key_reads(&self, n: usize) {
        self.stale_key_reads.store(n, Ordering::SeqCst);
    }

    /// Number of ledger entries committed so far
    pub async fn entry_count(&self) -> usize {
        self.state.lock().await.entries.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError> {
        let guard = self.state.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            work,
            committed: false,
            stale_key_reads: self.stale_key_reads.clone(),
        }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    work: MemoryState,
    committed: bool,
    stale_key_reads: Arc<AtomicUsize>,
}

impl MemoryTx {
    fn ensure_open(&self) -> Result<(), LedgerError> {
        if self.committed {
            return Err(LedgerError::System("Transaction already committed".into()));
        }
        Ok(())
    }

    /// Consume one injected stale read, if any
    fn key_read_is_stale(&self) -> bool {
        self.stale_key_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn insert_wallet(&mut self, wallet: &Wallet) -> Result<bool, LedgerError> {
        self.ensure_open()?;
        let owner_key = (wallet.owner_id, wallet.currency.clone(), wallet.kind);
        if self.work.wallet_owners.contains_key(&owner_key) {
            return Ok(false);
        }
        self.work.wallet_owners.insert(owner_key, wallet.wallet_id);
        self.work.wallets.insert(wallet.wallet_id, wallet.clone());
        Ok(true)
    }

    async fn wallet(&mut self, id: WalletId) -> Result<Option<Wallet>, LedgerError> {
        Ok(self.work.wallets.get(&id).cloned())
    }

    async fn find_wallet(
        &mut self,
        owner: UserId,
        currency: &Currency,
        kind: WalletKind,
    ) -> Result<Option<Wallet>, LedgerError> {
        Ok(self
            .work
            .wallet_owners
            .get(&(owner, currency.clone(), kind))
            .and_then(|id| self.work.wallets.get(id))
            .cloned())
    }

    async fn lock_wallets(&mut self, ids: &[WalletId]) -> Result<Vec<Wallet>, LedgerError> {
        // The whole store is already locked by this transaction
        ids.iter()
            .map(|id| {
                self.work
                    .wallets
                    .get(id)
                    .cloned()
                    .ok_or_else(|| LedgerError::NotFound(format!("wallet {}", id)))
            })
            .collect()
    }

    async fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        self.ensure_open()?;
        if let Some(key) = &entry.idempotency_key {
            if self.work.entry_keys.contains_key(key) {
                return Err(LedgerError::Conflict(format!("entry key {}", key)));
            }
            self.work
                .entry_keys
                .insert(key.clone(), self.work.entries.len());
        }
        self.work.entries.push(entry.clone());
        Ok(())
    }

    async fn entry_totals(
        &mut self,
        wallet: WalletId,
    ) -> Result<Vec<(EntryType, Decimal)>, LedgerError> {
        let mut totals: HashMap<EntryType, Decimal> = HashMap::new();
        for e in self.work.entries.iter().filter(|e| e.wallet_id == wallet) {
            let slot = totals.entry(e.entry_type).or_insert(Decimal::ZERO);
            *slot = checked_sum(*slot, e.amount)?;
        }
        Ok(totals.into_iter().collect())
    }

    async fn entries_for_wallet(
        &mut self,
        wallet: WalletId,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self
            .work
            .entries
            .iter()
            .filter(|e| e.wallet_id == wallet)
            .cloned()
            .collect())
    }

    async fn entries_for_link(&mut self, link: EntryLink) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self
            .work
            .entries
            .iter()
            .filter(|e| e.link == Some(link))
            .cloned()
            .collect())
    }

    async fn entry_by_key(&mut self, key: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        if self.key_read_is_stale() {
            return Ok(None);
        }
        Ok(self
            .work
            .entry_keys
            .get(key)
            .and_then(|idx| self.work.entries.get(*idx))
            .cloned())
    }

    async fn insert_transfer(&mut self, transfer: &Transfer) -> Result<bool, LedgerError> {
        self.ensure_open()?;
        if self
            .work
            .transfer_keys
            .contains_key(&transfer.idempotency_key)
        {
            return Ok(false);
        }
        self.work
            .transfer_keys
            .insert(transfer.idempotency_key.clone(), transfer.transfer_id);
        self.work
            .transfers
            .insert(transfer.transfer_id, transfer.clone());
        Ok(true)
    }

    async fn transfer(&mut self, id: TransferId) -> Result<Option<Transfer>, LedgerError> {
        Ok(self.work.transfers.get(&id).cloned())
    }

    async fn transfer_by_key(&mut self, key: &str) -> Result<Option<Transfer>, LedgerError> {
        if self.key_read_is_stale() {
            return Ok(None);
        }
        Ok(self
            .work
            .transfer_keys
            .get(key)
            .and_then(|id| self.work.transfers.get(id))
            .cloned())
    }

    async fn update_transfer_status(
        &mut self,
        id: TransferId,
        expected: TransferStatus,
        new_status: TransferStatus,
        review: Option<&ReviewInfo>,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        self.ensure_open()?;
        match self.work.transfers.get_mut(&id) {
            Some(t) if t.status == expected => {
                t.status = new_status;
                if let Some(r) = review {
                    t.review = Some(r.clone());
                }
                t.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_deposit(&mut self, deposit: &Deposit) -> Result<bool, LedgerError> {
        self.ensure_open()?;
        if self
            .work
            .deposit_keys
            .contains_key(&deposit.idempotency_key)
        {
            return Ok(false);
        }
        self.work
            .deposit_keys
            .insert(deposit.idempotency_key.clone(), deposit.deposit_id);
        self.work
            .deposits
            .insert(deposit.deposit_id, deposit.clone());
        Ok(true)
    }

    async fn deposit(&mut self, id: DepositId) -> Result<Option<Deposit>, LedgerError> {
        Ok(self.work.deposits.get(&id).cloned())
    }

    async fn deposit_by_key(&mut self, key: &str) -> Result<Option<Deposit>, LedgerError> {
        if self.key_read_is_stale() {
            return Ok(None);
        }
        Ok(self
            .work
            .deposit_keys
            .get(key)
            .and_then(|id| self.work.deposits.get(id))
            .cloned())
    }

    async fn insert_withdrawal(&mut self, withdrawal: &Withdrawal) -> Result<bool, LedgerError> {
        self.ensure_open()?;
        if self.work.withdrawal_codes.contains_key(&withdrawal.code)
            || self
                .work
                .withdrawal_keys
                .contains_key(&withdrawal.idempotency_key)
        {
            return Ok(false);
        }
        self.work
            .withdrawal_codes
            .insert(withdrawal.code.clone(), withdrawal.withdrawal_id);
        self.work
            .withdrawal_keys
            .insert(withdrawal.idempotency_key.clone(), withdrawal.withdrawal_id);
        self.work
            .withdrawals
            .insert(withdrawal.withdrawal_id, withdrawal.clone());
        Ok(true)
    }

    async fn withdrawal(&mut self, id: WithdrawalId) -> Result<Option<Withdrawal>, LedgerError> {
        Ok(self.work.withdrawals.get(&id).cloned())
    }

    async fn withdrawal_by_key(&mut self, key: &str) -> Result<Option<Withdrawal>, LedgerError> {
        if self.key_read_is_stale() {
            return Ok(None);
        }
        Ok(self
            .work
            .withdrawal_keys
            .get(key)
            .and_then(|id| self.work.withdrawals.get(id))
            .cloned())
    }

    async fn withdrawal_by_code(&mut self, code: &str) -> Result<Option<Withdrawal>, LedgerError> {
        Ok(self
            .work
            .withdrawal_codes
            .get(code)
            .and_then(|id| self.work.withdrawals.get(id))
            .cloned())
    }

    async fn update_withdrawal(
        &mut self,
        withdrawal: &Withdrawal,
        expected: WithdrawalStatus,
    ) -> Result<bool, LedgerError> {
        self.ensure_open()?;
        match self.work.withdrawals.get_mut(&withdrawal.withdrawal_id) {
            Some(w) if w.status == expected => {
                *w = withdrawal.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expired_withdrawals(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Withdrawal>, LedgerError> {
        let mut expired: Vec<Withdrawal> = self
            .work
            .withdrawals
            .values()
            .filter(|w| w.status == WithdrawalStatus::Pending && w.is_expired_at(now))
            .cloned()
            .collect();
        expired.sort_by_key(|w| w.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn insert_reversal(&mut self, reversal: &Reversal) -> Result<bool, LedgerError> {
        self.ensure_open()?;
        if self
            .work
            .reversal_keys
            .contains_key(&reversal.idempotency_key)
            || self.work.reversal_targets.contains_key(&reversal.target)
        {
            return Ok(false);
        }
        self.work
            .reversal_keys
            .insert(reversal.idempotency_key.clone(), reversal.reversal_id);
        self.work
            .reversal_targets
            .insert(reversal.target, reversal.reversal_id);
        self.work
            .reversals
            .insert(reversal.reversal_id, reversal.clone());
        Ok(true)
    }

    async fn reversal_by_key(&mut self, key: &str) -> Result<Option<Reversal>, LedgerError> {
        if self.key_read_is_stale() {
            return Ok(None);
        }
        Ok(self
            .work
            .reversal_keys
            .get(key)
            .and_then(|id| self.work.reversals.get(id))
            .cloned())
    }

    async fn reversal_for_target(
        &mut self,
        target: ReversalTarget,
    ) -> Result<Option<Reversal>, LedgerError> {
        Ok(self
            .work
            .reversal_targets
            .get(&target)
            .and_then(|id| self.work.reversals.get(id))
            .cloned())
    }

    async fn insert_card(&mut self, card: &Card) -> Result<(), LedgerError> {
        self.ensure_open()?;
        self.work.cards.insert(card.card_id, card.clone());
        Ok(())
    }

    async fn card(&mut self, id: CardId) -> Result<Option<Card>, LedgerError> {
        Ok(self.work.cards.get(&id).cloned())
    }

    async fn insert_card_tx(&mut self, tx: &CardTransaction) -> Result<bool, LedgerError> {
        self.ensure_open()?;
        if self.work.card_tx_keys.contains_key(&tx.idempotency_key) {
            return Ok(false);
        }
        self.work
            .card_tx_keys
            .insert(tx.idempotency_key.clone(), tx.card_tx_id);
        self.work.card_txs.insert(tx.card_tx_id, tx.clone());
        Ok(true)
    }

    async fn card_tx(&mut self, id: CardTxId) -> Result<Option<CardTransaction>, LedgerError> {
        Ok(self.work.card_txs.get(&id).cloned())
    }

    async fn card_tx_by_key(&mut self, key: &str) -> Result<Option<CardTransaction>, LedgerError> {
        if self.key_read_is_stale() {
            return Ok(None);
        }
        Ok(self
            .work
            .card_tx_keys
            .get(key)
            .and_then(|id| self.work.card_txs.get(id))
            .cloned())
    }

    async fn update_card_tx(
        &mut self,
        tx: &CardTransaction,
        expected: CardTxStatus,
    ) -> Result<bool, LedgerError> {
        self.ensure_open()?;
        match self.work.card_txs.get_mut(&tx.card_tx_id) {
            Some(existing) if existing.status == expected => {
                *existing = tx.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit(&mut self) -> Result<(), LedgerError> {
        self.ensure_open()?;
        *self.guard = std::mem::take(&mut self.work);
        self.committed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn wallet(owner: UserId, currency: &str) -> Wallet {
        Wallet {
            wallet_id: WalletId::new(),
            owner_id: owner,
            currency: Currency::new(currency).unwrap(),
            kind: WalletKind::User,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_commit_publishes() {
        let store = MemoryStore::new();
        let w = wallet(1, "USD");

        let mut tx = store.begin().await.unwrap();
        assert!(tx.insert_wallet(&w).await.unwrap());
        tx.insert_entry(&LedgerEntry::new(
            w.wallet_id,
            dec!(10),
            EntryType::Deposit,
            Utc::now(),
        ))
        .await
        .unwrap();
        tx.commit().await.unwrap();
        drop(tx);

        assert_eq!(store.entry_count().await, 1);
        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.wallet(w.wallet_id).await.unwrap(), Some(w));
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let store = MemoryStore::new();
        let w = wallet(1, "USD");
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_wallet(&w).await.unwrap();
        }
        let mut tx = store.begin().await.unwrap();
        assert!(tx.wallet(w.wallet_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wallet_owner_unique() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        assert!(tx.insert_wallet(&wallet(7, "HTG")).await.unwrap());
        assert!(!tx.insert_wallet(&wallet(7, "HTG")).await.unwrap());
        assert!(tx.insert_wallet(&wallet(7, "USD")).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_unknown_wallet() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let err = tx.lock_wallets(&[WalletId::new()]).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_entry_key_conflict() {
        let store = MemoryStore::new();
        let w = WalletId::new();
        let mut tx = store.begin().await.unwrap();
        let e = LedgerEntry::new(w, dec!(1), EntryType::AdminAdjustment, Utc::now()).with_key("adj-1");
        tx.insert_entry(&e).await.unwrap();
        let dup =
            LedgerEntry::new(w, dec!(2), EntryType::AdminAdjustment, Utc::now()).with_key("adj-1");
        assert!(matches!(
            tx.insert_entry(&dup).await,
            Err(LedgerError::Conflict(_))
        ));
        assert_eq!(tx.entry_by_key("adj-1").await.unwrap(), Some(e));
    }

    #[tokio::test]
    async fn test_stale_key_reads() {
        let store = MemoryStore::new();
        store.simulate_stale_key_reads(1);
        let mut tx = store.begin().await.unwrap();
        let e = LedgerEntry::new(WalletId::new(), dec!(1), EntryType::AdminAdjustment, Utc::now())
            .with_key("k");
        tx.insert_entry(&e).await.unwrap();
        assert!(tx.entry_by_key("k").await.unwrap().is_none());
        assert!(tx.entry_by_key("k").await.unwrap().is_some());
    }
}
