//! Ledger Store
//!
//! The store is the sole source of truth. Engines never touch it outside a
//! [`LedgerTx`]: one transaction per logical operation, balances re-read
//! inside it, and nothing visible to others until [`LedgerTx::commit`].
//! Dropping a transaction without committing rolls it back.
//!
//! # Implementations
//!
//! - [`MemoryStore`]: single-process, serializable (one writer at a time)
//! - [`PgStore`]: PostgreSQL via `sqlx`, row locks + unique constraints
//!
//! # Insert semantics
//!
//! `insert_*` methods for keyed records return `Ok(false)` when a unique key
//! (idempotency key, withdrawal code, reversal target) already exists,
//! instead of failing. That is the signal for the idempotency guard to
//! replay.

pub mod memory;
pub mod postgres;
pub mod schema;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::core_types::{
    CardId, CardTxId, Currency, DepositId, TransferId, UserId, WalletId, WithdrawalId,
};
use crate::error::LedgerError;
use crate::ledger::{EntryLink, EntryType, LedgerEntry};
use crate::models::{
    Card, CardTransaction, CardTxStatus, Deposit, Reversal, ReversalTarget, ReviewInfo,
    Transfer, TransferStatus, Wallet, WalletKind, Withdrawal, WithdrawalStatus,
};

/// Factory for units of work
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Store name for logging
    fn name(&self) -> &'static str;

    /// Open a transaction
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError>;

    /// Cheap liveness check
    async fn ping(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

/// One database transaction
#[async_trait]
pub trait LedgerTx: Send {
    // === Wallets ===

    /// Returns false if `(owner, currency, kind)` already has a wallet
    async fn insert_wallet(&mut self, wallet: &Wallet) -> Result<bool, LedgerError>;

    async fn wallet(&mut self, id: WalletId) -> Result<Option<Wallet>, LedgerError>;

    async fn find_wallet(
        &mut self,
        owner: UserId,
        currency: &Currency,
        kind: WalletKind,
    ) -> Result<Option<Wallet>, LedgerError>;

    /// Lock wallets for the rest of the transaction, in ascending id order.
    /// Fails with `NotFound` if any id is unknown. Returned in input order.
    async fn lock_wallets(&mut self, ids: &[WalletId]) -> Result<Vec<Wallet>, LedgerError>;

    // === Entries (append-only) ===

    /// Fails with `Conflict` if the entry's idempotency key is taken
    async fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<(), LedgerError>;

    /// Per-type sums for one wallet
    async fn entry_totals(
        &mut self,
        wallet: WalletId,
    ) -> Result<Vec<(EntryType, Decimal)>, LedgerError>;

    /// All entries of a wallet in insertion order
    async fn entries_for_wallet(&mut self, wallet: WalletId)
    -> Result<Vec<LedgerEntry>, LedgerError>;

    /// All entries linked to one originating record, in insertion order
    async fn entries_for_link(&mut self, link: EntryLink) -> Result<Vec<LedgerEntry>, LedgerError>;

    async fn entry_by_key(&mut self, key: &str) -> Result<Option<LedgerEntry>, LedgerError>;

    // === Transfers ===

    async fn insert_transfer(&mut self, transfer: &Transfer) -> Result<bool, LedgerError>;

    async fn transfer(&mut self, id: TransferId) -> Result<Option<Transfer>, LedgerError>;

    async fn transfer_by_key(&mut self, key: &str) -> Result<Option<Transfer>, LedgerError>;

    /// CAS status update; false if the current status is not `expected`
    async fn update_transfer_status(
        &mut self,
        id: TransferId,
        expected: TransferStatus,
        new_status: TransferStatus,
        review: Option<&ReviewInfo>,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    // === Deposits ===

    async fn insert_deposit(&mut self, deposit: &Deposit) -> Result<bool, LedgerError>;

    async fn deposit(&mut self, id: DepositId) -> Result<Option<Deposit>, LedgerError>;

    async fn deposit_by_key(&mut self, key: &str) -> Result<Option<Deposit>, LedgerError>;

    // === Withdrawals ===

    /// Returns false if the code or the idempotency key is already in use
    async fn insert_withdrawal(&mut self, withdrawal: &Withdrawal) -> Result<bool, LedgerError>;

    async fn withdrawal(&mut self, id: WithdrawalId) -> Result<Option<Withdrawal>, LedgerError>;

    async fn withdrawal_by_key(&mut self, key: &str) -> Result<Option<Withdrawal>, LedgerError>;

    async fn withdrawal_by_code(&mut self, code: &str) -> Result<Option<Withdrawal>, LedgerError>;

    /// CAS write of the mutable withdrawal fields; false if the stored status
    /// is not `expected`
    async fn update_withdrawal(
        &mut self,
        withdrawal: &Withdrawal,
        expected: WithdrawalStatus,
    ) -> Result<bool, LedgerError>;

    /// Pending withdrawals whose code expired before `now`
    async fn expired_withdrawals(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Withdrawal>, LedgerError>;

    // === Reversals ===

    /// Returns false if the key or the target is already taken
    async fn insert_reversal(&mut self, reversal: &Reversal) -> Result<bool, LedgerError>;

    async fn reversal_by_key(&mut self, key: &str) -> Result<Option<Reversal>, LedgerError>;

    async fn reversal_for_target(
        &mut self,
        target: ReversalTarget,
    ) -> Result<Option<Reversal>, LedgerError>;

    // === Cards ===

    async fn insert_card(&mut self, card: &Card) -> Result<(), LedgerError>;

    async fn card(&mut self, id: CardId) -> Result<Option<Card>, LedgerError>;

    /// Returns false if the idempotency key is already taken
    async fn insert_card_tx(&mut self, tx: &CardTransaction) -> Result<bool, LedgerError>;

    async fn card_tx(&mut self, id: CardTxId) -> Result<Option<CardTransaction>, LedgerError>;

    async fn card_tx_by_key(&mut self, key: &str) -> Result<Option<CardTransaction>, LedgerError>;

    /// CAS write of the mutable card transaction fields
    async fn update_card_tx(
        &mut self,
        tx: &CardTransaction,
        expected: CardTxStatus,
    ) -> Result<bool, LedgerError>;

    // === Lifecycle ===

    async fn commit(&mut self) -> Result<(), LedgerError>;
}
