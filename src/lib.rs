//! Ledger Engine - double-entry wallet ledger
//!
//! Append-only ledger behind a mobile-money style wallet: same-currency and
//! FX transfers, provider deposits, agent cash-out with one-time codes, card
//! authorization holds, reversals and admin adjustments.
//!
//! # Modules
//!
//! - [`core_types`] - Identifiers and currency codes
//! - [`money`] - Rounding and commission arithmetic
//! - [`ledger`] - Entries, balance derivation, balance cache
//! - [`models`] - Wallets, transfers, deposits, withdrawals, cards, reversals
//! - [`idempotency`] - Idempotency keys and the replay guard
//! - [`store`] - Transactional store trait, in-memory and PostgreSQL stores
//! - [`ports`] - External collaborators (rates, risk, limits, notifier, events, clock)
//! - [`events`] - Domain events and the outbox
//! - [`engine`] - Every money movement
//! - [`worker`] - Background outbox drain and withdrawal expiry
//! - [`gateway`] - HTTP surface

// Core types - must be first!
pub mod core_types;
pub mod error;
pub mod money;

// Ledger model
pub mod idempotency;
pub mod ledger;
pub mod models;

// Persistence and collaborators
pub mod events;
pub mod ports;
pub mod store;

// Operations
pub mod engine;
pub mod worker;

// Service plumbing
pub mod config;
pub mod gateway;
pub mod logging;

// Convenient re-exports at crate root
pub use core_types::{Currency, UserId, WalletId};
pub use engine::{Collaborators, LedgerEngine};
pub use error::LedgerError;
pub use idempotency::{Guarded, IdempotencyKey};
pub use ledger::{Balance, EntryType, LedgerEntry};
pub use store::{LedgerStore, MemoryStore, PgStore};
