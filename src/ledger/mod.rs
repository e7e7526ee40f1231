//! Ledger Store primitives
//!
//! Append-only signed entries per wallet, and the balance derived from them.

pub mod balance;
pub mod entry;

pub use balance::{Balance, BalanceCache};
pub use entry::{EntryClass, EntryLink, EntryType, LedgerEntry};
