//! Balance Calculator
//!
//! Balances are NEVER stored. They are derived by replaying entries:
//!
//! - `total`     = sum of all *settled* entry amounts
//! - `held`      = -(Σ hold_debit) - Σ hold_release - Σ hold_seize, clamped to >= 0
//! - `available` = total - held
//!
//! Hold entries are reservation memos (see [`EntryClass::Hold`]); they move
//! `held` but never `total`. A capture releases the hold and books a settled
//! `card_capture` debit, so the example
//!
//! ```text
//! deposit +500 | hold_debit -500 | hold_release +500 | card_capture -300
//! ```
//!
//! ends at total 200, held 0, available 200.

use cached::{Cached, TimedCache};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::entry::{EntryClass, EntryType, LedgerEntry};
use crate::core_types::WalletId;
use crate::error::LedgerError;
use crate::money::{checked_diff, checked_sum};

/// Derived balance of one wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub total: Decimal,
    pub held: Decimal,
    pub available: Decimal,
}

impl Default for Balance {
    fn default() -> Self {
        Self {
            total: Decimal::ZERO,
            held: Decimal::ZERO,
            available: Decimal::ZERO,
        }
    }
}

#[derive(Default)]
struct Accumulator {
    total: Decimal,
    hold_debits: Decimal,
    hold_credits: Decimal,
}

impl Accumulator {
    fn apply(&mut self, entry_type: EntryType, amount: Decimal) -> Result<(), LedgerError> {
        let slot = match entry_type.class() {
            EntryClass::Settled => &mut self.total,
            EntryClass::Hold => match entry_type {
                EntryType::HoldDebit => &mut self.hold_debits,
                _ => &mut self.hold_credits,
            },
        };
        *slot = checked_sum(*slot, amount)?;
        Ok(())
    }

    fn finish(self) -> Result<Balance, LedgerError> {
        let held = checked_diff(-self.hold_debits, self.hold_credits)?.max(Decimal::ZERO);
        Ok(Balance {
            total: self.total,
            held,
            available: checked_diff(self.total, held)?,
        })
    }
}

impl Balance {
    /// Replay raw entries
    pub fn from_entries<'a>(
        entries: impl IntoIterator<Item = &'a LedgerEntry>,
    ) -> Result<Self, LedgerError> {
        let mut acc = Accumulator::default();
        for e in entries {
            acc.apply(e.entry_type, e.amount)?;
        }
        acc.finish()
    }

    /// Fold per-type sums (`GROUP BY entry_type` output)
    pub fn from_totals(totals: &[(EntryType, Decimal)]) -> Result<Self, LedgerError> {
        let mut acc = Accumulator::default();
        for (t, amount) in totals {
            acc.apply(*t, *amount)?;
        }
        acc.finish()
    }

    #[inline]
    pub fn covers(&self, amount: Decimal) -> bool {
        self.available >= amount
    }
}

/// Short-TTL cache of wallet `total` for read-mostly paths.
///
/// Not authoritative: every mutating operation invalidates each wallet it
/// touched before reporting success. Each invalidation also bumps the
/// wallet's generation; a reader snapshots the generation before it reads
/// the ledger and its `put` is refused if a write landed in between, so a
/// slow reader cannot re-insert a pre-write total.
pub struct BalanceCache {
    inner: Mutex<CacheState>,
}

struct CacheState {
    totals: TimedCache<WalletId, Decimal>,
    generations: HashMap<WalletId, u64>,
}

impl BalanceCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            inner: Mutex::new(CacheState {
                totals: TimedCache::with_lifespan(ttl_secs),
                generations: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self, wallet: WalletId) -> Option<Decimal> {
        self.lock().totals.cache_get(&wallet).copied()
    }

    /// Take before reading the ledger; pass to [`BalanceCache::put`]
    pub fn generation(&self, wallet: WalletId) -> u64 {
        self.lock().generations.get(&wallet).copied().unwrap_or(0)
    }

    /// Store `total` unless the wallet was invalidated since `seen` was
    /// taken. Returns whether the value was stored.
    pub fn put(&self, wallet: WalletId, seen: u64, total: Decimal) -> bool {
        let mut state = self.lock();
        if state.generations.get(&wallet).copied().unwrap_or(0) != seen {
            return false;
        }
        state.totals.cache_set(wallet, total);
        true
    }

    pub fn invalidate(&self, wallets: &[WalletId]) {
        let mut state = self.lock();
        for w in wallets {
            state.totals.cache_remove(w);
            *state.generations.entry(*w).or_insert(0) += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().totals.cache_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
