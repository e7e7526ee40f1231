//! Domain records owned by the engines
//!
//! Statuses are stored as lowercase TEXT. Status transitions are one-way;
//! the `can_*` helpers are the single place those rules live.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core_types::{
    CardId, CardTxId, Currency, DepositId, EntryId, ReversalId, TransferId, UserId, WalletId,
    WithdrawalId,
};
use crate::error::LedgerError;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = LedgerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(LedgerError::System(format!(
                        "Invalid {}: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

// ============================================================================
// Wallet
// ============================================================================

/// Purpose of a wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletKind {
    User,
    Merchant,
    DistributorFloat,
    Treasury,
}

text_enum!(WalletKind {
    User => "user",
    Merchant => "merchant",
    DistributorFloat => "distributor_float",
    Treasury => "treasury",
});

/// Currency-scoped account. Identity is immutable; there is no balance field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub wallet_id: WalletId,
    pub owner_id: UserId,
    pub currency: Currency,
    pub kind: WalletKind,
    pub created_at: DateTime<Utc>,
}

impl Wallet {
    pub fn ensure_currency(&self, currency: &Currency) -> Result<(), LedgerError> {
        if &self.currency != currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: self.currency.to_string(),
                actual: currency.to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Transfer
// ============================================================================

/// Transfer status
///
/// ```text
/// pending_review ──approve──▶ completed ──reverse──▶ reversed
///        │
///        └──reject──▶ blocked
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    PendingReview,
    Completed,
    Blocked,
    Reversed,
}

text_enum!(TransferStatus {
    PendingReview => "pending_review",
    Completed => "completed",
    Blocked => "blocked",
    Reversed => "reversed",
});

impl TransferStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Blocked | TransferStatus::Reversed)
    }

    /// Only a completed transfer has entries that can be compensated
    #[inline]
    pub fn can_reverse(&self) -> bool {
        matches!(self, TransferStatus::Completed)
    }

    #[inline]
    pub fn can_review(&self) -> bool {
        matches!(self, TransferStatus::PendingReview)
    }
}

/// Cross-currency leg of a transfer, fixed at posting time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FxLeg {
    pub rate: Decimal,
    pub to_currency: Currency,
}

/// Reviewer decision metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewInfo {
    pub reviewer: String,
    pub note: Option<String>,
    pub reviewed_at: DateTime<Utc>,
}

/// Logical money movement between two wallets.
///
/// `amount`/`currency` always describe the sender leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub transfer_id: TransferId,
    pub from_wallet: WalletId,
    pub to_wallet: WalletId,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: TransferStatus,
    pub idempotency_key: String,
    pub fx: Option<FxLeg>,
    pub risk_ref: Option<String>,
    pub review: Option<ReviewInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transfer {
    pub fn is_fx(&self) -> bool {
        self.fx.is_some()
    }

    /// Amount credited to the recipient
    pub fn credit_amount(&self) -> Result<Decimal, LedgerError> {
        match &self.fx {
            Some(leg) => crate::money::convert(self.amount, leg.rate),
            None => Ok(self.amount),
        }
    }
}

// ============================================================================
// Deposit
// ============================================================================

/// External funds credited to a wallet. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub deposit_id: DepositId,
    pub wallet_id: WalletId,
    pub amount: Decimal,
    pub currency: Currency,
    pub source: String,
    pub external_ref: String,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Withdrawal
// ============================================================================

/// Cash-out status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Completed,
    Expired,
    Reversed,
}

text_enum!(WithdrawalStatus {
    Pending => "pending",
    Completed => "completed",
    Expired => "expired",
    Reversed => "reversed",
});

/// Agent cash-out request, gated by a single-use code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub withdrawal_id: WithdrawalId,
    pub user_id: UserId,
    pub wallet_id: WalletId,
    pub amount: Decimal,
    pub currency: Currency,
    pub code: String,
    pub idempotency_key: String,
    pub expires_at: DateTime<Utc>,
    pub status: WithdrawalStatus,
    pub agent_id: Option<UserId>,
    pub float_wallet_id: Option<WalletId>,
    pub fee_amount: Option<Decimal>,
    pub net_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Withdrawal {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

// ============================================================================
// Reversal
// ============================================================================

/// Kind of record a reversal compensates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReversalKind {
    Transfer,
    Deposit,
    Withdrawal,
}

text_enum!(ReversalKind {
    Transfer => "transfer",
    Deposit => "deposit",
    Withdrawal => "withdrawal",
});

/// Reversal target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "target_type", content = "target_id", rename_all = "snake_case")]
pub enum ReversalTarget {
    Transfer(TransferId),
    Deposit(DepositId),
    Withdrawal(WithdrawalId),
}

impl ReversalTarget {
    pub fn kind(&self) -> ReversalKind {
        match self {
            ReversalTarget::Transfer(_) => ReversalKind::Transfer,
            ReversalTarget::Deposit(_) => ReversalKind::Deposit,
            ReversalTarget::Withdrawal(_) => ReversalKind::Withdrawal,
        }
    }

    pub fn id_string(&self) -> String {
        match self {
            ReversalTarget::Transfer(id) => id.to_string(),
            ReversalTarget::Deposit(id) => id.to_string(),
            ReversalTarget::Withdrawal(id) => id.to_string(),
        }
    }

    pub fn from_parts(kind: ReversalKind, id: &str) -> Result<Self, LedgerError> {
        let bad = |_| LedgerError::Validation(format!("Invalid {} id: {}", kind, id));
        Ok(match kind {
            ReversalKind::Transfer => ReversalTarget::Transfer(id.parse().map_err(bad)?),
            ReversalKind::Deposit => ReversalTarget::Deposit(id.parse().map_err(bad)?),
            ReversalKind::Withdrawal => ReversalTarget::Withdrawal(id.parse().map_err(bad)?),
        })
    }
}

/// Compensating record; at most one per target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reversal {
    pub reversal_id: ReversalId,
    pub target: ReversalTarget,
    pub reason: String,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Cards
// ============================================================================

/// Payment card bound to one wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub card_id: CardId,
    pub wallet_id: WalletId,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Card authorization status
///
/// `authorized → {captured | reversed}`; `declined` is terminal from birth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardTxStatus {
    Authorized,
    Captured,
    Declined,
    Reversed,
}

text_enum!(CardTxStatus {
    Authorized => "authorized",
    Captured => "captured",
    Declined => "declined",
    Reversed => "reversed",
});

impl CardTxStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CardTxStatus::Authorized)
    }
}

/// Card authorization record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardTransaction {
    pub card_tx_id: CardTxId,
    pub card_id: CardId,
    pub wallet_id: WalletId,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: CardTxStatus,
    pub capture_amount: Option<Decimal>,
    pub hold_entry_id: Option<EntryId>,
    pub merchant: Option<String>,
    pub decline_reason: Option<String>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
