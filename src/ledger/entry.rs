//! Ledger entry definitions
//!
//! Entries are immutable and append-only. Each one carries a closed
//! [`EntryType`] tag; the balance calculator matches on it exhaustively so a
//! new tag cannot silently fall out of the held-balance computation.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core_types::{CardTxId, DepositId, EntryId, TransferId, WalletId, WithdrawalId};
use crate::error::LedgerError;

/// Entry type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    TransferOut,
    TransferIn,
    TransferOutReversal,
    TransferInReversal,
    Deposit,
    DepositReversal,
    Withdrawal,
    WithdrawalReversal,
    CashoutFloatDebit,
    CommissionCredit,
    HoldDebit,
    HoldRelease,
    HoldSeize,
    CardCapture,
    AdminAdjustment,
}

/// How an entry participates in the balance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryClass {
    /// Moves real funds: counts toward `total`
    Settled,
    /// Reservation memo: counts toward `held` only
    Hold,
}

impl EntryType {
    pub const ALL: [EntryType; 15] = [
        EntryType::TransferOut,
        EntryType::TransferIn,
        EntryType::TransferOutReversal,
        EntryType::TransferInReversal,
        EntryType::Deposit,
        EntryType::DepositReversal,
        EntryType::Withdrawal,
        EntryType::WithdrawalReversal,
        EntryType::CashoutFloatDebit,
        EntryType::CommissionCredit,
        EntryType::HoldDebit,
        EntryType::HoldRelease,
        EntryType::HoldSeize,
        EntryType::CardCapture,
        EntryType::AdminAdjustment,
    ];

    pub fn class(&self) -> EntryClass {
        match self {
            EntryType::TransferOut
            | EntryType::TransferIn
            | EntryType::TransferOutReversal
            | EntryType::TransferInReversal
            | EntryType::Deposit
            | EntryType::DepositReversal
            | EntryType::Withdrawal
            | EntryType::WithdrawalReversal
            | EntryType::CashoutFloatDebit
            | EntryType::CommissionCredit
            | EntryType::CardCapture
            | EntryType::AdminAdjustment => EntryClass::Settled,
            EntryType::HoldDebit | EntryType::HoldRelease | EntryType::HoldSeize => {
                EntryClass::Hold
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::TransferOut => "transfer_out",
            EntryType::TransferIn => "transfer_in",
            EntryType::TransferOutReversal => "transfer_out_reversal",
            EntryType::TransferInReversal => "transfer_in_reversal",
            EntryType::Deposit => "deposit",
            EntryType::DepositReversal => "deposit_reversal",
            EntryType::Withdrawal => "withdrawal",
            EntryType::WithdrawalReversal => "withdrawal_reversal",
            EntryType::CashoutFloatDebit => "cashout_float_debit",
            EntryType::CommissionCredit => "commission_credit",
            EntryType::HoldDebit => "hold_debit",
            EntryType::HoldRelease => "hold_release",
            EntryType::HoldSeize => "hold_seize",
            EntryType::CardCapture => "card_capture",
            EntryType::AdminAdjustment => "admin_adjustment",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntryType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| LedgerError::System(format!("Unknown entry type: {}", s)))
    }
}

/// Originating record of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntryLink {
    Transfer(TransferId),
    Deposit(DepositId),
    Withdrawal(WithdrawalId),
    CardTransaction(CardTxId),
}

impl EntryLink {
    pub fn kind(&self) -> &'static str {
        match self {
            EntryLink::Transfer(_) => "transfer",
            EntryLink::Deposit(_) => "deposit",
            EntryLink::Withdrawal(_) => "withdrawal",
            EntryLink::CardTransaction(_) => "card_transaction",
        }
    }

    pub fn id_string(&self) -> String {
        match self {
            EntryLink::Transfer(id) => id.to_string(),
            EntryLink::Deposit(id) => id.to_string(),
            EntryLink::Withdrawal(id) => id.to_string(),
            EntryLink::CardTransaction(id) => id.to_string(),
        }
    }

    /// Rebuild from stored `(kind, id)` columns
    pub fn from_parts(kind: &str, id: &str) -> Result<Self, LedgerError> {
        use crate::core_types::parse_id;
        match kind {
            "transfer" => Ok(EntryLink::Transfer(parse_id(id, "transfer_id")?)),
            "deposit" => Ok(EntryLink::Deposit(parse_id(id, "deposit_id")?)),
            "withdrawal" => Ok(EntryLink::Withdrawal(parse_id(id, "withdrawal_id")?)),
            "card_transaction" => Ok(EntryLink::CardTransaction(parse_id(id, "card_tx_id")?)),
            other => Err(LedgerError::System(format!("Unknown link kind: {}", other))),
        }
    }
}

/// One immutable, signed movement against one wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: EntryId,
    pub wallet_id: WalletId,
    /// Signed: negative debits, positive credits
    pub amount: Decimal,
    pub entry_type: EntryType,
    pub link: Option<EntryLink>,
    /// Free-text reference (reason, provider reference, ...)
    pub reference: Option<String>,
    /// Only set on standalone entries (admin adjustments); unique when present
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        wallet_id: WalletId,
        amount: Decimal,
        entry_type: EntryType,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entry_id: EntryId::new(),
            wallet_id,
            amount,
            entry_type,
            link: None,
            reference: None,
            idempotency_key: None,
            created_at,
        }
    }

    pub fn linked(mut self, link: EntryLink) -> Self {
        self.link = Some(link);
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_type_roundtrip_all() {
        for t in EntryType::ALL {
            assert_eq!(t.as_str().parse::<EntryType>().unwrap(), t);
        }
        assert!("mystery".parse::<EntryType>().is_err());
    }

    #[test]
    fn test_hold_classification() {
        let holds: Vec<_> = EntryType::ALL
            .into_iter()
            .filter(|t| t.class() == EntryClass::Hold)
            .collect();
        assert_eq!(
            holds,
            vec![
                EntryType::HoldDebit,
                EntryType::HoldRelease,
                EntryType::HoldSeize
            ]
        );
    }

    #[test]
    fn test_link_parts() {
        let link = EntryLink::Transfer(TransferId::new());
        let rebuilt = EntryLink::from_parts(link.kind(), &link.id_string()).unwrap();
        assert_eq!(link, rebuilt);
        assert!(EntryLink::from_parts("order", &TransferId::new().to_string()).is_err());
    }

    #[test]
    fn test_entry_type_serde_tag() {
        let json = serde_json::to_string(&EntryType::CashoutFloatDebit).unwrap();
        assert_eq!(json, "\"cashout_float_debit\"");
    }
}
