//! Core types used throughout the system
//!
//! Identifiers are ULID newtypes: sortable, coordination-free and stored as
//! 26-char TEXT in PostgreSQL. Their lexical order is the global lock order
//! for wallets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LedgerError;

/// User ID - owner of wallets (users, merchants, agents, treasury).
pub type UserId = i64;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(ulid::Ulid);

        impl $name {
            /// Generate a new unique id
            pub fn new() -> Self {
                Self(ulid::Ulid::new())
            }

            /// Get the inner ULID value
            pub fn inner(&self) -> ulid::Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(ulid::Ulid::from_string(s)?))
            }
        }
    };
}

ulid_id!(
    /// Wallet (account) identifier
    WalletId
);
ulid_id!(
    /// Ledger entry identifier
    EntryId
);
ulid_id!(
    /// Transfer identifier (same-currency and FX)
    TransferId
);
ulid_id!(
    /// Deposit identifier
    DepositId
);
ulid_id!(
    /// Withdrawal (cash-out) identifier
    WithdrawalId
);
ulid_id!(
    /// Reversal identifier
    ReversalId
);
ulid_id!(
    /// Card identifier
    CardId
);
ulid_id!(
    /// Card authorization (hold) transaction identifier
    CardTxId
);

/// Parse an id column, mapping failures to a system error.
pub fn parse_id<T: FromStr>(raw: &str, what: &str) -> Result<T, LedgerError> {
    raw.parse()
        .map_err(|_| LedgerError::System(format!("Invalid {} format: {}", what, raw)))
}

/// ISO-4217 style currency code, always three upper-case ASCII letters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Result<Self, LedgerError> {
        let code = code.trim().to_ascii_uppercase();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(LedgerError::Validation(format!(
                "Invalid currency code: {}",
                code
            )));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Currency {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::new(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Currency::new(&value)
    }
}

impl From<Currency> for String {
    fn from(c: Currency) -> String {
        c.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display_parse() {
        let id = TransferId::new();
        let parsed: TransferId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-ulid".parse::<TransferId>().is_err());
    }

    #[test]
    fn test_currency_normalized() {
        assert_eq!(Currency::new(" htg ").unwrap().as_str(), "HTG");
        assert!(Currency::new("US").is_err());
        assert!(Currency::new("U5D").is_err());
    }

    #[test]
    fn test_currency_serde() {
        let c: Currency = serde_json::from_str("\"usd\"").unwrap();
        assert_eq!(c.as_str(), "USD");
        assert!(serde_json::from_str::<Currency>("\"dollars\"").is_err());
        assert_eq!(serde_json::to_string(&c).unwrap(), "\"USD\"");
    }
}
