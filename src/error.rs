//! Ledger Error Types
//!
//! One error type for every engine operation. Business outcomes that must
//! leave a record behind (declined card authorizations, blocked transfers)
//! are NOT errors; they come back as successful results with a status.

use thiserror::Error;

use crate::core_types::WalletId;

/// Ledger error types
///
/// Every variant aborts the surrounding transaction: no partial entries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    // === Validation Errors (rejected before any write) ===
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Source and target wallet cannot be the same")]
    SameWallet,

    #[error("Currency mismatch: wallet holds {expected}, request uses {actual}")]
    CurrencyMismatch { expected: String, actual: String },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    // === Funds ===
    #[error("Insufficient available balance in wallet {0}")]
    InsufficientFunds(WalletId),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    // === Lookup / State ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Already processed")]
    AlreadyProcessed,

    #[error("Code expired")]
    Expired,

    // === Collaborators ===
    #[error("Exchange rate unavailable: {0}")]
    RateUnavailable(String),

    // === Storage / System ===
    #[error("Concurrent duplicate: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal system error: {0}")]
    System(String),
}

impl LedgerError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "VALIDATION_ERROR",
            LedgerError::InvalidAmount => "INVALID_AMOUNT",
            LedgerError::SameWallet => "SAME_WALLET",
            LedgerError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            LedgerError::Forbidden(_) => "FORBIDDEN",
            LedgerError::InsufficientFunds(_) => "INSUFFICIENT_FUNDS",
            LedgerError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            LedgerError::NotFound(_) => "NOT_FOUND",
            LedgerError::InvalidState(_) => "INVALID_STATE",
            LedgerError::AlreadyProcessed => "ALREADY_PROCESSED",
            LedgerError::Expired => "EXPIRED",
            LedgerError::RateUnavailable(_) => "RATE_UNAVAILABLE",
            LedgerError::Conflict(_) => "CONFLICT",
            LedgerError::Storage(_) => "STORAGE_ERROR",
            LedgerError::System(_) => "SYSTEM_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            LedgerError::Validation(_)
            | LedgerError::InvalidAmount
            | LedgerError::SameWallet
            | LedgerError::CurrencyMismatch { .. } => 400,
            LedgerError::Forbidden(_) => 403,
            LedgerError::NotFound(_) => 404,
            LedgerError::InvalidState(_)
            | LedgerError::AlreadyProcessed
            | LedgerError::Conflict(_) => 409,
            LedgerError::Expired => 410,
            LedgerError::InsufficientFunds(_) | LedgerError::LimitExceeded(_) => 422,
            LedgerError::RateUnavailable(_) => 503,
            LedgerError::Storage(_) | LedgerError::System(_) => 500,
        }
    }

    /// True for terminal state-machine violations, including a withdrawal
    /// code that was already used.
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidState(_) | LedgerError::AlreadyProcessed
        )
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e
            && db.is_unique_violation()
        {
            return LedgerError::Conflict(db.message().to_string());
        }
        LedgerError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(LedgerError::SameWallet.code(), "SAME_WALLET");
        assert_eq!(LedgerError::AlreadyProcessed.code(), "ALREADY_PROCESSED");
        assert_eq!(LedgerError::Expired.code(), "EXPIRED");
        assert_eq!(
            LedgerError::InsufficientFunds(WalletId::new()).code(),
            "INSUFFICIENT_FUNDS"
        );
    }

    #[test]
    fn test_http_status() {
        assert_eq!(LedgerError::InvalidAmount.http_status(), 400);
        assert_eq!(LedgerError::NotFound("x".into()).http_status(), 404);
        assert_eq!(LedgerError::AlreadyProcessed.http_status(), 409);
        assert_eq!(LedgerError::Expired.http_status(), 410);
        assert_eq!(LedgerError::Storage("db".into()).http_status(), 500);
    }

    #[test]
    fn test_invalid_state_family() {
        assert!(LedgerError::AlreadyProcessed.is_invalid_state());
        assert!(LedgerError::InvalidState("captured".into()).is_invalid_state());
        assert!(!LedgerError::Expired.is_invalid_state());
    }

    #[test]
    fn test_display() {
        let err = LedgerError::CurrencyMismatch {
            expected: "USD".into(),
            actual: "HTG".into(),
        };
        assert_eq!(
            err.to_string(),
            "Currency mismatch: wallet holds USD, request uses HTG"
        );
    }
}
