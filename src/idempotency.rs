//! Idempotency Guard
//!
//! Every mutating operation takes a caller-supplied key. The guard protocol,
//! shared by all engines:
//!
//! 1. Look the key up inside the write transaction → replay if found.
//! 2. Insert the keyed record with `ON CONFLICT DO NOTHING` semantics.
//! 3. Not inserted means a concurrent twin won the unique constraint: roll
//!    back and re-read in a fresh transaction → replay.
//!
//! A replay is never an error and creates no entries.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::LedgerError;

/// Maximum accepted key length
pub const MAX_KEY_LEN: usize = 128;

/// Validated, trimmed idempotency key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, LedgerError> {
        let key = raw.as_ref().trim();
        if key.is_empty() {
            return Err(LedgerError::Validation(
                "Idempotency key cannot be empty".to_string(),
            ));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(LedgerError::Validation(format!(
                "Idempotency key exceeds {} characters",
                MAX_KEY_LEN
            )));
        }
        Ok(Self(key.to_string()))
    }

    /// Webhook-style key: `provider:external_id`
    pub fn for_provider(provider: &str, external_id: &str) -> Result<Self, LedgerError> {
        Self::new(format!("{}:{}", provider.trim(), external_id.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        IdempotencyKey::new(value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(k: IdempotencyKey) -> String {
        k.0
    }
}

/// Outcome of a key-guarded operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Guarded<T> {
    pub value: T,
    /// True when the key had already been executed and nothing was written
    pub replayed: bool,
}

impl<T> Guarded<T> {
    pub fn fresh(value: T) -> Self {
        Self {
            value,
            replayed: false,
        }
    }

    pub fn replay(value: T) -> Self {
        Self {
            value,
            replayed: true,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Guarded<U> {
        Guarded {
            value: f(self.value),
            replayed: self.replayed,
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Result of the write attempt in step 2
pub(crate) enum Attempt<T> {
    Done(Guarded<T>),
    /// Lost the unique-key race; caller must replay from a fresh transaction
    LostRace,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_trimmed() {
        assert_eq!(IdempotencyKey::new("  abc ").unwrap().as_str(), "abc");
    }

    #[test]
    fn test_key_rejects_empty_and_long() {
        assert!(IdempotencyKey::new("   ").is_err());
        assert!(IdempotencyKey::new("x".repeat(MAX_KEY_LEN + 1)).is_err());
        assert!(IdempotencyKey::new("x".repeat(MAX_KEY_LEN)).is_ok());
    }

    #[test]
    fn test_provider_key() {
        let key = IdempotencyKey::for_provider("moncash", " tx-881 ").unwrap();
        assert_eq!(key.as_str(), "moncash:tx-881");
    }

    #[test]
    fn test_guarded_map() {
        let g = Guarded::replay(2).map(|v| v * 10);
        assert_eq!(g.value, 20);
        assert!(g.replayed);
        assert!(!Guarded::fresh(()).replayed);
    }
}
