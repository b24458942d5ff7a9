//! Caller-supplied idempotency keys.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Maximum accepted key length in bytes.
pub const MAX_KEY_LEN: usize = 128;

/// A validated idempotency key.
///
/// The key is the caller's token for "this request, exactly once": a retried
/// request carrying the same key must not be applied twice. Uniqueness is
/// enforced at the storage boundary; this type only guarantees the key is
/// well-formed (non-empty, bounded, printable ASCII).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> DomainResult<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(DomainError::validation("idempotency key cannot be empty"));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(DomainError::validation(format!(
                "idempotency key exceeds {MAX_KEY_LEN} bytes"
            )));
        }
        if !key.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(DomainError::validation(
                "idempotency key must be printable ASCII without whitespace",
            ));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IdempotencyKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(value: IdempotencyKey) -> Self {
        value.0
    }
}
