use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use khata_core::{DomainError, DomainResult, PartyId};

/// Maximum accepted display-name length in bytes.
pub const MAX_NAME_LEN: usize = 128;

/// Party kind: a client we sell to, a supplier we buy from, or the company
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartyKind {
    Client,
    Supplier,
    Company,
}

impl PartyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PartyKind::Client => "client",
            PartyKind::Supplier => "supplier",
            PartyKind::Company => "company",
        }
    }
}

impl core::fmt::Display for PartyKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ledger party.
///
/// The party record carries identity and metadata only. Its running balance
/// lives in the engine's snapshot store and is always derivable from entry
/// history; it is never a field here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub id: PartyId,
    pub kind: PartyKind,
    pub name: String,
    pub registered_at: DateTime<Utc>,
}

impl Party {
    pub fn new(
        id: PartyId,
        kind: PartyKind,
        name: impl Into<String>,
        registered_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("party name cannot be empty"));
        }
        if trimmed.len() > MAX_NAME_LEN {
            return Err(DomainError::validation(format!(
                "party name exceeds {MAX_NAME_LEN} bytes"
            )));
        }

        Ok(Self {
            id,
            kind,
            name: trimmed.to_string(),
            registered_at,
        })
    }

    pub fn is_supplier(&self) -> bool {
        self.kind == PartyKind::Supplier
    }

    pub fn is_client(&self) -> bool {
        self.kind == PartyKind::Client
    }
}
