use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use khata_core::{Amount, DomainError, EntryId, IdempotencyKey, PartyId};

/// Business meaning of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Sale,
    Payment,
    Adjustment,
    Reversal,
}

impl EntryKind {
    /// Kinds that may carry a linked stock movement.
    ///
    /// Payments move money only; reversals compensate a prior entry and never
    /// touch inventory themselves.
    pub fn is_stock_affecting(self) -> bool {
        matches!(self, EntryKind::Sale | EntryKind::Adjustment)
    }

    /// Stable textual name, used by persistent stores.
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Sale => "sale",
            EntryKind::Payment => "payment",
            EntryKind::Adjustment => "adjustment",
            EntryKind::Reversal => "reversal",
        }
    }
}

impl FromStr for EntryKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sale" => Ok(EntryKind::Sale),
            "payment" => Ok(EntryKind::Payment),
            "adjustment" => Ok(EntryKind::Adjustment),
            "reversal" => Ok(EntryKind::Reversal),
            other => Err(DomainError::validation(format!(
                "unknown entry kind '{other}'"
            ))),
        }
    }
}

/// An entry ready to be appended but not yet assigned a sequence number.
///
/// Drafts are produced by the transaction poster; the entry store assigns
/// sequence numbers during its atomic append. Two-phase lifecycle:
///
/// 1. **`EntryDraft`**: decided, carries an id and all business fields
/// 2. **`LedgerEntry`**: persisted, with a store-assigned `sequence`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDraft {
    pub entry_id: EntryId,
    pub party_id: PartyId,
    /// Signed: positive increases the party's balance, negative decreases it.
    pub amount: Amount,
    pub kind: EntryKind,
    pub occurred_at: DateTime<Utc>,
    /// Set only on reversal entries: the entry being compensated.
    pub reverses: Option<EntryId>,
    pub idempotency_key: IdempotencyKey,
    pub note: Option<String>,
}

impl EntryDraft {
    /// Promote a draft into a stored entry once the store has assigned its
    /// position in the append-only log.
    pub fn into_entry(self, sequence: u64) -> LedgerEntry {
        LedgerEntry {
            entry_id: self.entry_id,
            party_id: self.party_id,
            amount: self.amount,
            kind: self.kind,
            occurred_at: self.occurred_at,
            reverses: self.reverses,
            idempotency_key: self.idempotency_key,
            note: self.note,
            sequence,
        }
    }
}

/// One immutable, signed transaction record against a party.
///
/// Entries are never updated or deleted. A correction is a new entry with
/// `reverses` pointing at the original and the amount negated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: EntryId,
    pub party_id: PartyId,
    pub amount: Amount,
    pub kind: EntryKind,
    pub occurred_at: DateTime<Utc>,
    pub reverses: Option<EntryId>,
    pub idempotency_key: IdempotencyKey,
    pub note: Option<String>,
    /// Monotonically increasing position in the store's append-only log.
    pub sequence: u64,
}

impl LedgerEntry {
    pub fn is_reversal(&self) -> bool {
        self.kind == EntryKind::Reversal
    }
}
