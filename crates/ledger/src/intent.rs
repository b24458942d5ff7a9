use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use khata_core::{Amount, DomainError, DomainResult, EntryId, IdempotencyKey, PartyId};

use crate::entry::EntryKind;

/// Upper bound on legs per posting.
///
/// The domain only ever needs one leg (single-ledger posting) or two
/// (client/company or supplier/company pairs); the bound leaves headroom
/// without admitting unbounded requests.
pub const MAX_LEGS: usize = 8;

/// Maximum accepted note length in bytes.
pub const MAX_NOTE_LEN: usize = 512;

/// One side of a posting: a signed amount against one party's ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingLeg {
    pub party_id: PartyId,
    pub amount: Amount,
}

/// Inventory effect requested alongside a posting.
///
/// The engine links the movement to the posting's first leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementIntent {
    /// Signed quantity change (negative = stock leaves the company).
    pub quantity_delta: i64,
    /// Valuation per unit, in minor units.
    pub unit_value: Amount,
}

/// A validated request to durably record one or more ledger entries as one
/// atomic unit.
///
/// Intents arrive from the (external) request layer as loosely-typed bodies;
/// everything here is checked by [`PostingIntent::validate`] before the core
/// acts on it. All legs share one idempotency key: replaying the intent
/// replays the whole posting or none of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingIntent {
    pub legs: Vec<PostingLeg>,
    pub kind: EntryKind,
    pub idempotency_key: IdempotencyKey,
    pub occurred_at: DateTime<Utc>,
    /// Set only when `kind` is [`EntryKind::Reversal`].
    pub reverses: Option<EntryId>,
    pub movement: Option<MovementIntent>,
    pub note: Option<String>,
}

impl PostingIntent {
    /// Single-leg posting against one party's ledger.
    pub fn single(
        party_id: PartyId,
        amount: Amount,
        kind: EntryKind,
        idempotency_key: IdempotencyKey,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            legs: vec![PostingLeg { party_id, amount }],
            kind,
            idempotency_key,
            occurred_at,
            reverses: None,
            movement: None,
            note: None,
        }
    }

    /// Two-leg posting with the same signed amount on both ledgers, e.g. a
    /// sale that raises what the client owes and the company's receivables
    /// together.
    pub fn symmetric(
        first: PartyId,
        second: PartyId,
        amount: Amount,
        kind: EntryKind,
        idempotency_key: IdempotencyKey,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            legs: vec![
                PostingLeg {
                    party_id: first,
                    amount,
                },
                PostingLeg {
                    party_id: second,
                    amount,
                },
            ],
            kind,
            idempotency_key,
            occurred_at,
            reverses: None,
            movement: None,
            note: None,
        }
    }

    pub fn with_movement(mut self, movement: MovementIntent) -> Self {
        self.movement = Some(movement);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Parties touched by this intent, in leg order.
    pub fn parties(&self) -> Vec<PartyId> {
        self.legs.iter().map(|leg| leg.party_id).collect()
    }

    /// Deterministic intent validation.
    ///
    /// Everything checked here is user-correctable; storage-boundary
    /// invariants (idempotency-key uniqueness, single reversal per entry)
    /// are enforced by the entry store itself.
    pub fn validate(&self) -> DomainResult<()> {
        if self.legs.is_empty() {
            return Err(DomainError::validation("posting must have at least one leg"));
        }
        if self.legs.len() > MAX_LEGS {
            return Err(DomainError::validation(format!(
                "posting exceeds {MAX_LEGS} legs"
            )));
        }

        for leg in &self.legs {
            if leg.amount.is_zero() {
                return Err(DomainError::validation("leg amount must be non-zero"));
            }
        }

        for (i, leg) in self.legs.iter().enumerate() {
            if self.legs[..i].iter().any(|l| l.party_id == leg.party_id) {
                return Err(DomainError::validation(
                    "a party may appear in at most one leg",
                ));
            }
        }

        // Multi-leg postings must carry a symmetric net effect: every leg the
        // same magnitude, created together or not at all.
        if self.legs.len() > 1 {
            let magnitude = self.legs[0].amount.checked_abs()?;
            for leg in &self.legs[1..] {
                if leg.amount.checked_abs()? != magnitude {
                    return Err(DomainError::validation(
                        "multi-leg posting must have symmetric leg amounts",
                    ));
                }
            }
        }

        match (self.kind, self.reverses) {
            (EntryKind::Reversal, None) => {
                return Err(DomainError::validation(
                    "reversal posting must reference the entry it reverses",
                ));
            }
            (EntryKind::Reversal, Some(_)) if self.legs.len() != 1 => {
                return Err(DomainError::validation(
                    "reversal posting must have exactly one leg",
                ));
            }
            (kind, Some(_)) if kind != EntryKind::Reversal => {
                return Err(DomainError::validation(
                    "only reversal postings may reference a prior entry",
                ));
            }
            _ => {}
        }

        if let Some(movement) = &self.movement {
            if !self.kind.is_stock_affecting() {
                return Err(DomainError::validation(
                    "only sale and adjustment postings may carry a stock movement",
                ));
            }
            if movement.quantity_delta == 0 {
                return Err(DomainError::validation(
                    "stock movement quantity must be non-zero",
                ));
            }
            if movement.unit_value.is_negative() {
                return Err(DomainError::validation(
                    "stock movement unit value cannot be negative",
                ));
            }
        }

        if let Some(note) = &self.note {
            if note.len() > MAX_NOTE_LEN {
                return Err(DomainError::validation(format!(
                    "note exceeds {MAX_NOTE_LEN} bytes"
                )));
            }
        }

        Ok(())
    }
}
