//! Transaction posting pipeline (application-level orchestration).
//!
//! The poster is the single write path into the ledger. It orchestrates the
//! full lifecycle of a posting:
//!
//! ```text
//! PostingIntent
//!   ↓
//! 1. Validate intent (pure, in khata-ledger)
//!   ↓
//! 2. Resolve parties / reversal target
//!   ↓
//! 3. Acquire per-party locks (sorted order)
//!   ↓
//! 4. Atomic append (store enforces idempotency-key uniqueness)
//!   ↓
//! 5. Fold deltas into balance snapshots, return confirmed balances
//! ```
//!
//! A duplicate idempotency key is not an error: the poster loads the original
//! posting and returns it with `replayed = true`, so a retried request
//! observes its first outcome without creating entries or moving balances.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error};

use khata_core::{DomainError, EntryId, MovementId, PartyId};
use khata_ledger::{EntryDraft, EntryKind, LedgerEntry, PostingIntent};
use khata_parties::Party;
use khata_stock::StockMovement;

use crate::balances::{BalanceAggregator, BalanceError, BalanceSnapshot};
use crate::entry_store::{CommittedPosting, EntryStore, EntryStoreError};
use crate::locks::PartyLocks;
use crate::read_model::KvStore;
use crate::registry::PartyRegistry;

/// Posting pipeline error.
///
/// This is the error surface the request layer sees. Note what is *not*
/// here: a duplicate idempotency key, which the poster resolves into the
/// original result instead of failing.
#[derive(Debug, Error)]
pub enum PostingError {
    /// Malformed or out-of-range intent; user-correctable.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced party is not registered.
    #[error("party {0} not found")]
    PartyNotFound(PartyId),

    /// A referenced entry does not exist.
    #[error("entry {0} not found")]
    EntryNotFound(EntryId),

    /// Multi-leg atomicity was violated at the storage boundary; nothing was
    /// persisted. Indicates a defect, surfaced with full context.
    #[error("inconsistent posting: {0}")]
    InconsistentPosting(String),

    /// The backing storage failed.
    #[error("entry store error: {0}")]
    Store(#[from] EntryStoreError),
}

impl From<DomainError> for PostingError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => PostingError::Validation(msg),
            DomainError::InvalidId(msg) => PostingError::Validation(msg),
            DomainError::AmountOverflow => {
                PostingError::Validation("amount arithmetic overflowed".to_string())
            }
            DomainError::NotFound => PostingError::Validation("record not found".to_string()),
        }
    }
}

impl From<BalanceError> for PostingError {
    fn from(value: BalanceError) -> Self {
        match value {
            BalanceError::Store(e) => PostingError::Store(e),
            BalanceError::Domain(e) => e.into(),
        }
    }
}

/// Confirmed balance for one party after a posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PartyBalance {
    pub party_id: PartyId,
    pub balance: khata_core::Amount,
}

/// Outcome of a posting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingResult {
    /// The posting's entries, in leg order.
    pub entries: Vec<LedgerEntry>,
    pub movement: Option<StockMovement>,
    /// Confirmed balances per affected party, in leg order.
    pub new_balances: Vec<PartyBalance>,
    /// True when the intent's idempotency key was already recorded and the
    /// original posting was returned instead of a new one.
    pub replayed: bool,
}

impl PostingResult {
    /// Convenience accessor for single-leg postings.
    pub fn entry_id(&self) -> EntryId {
        self.entries[0].entry_id
    }
}

/// The single entry point that creates ledger entries and updates balances
/// atomically.
#[derive(Debug)]
pub struct TransactionPoster<E, P, B> {
    store: Arc<E>,
    parties: Arc<PartyRegistry<P>>,
    balances: Arc<BalanceAggregator<E, B>>,
    locks: Arc<PartyLocks>,
}

impl<E, P, B> TransactionPoster<E, P, B>
where
    E: EntryStore,
    P: KvStore<PartyId, Party>,
    B: KvStore<PartyId, BalanceSnapshot>,
{
    pub fn new(
        store: Arc<E>,
        parties: Arc<PartyRegistry<P>>,
        balances: Arc<BalanceAggregator<E, B>>,
        locks: Arc<PartyLocks>,
    ) -> Self {
        Self {
            store,
            parties,
            balances,
            locks,
        }
    }

    /// Post a transaction intent.
    ///
    /// All legs plus any linked stock movement commit as one unit; a rejected
    /// intent leaves the store exactly as it was before the call.
    pub fn post(&self, intent: PostingIntent) -> Result<PostingResult, PostingError> {
        intent.validate()?;

        let parties = intent.parties();
        for party_id in &parties {
            self.parties
                .get(*party_id)
                .ok_or(PostingError::PartyNotFound(*party_id))?;
        }

        if let Some(target) = intent.reverses {
            self.check_reversal_target(&intent, target)?;
        }

        // Serialize conflicting writes per party; disjoint parties run in
        // parallel. Sorted acquisition, so symmetric postings cannot deadlock.
        let lock_set = self.locks.for_parties(&parties);
        let _guards = lock_set.acquire();

        let multi_leg = intent.legs.len() > 1 || intent.movement.is_some();
        let drafts = self.build_drafts(&intent);
        let movement = self.build_movement(&intent, &drafts)?;

        match self.store.append(drafts, movement) {
            Ok(committed) => self.confirm(committed),
            Err(EntryStoreError::DuplicateIdempotencyKey { key, .. }) => {
                debug!(%key, "idempotent replay of posting");
                self.replay(&intent)
            }
            Err(EntryStoreError::InvalidAppend(msg)) if multi_leg => {
                error!(
                    key = %intent.idempotency_key,
                    legs = intent.legs.len(),
                    "multi-leg posting rejected at storage boundary: {msg}"
                );
                Err(PostingError::InconsistentPosting(msg))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// A reversal must negate the original entry on the same party's ledger.
    fn check_reversal_target(
        &self,
        intent: &PostingIntent,
        target: EntryId,
    ) -> Result<(), PostingError> {
        let original = self
            .store
            .entry_by_id(target)?
            .ok_or(PostingError::EntryNotFound(target))?;

        if original.kind == EntryKind::Reversal {
            return Err(PostingError::Validation(
                "a reversal entry cannot itself be reversed".to_string(),
            ));
        }

        let leg = &intent.legs[0];
        if leg.party_id != original.party_id {
            return Err(PostingError::Validation(
                "reversal must target the original entry's party".to_string(),
            ));
        }
        if leg.amount != original.amount.checked_neg()? {
            return Err(PostingError::Validation(
                "reversal amount must negate the original entry".to_string(),
            ));
        }

        Ok(())
    }

    fn build_drafts(&self, intent: &PostingIntent) -> Vec<EntryDraft> {
        intent
            .legs
            .iter()
            .map(|leg| EntryDraft {
                entry_id: EntryId::new(),
                party_id: leg.party_id,
                amount: leg.amount,
                kind: intent.kind,
                occurred_at: intent.occurred_at,
                reverses: intent.reverses,
                idempotency_key: intent.idempotency_key.clone(),
                note: intent.note.clone(),
            })
            .collect()
    }

    fn build_movement(
        &self,
        intent: &PostingIntent,
        drafts: &[EntryDraft],
    ) -> Result<Option<StockMovement>, PostingError> {
        intent
            .movement
            .map(|m| {
                StockMovement::new(
                    MovementId::new(),
                    drafts[0].entry_id,
                    m.quantity_delta,
                    m.unit_value,
                    intent.occurred_at,
                )
            })
            .transpose()
            .map_err(PostingError::from)
    }

    /// Fold a fresh posting into the snapshots and assemble the result.
    fn confirm(&self, committed: CommittedPosting) -> Result<PostingResult, PostingError> {
        let mut new_balances = Vec::with_capacity(committed.entries.len());
        for entry in &committed.entries {
            let balance =
                self.balances
                    .apply_delta(entry.party_id, entry.amount, entry.sequence)?;
            new_balances.push(PartyBalance {
                party_id: entry.party_id,
                balance,
            });
        }

        Ok(PostingResult {
            entries: committed.entries,
            movement: committed.movement,
            new_balances,
            replayed: false,
        })
    }

    /// Resolve a duplicate submission into the original posting's outcome.
    fn replay(&self, intent: &PostingIntent) -> Result<PostingResult, PostingError> {
        let mut entries = self
            .store
            .entries_by_idempotency_key(&intent.idempotency_key)?;
        entries.sort_by_key(|e| e.sequence);

        if entries.is_empty() {
            // The key was claimed but its entries are gone: storage is
            // inconsistent with itself.
            return Err(PostingError::InconsistentPosting(format!(
                "idempotency key '{}' recorded without entries",
                intent.idempotency_key
            )));
        }

        let movement = self.store.movement_for_entry(entries[0].entry_id)?;

        let mut new_balances = Vec::with_capacity(entries.len());
        for entry in &entries {
            let balance = self.balances.current_balance(entry.party_id)?;
            new_balances.push(PartyBalance {
                party_id: entry.party_id,
                balance,
            });
        }

        Ok(PostingResult {
            entries,
            movement,
            new_balances,
            replayed: true,
        })
    }
}
