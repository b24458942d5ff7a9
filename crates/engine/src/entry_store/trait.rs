use std::sync::Arc;

use thiserror::Error;

use khata_core::{EntryId, IdempotencyKey, PartyId};
use khata_ledger::{EntryDraft, LedgerEntry};
use khata_stock::StockMovement;

use super::query::{EntryFilter, EntryPage, Pagination};

/// A posting committed by the store: its entries with assigned sequence
/// numbers, plus the linked stock movement if one was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedPosting {
    pub entries: Vec<LedgerEntry>,
    pub movement: Option<StockMovement>,
}

/// Entry store operation error.
///
/// These are **infrastructure errors** (storage, append invariants) as
/// opposed to domain errors (intent validation). `DuplicateIdempotencyKey`
/// is special: callers treat it as success-of-the-original-request, not as
/// a failure to surface to the end user.
#[derive(Debug, Error)]
pub enum EntryStoreError {
    /// A posting with this idempotency key is already durably recorded.
    ///
    /// Carries the ids of the original posting's entries so the caller can
    /// return the original result.
    #[error("idempotency key '{key}' already recorded")]
    DuplicateIdempotencyKey {
        key: IdempotencyKey,
        existing: Vec<EntryId>,
    },

    /// The batch violates an append invariant (mixed keys, unknown reversal
    /// target, second reversal of the same entry, dangling movement link).
    #[error("invalid append: {0}")]
    InvalidAppend(String),

    /// The backing storage failed (connection, transaction, deserialization).
    #[error("storage error: {0}")]
    Storage(String),
}

/// Append-only store of ledger entries.
///
/// ## Append semantics
///
/// `append()` commits a whole posting — every draft plus the optional stock
/// movement — as one unit, or nothing at all. Implementations must:
///
/// - assign sequence numbers monotonically per store instance (no gaps in a
///   single append, never reused)
/// - enforce idempotency-key uniqueness **atomically with the append**: the
///   lookup-then-insert must not race with a concurrent duplicate submission
///   (a single write lock in memory, a unique index in Postgres — never an
///   application-level check-then-write)
/// - enforce at most one reversal per entry at the same boundary
/// - never update or delete entries once committed
///
/// ## Read semantics
///
/// Party history is ordered by business time first (`occurred_at`), then by
/// insertion order (`sequence`) to break ties deterministically.
pub trait EntryStore: Send + Sync {
    /// Atomically commit a posting (all drafts share one idempotency key).
    fn append(
        &self,
        drafts: Vec<EntryDraft>,
        movement: Option<StockMovement>,
    ) -> Result<CommittedPosting, EntryStoreError>;

    /// Full entry history for a party, ordered by (occurred_at, sequence).
    fn entries_for_party(&self, party_id: PartyId) -> Result<Vec<LedgerEntry>, EntryStoreError>;

    /// Paginated, filtered entry history for a party.
    fn entries_for_party_page(
        &self,
        party_id: PartyId,
        filter: EntryFilter,
        pagination: Pagination,
    ) -> Result<EntryPage, EntryStoreError>;

    /// All entries recorded under an idempotency key (one posting's legs).
    fn entries_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Vec<LedgerEntry>, EntryStoreError>;

    fn entry_by_id(&self, entry_id: EntryId) -> Result<Option<LedgerEntry>, EntryStoreError>;

    /// The reversal entry referencing `entry_id`, if one exists.
    fn reversal_of(&self, entry_id: EntryId) -> Result<Option<LedgerEntry>, EntryStoreError>;

    /// Highest sequence number among the party's entries (0 if none).
    ///
    /// Used as the staleness watermark for balance snapshots.
    fn last_sequence_for_party(&self, party_id: PartyId) -> Result<u64, EntryStoreError>;

    /// The stock movement linked to an entry, if any.
    fn movement_for_entry(
        &self,
        entry_id: EntryId,
    ) -> Result<Option<StockMovement>, EntryStoreError>;
}

impl<S> EntryStore for Arc<S>
where
    S: EntryStore + ?Sized,
{
    fn append(
        &self,
        drafts: Vec<EntryDraft>,
        movement: Option<StockMovement>,
    ) -> Result<CommittedPosting, EntryStoreError> {
        (**self).append(drafts, movement)
    }

    fn entries_for_party(&self, party_id: PartyId) -> Result<Vec<LedgerEntry>, EntryStoreError> {
        (**self).entries_for_party(party_id)
    }

    fn entries_for_party_page(
        &self,
        party_id: PartyId,
        filter: EntryFilter,
        pagination: Pagination,
    ) -> Result<EntryPage, EntryStoreError> {
        (**self).entries_for_party_page(party_id, filter, pagination)
    }

    fn entries_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Vec<LedgerEntry>, EntryStoreError> {
        (**self).entries_by_idempotency_key(key)
    }

    fn entry_by_id(&self, entry_id: EntryId) -> Result<Option<LedgerEntry>, EntryStoreError> {
        (**self).entry_by_id(entry_id)
    }

    fn reversal_of(&self, entry_id: EntryId) -> Result<Option<LedgerEntry>, EntryStoreError> {
        (**self).reversal_of(entry_id)
    }

    fn last_sequence_for_party(&self, party_id: PartyId) -> Result<u64, EntryStoreError> {
        (**self).last_sequence_for_party(party_id)
    }

    fn movement_for_entry(
        &self,
        entry_id: EntryId,
    ) -> Result<Option<StockMovement>, EntryStoreError> {
        (**self).movement_for_entry(entry_id)
    }
}
