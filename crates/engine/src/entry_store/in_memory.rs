use std::collections::HashMap;
use std::sync::RwLock;

use khata_core::{EntryId, IdempotencyKey, PartyId};
use khata_ledger::{EntryDraft, EntryKind, LedgerEntry};
use khata_stock::StockMovement;

use super::query::{EntryFilter, EntryPage, Pagination};
use super::r#trait::{CommittedPosting, EntryStore, EntryStoreError};

#[derive(Debug, Default)]
struct Inner {
    /// Append-only log; `sequence` of the entry at position i is i + 1.
    entries: Vec<LedgerEntry>,
    by_party: HashMap<PartyId, Vec<usize>>,
    by_key: HashMap<IdempotencyKey, Vec<usize>>,
    by_id: HashMap<EntryId, usize>,
    /// reversed entry id -> position of its reversal.
    reversals: HashMap<EntryId, usize>,
    movements: HashMap<EntryId, StockMovement>,
}

/// In-memory append-only entry store.
///
/// Intended for tests/dev. The whole append runs under one write lock, so
/// the duplicate-key check, the reversal-uniqueness check and the commit are
/// a single atomic step — the same guarantee the Postgres store gets from
/// its unique indexes.
#[derive(Debug, Default)]
pub struct InMemoryEntryStore {
    inner: RwLock<Inner>,
}

impl InMemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, EntryStoreError> {
        self.inner
            .read()
            .map_err(|_| EntryStoreError::Storage("lock poisoned".to_string()))
    }

    fn party_entries(inner: &Inner, party_id: PartyId) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = inner
            .by_party
            .get(&party_id)
            .into_iter()
            .flatten()
            .map(|&idx| inner.entries[idx].clone())
            .collect();
        entries.sort_by_key(|e| (e.occurred_at, e.sequence));
        entries
    }
}

impl EntryStore for InMemoryEntryStore {
    fn append(
        &self,
        drafts: Vec<EntryDraft>,
        movement: Option<StockMovement>,
    ) -> Result<CommittedPosting, EntryStoreError> {
        if drafts.is_empty() {
            return Err(EntryStoreError::InvalidAppend(
                "posting batch cannot be empty".to_string(),
            ));
        }

        // All legs of a posting share one idempotency key.
        let key = drafts[0].idempotency_key.clone();
        for (idx, draft) in drafts.iter().enumerate() {
            if draft.idempotency_key != key {
                return Err(EntryStoreError::InvalidAppend(format!(
                    "batch contains multiple idempotency keys (index {idx})"
                )));
            }
        }

        let mut inner = self
            .inner
            .write()
            .map_err(|_| EntryStoreError::Storage("lock poisoned".to_string()))?;

        // Uniqueness check and commit happen under the same write lock, so a
        // concurrent duplicate submission cannot slip between them.
        if let Some(existing) = inner.by_key.get(&key) {
            let existing = existing
                .iter()
                .map(|&idx| inner.entries[idx].entry_id)
                .collect();
            return Err(EntryStoreError::DuplicateIdempotencyKey { key, existing });
        }

        for (idx, draft) in drafts.iter().enumerate() {
            if draft.amount.is_zero() {
                return Err(EntryStoreError::InvalidAppend(format!(
                    "zero amount in batch (index {idx})"
                )));
            }
            if inner.by_id.contains_key(&draft.entry_id) {
                return Err(EntryStoreError::InvalidAppend(format!(
                    "entry id {} already exists",
                    draft.entry_id
                )));
            }
            if drafts[..idx].iter().any(|d| d.entry_id == draft.entry_id) {
                return Err(EntryStoreError::InvalidAppend(format!(
                    "duplicate entry id in batch (index {idx})"
                )));
            }

            match (draft.kind, draft.reverses) {
                (EntryKind::Reversal, Some(target)) => {
                    let target_idx = *inner.by_id.get(&target).ok_or_else(|| {
                        EntryStoreError::InvalidAppend(format!(
                            "reversed entry {target} not found"
                        ))
                    })?;
                    if inner.entries[target_idx].kind == EntryKind::Reversal {
                        return Err(EntryStoreError::InvalidAppend(
                            "a reversal entry cannot itself be reversed".to_string(),
                        ));
                    }
                    if inner.reversals.contains_key(&target) {
                        return Err(EntryStoreError::InvalidAppend(format!(
                            "entry {target} is already reversed"
                        )));
                    }
                }
                (EntryKind::Reversal, None) => {
                    return Err(EntryStoreError::InvalidAppend(
                        "reversal entry must reference the entry it reverses".to_string(),
                    ));
                }
                (_, Some(_)) => {
                    return Err(EntryStoreError::InvalidAppend(
                        "only reversal entries may reference a prior entry".to_string(),
                    ));
                }
                (_, None) => {}
            }
        }

        if let Some(m) = &movement {
            if !drafts.iter().any(|d| d.entry_id == m.entry_id) {
                return Err(EntryStoreError::InvalidAppend(
                    "stock movement must reference an entry in the same posting".to_string(),
                ));
            }
        }

        // Validation complete; commit the whole posting. Nothing above
        // mutated state, so a rejected batch leaves the store untouched.
        let mut committed = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let sequence = inner.entries.len() as u64 + 1;
            let idx = inner.entries.len();
            let entry = draft.into_entry(sequence);

            inner.by_party.entry(entry.party_id).or_default().push(idx);
            inner.by_key.entry(key.clone()).or_default().push(idx);
            inner.by_id.insert(entry.entry_id, idx);
            if let Some(target) = entry.reverses {
                inner.reversals.insert(target, idx);
            }

            inner.entries.push(entry.clone());
            committed.push(entry);
        }

        if let Some(m) = &movement {
            inner.movements.insert(m.entry_id, m.clone());
        }

        Ok(CommittedPosting {
            entries: committed,
            movement,
        })
    }

    fn entries_for_party(&self, party_id: PartyId) -> Result<Vec<LedgerEntry>, EntryStoreError> {
        let inner = self.read()?;
        Ok(Self::party_entries(&inner, party_id))
    }

    fn entries_for_party_page(
        &self,
        party_id: PartyId,
        filter: EntryFilter,
        pagination: Pagination,
    ) -> Result<EntryPage, EntryStoreError> {
        let inner = self.read()?;
        let matching: Vec<LedgerEntry> = Self::party_entries(&inner, party_id)
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();

        let total = matching.len() as u64;
        let entries: Vec<LedgerEntry> = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();
        let has_more = total > (pagination.offset + pagination.limit) as u64;

        Ok(EntryPage {
            entries,
            total,
            pagination,
            has_more,
        })
    }

    fn entries_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Vec<LedgerEntry>, EntryStoreError> {
        let inner = self.read()?;
        Ok(inner
            .by_key
            .get(key)
            .into_iter()
            .flatten()
            .map(|&idx| inner.entries[idx].clone())
            .collect())
    }

    fn entry_by_id(&self, entry_id: EntryId) -> Result<Option<LedgerEntry>, EntryStoreError> {
        let inner = self.read()?;
        Ok(inner
            .by_id
            .get(&entry_id)
            .map(|&idx| inner.entries[idx].clone()))
    }

    fn reversal_of(&self, entry_id: EntryId) -> Result<Option<LedgerEntry>, EntryStoreError> {
        let inner = self.read()?;
        Ok(inner
            .reversals
            .get(&entry_id)
            .map(|&idx| inner.entries[idx].clone()))
    }

    fn last_sequence_for_party(&self, party_id: PartyId) -> Result<u64, EntryStoreError> {
        let inner = self.read()?;
        Ok(inner
            .by_party
            .get(&party_id)
            .and_then(|idxs| idxs.iter().max())
            .map(|&idx| inner.entries[idx].sequence)
            .unwrap_or(0))
    }

    fn movement_for_entry(
        &self,
        entry_id: EntryId,
    ) -> Result<Option<StockMovement>, EntryStoreError> {
        let inner = self.read()?;
        Ok(inner.movements.get(&entry_id).cloned())
    }
}
