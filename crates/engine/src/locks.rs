//! Per-party mutual exclusion.
//!
//! Two concurrent postings against the same party must never interleave
//! their read-modify-write of the cached balance; postings against disjoint
//! parties proceed fully in parallel. Each party gets its own mutex, handed
//! out lazily from a shared map. Multi-party acquisition always happens in
//! sorted id order, so a client/company posting and a company/client posting
//! cannot deadlock against each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use khata_core::PartyId;

/// Registry of per-party locks.
#[derive(Debug, Default)]
pub struct PartyLocks {
    inner: Mutex<HashMap<PartyId, Arc<Mutex<()>>>>,
}

impl PartyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect lock handles for a set of parties, deduplicated and sorted.
    ///
    /// The returned set owns the handles; call [`PartyLockSet::acquire`] to
    /// take the guards for the duration of a critical section.
    pub fn for_parties(&self, parties: &[PartyId]) -> PartyLockSet {
        let mut ids: Vec<PartyId> = parties.to_vec();
        ids.sort_by_key(|id| *id.as_uuid().as_bytes());
        ids.dedup();

        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let handles = ids
            .into_iter()
            .map(|id| Arc::clone(map.entry(id).or_default()))
            .collect();

        PartyLockSet { handles }
    }
}

/// An ordered set of party lock handles.
#[derive(Debug)]
pub struct PartyLockSet {
    handles: Vec<Arc<Mutex<()>>>,
}

impl PartyLockSet {
    /// Acquire every lock in the set, in order. The returned guards release
    /// on drop.
    pub fn acquire(&self) -> Vec<MutexGuard<'_, ()>> {
        self.handles
            .iter()
            // The guarded unit carries no data, so a poisoned lock is still safe to take.
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
            .collect()
    }
}
