//! Balance aggregation over entry history.
//!
//! The aggregator owns per-party [`BalanceSnapshot`]s: derived, cacheable
//! running balances with a sequence-number watermark. Snapshots are never a
//! source of truth — every balance is rebuildable by replaying the party's
//! entries, and incremental accumulation must agree with a full replay
//! exactly. Any divergence is a correctness bug surfaced by the audit
//! service, never a tolerated approximation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use khata_core::{Amount, DomainError, PartyId};

use crate::entry_store::{EntryStore, EntryStoreError};
use crate::read_model::KvStore;

/// Cached running balance for one party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub party_id: PartyId,
    pub balance: Amount,
    /// Sequence number of the last entry folded into `balance`.
    ///
    /// Replaying the party's entries up to this sequence must reproduce
    /// `balance` exactly.
    pub as_of_sequence: u64,
}

impl BalanceSnapshot {
    pub fn zero(party_id: PartyId) -> Self {
        Self {
            party_id,
            balance: Amount::ZERO,
            as_of_sequence: 0,
        }
    }
}

/// Balance aggregation error.
#[derive(Debug, Error)]
pub enum BalanceError {
    #[error("entry store error: {0}")]
    Store(#[from] EntryStoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Computes and caches running balances per party.
///
/// Generic over the entry store and the snapshot store so tests run fully
/// in memory while production wires the Postgres store underneath.
///
/// Callers are responsible for serialization: the poster and the audit
/// service invoke these methods while holding the relevant party lock.
#[derive(Debug)]
pub struct BalanceAggregator<E, S> {
    store: Arc<E>,
    snapshots: S,
}

impl<E, S> BalanceAggregator<E, S>
where
    E: EntryStore,
    S: KvStore<PartyId, BalanceSnapshot>,
{
    pub fn new(store: Arc<E>, snapshots: S) -> Self {
        Self { store, snapshots }
    }

    /// The cached snapshot, if any. Never triggers a recompute.
    pub fn cached(&self, party_id: PartyId) -> Option<BalanceSnapshot> {
        self.snapshots.get(&party_id)
    }

    /// Current balance: the cached snapshot when it is up to date with the
    /// entry history, otherwise a full recompute.
    pub fn current_balance(&self, party_id: PartyId) -> Result<Amount, BalanceError> {
        let head = self.store.last_sequence_for_party(party_id)?;
        if let Some(snapshot) = self.snapshots.get(&party_id) {
            if snapshot.as_of_sequence == head {
                return Ok(snapshot.balance);
            }
        }
        self.recompute(party_id)
    }

    /// Force a full replay from entry history and refresh the snapshot.
    pub fn recompute(&self, party_id: PartyId) -> Result<Amount, BalanceError> {
        let head = self.store.last_sequence_for_party(party_id)?;
        let balance = self.replay_sum_up_to(party_id, head)?;
        self.snapshots.upsert(
            party_id,
            BalanceSnapshot {
                party_id,
                balance,
                as_of_sequence: head,
            },
        );
        Ok(balance)
    }

    /// Exact sum of the party's entry amounts with `sequence <= up_to`, in
    /// insertion order. A reversed entry and its reversal cancel exactly, so
    /// this equals the sum of non-reversed entries.
    ///
    /// Pure read: never touches the snapshot. The audit service relies on
    /// that to compare cached state against history without healing it.
    pub fn replay_sum_up_to(&self, party_id: PartyId, up_to: u64) -> Result<Amount, BalanceError> {
        let mut entries = self.store.entries_for_party(party_id)?;
        entries.sort_by_key(|e| e.sequence);

        let mut sum = Amount::ZERO;
        for entry in entries.iter().filter(|e| e.sequence <= up_to) {
            sum = sum.checked_add(entry.amount)?;
        }
        Ok(sum)
    }

    /// Fold one committed entry into the cached balance.
    ///
    /// Idempotent with respect to replays: a delta at or below the snapshot's
    /// watermark has already been folded in and is ignored.
    pub fn apply_delta(
        &self,
        party_id: PartyId,
        amount: Amount,
        as_of_sequence: u64,
    ) -> Result<Amount, BalanceError> {
        let prev = self
            .snapshots
            .get(&party_id)
            .unwrap_or_else(|| BalanceSnapshot::zero(party_id));

        if as_of_sequence <= prev.as_of_sequence {
            return Ok(prev.balance);
        }

        let balance = prev.balance.checked_add(amount)?;
        self.snapshots.upsert(
            party_id,
            BalanceSnapshot {
                party_id,
                balance,
                as_of_sequence,
            },
        );
        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use khata_core::{EntryId, IdempotencyKey};
    use khata_ledger::{EntryDraft, EntryKind};

    use crate::entry_store::InMemoryEntryStore;
    use crate::read_model::InMemoryKvStore;

    type TestAggregator =
        BalanceAggregator<InMemoryEntryStore, InMemoryKvStore<PartyId, BalanceSnapshot>>;

    fn setup() -> (Arc<InMemoryEntryStore>, TestAggregator) {
        let store = Arc::new(InMemoryEntryStore::new());
        let aggregator = BalanceAggregator::new(Arc::clone(&store), InMemoryKvStore::new());
        (store, aggregator)
    }

    fn post(store: &InMemoryEntryStore, party_id: PartyId, minor: i64, key: &str) -> u64 {
        let draft = EntryDraft {
            entry_id: EntryId::new(),
            party_id,
            amount: Amount::from_minor(minor),
            kind: EntryKind::Sale,
            occurred_at: Utc::now(),
            reverses: None,
            idempotency_key: IdempotencyKey::new(key).unwrap(),
            note: None,
        };
        store.append(vec![draft], None).unwrap().entries[0].sequence
    }

    #[test]
    fn current_balance_of_unknown_party_is_zero() {
        let (_, aggregator) = setup();
        assert_eq!(
            aggregator.current_balance(PartyId::new()).unwrap(),
            Amount::ZERO
        );
    }

    #[test]
    fn incremental_deltas_agree_with_recompute() {
        let (store, aggregator) = setup();
        let party = PartyId::new();

        let mut incremental = Amount::ZERO;
        for (i, minor) in [500, -200, 300, -50].into_iter().enumerate() {
            let seq = post(&store, party, minor, &format!("k{i}"));
            incremental = aggregator
                .apply_delta(party, Amount::from_minor(minor), seq)
                .unwrap();
        }

        assert_eq!(incremental, Amount::from_minor(550));
        assert_eq!(aggregator.recompute(party).unwrap(), Amount::from_minor(550));
    }

    #[test]
    fn stale_snapshot_triggers_recompute() {
        let (store, aggregator) = setup();
        let party = PartyId::new();

        let seq = post(&store, party, 500, "k1");
        aggregator
            .apply_delta(party, Amount::from_minor(500), seq)
            .unwrap();

        // Entry appended without a matching delta: snapshot is now stale.
        post(&store, party, 200, "k2");

        assert_eq!(
            aggregator.current_balance(party).unwrap(),
            Amount::from_minor(700)
        );
        // The recompute refreshed the watermark.
        assert_eq!(aggregator.cached(party).unwrap().as_of_sequence, 2);
    }

    #[test]
    fn replayed_delta_is_ignored() {
        let (store, aggregator) = setup();
        let party = PartyId::new();

        let seq = post(&store, party, 500, "k1");
        let first = aggregator
            .apply_delta(party, Amount::from_minor(500), seq)
            .unwrap();
        let replay = aggregator
            .apply_delta(party, Amount::from_minor(500), seq)
            .unwrap();

        assert_eq!(first, Amount::from_minor(500));
        assert_eq!(replay, Amount::from_minor(500));
        assert_eq!(
            aggregator.current_balance(party).unwrap(),
            Amount::from_minor(500)
        );
    }

    #[test]
    fn replay_sum_respects_the_watermark() {
        let (store, aggregator) = setup();
        let party = PartyId::new();

        let s1 = post(&store, party, 500, "k1");
        let s2 = post(&store, party, -200, "k2");

        assert_eq!(
            aggregator.replay_sum_up_to(party, s1).unwrap(),
            Amount::from_minor(500)
        );
        assert_eq!(
            aggregator.replay_sum_up_to(party, s2).unwrap(),
            Amount::from_minor(300)
        );
        // A pure read: no snapshot was written.
        assert!(aggregator.cached(party).is_none());
    }

    #[test]
    fn parties_do_not_interfere() {
        let (store, aggregator) = setup();
        let a = PartyId::new();
        let b = PartyId::new();

        let sa = post(&store, a, 500, "ka");
        let sb = post(&store, b, -300, "kb");
        aggregator.apply_delta(a, Amount::from_minor(500), sa).unwrap();
        aggregator.apply_delta(b, Amount::from_minor(-300), sb).unwrap();

        assert_eq!(aggregator.current_balance(a).unwrap(), Amount::from_minor(500));
        assert_eq!(aggregator.current_balance(b).unwrap(), Amount::from_minor(-300));
    }
}
