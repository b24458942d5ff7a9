//! Reconciliation & audit.
//!
//! Detects balance drift (cached snapshot disagreeing with entry history)
//! and supports corrections via compensating entries. Drift is reported and
//! logged, never silently auto-corrected: a snapshot that disagrees with the
//! history it claims to summarize means a bug elsewhere, and an operator has
//! to see it. History itself is never mutated — a correction is a new entry
//! posted through the same path as everything else.

pub mod sweep;

pub use sweep::{spawn_sweep, SweepError, SweepHandle, SweepPhase, SweepProgress};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::error;

use khata_core::{Amount, EntryId, IdempotencyKey, PartyId};
use khata_ledger::{EntryKind, PostingIntent};
use khata_parties::Party;

use crate::balances::{BalanceAggregator, BalanceSnapshot};
use crate::entry_store::EntryStore;
use crate::locks::PartyLocks;
use crate::poster::{PostingError, PostingResult, TransactionPoster};
use crate::read_model::KvStore;

/// Outcome of verifying one party's cached balance against history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub party_id: PartyId,
    pub ok: bool,
    /// Cached balance minus the balance recomputed from history up to the
    /// snapshot's watermark. Zero when consistent.
    pub drift: Amount,
    /// The cached balance that was checked, if a snapshot existed.
    pub cached_balance: Option<Amount>,
    /// The balance recomputed from entry history.
    pub recomputed_balance: Amount,
}

/// Reconciliation & audit service.
#[derive(Debug)]
pub struct ReconciliationService<E, P, B> {
    store: Arc<E>,
    balances: Arc<BalanceAggregator<E, B>>,
    poster: Arc<TransactionPoster<E, P, B>>,
    locks: Arc<PartyLocks>,
}

impl<E, P, B> ReconciliationService<E, P, B>
where
    E: EntryStore,
    P: KvStore<PartyId, Party>,
    B: KvStore<PartyId, BalanceSnapshot>,
{
    pub fn new(
        store: Arc<E>,
        balances: Arc<BalanceAggregator<E, B>>,
        poster: Arc<TransactionPoster<E, P, B>>,
        locks: Arc<PartyLocks>,
    ) -> Self {
        Self {
            store,
            balances,
            poster,
            locks,
        }
    }

    /// Compare the cached balance against a full recompute from history.
    ///
    /// Runs under the party lock, so it reads a consistent snapshot even
    /// while postings to other parties proceed. The check compares the
    /// snapshot against history *up to its own watermark* — a snapshot that
    /// is merely behind a fresh append is stale, not drifted.
    pub fn verify(&self, party_id: PartyId) -> Result<VerifyReport, PostingError> {
        let lock_set = self.locks.for_parties(&[party_id]);
        let _guards = lock_set.acquire();

        let report = match self.balances.cached(party_id) {
            None => {
                // Nothing cached, nothing to drift.
                let recomputed = self.balances.replay_sum_up_to(party_id, u64::MAX)?;
                VerifyReport {
                    party_id,
                    ok: true,
                    drift: Amount::ZERO,
                    cached_balance: None,
                    recomputed_balance: recomputed,
                }
            }
            Some(snapshot) => {
                let recomputed = self
                    .balances
                    .replay_sum_up_to(party_id, snapshot.as_of_sequence)?;
                let drift = snapshot.balance.checked_sub(recomputed)?;
                VerifyReport {
                    party_id,
                    ok: drift.is_zero(),
                    drift,
                    cached_balance: Some(snapshot.balance),
                    recomputed_balance: recomputed,
                }
            }
        };

        if !report.ok {
            error!(
                party_id = %report.party_id,
                drift = %report.drift,
                cached = ?report.cached_balance,
                recomputed = %report.recomputed_balance,
                "balance drift detected"
            );
        }

        Ok(report)
    }

    /// Post a compensating entry for `entry_id`.
    ///
    /// Never deletes history: the original stays, a new entry with the
    /// amount negated and `reverses` set goes through the normal posting
    /// path. The idempotency key is derived from the original entry id, so
    /// retrying a reversal replays the first one instead of double-reversing.
    pub fn reverse(
        &self,
        entry_id: EntryId,
        reason: impl Into<String>,
    ) -> Result<PostingResult, PostingError> {
        let original = self
            .store
            .entry_by_id(entry_id)?
            .ok_or(PostingError::EntryNotFound(entry_id))?;

        if original.kind == EntryKind::Reversal {
            return Err(PostingError::Validation(
                "a reversal entry cannot itself be reversed".to_string(),
            ));
        }

        let key = IdempotencyKey::new(format!("reversal-{entry_id}"))?;

        if let Some(existing) = self.store.reversal_of(entry_id)? {
            if existing.idempotency_key != key {
                // Reversed through some other posting; exactly one reversal
                // per entry, so this request cannot proceed.
                return Err(PostingError::Validation(format!(
                    "entry {entry_id} is already reversed by {}",
                    existing.entry_id
                )));
            }
            // Our own earlier reversal: fall through and let the poster
            // resolve the duplicate key into a replay.
        }

        let mut intent = PostingIntent::single(
            original.party_id,
            original.amount.checked_neg()?,
            EntryKind::Reversal,
            key,
            chrono::Utc::now(),
        );
        intent.reverses = Some(entry_id);
        intent.note = Some(reason.into());

        self.poster.post(intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use khata_parties::PartyKind;

    use crate::entry_store::InMemoryEntryStore;
    use crate::read_model::InMemoryKvStore;
    use crate::registry::PartyRegistry;

    type SnapshotStore = Arc<InMemoryKvStore<PartyId, BalanceSnapshot>>;
    type PartyStore = InMemoryKvStore<PartyId, Party>;

    struct Fixture {
        audit: ReconciliationService<InMemoryEntryStore, PartyStore, SnapshotStore>,
        poster: Arc<TransactionPoster<InMemoryEntryStore, PartyStore, SnapshotStore>>,
        registry: Arc<PartyRegistry<PartyStore>>,
        snapshots: SnapshotStore,
    }

    fn setup() -> Fixture {
        let store = Arc::new(InMemoryEntryStore::new());
        let registry = Arc::new(PartyRegistry::new(InMemoryKvStore::new()));
        let snapshots: SnapshotStore = Arc::new(InMemoryKvStore::new());
        let balances = Arc::new(BalanceAggregator::new(
            Arc::clone(&store),
            Arc::clone(&snapshots),
        ));
        let locks = Arc::new(PartyLocks::new());
        let poster = Arc::new(TransactionPoster::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&balances),
            Arc::clone(&locks),
        ));
        let audit = ReconciliationService::new(
            Arc::clone(&store),
            Arc::clone(&balances),
            Arc::clone(&poster),
            locks,
        );
        Fixture {
            audit,
            poster,
            registry,
            snapshots,
        }
    }

    fn client(fixture: &Fixture) -> PartyId {
        fixture
            .registry
            .register(
                Party::new(PartyId::new(), PartyKind::Client, "Rahim Traders", Utc::now()).unwrap(),
            )
            .unwrap()
            .id
    }

    fn sale(party: PartyId, minor: i64, k: &str) -> PostingIntent {
        PostingIntent::single(
            party,
            Amount::from_minor(minor),
            EntryKind::Sale,
            IdempotencyKey::new(k).unwrap(),
            Utc::now(),
        )
    }

    #[test]
    fn verify_reports_ok_for_consistent_party() {
        let fixture = setup();
        let party = client(&fixture);

        fixture.poster.post(sale(party, 50_000, "k1")).unwrap();
        let report = fixture.audit.verify(party).unwrap();
        assert!(report.ok);
        assert_eq!(report.drift, Amount::ZERO);
        assert_eq!(report.cached_balance, Some(Amount::from_minor(50_000)));
    }

    #[test]
    fn verify_reports_ok_for_unknown_party() {
        let fixture = setup();
        let report = fixture.audit.verify(PartyId::new()).unwrap();
        assert!(report.ok);
        assert_eq!(report.recomputed_balance, Amount::ZERO);
        assert_eq!(report.cached_balance, None);
    }

    #[test]
    fn verify_detects_corrupted_snapshot() {
        let fixture = setup();
        let party = client(&fixture);

        fixture.poster.post(sale(party, 50_000, "k1")).unwrap();
        assert!(fixture.audit.verify(party).unwrap().ok);

        // Corrupt the cache behind the aggregator's back.
        let snapshot = fixture.snapshots.get(&party).unwrap();
        fixture.snapshots.upsert(
            party,
            BalanceSnapshot {
                balance: Amount::from_minor(60_000),
                ..snapshot
            },
        );

        let report = fixture.audit.verify(party).unwrap();
        assert!(!report.ok);
        assert_eq!(report.drift, Amount::from_minor(10_000));
        assert_eq!(report.cached_balance, Some(Amount::from_minor(60_000)));
        assert_eq!(report.recomputed_balance, Amount::from_minor(50_000));

        // Verify reports; it never heals the cache.
        assert_eq!(
            fixture.snapshots.get(&party).unwrap().balance,
            Amount::from_minor(60_000)
        );
    }

    #[test]
    fn reverse_restores_prior_balance() {
        let fixture = setup();
        let party = client(&fixture);

        fixture.poster.post(sale(party, 50_000, "k1")).unwrap();
        let payment = fixture.poster.post(sale(party, -20_000, "k2")).unwrap();
        assert_eq!(payment.new_balances[0].balance, Amount::from_minor(30_000));

        let sale_entry = fixture
            .poster
            .post(sale(party, 10_000, "k3"))
            .unwrap();
        let reversal = fixture
            .audit
            .reverse(sale_entry.entry_id(), "posted twice upstream")
            .unwrap();

        assert!(!reversal.replayed);
        assert_eq!(reversal.entries[0].kind, EntryKind::Reversal);
        assert_eq!(reversal.entries[0].reverses, Some(sale_entry.entry_id()));
        assert_eq!(
            reversal.new_balances[0].balance,
            Amount::from_minor(30_000)
        );
        assert_eq!(
            reversal.entries[0].note.as_deref(),
            Some("posted twice upstream")
        );
    }

    #[test]
    fn retried_reversal_replays_instead_of_double_reversing() {
        let fixture = setup();
        let party = client(&fixture);

        let posted = fixture.poster.post(sale(party, 50_000, "k1")).unwrap();
        let first = fixture.audit.reverse(posted.entry_id(), "correction").unwrap();
        let retry = fixture.audit.reverse(posted.entry_id(), "correction").unwrap();

        assert!(!first.replayed);
        assert!(retry.replayed);
        assert_eq!(retry.entry_id(), first.entry_id());
        assert_eq!(retry.new_balances[0].balance, Amount::ZERO);
    }

    #[test]
    fn reversing_a_reversal_is_rejected() {
        let fixture = setup();
        let party = client(&fixture);

        let posted = fixture.poster.post(sale(party, 50_000, "k1")).unwrap();
        let reversal = fixture.audit.reverse(posted.entry_id(), "correction").unwrap();

        let err = fixture
            .audit
            .reverse(reversal.entry_id(), "again")
            .unwrap_err();
        match err {
            PostingError::Validation(msg) => assert!(msg.contains("cannot itself")),
            other => panic!("Expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn reversing_unknown_entry_fails() {
        let fixture = setup();
        let ghost = EntryId::new();
        let err = fixture.audit.reverse(ghost, "oops").unwrap_err();
        match err {
            PostingError::EntryNotFound(id) => assert_eq!(id, ghost),
            other => panic!("Expected EntryNotFound, got {other:?}"),
        }
    }
}
