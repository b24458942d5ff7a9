//! The engine's external surface.
//!
//! `LedgerService` is what the (out-of-scope) request layer holds: one
//! explicitly constructed handle wiring the entry store, party registry,
//! balance aggregator, poster, audit service and supplier adapter together.
//! No ambient singletons — every component receives its collaborators at
//! construction time.

use std::sync::Arc;

use khata_core::{Amount, EntryId, IdempotencyKey, PartyId};
use khata_ledger::PostingIntent;
use khata_parties::{Party, PartyKind};
use khata_stock::StockMovement;

use crate::audit::{spawn_sweep, ReconciliationService, SweepHandle, VerifyReport};
use crate::balances::{BalanceAggregator, BalanceSnapshot};
use crate::entry_store::{EntryFilter, EntryPage, EntryStore, InMemoryEntryStore, Pagination};
use crate::locks::PartyLocks;
use crate::poster::{PostingError, PostingResult, TransactionPoster};
use crate::read_model::{InMemoryKvStore, KvStore};
use crate::registry::PartyRegistry;
use crate::supplier::SupplierPaymentAdapter;

/// Facade over the posting and reconciliation engine.
#[derive(Debug)]
pub struct LedgerService<E, P, B> {
    store: Arc<E>,
    parties: Arc<PartyRegistry<P>>,
    balances: Arc<BalanceAggregator<E, B>>,
    locks: Arc<PartyLocks>,
    poster: Arc<TransactionPoster<E, P, B>>,
    audit: Arc<ReconciliationService<E, P, B>>,
    supplier: SupplierPaymentAdapter<E, P, B>,
}

/// Service wired entirely to in-memory stores (tests/dev).
pub type InMemoryLedgerService = LedgerService<
    InMemoryEntryStore,
    InMemoryKvStore<PartyId, Party>,
    InMemoryKvStore<PartyId, BalanceSnapshot>,
>;

impl InMemoryLedgerService {
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryEntryStore::new()),
            InMemoryKvStore::new(),
            InMemoryKvStore::new(),
        )
    }
}

impl<E, P, B> LedgerService<E, P, B>
where
    E: EntryStore + 'static,
    P: KvStore<PartyId, Party> + 'static,
    B: KvStore<PartyId, BalanceSnapshot> + 'static,
{
    pub fn new(store: Arc<E>, party_store: P, snapshot_store: B) -> Self {
        let parties = Arc::new(PartyRegistry::new(party_store));
        let balances = Arc::new(BalanceAggregator::new(Arc::clone(&store), snapshot_store));
        let locks = Arc::new(PartyLocks::new());
        let poster = Arc::new(TransactionPoster::new(
            Arc::clone(&store),
            Arc::clone(&parties),
            Arc::clone(&balances),
            Arc::clone(&locks),
        ));
        let audit = Arc::new(ReconciliationService::new(
            Arc::clone(&store),
            Arc::clone(&balances),
            Arc::clone(&poster),
            Arc::clone(&locks),
        ));
        let supplier = SupplierPaymentAdapter::new(Arc::clone(&poster), Arc::clone(&parties));

        Self {
            store,
            parties,
            balances,
            locks,
            poster,
            audit,
            supplier,
        }
    }

    // ---- parties ----

    pub fn register_party(
        &self,
        kind: PartyKind,
        name: impl Into<String>,
    ) -> Result<Party, PostingError> {
        let party = Party::new(PartyId::new(), kind, name, chrono::Utc::now())
            .map_err(PostingError::from)?;
        self.parties.register(party).map_err(PostingError::from)
    }

    pub fn party(&self, party_id: PartyId) -> Option<Party> {
        self.parties.get(party_id)
    }

    pub fn list_parties(&self, kind: Option<PartyKind>) -> Vec<Party> {
        self.parties.list(kind)
    }

    // ---- posting ----

    pub fn post_transaction(&self, intent: PostingIntent) -> Result<PostingResult, PostingError> {
        self.poster.post(intent)
    }

    pub fn reverse_transaction(
        &self,
        entry_id: EntryId,
        reason: impl Into<String>,
    ) -> Result<PostingResult, PostingError> {
        self.audit.reverse(entry_id, reason)
    }

    // ---- supplier payments ----

    pub fn pay_supplier(
        &self,
        supplier_id: PartyId,
        amount: Amount,
        idempotency_key: IdempotencyKey,
        note: Option<String>,
    ) -> Result<PostingResult, PostingError> {
        self.supplier.pay(supplier_id, amount, idempotency_key, note)
    }

    pub fn supplier_credit_note(
        &self,
        supplier_id: PartyId,
        amount: Amount,
        idempotency_key: IdempotencyKey,
        note: Option<String>,
    ) -> Result<PostingResult, PostingError> {
        self.supplier
            .credit_note(supplier_id, amount, idempotency_key, note)
    }

    // ---- reads ----

    /// Current balance for a registered party.
    ///
    /// Taken under the party lock so a concurrent posting never exposes a
    /// half-updated balance.
    pub fn get_balance(&self, party_id: PartyId) -> Result<Amount, PostingError> {
        self.parties
            .get(party_id)
            .ok_or(PostingError::PartyNotFound(party_id))?;

        let lock_set = self.locks.for_parties(&[party_id]);
        let _guards = lock_set.acquire();
        self.balances
            .current_balance(party_id)
            .map_err(PostingError::from)
    }

    /// Operator-initiated repair: rebuild the party's snapshot from history.
    ///
    /// This is the explicit follow-up to a drift report — drift itself is
    /// never healed automatically.
    pub fn recompute_balance(&self, party_id: PartyId) -> Result<Amount, PostingError> {
        self.parties
            .get(party_id)
            .ok_or(PostingError::PartyNotFound(party_id))?;

        let lock_set = self.locks.for_parties(&[party_id]);
        let _guards = lock_set.acquire();
        self.balances
            .recompute(party_id)
            .map_err(PostingError::from)
    }

    pub fn get_history(
        &self,
        party_id: PartyId,
        filter: EntryFilter,
        pagination: Pagination,
    ) -> Result<EntryPage, PostingError> {
        self.parties
            .get(party_id)
            .ok_or(PostingError::PartyNotFound(party_id))?;
        self.store
            .entries_for_party_page(party_id, filter, pagination)
            .map_err(PostingError::from)
    }

    pub fn stock_movement_for(
        &self,
        entry_id: EntryId,
    ) -> Result<Option<StockMovement>, PostingError> {
        self.store
            .movement_for_entry(entry_id)
            .map_err(PostingError::from)
    }

    // ---- audit ----

    pub fn verify_balance(&self, party_id: PartyId) -> Result<VerifyReport, PostingError> {
        self.audit.verify(party_id)
    }

    /// Start a background sweep verifying every registered party.
    ///
    /// Must be called from within a tokio runtime.
    pub fn verify_all(&self) -> SweepHandle {
        let parties = self.parties.list(None).into_iter().map(|p| p.id).collect();
        spawn_sweep(Arc::clone(&self.audit), parties)
    }
}
