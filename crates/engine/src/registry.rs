//! Party registry.
//!
//! Lookup table for the parties a ledger can be kept against. Backed by the
//! same KV abstraction as the balance snapshots; production deployments can
//! substitute a persistent store without touching the poster.

use khata_core::{DomainError, DomainResult, PartyId};
use khata_parties::{Party, PartyKind};

use crate::read_model::KvStore;

/// Registry of known parties.
#[derive(Debug)]
pub struct PartyRegistry<S> {
    store: S,
}

impl<S> PartyRegistry<S>
where
    S: KvStore<PartyId, Party>,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Register a new party. Registering the same id twice is a validation
    /// error; parties are not upserted.
    pub fn register(&self, party: Party) -> DomainResult<Party> {
        if self.store.get(&party.id).is_some() {
            return Err(DomainError::validation(format!(
                "party {} is already registered",
                party.id
            )));
        }
        self.store.upsert(party.id, party.clone());
        Ok(party)
    }

    pub fn get(&self, party_id: PartyId) -> Option<Party> {
        self.store.get(&party_id)
    }

    /// All registered parties, optionally restricted to one kind, sorted by
    /// display name.
    pub fn list(&self, kind: Option<PartyKind>) -> Vec<Party> {
        let mut parties: Vec<Party> = self
            .store
            .list()
            .into_iter()
            .filter(|p| kind.is_none_or(|k| p.kind == k))
            .collect();
        parties.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        parties
    }
}
