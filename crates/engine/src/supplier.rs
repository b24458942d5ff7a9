//! Supplier payment adapter.
//!
//! Thin specialization of the poster for supplier-side cash-out. A supplier's
//! balance is what the company owes them: paying the supplier decreases it,
//! a credit note increases it. The adapter only translates into posting
//! intents — every invariant (idempotency, atomicity, locking) comes from
//! the shared posting path, and no new state is added here.

use std::sync::Arc;

use khata_core::{Amount, IdempotencyKey, PartyId};
use khata_ledger::{EntryKind, PostingIntent};
use khata_parties::Party;

use crate::balances::BalanceSnapshot;
use crate::entry_store::EntryStore;
use crate::poster::{PostingError, PostingResult, TransactionPoster};
use crate::read_model::KvStore;
use crate::registry::PartyRegistry;

/// Posts supplier payments and credit notes through the shared poster.
#[derive(Debug)]
pub struct SupplierPaymentAdapter<E, P, B> {
    poster: Arc<TransactionPoster<E, P, B>>,
    parties: Arc<PartyRegistry<P>>,
}

impl<E, P, B> SupplierPaymentAdapter<E, P, B>
where
    E: EntryStore,
    P: KvStore<PartyId, Party>,
    B: KvStore<PartyId, BalanceSnapshot>,
{
    pub fn new(poster: Arc<TransactionPoster<E, P, B>>, parties: Arc<PartyRegistry<P>>) -> Self {
        Self { poster, parties }
    }

    /// Pay a supplier: decreases what the company owes them.
    ///
    /// `amount` is the positive cash amount paid out.
    pub fn pay(
        &self,
        supplier_id: PartyId,
        amount: Amount,
        idempotency_key: IdempotencyKey,
        note: Option<String>,
    ) -> Result<PostingResult, PostingError> {
        let leg_amount = self.check(supplier_id, amount)?.checked_neg()?;
        self.post(supplier_id, leg_amount, idempotency_key, note)
    }

    /// Record a supplier credit note: increases what the company owes them.
    pub fn credit_note(
        &self,
        supplier_id: PartyId,
        amount: Amount,
        idempotency_key: IdempotencyKey,
        note: Option<String>,
    ) -> Result<PostingResult, PostingError> {
        let leg_amount = self.check(supplier_id, amount)?;
        self.post(supplier_id, leg_amount, idempotency_key, note)
    }

    fn check(&self, supplier_id: PartyId, amount: Amount) -> Result<Amount, PostingError> {
        if !amount.is_positive() {
            return Err(PostingError::Validation(
                "supplier payment amount must be positive".to_string(),
            ));
        }

        let party = self
            .parties
            .get(supplier_id)
            .ok_or(PostingError::PartyNotFound(supplier_id))?;
        if !party.is_supplier() {
            return Err(PostingError::Validation(format!(
                "party {supplier_id} is not a supplier"
            )));
        }

        Ok(amount)
    }

    fn post(
        &self,
        supplier_id: PartyId,
        leg_amount: Amount,
        idempotency_key: IdempotencyKey,
        note: Option<String>,
    ) -> Result<PostingResult, PostingError> {
        let mut intent = PostingIntent::single(
            supplier_id,
            leg_amount,
            EntryKind::Payment,
            idempotency_key,
            chrono::Utc::now(),
        );
        intent.note = note;
        self.poster.post(intent)
    }
}
