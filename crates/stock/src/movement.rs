use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use khata_core::{Amount, DomainError, DomainResult, EntryId, MovementId};

/// An inventory change caused by a stock-affecting ledger entry.
///
/// Each movement belongs to exactly one entry; an entry has at most one
/// movement (purely financial entries have none). Movements inherit the
/// immutability of their entry: corrections go through a new posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: MovementId,
    /// The ledger entry this movement belongs to.
    pub entry_id: EntryId,
    /// Signed quantity change (negative = stock leaves the company).
    pub quantity_delta: i64,
    /// Valuation per unit, in minor units.
    pub unit_value: Amount,
    pub occurred_at: DateTime<Utc>,
}

impl StockMovement {
    pub fn new(
        id: MovementId,
        entry_id: EntryId,
        quantity_delta: i64,
        unit_value: Amount,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if quantity_delta == 0 {
            return Err(DomainError::validation(
                "stock movement quantity must be non-zero",
            ));
        }
        if unit_value.is_negative() {
            return Err(DomainError::validation(
                "stock movement unit value cannot be negative",
            ));
        }

        Ok(Self {
            id,
            entry_id,
            quantity_delta,
            unit_value,
            occurred_at,
        })
    }

    /// Total signed value of the movement (quantity × unit value), exact.
    pub fn value(&self) -> DomainResult<Amount> {
        let total = (self.quantity_delta as i128) * (self.unit_value.minor() as i128);
        let minor = i64::try_from(total).map_err(|_| DomainError::AmountOverflow)?;
        Ok(Amount::from_minor(minor))
    }
}
