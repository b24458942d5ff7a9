//! Postgres-backed entry store implementation.
//!
//! Persists postings in an append-only fashion with the idempotency-key
//! uniqueness constraint and the one-reversal-per-entry constraint enforced
//! at the database level, so concurrent duplicate submissions are decided by
//! the index, never by an application-level check-then-write.
//!
//! ## Expected schema
//!
//! ```sql
//! CREATE TABLE ledger_postings (
//!     idempotency_key TEXT PRIMARY KEY,
//!     posted_at       TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE TABLE ledger_entries (
//!     entry_id        UUID PRIMARY KEY,
//!     party_id        UUID NOT NULL,
//!     amount          BIGINT NOT NULL CHECK (amount <> 0),
//!     kind            TEXT NOT NULL,
//!     occurred_at     TIMESTAMPTZ NOT NULL,
//!     reverses        UUID UNIQUE REFERENCES ledger_entries (entry_id),
//!     idempotency_key TEXT NOT NULL REFERENCES ledger_postings (idempotency_key),
//!     note            TEXT,
//!     sequence        BIGINT NOT NULL UNIQUE
//!                     GENERATED ALWAYS AS IDENTITY,
//!     created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! CREATE INDEX idx_ledger_entries_party ON ledger_entries (party_id, occurred_at, sequence);
//! CREATE INDEX idx_ledger_entries_key   ON ledger_entries (idempotency_key);
//!
//! CREATE TABLE stock_movements (
//!     movement_id    UUID PRIMARY KEY,
//!     entry_id       UUID NOT NULL UNIQUE REFERENCES ledger_entries (entry_id),
//!     quantity_delta BIGINT NOT NULL CHECK (quantity_delta <> 0),
//!     unit_value     BIGINT NOT NULL CHECK (unit_value >= 0),
//!     occurred_at    TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! ## Error mapping
//!
//! | PostgreSQL error | Constraint | `EntryStoreError` |
//! |------------------|-----------|-------------------|
//! | `23505` unique violation | `ledger_postings_pkey` | `DuplicateIdempotencyKey` (with the original posting's entry ids) |
//! | `23505` unique violation | `ledger_entries_reverses_key` | `InvalidAppend` ("already reversed") |
//! | `23505` unique violation | `stock_movements_entry_id_key` | `InvalidAppend` |
//! | `23503` foreign key violation | `ledger_entries_reverses_fkey` | `InvalidAppend` ("not found") |
//! | `23514` check violation | any | `InvalidAppend` |
//! | other database / pool errors | — | `Storage` |
//!
//! ## Thread safety
//!
//! `PostgresEntryStore` is `Send + Sync` and shares a SQLx connection pool.
//! Each `append` runs inside one database transaction: the posting row, all
//! entry rows and the optional movement row commit together or not at all.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::instrument;

use khata_core::{Amount, EntryId, IdempotencyKey, MovementId, PartyId};
use khata_ledger::{EntryDraft, EntryKind, LedgerEntry};
use khata_stock::StockMovement;

use super::query::{EntryFilter, EntryPage, Pagination};
use super::r#trait::{CommittedPosting, EntryStore, EntryStoreError};

/// Postgres-backed append-only entry store.
#[derive(Debug, Clone)]
pub struct PostgresEntryStore {
    pool: Arc<PgPool>,
}

impl PostgresEntryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Atomically commit a posting.
    ///
    /// The posting row is inserted first; a unique violation there means the
    /// idempotency key is already durably recorded and the original posting's
    /// entries are returned inside `DuplicateIdempotencyKey`.
    #[instrument(skip(self, drafts, movement), fields(legs = drafts.len()), err)]
    pub async fn append_posting(
        &self,
        drafts: Vec<EntryDraft>,
        movement: Option<StockMovement>,
    ) -> Result<CommittedPosting, EntryStoreError> {
        if drafts.is_empty() {
            return Err(EntryStoreError::InvalidAppend(
                "posting batch cannot be empty".to_string(),
            ));
        }

        let key = drafts[0].idempotency_key.clone();
        for (idx, draft) in drafts.iter().enumerate() {
            if draft.idempotency_key != key {
                return Err(EntryStoreError::InvalidAppend(format!(
                    "batch contains multiple idempotency keys (index {idx})"
                )));
            }
        }

        if let Some(m) = &movement {
            if !drafts.iter().any(|d| d.entry_id == m.entry_id) {
                return Err(EntryStoreError::InvalidAppend(
                    "stock movement must reference an entry in the same posting".to_string(),
                ));
            }
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // The posting row claims the key. Concurrent duplicates race on the
        // primary key and exactly one wins.
        let claim = sqlx::query("INSERT INTO ledger_postings (idempotency_key) VALUES ($1)")
            .bind(key.as_str())
            .execute(&mut *tx)
            .await;

        if let Err(e) = claim {
            if is_unique_violation(&e) {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                let existing = self
                    .entries_by_key(&key)
                    .await?
                    .into_iter()
                    .map(|entry| entry.entry_id)
                    .collect();
                return Err(EntryStoreError::DuplicateIdempotencyKey { key, existing });
            }
            return Err(map_sqlx_error("claim_idempotency_key", e));
        }

        let mut committed = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let row = sqlx::query(
                r#"
                INSERT INTO ledger_entries (
                    entry_id,
                    party_id,
                    amount,
                    kind,
                    occurred_at,
                    reverses,
                    idempotency_key,
                    note
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING sequence
                "#,
            )
            .bind(draft.entry_id.as_uuid())
            .bind(draft.party_id.as_uuid())
            .bind(draft.amount.minor())
            .bind(draft.kind.as_str())
            .bind(draft.occurred_at)
            .bind(draft.reverses.map(|id| *id.as_uuid()))
            .bind(draft.idempotency_key.as_str())
            .bind(draft.note.as_deref())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_append_error(&draft, e))?;

            let sequence: i64 = row
                .try_get("sequence")
                .map_err(|e| EntryStoreError::Storage(format!("failed to read sequence: {e}")))?;
            committed.push(draft.into_entry(sequence as u64));
        }

        if let Some(m) = &movement {
            sqlx::query(
                r#"
                INSERT INTO stock_movements (
                    movement_id,
                    entry_id,
                    quantity_delta,
                    unit_value,
                    occurred_at
                )
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(m.id.as_uuid())
            .bind(m.entry_id.as_uuid())
            .bind(m.quantity_delta)
            .bind(m.unit_value.minor())
            .bind(m.occurred_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EntryStoreError::InvalidAppend(format!(
                        "entry {} already has a stock movement",
                        m.entry_id
                    ))
                } else {
                    map_sqlx_error("insert_movement", e)
                }
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(CommittedPosting {
            entries: committed,
            movement,
        })
    }

    #[instrument(skip(self), fields(party_id = %party_id), err)]
    pub async fn load_party_entries(
        &self,
        party_id: PartyId,
    ) -> Result<Vec<LedgerEntry>, EntryStoreError> {
        let rows = sqlx::query(&format!(
            "{ENTRY_COLUMNS} WHERE party_id = $1 ORDER BY occurred_at ASC, sequence ASC"
        ))
        .bind(party_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_party_entries", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    pub async fn load_party_page(
        &self,
        party_id: PartyId,
        filter: EntryFilter,
        pagination: Pagination,
    ) -> Result<EntryPage, EntryStoreError> {
        let kind_param: Option<&str> = filter.kind.map(EntryKind::as_str);

        // COALESCE-style optional filters keep this one parameterized query.
        let count_row = sqlx::query(
            r#"
            SELECT COUNT(*) as total
            FROM ledger_entries
            WHERE party_id = $1
                AND ($2::text IS NULL OR kind = $2)
                AND ($3::timestamptz IS NULL OR occurred_at >= $3)
                AND ($4::timestamptz IS NULL OR occurred_at <= $4)
            "#,
        )
        .bind(party_id.as_uuid())
        .bind(kind_param)
        .bind(filter.occurred_after)
        .bind(filter.occurred_before)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_party_entries", e))?;

        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| EntryStoreError::Storage(format!("failed to read count: {e}")))?;

        let rows = sqlx::query(&format!(
            r#"
            {ENTRY_COLUMNS}
            WHERE party_id = $1
                AND ($2::text IS NULL OR kind = $2)
                AND ($3::timestamptz IS NULL OR occurred_at >= $3)
                AND ($4::timestamptz IS NULL OR occurred_at <= $4)
            ORDER BY occurred_at ASC, sequence ASC
            LIMIT $5 OFFSET $6
            "#
        ))
        .bind(party_id.as_uuid())
        .bind(kind_param)
        .bind(filter.occurred_after)
        .bind(filter.occurred_before)
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_party_page", e))?;

        let entries = rows
            .iter()
            .map(entry_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let has_more = total > (pagination.offset + pagination.limit) as i64;

        Ok(EntryPage {
            entries,
            total: total as u64,
            pagination,
            has_more,
        })
    }

    pub async fn entries_by_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Vec<LedgerEntry>, EntryStoreError> {
        let rows = sqlx::query(&format!(
            "{ENTRY_COLUMNS} WHERE idempotency_key = $1 ORDER BY sequence ASC"
        ))
        .bind(key.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("entries_by_key", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    pub async fn load_entry(
        &self,
        entry_id: EntryId,
    ) -> Result<Option<LedgerEntry>, EntryStoreError> {
        let row = sqlx::query(&format!("{ENTRY_COLUMNS} WHERE entry_id = $1"))
            .bind(entry_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_entry", e))?;

        row.as_ref().map(entry_from_row).transpose()
    }

    pub async fn load_reversal_of(
        &self,
        entry_id: EntryId,
    ) -> Result<Option<LedgerEntry>, EntryStoreError> {
        let row = sqlx::query(&format!("{ENTRY_COLUMNS} WHERE reverses = $1"))
            .bind(entry_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_reversal_of", e))?;

        row.as_ref().map(entry_from_row).transpose()
    }

    pub async fn load_last_sequence(&self, party_id: PartyId) -> Result<u64, EntryStoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence), 0) as last FROM ledger_entries WHERE party_id = $1",
        )
        .bind(party_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_last_sequence", e))?;

        let last: i64 = row
            .try_get("last")
            .map_err(|e| EntryStoreError::Storage(format!("failed to read last sequence: {e}")))?;
        Ok(last as u64)
    }

    pub async fn load_movement(
        &self,
        entry_id: EntryId,
    ) -> Result<Option<StockMovement>, EntryStoreError> {
        let row = sqlx::query(
            r#"
            SELECT movement_id, entry_id, quantity_delta, unit_value, occurred_at
            FROM stock_movements
            WHERE entry_id = $1
            "#,
        )
        .bind(entry_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_movement", e))?;

        row.as_ref().map(movement_from_row).transpose()
    }
}

const ENTRY_COLUMNS: &str = r#"
    SELECT
        entry_id,
        party_id,
        amount,
        kind,
        occurred_at,
        reverses,
        idempotency_key,
        note,
        sequence
    FROM ledger_entries
"#;

fn entry_from_row(row: &sqlx::postgres::PgRow) -> Result<LedgerEntry, EntryStoreError> {
    let read = |e: sqlx::Error| EntryStoreError::Storage(format!("failed to read entry row: {e}"));

    let entry_id: uuid::Uuid = row.try_get("entry_id").map_err(read)?;
    let party_id: uuid::Uuid = row.try_get("party_id").map_err(read)?;
    let amount: i64 = row.try_get("amount").map_err(read)?;
    let kind: String = row.try_get("kind").map_err(read)?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at").map_err(read)?;
    let reverses: Option<uuid::Uuid> = row.try_get("reverses").map_err(read)?;
    let idempotency_key: String = row.try_get("idempotency_key").map_err(read)?;
    let note: Option<String> = row.try_get("note").map_err(read)?;
    let sequence: i64 = row.try_get("sequence").map_err(read)?;

    let kind: EntryKind = kind
        .parse()
        .map_err(|e| EntryStoreError::Storage(format!("failed to parse entry kind: {e}")))?;
    let idempotency_key = IdempotencyKey::new(idempotency_key)
        .map_err(|e| EntryStoreError::Storage(format!("stored idempotency key invalid: {e}")))?;

    Ok(LedgerEntry {
        entry_id: EntryId::from_uuid(entry_id),
        party_id: PartyId::from_uuid(party_id),
        amount: Amount::from_minor(amount),
        kind,
        occurred_at,
        reverses: reverses.map(EntryId::from_uuid),
        idempotency_key,
        note,
        sequence: sequence as u64,
    })
}

fn movement_from_row(row: &sqlx::postgres::PgRow) -> Result<StockMovement, EntryStoreError> {
    let read =
        |e: sqlx::Error| EntryStoreError::Storage(format!("failed to read movement row: {e}"));

    let movement_id: uuid::Uuid = row.try_get("movement_id").map_err(read)?;
    let entry_id: uuid::Uuid = row.try_get("entry_id").map_err(read)?;
    let quantity_delta: i64 = row.try_get("quantity_delta").map_err(read)?;
    let unit_value: i64 = row.try_get("unit_value").map_err(read)?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at").map_err(read)?;

    StockMovement::new(
        MovementId::from_uuid(movement_id),
        EntryId::from_uuid(entry_id),
        quantity_delta,
        Amount::from_minor(unit_value),
        occurred_at,
    )
    .map_err(|e| EntryStoreError::Storage(format!("stored movement invalid: {e}")))
}

/// Map per-entry insert failures onto append semantics.
fn map_append_error(draft: &EntryDraft, err: sqlx::Error) -> EntryStoreError {
    if let sqlx::Error::Database(db_err) = &err {
        let constraint = db_err.constraint().unwrap_or_default();
        if let Some(code) = db_err.code() {
            match code.as_ref() {
                "23505" if constraint.contains("reverses") => {
                    return EntryStoreError::InvalidAppend(format!(
                        "entry {} is already reversed",
                        draft
                            .reverses
                            .map(|id| id.to_string())
                            .unwrap_or_else(|| "?".to_string())
                    ));
                }
                "23505" => {
                    return EntryStoreError::InvalidAppend(format!(
                        "entry id {} already exists",
                        draft.entry_id
                    ));
                }
                "23503" if constraint.contains("reverses") => {
                    return EntryStoreError::InvalidAppend(format!(
                        "reversed entry {} not found",
                        draft
                            .reverses
                            .map(|id| id.to_string())
                            .unwrap_or_else(|| "?".to_string())
                    ));
                }
                _ => {}
            }
        }
    }
    map_sqlx_error("insert_entry", err)
}

/// Map SQLx errors to `EntryStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EntryStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                // Constraint violations are append invariants, not storage faults.
                Some("23505") | Some("23503") | Some("23514") => {
                    EntryStoreError::InvalidAppend(msg)
                }
                _ => EntryStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EntryStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => EntryStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// The EntryStore trait is synchronous; Postgres operations require async.
// As with the rest of the engine, this works when called from within a tokio
// runtime (e.g. from request handlers): we bridge with the runtime handle.

fn runtime_handle() -> Result<tokio::runtime::Handle, EntryStoreError> {
    tokio::runtime::Handle::try_current().map_err(|_| {
        EntryStoreError::Storage(
            "PostgresEntryStore requires a tokio runtime context".to_string(),
        )
    })
}

impl EntryStore for PostgresEntryStore {
    fn append(
        &self,
        drafts: Vec<EntryDraft>,
        movement: Option<StockMovement>,
    ) -> Result<CommittedPosting, EntryStoreError> {
        runtime_handle()?.block_on(self.append_posting(drafts, movement))
    }

    fn entries_for_party(&self, party_id: PartyId) -> Result<Vec<LedgerEntry>, EntryStoreError> {
        runtime_handle()?.block_on(self.load_party_entries(party_id))
    }

    fn entries_for_party_page(
        &self,
        party_id: PartyId,
        filter: EntryFilter,
        pagination: Pagination,
    ) -> Result<EntryPage, EntryStoreError> {
        runtime_handle()?.block_on(self.load_party_page(party_id, filter, pagination))
    }

    fn entries_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Vec<LedgerEntry>, EntryStoreError> {
        runtime_handle()?.block_on(self.entries_by_key(key))
    }

    fn entry_by_id(&self, entry_id: EntryId) -> Result<Option<LedgerEntry>, EntryStoreError> {
        runtime_handle()?.block_on(self.load_entry(entry_id))
    }

    fn reversal_of(&self, entry_id: EntryId) -> Result<Option<LedgerEntry>, EntryStoreError> {
        runtime_handle()?.block_on(self.load_reversal_of(entry_id))
    }

    fn last_sequence_for_party(&self, party_id: PartyId) -> Result<u64, EntryStoreError> {
        runtime_handle()?.block_on(self.load_last_sequence(party_id))
    }

    fn movement_for_entry(
        &self,
        entry_id: EntryId,
    ) -> Result<Option<StockMovement>, EntryStoreError> {
        runtime_handle()?.block_on(self.load_movement(entry_id))
    }
}
