//! Append-only ledger entry store boundary.
//!
//! This module defines the infrastructure-facing abstraction for durably
//! recording postings and reading entry history, without making storage
//! assumptions. Two implementations ship: an in-memory store for tests/dev
//! and a Postgres-backed store for production.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryEntryStore;
pub use postgres::PostgresEntryStore;
pub use query::{EntryFilter, EntryPage, Pagination};
pub use r#trait::{CommittedPosting, EntryStore, EntryStoreError};
