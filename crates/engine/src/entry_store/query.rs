//! History query types.
//!
//! Paginated, filtered reads over a party's entry history, for ledger
//! statements and inspection. All queries are party-scoped and paginated by
//! default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use khata_ledger::{EntryKind, LedgerEntry};

/// Pagination parameters for history queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of entries to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50, // Safe default
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000), // Cap at 1000 for safety
            offset: offset.unwrap_or(0),
        }
    }
}

/// Filter criteria for history queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryFilter {
    /// Filter by entry kind (optional).
    pub kind: Option<EntryKind>,
    /// Filter entries that occurred at or after this time (optional).
    pub occurred_after: Option<DateTime<Utc>>,
    /// Filter entries that occurred at or before this time (optional).
    pub occurred_before: Option<DateTime<Utc>>,
}

impl EntryFilter {
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        if let Some(kind) = self.kind {
            if entry.kind != kind {
                return false;
            }
        }
        if let Some(after) = self.occurred_after {
            if entry.occurred_at < after {
                return false;
            }
        }
        if let Some(before) = self.occurred_before {
            if entry.occurred_at > before {
                return false;
            }
        }
        true
    }
}

/// Paginated history query result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPage {
    /// The entries matching the query, ordered by (occurred_at, sequence).
    pub entries: Vec<LedgerEntry>,
    /// Total number of entries matching the filter (across all pages).
    pub total: u64,
    /// Pagination parameters used.
    pub pagination: Pagination,
    /// Whether there are more entries available.
    pub has_more: bool,
}
