//! `khata-parties` — the parties a ledger can be kept against.

pub mod party;

pub use party::{Party, PartyKind};
