//! `khata-stock` — inventory movements tied to ledger entries.

pub mod movement;

pub use movement::StockMovement;
