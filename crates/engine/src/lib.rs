//! Infrastructure layer: entry storage, balance aggregation, posting,
//! reconciliation, and the service facade consumed by the request layer.

pub mod audit;
pub mod balances;
pub mod entry_store;
pub mod locks;
pub mod poster;
pub mod read_model;
pub mod registry;
pub mod service;
pub mod supplier;

#[cfg(test)]
mod integration_tests;
