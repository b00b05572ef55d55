//! Per-key sample history with retention and eviction.

mod store;

pub use store::HistoryStore;
