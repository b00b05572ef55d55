//! Discard arbitration applied before delivery to a reader.

mod discard;

pub use discard::{AdmitContext, DiscardArbiter};
