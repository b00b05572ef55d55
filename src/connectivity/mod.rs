//! Connectivity notification: who is connected for which keys, as events.
//!
//! Watches follow a snapshot-then-changes contract: the initial snapshot is
//! taken exactly once, atomically with watch registration, so no peer or key
//! appears in both the snapshot and a subsequent `Connect` event, and no
//! `Disconnect` arrives for an id absent from both.

mod hub;
mod types;

pub(crate) use hub::{ConnectivityHub, PeerKind};
pub use types::{ChangeReason, KeyEvent, KeyWatch, PeerEvent, PeerWatch, WatchId};
