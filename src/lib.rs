//! # Keybus
//!
//! A keyed publish/subscribe distribution core: topics expose typed
//! key-value streams, writers publish samples under keys, readers subscribe
//! by exact key, predicate, or wildcard.
//!
//! ## Core Concepts
//!
//! - **Samples**: Immutable publication events (add/update/remove/partial-update)
//! - **History**: Per-key bounded buffers with clear/count/lifetime retention
//! - **Arbitration**: Priority and send-time discard before reader delivery
//! - **Sessions**: Reconnect-resilient delivery cursors per writer-reader pair
//!
//! ## Example
//!
//! ```ignore
//! use keybus::{RetentionConfig, Topic};
//!
//! let topic: Topic<String, String> = Topic::new("telemetry");
//!
//! let writer = topic.single_key_writer("engine".into(), None, RetentionConfig::default())?;
//! let reader = topic.single_key_reader("engine".into(), None, RetentionConfig::default())?;
//!
//! writer.add("running".into())?;
//! let sample = reader.next_unread(None)?.unwrap();
//! assert_eq!(sample.value.as_deref(), Some("running"));
//! ```

pub mod arbiter;
pub mod connectivity;
pub mod error;
pub mod history;
pub mod session;
pub mod topic;
pub mod transport;
pub mod types;

// Re-exports
pub use arbiter::{AdmitContext, DiscardArbiter};
pub use connectivity::{ChangeReason, KeyEvent, KeyWatch, PeerEvent, PeerWatch, WatchId};
pub use error::{BusError, Result};
pub use history::HistoryStore;
pub use session::{Session, SessionState};
pub use topic::{KeyScope, Reader, Topic, Writer};
pub use transport::{Connection, Discovery, InProcessConnection, PeerInfo};
pub use types::*;
