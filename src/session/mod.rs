//! Reconnect-resilient writer/reader sessions.

mod session;

pub use session::{Session, SessionState};
