//! Per writer–reader session: delivery cursor and transport lifecycle.

use crate::transport::Connection;
use crate::types::{KeyId, SequenceNr, SessionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Session lifecycle state.
///
/// The normal cycle is `Connecting -> Connected -> Disconnected ->
/// Connected -> ...`; `Closed` is terminal and only reached on explicit
/// teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

/// A logical channel between one writer and one reader.
///
/// A session outlives individual transport connections: across a reconnect
/// only `state` and the connection handle change, the per-key delivery
/// cursor is preserved. The cursor records the highest sequence number
/// routed to the reader for each key, counting samples the arbiter dropped
/// (discard decisions are final and are never replayed).
pub struct Session {
    id: SessionId,
    writer: SessionId,
    reader: SessionId,
    state: Mutex<SessionState>,
    cursor: Mutex<HashMap<KeyId, SequenceNr>>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
}

impl Session {
    /// New in-process session. The in-process link is immediately open, so
    /// the session starts `Connected`; binding a real transport connection
    /// moves it through the normal cycle.
    pub(crate) fn new(id: SessionId, writer: SessionId, reader: SessionId) -> Self {
        Self {
            id,
            writer,
            reader,
            state: Mutex::new(SessionState::Connected),
            cursor: Mutex::new(HashMap::new()),
            connection: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn writer(&self) -> SessionId {
        self.writer
    }

    pub fn reader(&self) -> SessionId {
        self.reader
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Set the state, returning the previous one. Closed is terminal.
    pub(crate) fn set_state(&self, next: SessionState) -> SessionState {
        let mut state = self.state.lock();
        let prev = *state;
        if prev != SessionState::Closed {
            *state = next;
            if prev != next {
                debug!(session = %self.id, ?prev, ?next, "session state transition");
            }
        }
        prev
    }

    /// Transition to Disconnected on transport loss. Returns whether the
    /// session was live before. Cursor and reader-side unread samples are
    /// untouched.
    pub(crate) fn mark_disconnected(&self) -> bool {
        matches!(
            self.set_state(SessionState::Disconnected),
            SessionState::Connected | SessionState::Connecting
        )
    }

    pub(crate) fn close(&self) {
        self.set_state(SessionState::Closed);
    }

    /// Last routed sequence number for `key` (0 = nothing routed yet).
    pub fn cursor_for(&self, key: KeyId) -> SequenceNr {
        self.cursor
            .lock()
            .get(&key)
            .copied()
            .unwrap_or(SequenceNr(0))
    }

    /// Advance the cursor for `key`. Never moves backwards.
    pub(crate) fn advance_cursor(&self, key: KeyId, sequence: SequenceNr) {
        let mut cursor = self.cursor.lock();
        let entry = cursor.entry(key).or_insert(SequenceNr(0));
        if sequence > *entry {
            *entry = sequence;
        }
    }

    pub(crate) fn bind_connection(&self, connection: Arc<dyn Connection>) {
        *self.connection.lock() = Some(connection);
    }

    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.lock().clone()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("writer", &self.writer)
            .field("reader", &self.reader)
            .field("state", &self.state())
            .finish()
    }
}
