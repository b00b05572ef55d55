//! Reader handle: consumption operations and connectivity helpers.

use super::registry::{BatchCallback, ReaderShared, SampleCallback, TopicCore};
use crate::connectivity::{KeyWatch, PeerWatch};
use crate::error::Result;
use crate::types::{Sample, SessionId};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// Consumes samples from a topic.
///
/// Samples arrive in write order per writer; consumption is by blocking
/// pull (`next_unread`), drain (`get_all_unread`), or callbacks
/// (`on_samples`). Dropping the handle unregisters the reader and cancels
/// any blocked pull.
pub struct Reader<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    core: Arc<TopicCore<K, V>>,
    id: SessionId,
    shared: Arc<ReaderShared<K, V>>,
}

impl<K, V> Reader<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        core: Arc<TopicCore<K, V>>,
        id: SessionId,
        shared: Arc<ReaderShared<K, V>>,
    ) -> Self {
        Self { core, id, shared }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    // --- Consumption ---

    /// Take the next unread sample, blocking until one is available, the
    /// timeout passes (`Ok(None)`, nothing consumed), or the topic closes
    /// (`Err(Closed)`).
    pub fn next_unread(&self, timeout: Option<Duration>) -> Result<Option<Sample<K, V>>> {
        self.shared.next_unread(timeout)
    }

    /// Drain every unread sample, in arrival order.
    pub fn get_all_unread(&self) -> Vec<Sample<K, V>> {
        self.shared.get_all_unread()
    }

    pub fn has_unread(&self) -> bool {
        self.shared.has_unread()
    }

    pub fn unread_count(&self) -> usize {
        self.shared.unread_count()
    }

    /// Block until at least `n` samples are unread. Returns whether the
    /// condition held before the timeout.
    pub fn wait_for_unread(&self, n: usize, timeout: Option<Duration>) -> bool {
        self.shared.wait_for_unread(n, timeout)
    }

    /// Register delivery callbacks, invoked from the delivery path (they
    /// must not block). The current backlog is flushed to `on_batch` once;
    /// live samples then invoke `on_single`, and reconnect replays arrive
    /// through `on_batch`.
    pub fn on_samples(&self, on_batch: BatchCallback<K, V>, on_single: SampleCallback<K, V>) {
        self.shared.set_callbacks(on_batch, on_single);
    }

    /// Samples known to have been evicted before this reader could observe
    /// them (silent gap diagnostic).
    pub fn evicted_gap_count(&self) -> u64 {
        self.shared.evicted_gap_count()
    }

    // --- Connectivity ---

    pub fn connected_writers(&self) -> Vec<String> {
        self.core.connected_writers(self.id)
    }

    /// Keys currently having at least one bound writer, within this
    /// reader's scope.
    pub fn connected_keys(&self) -> Vec<K> {
        self.core.connected_keys(self.id)
    }

    /// Block until at least `n` writers are connected for this reader's
    /// key space. Returns whether the condition held before the timeout.
    pub fn wait_for_writers(&self, n: usize, timeout: Option<Duration>) -> bool {
        self.core.wait_for_writers(self.id, n, timeout)
    }

    pub fn wait_for_no_writers(&self, timeout: Option<Duration>) -> bool {
        self.core.wait_for_no_writers(self.id, timeout)
    }

    /// Watch writer connectivity: an initial snapshot, then change events.
    pub fn watch_connected_writers(&self) -> PeerWatch {
        self.core.watch_connected_writers(self.id)
    }

    /// Watch key activity: an initial snapshot, then change events.
    pub fn watch_connected_keys(&self) -> KeyWatch<K> {
        self.core.watch_connected_keys(self.id)
    }
}

impl<K, V> Drop for Reader<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.core.unregister_reader(self.id);
    }
}
