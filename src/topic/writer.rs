//! Writer handle: publication operations and connectivity helpers.

use super::registry::{TopicCore, Updater};
use crate::connectivity::PeerWatch;
use crate::error::{BusError, Result};
use crate::types::{Sample, SampleEvent, SessionId};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// Publishes samples into a topic.
///
/// Single-key writers use the bare operations (`add`, `update`, ...);
/// filtered and wildcard writers use the keyed variants (`add_to`, ...).
/// Dropping the handle unregisters the writer; its retained history stays
/// available to late readers until it expires.
pub struct Writer<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    core: Arc<TopicCore<K, V>>,
    id: SessionId,
    exact_key: Option<K>,
}

impl<K, V> Writer<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(core: Arc<TopicCore<K, V>>, id: SessionId, exact_key: Option<K>) -> Self {
        Self {
            core,
            id,
            exact_key,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    fn exact(&self) -> Result<K> {
        self.exact_key.clone().ok_or(BusError::KeyRequired)
    }

    // --- Single-key operations ---

    pub fn add(&self, value: V) -> Result<Sample<K, V>> {
        self.add_to(self.exact()?, value)
    }

    pub fn update(&self, value: V) -> Result<Sample<K, V>> {
        self.update_to(self.exact()?, value)
    }

    pub fn remove(&self) -> Result<Sample<K, V>> {
        self.remove_at(self.exact()?)
    }

    /// Apply a partial update: the registered updater for `tag` computes the
    /// new value from the current one and `delta`.
    pub fn partial_update(&self, tag: &str, delta: V) -> Result<Sample<K, V>> {
        self.partial_update_at(self.exact()?, tag, delta)
    }

    // --- Keyed operations ---

    pub fn add_to(&self, key: K, value: V) -> Result<Sample<K, V>> {
        self.core
            .publish(self.id, key, SampleEvent::Add, Some(value), None)
    }

    pub fn update_to(&self, key: K, value: V) -> Result<Sample<K, V>> {
        self.core
            .publish(self.id, key, SampleEvent::Update, Some(value), None)
    }

    pub fn remove_at(&self, key: K) -> Result<Sample<K, V>> {
        self.core
            .publish(self.id, key, SampleEvent::Remove, None, None)
    }

    pub fn partial_update_at(&self, key: K, tag: &str, delta: V) -> Result<Sample<K, V>> {
        self.core.publish(
            self.id,
            key,
            SampleEvent::PartialUpdate,
            None,
            Some((tag.to_string(), delta)),
        )
    }

    /// Register the updater function applied by `partial_update` for `tag`.
    pub fn register_updater(
        &self,
        tag: &str,
        updater: impl Fn(&V, &V) -> V + Send + Sync + 'static,
    ) -> Result<()> {
        let updater: Updater<V> = Arc::new(updater);
        self.core.register_updater(self.id, tag, updater)
    }

    /// The currently retained samples of this writer, oldest first.
    pub fn get_all(&self) -> Result<Vec<Sample<K, V>>> {
        self.core.writer_history(self.id)
    }

    /// Samples dropped from this writer's retained history so far
    /// (retention diagnostic).
    pub fn evicted_count(&self) -> Result<u64> {
        self.core.writer_evicted_count(self.id)
    }

    // --- Connectivity ---

    pub fn connected_readers(&self) -> Vec<String> {
        self.core.connected_readers(self.id)
    }

    /// Block until at least `n` readers are connected for this writer's
    /// key space. Returns whether the condition held before the timeout.
    pub fn wait_for_readers(&self, n: usize, timeout: Option<Duration>) -> bool {
        self.core.wait_for_readers(self.id, n, timeout)
    }

    pub fn wait_for_no_readers(&self, timeout: Option<Duration>) -> bool {
        self.core.wait_for_no_readers(self.id, timeout)
    }

    /// Watch reader connectivity: an initial snapshot, then change events.
    pub fn watch_connected_readers(&self) -> PeerWatch {
        self.core.watch_connected_readers(self.id)
    }
}

impl<K, V> Drop for Writer<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.core.unregister_writer(self.id);
    }
}
