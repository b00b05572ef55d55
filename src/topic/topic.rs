//! Public topic handle and writer/reader factories.

use super::reader::Reader;
use super::registry::{KeyScope, TopicCore};
use super::writer::Writer;
use crate::error::Result;
use crate::session::SessionState;
use crate::transport::Connection;
use crate::types::{RetentionConfig, SessionId};
use std::hash::Hash;
use std::sync::Arc;

/// A typed key-value stream.
///
/// Writers publish samples under keys; readers subscribe by exact key,
/// predicate, or wildcard. Per-key stores are created lazily on first
/// publish and destroyed once nothing references the key and retained
/// history has expired. Handles share the topic by reference counting;
/// `close` tears it down explicitly, cancelling blocked pulls.
pub struct Topic<K, V> {
    core: Arc<TopicCore<K, V>>,
}

impl<K, V> Clone for Topic<K, V> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<K, V> Topic<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: TopicCore::new(name),
        }
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    // --- Writer factories ---

    /// Writer bound to exactly one key.
    pub fn single_key_writer(
        &self,
        key: K,
        name: Option<&str>,
        config: RetentionConfig,
    ) -> Result<Writer<K, V>> {
        let id = self
            .core
            .register_writer(name, KeyScope::Exact(key.clone()), config)?;
        Ok(Writer::new(Arc::clone(&self.core), id, Some(key)))
    }

    /// Writer publishing to every key matching a predicate.
    pub fn filtered_key_writer(
        &self,
        predicate: impl Fn(&K) -> bool + Send + Sync + 'static,
        name: Option<&str>,
        config: RetentionConfig,
    ) -> Result<Writer<K, V>> {
        let id = self
            .core
            .register_writer(name, KeyScope::Filtered(Arc::new(predicate)), config)?;
        Ok(Writer::new(Arc::clone(&self.core), id, None))
    }

    /// Writer publishing to any key of the topic.
    pub fn any_key_writer(&self, name: Option<&str>, config: RetentionConfig) -> Result<Writer<K, V>> {
        let id = self.core.register_writer(name, KeyScope::Any, config)?;
        Ok(Writer::new(Arc::clone(&self.core), id, None))
    }

    // --- Reader factories ---

    /// Reader subscribed to exactly one key.
    pub fn single_key_reader(
        &self,
        key: K,
        name: Option<&str>,
        config: RetentionConfig,
    ) -> Result<Reader<K, V>> {
        let (id, shared) = self
            .core
            .register_reader(name, KeyScope::Exact(key), config)?;
        Ok(Reader::new(Arc::clone(&self.core), id, shared))
    }

    /// Reader subscribed to every key matching a predicate.
    pub fn filtered_key_reader(
        &self,
        predicate: impl Fn(&K) -> bool + Send + Sync + 'static,
        name: Option<&str>,
        config: RetentionConfig,
    ) -> Result<Reader<K, V>> {
        let (id, shared) = self
            .core
            .register_reader(name, KeyScope::Filtered(Arc::new(predicate)), config)?;
        Ok(Reader::new(Arc::clone(&self.core), id, shared))
    }

    /// Reader subscribed to any key of the topic.
    pub fn any_key_reader(&self, name: Option<&str>, config: RetentionConfig) -> Result<Reader<K, V>> {
        let (id, shared) = self.core.register_reader(name, KeyScope::Any, config)?;
        Ok(Reader::new(Arc::clone(&self.core), id, shared))
    }

    // --- Sessions ---

    /// Attach a transport connection to the session between a writer and a
    /// reader. Rebinding after a drop resumes delivery from the session
    /// cursor.
    pub fn bind_session(
        &self,
        writer: SessionId,
        reader: SessionId,
        connection: Arc<dyn Connection>,
    ) -> Result<()> {
        self.core.bind_session(writer, reader, connection)
    }

    pub fn session_state(&self, writer: SessionId, reader: SessionId) -> Option<SessionState> {
        self.core.session_state(writer, reader)
    }

    // --- Housekeeping ---

    /// Drop lifetime-expired samples and collect fully-drained retired
    /// stores. Returns the number of samples dropped.
    pub fn evict_expired(&self) -> usize {
        self.core.evict_expired()
    }

    /// Tear the topic down. Blocked pulls are cancelled with
    /// [`BusError::Closed`](crate::BusError::Closed) instead of hanging.
    pub fn close(&self) {
        self.core.close()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}
