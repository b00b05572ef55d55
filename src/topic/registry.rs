//! Topic core: key interning, writer/reader registry, routing, and replay.
//!
//! Lock order: `registry` (RwLock) -> writer `stores` -> reader `queue` ->
//! reader `callbacks`; `Session` and arbiter mutexes and the hub watcher
//! list are leaves. Connectivity change events are sent while the registry
//! write lock is held (snapshot-then-changes atomicity); `hub.bump()` and
//! user callbacks run only after every registry lock is released.

use crate::arbiter::{AdmitContext, DiscardArbiter};
use crate::connectivity::{ChangeReason, ConnectivityHub, KeyWatch, PeerKind, PeerWatch};
use crate::error::{BusError, Result};
use crate::history::HistoryStore;
use crate::session::{Session, SessionState};
use crate::transport::Connection;
use crate::types::{
    DiscardPolicy, KeyId, RetentionConfig, Sample, SampleEvent, SequenceNr, SessionId, Timestamp,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Key predicate for filtered subscriptions.
pub type Predicate<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

/// Partial-update application function: `(current, delta) -> new value`.
pub type Updater<V> = Arc<dyn Fn(&V, &V) -> V + Send + Sync>;

/// Callback for batches (catch-up backlog, reconnect replay).
pub type BatchCallback<K, V> = Box<dyn Fn(&[Sample<K, V>]) + Send>;

/// Callback for individual live samples.
pub type SampleCallback<K, V> = Box<dyn Fn(&Sample<K, V>) + Send>;

/// Which keys a writer publishes to, or a reader subscribes to.
pub enum KeyScope<K> {
    /// Exactly one key.
    Exact(K),
    /// Every key matching a predicate.
    Filtered(Predicate<K>),
    /// Every key of the topic.
    Any,
}

impl<K: PartialEq> KeyScope<K> {
    pub fn matches(&self, key: &K) -> bool {
        match self {
            KeyScope::Exact(k) => k == key,
            KeyScope::Filtered(predicate) => predicate(key),
            KeyScope::Any => true,
        }
    }

    /// Conservative scope intersection test for peer connectivity: two
    /// filtered scopes are assumed to overlap.
    pub(crate) fn could_overlap(&self, other: &KeyScope<K>) -> bool {
        match (self, other) {
            (KeyScope::Exact(a), KeyScope::Exact(b)) => a == b,
            (KeyScope::Exact(k), KeyScope::Filtered(p))
            | (KeyScope::Filtered(p), KeyScope::Exact(k)) => p(k),
            _ => true,
        }
    }

    pub(crate) fn exact_key(&self) -> Option<&K> {
        match self {
            KeyScope::Exact(k) => Some(k),
            _ => None,
        }
    }
}

impl<K: Clone> Clone for KeyScope<K> {
    fn clone(&self) -> Self {
        match self {
            KeyScope::Exact(k) => KeyScope::Exact(k.clone()),
            KeyScope::Filtered(p) => KeyScope::Filtered(Arc::clone(p)),
            KeyScope::Any => KeyScope::Any,
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for KeyScope<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyScope::Exact(k) => write!(f, "Exact({:?})", k),
            KeyScope::Filtered(_) => write!(f, "Filtered(..)"),
            KeyScope::Any => write!(f, "Any"),
        }
    }
}

struct SampleCallbacks<K, V> {
    on_batch: BatchCallback<K, V>,
    on_single: SampleCallback<K, V>,
}

/// Writer-side registry entry: scope, per-key history, updaters.
struct WriterEntry<K, V> {
    id: SessionId,
    name: String,
    scope: KeyScope<K>,
    config: RetentionConfig,
    stores: Mutex<HashMap<KeyId, HistoryStore<K, V>>>,
    updaters: RwLock<HashMap<String, Updater<V>>>,
}

/// Reader-side state shared between the registry and the `Reader` handle.
pub(crate) struct ReaderShared<K, V> {
    config: RetentionConfig,
    queue: Mutex<ReaderQueue<K, V>>,
    available: Condvar,
    arbiter: Mutex<DiscardArbiter>,
    callbacks: Mutex<Option<SampleCallbacks<K, V>>>,
    gaps: AtomicU64,
    closed: AtomicBool,
}

/// The reader's merged per-key view plus arrival order.
///
/// `stores` holds exactly the not-yet-consumed samples; `arrival` records
/// admission order. An arrival entry whose sample was since evicted or
/// coalesced away is skipped during consumption.
struct ReaderQueue<K, V> {
    stores: HashMap<KeyId, HistoryStore<K, V>>,
    arrival: VecDeque<(KeyId, SessionId, SequenceNr)>,
}

impl<K: Clone, V: Clone> ReaderQueue<K, V> {
    fn new() -> Self {
        Self {
            stores: HashMap::new(),
            arrival: VecDeque::new(),
        }
    }

    fn push(&mut self, key: KeyId, sample: Sample<K, V>, now: Timestamp, config: &RetentionConfig) {
        if config.discard_policy == DiscardPolicy::SendTime {
            // Last-value-wins: a newer admitted sample displaces older
            // unconsumed ones for the same key.
            if let Some(store) = self.stores.get_mut(&key) {
                store.prune_older_than(sample.timestamp);
            }
        }

        let entry = (key, sample.origin, sample.sequence);
        let store = self
            .stores
            .entry(key)
            .or_insert_with(|| HistoryStore::new(config.clone()));
        store.append(sample, now);
        self.arrival.push_back(entry);
    }

    fn pop_resolved(&mut self) -> Option<Sample<K, V>> {
        while let Some((key, origin, sequence)) = self.arrival.pop_front() {
            if let Some(sample) = self
                .stores
                .get_mut(&key)
                .and_then(|store| store.take(origin, sequence))
            {
                return Some(sample);
            }
        }
        None
    }

    fn peek_all(&self) -> Vec<Sample<K, V>> {
        self.arrival
            .iter()
            .filter_map(|(key, origin, sequence)| {
                self.stores
                    .get(key)
                    .and_then(|store| store.get(*origin, *sequence))
                    .cloned()
            })
            .collect()
    }

    fn unread_count(&self) -> usize {
        self.stores.values().map(|store| store.len()).sum()
    }

    fn evict_expired(&mut self, now: Timestamp) -> usize {
        self.stores
            .values_mut()
            .map(|store| store.evict_expired(now))
            .sum()
    }
}

impl<K: Clone, V: Clone> ReaderShared<K, V> {
    fn new(config: RetentionConfig) -> Self {
        let arbiter = DiscardArbiter::new(config.discard_policy);
        Self {
            config,
            queue: Mutex::new(ReaderQueue::new()),
            available: Condvar::new(),
            arbiter: Mutex::new(arbiter),
            callbacks: Mutex::new(None),
            gaps: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn next_unread(&self, timeout: Option<Duration>) -> Result<Option<Sample<K, V>>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = self.queue.lock();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(BusError::Closed);
            }
            if let Some(sample) = queue.pop_resolved() {
                return Ok(Some(sample));
            }
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut queue, deadline).timed_out() {
                        if self.closed.load(Ordering::Acquire) {
                            return Err(BusError::Closed);
                        }
                        return Ok(queue.pop_resolved());
                    }
                }
                None => self.available.wait(&mut queue),
            }
        }
    }

    pub fn get_all_unread(&self) -> Vec<Sample<K, V>> {
        let mut queue = self.queue.lock();
        let mut drained = Vec::new();
        while let Some(sample) = queue.pop_resolved() {
            drained.push(sample);
        }
        drained
    }

    pub fn unread_count(&self) -> usize {
        self.queue.lock().unread_count()
    }

    pub fn has_unread(&self) -> bool {
        self.unread_count() > 0
    }

    pub fn wait_for_unread(&self, n: usize, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = self.queue.lock();
        loop {
            if queue.unread_count() >= n {
                return true;
            }
            if self.closed.load(Ordering::Acquire) {
                return false;
            }
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut queue, deadline).timed_out() {
                        return queue.unread_count() >= n;
                    }
                }
                None => self.available.wait(&mut queue),
            }
        }
    }

    /// Register sample callbacks; the current unread backlog is flushed to
    /// `on_batch` once (without consuming it from the pull queue).
    pub fn set_callbacks(&self, on_batch: BatchCallback<K, V>, on_single: SampleCallback<K, V>) {
        let backlog = {
            let queue = self.queue.lock();
            let backlog = queue.peek_all();
            *self.callbacks.lock() = Some(SampleCallbacks { on_batch, on_single });
            backlog
        };
        if !backlog.is_empty() {
            self.invoke_batch(&backlog);
        }
    }

    fn has_callbacks(&self) -> bool {
        self.callbacks.lock().is_some()
    }

    fn invoke_single(&self, sample: &Sample<K, V>) {
        if let Some(callbacks) = self.callbacks.lock().as_ref() {
            (callbacks.on_single)(sample);
        }
    }

    fn invoke_batch(&self, batch: &[Sample<K, V>]) {
        if let Some(callbacks) = self.callbacks.lock().as_ref() {
            (callbacks.on_batch)(batch);
        }
    }

    pub fn evicted_gap_count(&self) -> u64 {
        self.gaps.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.notify_all();
    }
}

struct ReaderEntry<K, V> {
    id: SessionId,
    name: String,
    scope: KeyScope<K>,
    shared: Arc<ReaderShared<K, V>>,
}

/// A dropped writer's still-retained history, kept for late readers until
/// it fully expires.
struct RetiredStore<K, V> {
    key: KeyId,
    store: HistoryStore<K, V>,
}

struct RegistryState<K, V> {
    keys: HashMap<K, KeyId>,
    key_of: HashMap<KeyId, K>,
    next_key: u64,
    writers: HashMap<SessionId, Arc<WriterEntry<K, V>>>,
    readers: HashMap<SessionId, Arc<ReaderEntry<K, V>>>,
    sessions: HashMap<(SessionId, SessionId), Arc<Session>>,
    /// Live writers bound to each key (exact scope at creation, others on
    /// first publish). A key is "active" while this set is non-empty.
    bindings: HashMap<KeyId, HashSet<SessionId>>,
    retired: Vec<RetiredStore<K, V>>,
}

/// Pending user-callback work, run after all registry locks are released.
enum CallbackJob<K, V> {
    Single(Arc<ReaderShared<K, V>>, Sample<K, V>),
    Batch(Arc<ReaderShared<K, V>>, Vec<Sample<K, V>>),
}

/// Shared topic state behind the `Topic`, `Writer`, and `Reader` handles.
pub(crate) struct TopicCore<K, V> {
    name: String,
    registry: RwLock<RegistryState<K, V>>,
    hub: ConnectivityHub<K>,
    next_id: AtomicU64,
    closed: AtomicBool,
    weak_self: Weak<TopicCore<K, V>>,
}

impl<K, V> TopicCore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak| Self {
            name,
            registry: RwLock::new(RegistryState {
                keys: HashMap::new(),
                key_of: HashMap::new(),
                next_key: 1,
                writers: HashMap::new(),
                readers: HashMap::new(),
                sessions: HashMap::new(),
                bindings: HashMap::new(),
                retired: Vec::new(),
            }),
            hub: ConnectivityHub::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn next_id(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    // --- Registration ---

    pub fn register_writer(
        &self,
        name: Option<&str>,
        scope: KeyScope<K>,
        config: RetentionConfig,
    ) -> Result<SessionId> {
        self.ensure_open()?;
        config.validate()?;

        let id = self.next_id();
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("writer-{}", id));
        let entry = Arc::new(WriterEntry {
            id,
            name: name.clone(),
            scope: scope.clone(),
            config: config.clone(),
            stores: Mutex::new(HashMap::new()),
            updaters: RwLock::new(HashMap::new()),
        });

        let mut registry = self.registry.write();

        // Exact writers bind (and possibly activate) their key up front.
        let mut activated = None;
        if let Some(key) = scope.exact_key() {
            let key_id = Self::intern_key(&mut registry, key);
            entry
                .stores
                .lock()
                .insert(key_id, HistoryStore::new(config.clone()));
            if Self::bind_key(&mut registry, key_id, id) {
                activated = Some(key.clone());
            }
        }

        for reader_id in registry.readers.keys().copied().collect::<Vec<_>>() {
            let session = Session::new(self.next_id(), id, reader_id);
            registry.sessions.insert((id, reader_id), Arc::new(session));
        }
        registry.writers.insert(id, entry);

        for reader in registry.readers.values() {
            if scope.could_overlap(&reader.scope) {
                self.hub
                    .notify_peers(reader.id, PeerKind::Writers, ChangeReason::Connect, &name);
            }
        }
        if let Some(key) = activated {
            let owners = Self::readers_matching(&registry, &key);
            self.hub.notify_keys(ChangeReason::Connect, &key, &owners);
        }

        drop(registry);
        self.hub.bump();
        debug!(topic = %self.name, writer = %name, "writer registered");
        Ok(id)
    }

    pub fn register_reader(
        &self,
        name: Option<&str>,
        scope: KeyScope<K>,
        config: RetentionConfig,
    ) -> Result<(SessionId, Arc<ReaderShared<K, V>>)> {
        self.ensure_open()?;
        config.validate()?;

        let id = self.next_id();
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("reader-{}", id));
        let shared = Arc::new(ReaderShared::new(config));
        let entry = Arc::new(ReaderEntry {
            id,
            name: name.clone(),
            scope: scope.clone(),
            shared: Arc::clone(&shared),
        });

        let mut registry = self.registry.write();

        for writer_id in registry.writers.keys().copied().collect::<Vec<_>>() {
            let session = Session::new(self.next_id(), writer_id, id);
            registry.sessions.insert((writer_id, id), Arc::new(session));
        }
        registry.readers.insert(id, Arc::clone(&entry));

        // Catch up from retained history, subject to the reader's own
        // policies. Gap accounting starts only after this initial sync.
        self.catch_up(&registry, &entry);

        for writer in registry.writers.values() {
            if writer.scope.could_overlap(&scope) {
                self.hub
                    .notify_peers(writer.id, PeerKind::Readers, ChangeReason::Connect, &name);
            }
        }

        drop(registry);
        self.hub.bump();
        debug!(topic = %self.name, reader = %name, "reader registered");
        Ok((id, shared))
    }

    fn catch_up(&self, registry: &RegistryState<K, V>, reader: &ReaderEntry<K, V>) {
        let now = Timestamp::now();
        for writer in registry.writers.values() {
            let stores = writer.stores.lock();
            for (key_id, store) in stores.iter() {
                let key = &registry.key_of[key_id];
                if !reader.scope.matches(key) {
                    continue;
                }
                let session = match registry.sessions.get(&(writer.id, reader.id)) {
                    Some(session) => session,
                    None => continue,
                };
                let ctx = Self::admit_context(registry, *key_id, reader.id);
                for sample in store.iter_after(SequenceNr(0)) {
                    Self::deliver_one(&reader.shared, *key_id, sample, ctx, now);
                    session.advance_cursor(*key_id, sample.sequence);
                }
            }
        }
        for retired in &registry.retired {
            let key = &registry.key_of[&retired.key];
            if !reader.scope.matches(key) {
                continue;
            }
            let ctx = Self::admit_context(registry, retired.key, reader.id);
            for sample in retired.store.iter_after(SequenceNr(0)) {
                Self::deliver_one(&reader.shared, retired.key, sample, ctx, now);
            }
        }
    }

    pub fn unregister_writer(&self, id: SessionId) {
        let mut registry = self.registry.write();
        let entry = match registry.writers.remove(&id) {
            Some(entry) => entry,
            None => return,
        };

        let stores = std::mem::take(&mut *entry.stores.lock());
        let mut deactivated = Vec::new();
        for (key_id, store) in stores {
            if Self::unbind_key(&mut registry, key_id, id) {
                deactivated.push(registry.key_of[&key_id].clone());
            }
            if !store.is_empty() {
                registry.retired.push(RetiredStore { key: key_id, store });
            }
        }

        registry.sessions.retain(|(writer, _), session| {
            if *writer == id {
                session.close();
                false
            } else {
                true
            }
        });

        for reader in registry.readers.values() {
            if entry.scope.could_overlap(&reader.scope) {
                self.hub.notify_peers(
                    reader.id,
                    PeerKind::Writers,
                    ChangeReason::Disconnect,
                    &entry.name,
                );
            }
        }
        for key in deactivated {
            let owners = Self::readers_matching(&registry, &key);
            self.hub.notify_keys(ChangeReason::Disconnect, &key, &owners);
        }

        self.hub.drop_watches_of(id);
        drop(registry);
        self.hub.bump();
    }

    pub fn unregister_reader(&self, id: SessionId) {
        let mut registry = self.registry.write();
        let entry = match registry.readers.remove(&id) {
            Some(entry) => entry,
            None => return,
        };
        entry.shared.close();

        registry.sessions.retain(|(_, reader), session| {
            if *reader == id {
                session.close();
                false
            } else {
                true
            }
        });

        for writer in registry.writers.values() {
            if writer.scope.could_overlap(&entry.scope) {
                self.hub.notify_peers(
                    writer.id,
                    PeerKind::Readers,
                    ChangeReason::Disconnect,
                    &entry.name,
                );
            }
        }

        self.hub.drop_watches_of(id);
        drop(registry);
        self.hub.bump();
    }

    // --- Keys ---

    fn intern_key(registry: &mut RegistryState<K, V>, key: &K) -> KeyId {
        if let Some(id) = registry.keys.get(key) {
            return *id;
        }
        let id = KeyId(registry.next_key);
        registry.next_key += 1;
        registry.keys.insert(key.clone(), id);
        registry.key_of.insert(id, key.clone());
        id
    }

    /// Bind a writer to a key. Returns true when the key became active.
    fn bind_key(registry: &mut RegistryState<K, V>, key: KeyId, writer: SessionId) -> bool {
        let bound = registry.bindings.entry(key).or_default();
        let was_empty = bound.is_empty();
        bound.insert(writer);
        was_empty
    }

    /// Unbind a writer from a key. Returns true when the key became inactive.
    fn unbind_key(registry: &mut RegistryState<K, V>, key: KeyId, writer: SessionId) -> bool {
        match registry.bindings.get_mut(&key) {
            Some(bound) => {
                bound.remove(&writer);
                bound.is_empty()
            }
            None => false,
        }
    }

    fn readers_matching(registry: &RegistryState<K, V>, key: &K) -> Vec<SessionId> {
        registry
            .readers
            .values()
            .filter(|r| r.scope.matches(key))
            .map(|r| r.id)
            .collect()
    }

    // --- Publishing and routing ---

    /// Publish one event through a writer. `delta` carries the updater tag
    /// and delta value for `PartialUpdate`; `value` is used otherwise.
    pub fn publish(
        &self,
        writer_id: SessionId,
        key: K,
        event: SampleEvent,
        value: Option<V>,
        delta: Option<(String, V)>,
    ) -> Result<Sample<K, V>> {
        self.ensure_open()?;
        let now = Timestamp::now();

        // Make sure the key is interned and the writer's store exists;
        // first publish of a key takes the write lock once.
        let registry = {
            let registry = self.registry.read();
            let ready = registry.keys.get(&key).map_or(false, |key_id| {
                registry
                    .writers
                    .get(&writer_id)
                    .map_or(false, |w| w.stores.lock().contains_key(key_id))
            });
            if ready {
                registry
            } else {
                drop(registry);
                let mut registry = self.registry.write();
                self.bind_for_publish(&mut registry, writer_id, &key)?;
                parking_lot::RwLockWriteGuard::downgrade(registry)
            }
        };

        let writer = registry
            .writers
            .get(&writer_id)
            .cloned()
            .ok_or(BusError::UnknownWriter(writer_id.0))?;
        if !writer.scope.matches(&key) {
            return Err(BusError::KeyOutOfScope);
        }
        let key_id = registry.keys[&key];

        let mut stores = writer.stores.lock();
        let store = stores
            .get_mut(&key_id)
            .expect("store bound before publish");

        let (value, update_tag) = match event {
            SampleEvent::Remove => (None, None),
            SampleEvent::PartialUpdate => {
                let (tag, delta) = delta.ok_or(BusError::NoCurrentValue)?;
                let updater = writer
                    .updaters
                    .read()
                    .get(&tag)
                    .cloned()
                    .ok_or_else(|| BusError::UpdaterNotRegistered(tag.clone()))?;
                let current = store.last_value().ok_or(BusError::NoCurrentValue)?;
                (Some(updater(current, &delta)), Some(tag))
            }
            _ => (value, None),
        };

        let sample = store.publish(
            key.clone(),
            event,
            value,
            update_tag,
            writer_id,
            writer.config.priority,
            now,
        );

        let mut jobs = Vec::new();
        for reader in registry.readers.values() {
            if !reader.scope.matches(&key) {
                continue;
            }
            let session = match registry.sessions.get(&(writer_id, reader.id)) {
                Some(session) => session,
                None => continue,
            };
            if !session.is_connected() {
                trace!(reader = %reader.name, "session down, sample retained for replay");
                continue;
            }
            let ctx = Self::admit_context(&registry, key_id, reader.id);
            let admitted = Self::deliver_one(&reader.shared, key_id, &sample, ctx, now);
            session.advance_cursor(key_id, sample.sequence);
            if admitted && reader.shared.has_callbacks() {
                jobs.push(CallbackJob::Single(
                    Arc::clone(&reader.shared),
                    sample.clone(),
                ));
            }
        }

        drop(stores);
        drop(registry);
        self.run_jobs(jobs);
        Ok(sample)
    }

    /// Intern the key and create the writer's store for it (first publish).
    fn bind_for_publish(
        &self,
        registry: &mut RegistryState<K, V>,
        writer_id: SessionId,
        key: &K,
    ) -> Result<()> {
        let writer = registry
            .writers
            .get(&writer_id)
            .cloned()
            .ok_or(BusError::UnknownWriter(writer_id.0))?;
        if !writer.scope.matches(key) {
            return Err(BusError::KeyOutOfScope);
        }

        let key_id = Self::intern_key(registry, key);
        writer
            .stores
            .lock()
            .entry(key_id)
            .or_insert_with(|| HistoryStore::new(writer.config.clone()));
        if Self::bind_key(registry, key_id, writer_id) {
            let owners = Self::readers_matching(registry, key);
            self.hub.notify_keys(ChangeReason::Connect, key, &owners);
        }
        Ok(())
    }

    /// Highest priority among writers currently connected for `key`, from
    /// `reader`'s point of view. A writer with no session entry counts as
    /// connected (in-process link).
    fn admit_context(
        registry: &RegistryState<K, V>,
        key: KeyId,
        reader: SessionId,
    ) -> AdmitContext {
        let mut max = None;
        if let Some(bound) = registry.bindings.get(&key) {
            for writer_id in bound {
                let entry = match registry.writers.get(writer_id) {
                    Some(entry) => entry,
                    None => continue,
                };
                let connected = registry
                    .sessions
                    .get(&(*writer_id, reader))
                    .map_or(true, |s| s.is_connected());
                if connected {
                    let priority = entry.config.priority;
                    max = Some(max.map_or(priority, |m: i32| m.max(priority)));
                }
            }
        }
        AdmitContext {
            max_connected_priority: max,
        }
    }

    /// Run one sample through the reader's arbiter and, when admitted, into
    /// its queue. Wakes blocked pulls. Returns whether it was admitted.
    fn deliver_one(
        shared: &ReaderShared<K, V>,
        key: KeyId,
        sample: &Sample<K, V>,
        ctx: AdmitContext,
        now: Timestamp,
    ) -> bool {
        let admitted = shared.arbiter.lock().admit(key, sample, &ctx);
        if admitted {
            shared
                .queue
                .lock()
                .push(key, sample.clone(), now, &shared.config);
            shared.available.notify_all();
        }
        admitted
    }

    fn run_jobs(&self, jobs: Vec<CallbackJob<K, V>>) {
        for job in jobs {
            match job {
                CallbackJob::Single(shared, sample) => shared.invoke_single(&sample),
                CallbackJob::Batch(shared, batch) => shared.invoke_batch(&batch),
            }
        }
    }

    pub fn register_updater(&self, writer_id: SessionId, tag: &str, updater: Updater<V>) -> Result<()> {
        let registry = self.registry.read();
        let writer = registry
            .writers
            .get(&writer_id)
            .ok_or(BusError::UnknownWriter(writer_id.0))?;
        writer.updaters.write().insert(tag.to_string(), updater);
        Ok(())
    }

    /// Samples dropped from the writer's retained history by retention so far.
    pub fn writer_evicted_count(&self, writer_id: SessionId) -> Result<u64> {
        let registry = self.registry.read();
        let writer = registry
            .writers
            .get(&writer_id)
            .ok_or(BusError::UnknownWriter(writer_id.0))?;
        let stores = writer.stores.lock();
        Ok(stores.values().map(|s| s.evicted_count()).sum())
    }

    /// The writer's currently retained samples, oldest first (merged across
    /// its keys by timestamp).
    pub fn writer_history(&self, writer_id: SessionId) -> Result<Vec<Sample<K, V>>> {
        let registry = self.registry.read();
        let writer = registry
            .writers
            .get(&writer_id)
            .ok_or(BusError::UnknownWriter(writer_id.0))?;
        let now = Timestamp::now();
        let mut stores = writer.stores.lock();
        let mut samples = Vec::new();
        for store in stores.values_mut() {
            store.evict_expired(now);
            samples.extend(store.snapshot());
        }
        samples.sort_by_key(|s| s.timestamp);
        Ok(samples)
    }

    // --- Sessions ---

    /// Attach a transport connection to the (writer, reader) session.
    ///
    /// An open connection moves the session to `Connected` and replays
    /// retained samples past the delivery cursor; a not-yet-open one leaves
    /// it `Connecting`. The connection's close notification drives the
    /// `Disconnected` transition.
    pub fn bind_session(
        &self,
        writer_id: SessionId,
        reader_id: SessionId,
        connection: Arc<dyn Connection>,
    ) -> Result<()> {
        self.ensure_open()?;

        let mut jobs = Vec::new();
        {
            let registry = self.registry.write();
            let session = registry
                .sessions
                .get(&(writer_id, reader_id))
                .cloned()
                .ok_or(BusError::UnknownWriter(writer_id.0))?;

            session.bind_connection(Arc::clone(&connection));
            if connection.is_open() {
                let prev = session.set_state(SessionState::Connected);
                if prev != SessionState::Connected {
                    if let Some(reader) = registry.readers.get(&reader_id) {
                        // Arbiter state never survives re-establishment.
                        reader.shared.arbiter.lock().reset();
                    }
                    if let Some(job) = self.replay(&registry, writer_id, reader_id) {
                        jobs.push(job);
                    }
                    self.notify_session_change(&registry, writer_id, reader_id, ChangeReason::Connect);
                }
            } else {
                session.set_state(SessionState::Connecting);
            }
        }

        // Register outside the registry lock: a connection that already
        // closed fires the callback immediately.
        let weak = self.weak_self.clone();
        let observed = Arc::clone(&connection);
        connection.on_close(Box::new(move || {
            if let Some(core) = weak.upgrade() {
                core.handle_connection_lost(writer_id, reader_id, observed);
            }
        }));

        self.hub.bump();
        self.run_jobs(jobs);
        Ok(())
    }

    /// Transport close notification. Ignores stale notifications from a
    /// connection that has already been replaced.
    fn handle_connection_lost(
        &self,
        writer_id: SessionId,
        reader_id: SessionId,
        observed: Arc<dyn Connection>,
    ) {
        {
            let registry = self.registry.write();
            let session = match registry.sessions.get(&(writer_id, reader_id)) {
                Some(session) => session,
                None => return,
            };
            let current = session.connection();
            let is_current = current.map_or(false, |c| Arc::ptr_eq(&c, &observed));
            if !is_current || !session.mark_disconnected() {
                return;
            }
            debug!(writer = %writer_id, reader = %reader_id, "session lost transport");
            self.notify_session_change(&registry, writer_id, reader_id, ChangeReason::Disconnect);
        }
        self.hub.bump();
    }

    fn notify_session_change(
        &self,
        registry: &RegistryState<K, V>,
        writer_id: SessionId,
        reader_id: SessionId,
        reason: ChangeReason,
    ) {
        if let Some(writer) = registry.writers.get(&writer_id) {
            self.hub
                .notify_peers(reader_id, PeerKind::Writers, reason, &writer.name);
        }
        if let Some(reader) = registry.readers.get(&reader_id) {
            self.hub
                .notify_peers(writer_id, PeerKind::Readers, reason, &reader.name);
        }
    }

    /// Resume delivery strictly from the session cursor. Samples evicted
    /// while disconnected are counted as a gap, not replayed.
    fn replay(
        &self,
        registry: &RegistryState<K, V>,
        writer_id: SessionId,
        reader_id: SessionId,
    ) -> Option<CallbackJob<K, V>> {
        let writer = registry.writers.get(&writer_id)?;
        let reader = registry.readers.get(&reader_id)?;
        let session = registry.sessions.get(&(writer_id, reader_id))?;

        let now = Timestamp::now();
        let stores = writer.stores.lock();
        let mut batch = Vec::new();
        let mut replayed = 0u64;

        for (key_id, store) in stores.iter() {
            let key = &registry.key_of[key_id];
            if !reader.scope.matches(key) {
                continue;
            }
            let cursor = session.cursor_for(*key_id);

            let expected_next = cursor.0 + 1;
            let oldest_available = store
                .first_sequence()
                .map(|s| s.0)
                .unwrap_or_else(|| store.next_sequence().0);
            if oldest_available > expected_next {
                let lost = oldest_available - expected_next;
                reader.shared.gaps.fetch_add(lost, Ordering::Relaxed);
                debug!(lost, "history evicted during disconnect, gap is silent");
            }

            let ctx = Self::admit_context(registry, *key_id, reader_id);
            for sample in store.iter_after(cursor) {
                replayed += 1;
                if Self::deliver_one(&reader.shared, *key_id, sample, ctx, now) {
                    batch.push(sample.clone());
                }
                session.advance_cursor(*key_id, sample.sequence);
            }
        }

        if replayed > 0 {
            debug!(writer = %writer_id, reader = %reader_id, replayed, "session replay complete");
        }
        if !batch.is_empty() && reader.shared.has_callbacks() {
            Some(CallbackJob::Batch(Arc::clone(&reader.shared), batch))
        } else {
            None
        }
    }

    pub fn session_state(&self, writer_id: SessionId, reader_id: SessionId) -> Option<SessionState> {
        self.registry
            .read()
            .sessions
            .get(&(writer_id, reader_id))
            .map(|s| s.state())
    }

    // --- Connectivity queries, waits, watches ---

    pub fn connected_readers(&self, writer_id: SessionId) -> Vec<String> {
        let registry = self.registry.read();
        Self::connected_readers_locked(&registry, writer_id)
    }

    fn connected_readers_locked(
        registry: &RegistryState<K, V>,
        writer_id: SessionId,
    ) -> Vec<String> {
        let writer = match registry.writers.get(&writer_id) {
            Some(writer) => writer,
            None => return Vec::new(),
        };
        registry
            .readers
            .values()
            .filter(|r| writer.scope.could_overlap(&r.scope))
            .filter(|r| {
                registry
                    .sessions
                    .get(&(writer_id, r.id))
                    .map_or(true, |s| s.is_connected())
            })
            .map(|r| r.name.clone())
            .collect()
    }

    pub fn connected_writers(&self, reader_id: SessionId) -> Vec<String> {
        let registry = self.registry.read();
        Self::connected_writers_locked(&registry, reader_id)
    }

    fn connected_writers_locked(
        registry: &RegistryState<K, V>,
        reader_id: SessionId,
    ) -> Vec<String> {
        let reader = match registry.readers.get(&reader_id) {
            Some(reader) => reader,
            None => return Vec::new(),
        };
        registry
            .writers
            .values()
            .filter(|w| w.scope.could_overlap(&reader.scope))
            .filter(|w| {
                registry
                    .sessions
                    .get(&(w.id, reader_id))
                    .map_or(true, |s| s.is_connected())
            })
            .map(|w| w.name.clone())
            .collect()
    }

    pub fn connected_keys(&self, reader_id: SessionId) -> Vec<K> {
        let registry = self.registry.read();
        Self::connected_keys_locked(&registry, reader_id)
    }

    fn connected_keys_locked(registry: &RegistryState<K, V>, reader_id: SessionId) -> Vec<K> {
        let reader = match registry.readers.get(&reader_id) {
            Some(reader) => reader,
            None => return Vec::new(),
        };
        registry
            .bindings
            .iter()
            .filter(|(_, bound)| !bound.is_empty())
            .map(|(key_id, _)| registry.key_of[key_id].clone())
            .filter(|key| reader.scope.matches(key))
            .collect()
    }

    pub fn wait_for_readers(
        &self,
        writer_id: SessionId,
        n: usize,
        timeout: Option<Duration>,
    ) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.hub
            .wait_until(deadline, || self.connected_readers(writer_id).len() >= n)
    }

    pub fn wait_for_no_readers(&self, writer_id: SessionId, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.hub
            .wait_until(deadline, || self.connected_readers(writer_id).is_empty())
    }

    pub fn wait_for_writers(
        &self,
        reader_id: SessionId,
        n: usize,
        timeout: Option<Duration>,
    ) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.hub
            .wait_until(deadline, || self.connected_writers(reader_id).len() >= n)
    }

    pub fn wait_for_no_writers(&self, reader_id: SessionId, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.hub
            .wait_until(deadline, || self.connected_writers(reader_id).is_empty())
    }

    pub fn watch_connected_readers(&self, writer_id: SessionId) -> PeerWatch {
        let registry = self.registry.write();
        let snapshot = Self::connected_readers_locked(&registry, writer_id);
        self.hub.watch_peers(writer_id, PeerKind::Readers, snapshot)
    }

    pub fn watch_connected_writers(&self, reader_id: SessionId) -> PeerWatch {
        let registry = self.registry.write();
        let snapshot = Self::connected_writers_locked(&registry, reader_id);
        self.hub.watch_peers(reader_id, PeerKind::Writers, snapshot)
    }

    pub fn watch_connected_keys(&self, reader_id: SessionId) -> KeyWatch<K> {
        let registry = self.registry.write();
        let snapshot = Self::connected_keys_locked(&registry, reader_id);
        self.hub.watch_keys(reader_id, snapshot)
    }

    // --- Housekeeping ---

    /// Drop lifetime-expired samples everywhere and garbage-collect retired
    /// stores that have fully drained. Returns the number of samples dropped.
    pub fn evict_expired(&self) -> usize {
        let now = Timestamp::now();
        let mut dropped = 0;
        let mut registry = self.registry.write();
        for writer in registry.writers.values() {
            for store in writer.stores.lock().values_mut() {
                dropped += store.evict_expired(now);
            }
        }
        for reader in registry.readers.values() {
            dropped += reader.shared.queue.lock().evict_expired(now);
        }
        registry.retired.retain_mut(|retired| {
            dropped += retired.store.evict_expired(now);
            !retired.store.is_empty()
        });
        dropped
    }

    /// Tear the topic down: every blocked pull is cancelled with `Closed`,
    /// sessions become `Closed`, watches disconnect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let registry = self.registry.write();
            for reader in registry.readers.values() {
                reader.shared.close();
            }
            for session in registry.sessions.values() {
                session.close();
            }
        }
        self.hub.bump();
        debug!(topic = %self.name, "topic closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
