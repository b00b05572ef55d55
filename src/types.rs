//! Core types for the bus.

use crate::error::{BusError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Unique identifier for a writer, reader, or the session binding them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Interned identifier for a key within one topic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(pub u64);

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.0)
    }
}

/// Position in a (key, writer) sample sequence. The delivery cursor unit.
///
/// Sequence numbers start at 1; `SequenceNr(0)` means "nothing delivered yet".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct SequenceNr(pub u64);

impl fmt::Debug for SequenceNr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl SequenceNr {
    pub fn next(self) -> Self {
        SequenceNr(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(SequenceNr(self.0 - 1))
        } else {
            None
        }
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }

    /// One microsecond later. Used to keep per-writer timestamps strictly increasing.
    pub fn bumped(self) -> Self {
        Timestamp(self.0 + 1)
    }

    /// Age of this timestamp as seen from `now` (zero if `now` is earlier).
    pub fn age(self, now: Timestamp) -> Duration {
        Duration::from_micros((now.0 - self.0).max(0) as u64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Kind of publication event a sample records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleEvent {
    Add,
    Update,
    Remove,
    PartialUpdate,
}

/// One immutable publication event for a key.
#[derive(Clone, Debug)]
pub struct Sample<K, V> {
    /// The key this sample was published under.
    pub key: K,

    /// Published value. Absent for `Remove`.
    pub value: Option<V>,

    /// What kind of publication this was.
    pub event: SampleEvent,

    /// Publish time (strictly increasing within one writer's store).
    pub timestamp: Timestamp,

    /// Position in the (key, writer) sequence (assigned by the writer store).
    pub sequence: SequenceNr,

    /// The writer that published this sample.
    pub origin: SessionId,

    /// Updater tag, set for `PartialUpdate`.
    pub update_tag: Option<String>,

    /// Writer priority at publish time.
    pub priority: i32,
}

/// When retained history is truncated on a new event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClearHistoryPolicy {
    /// No pruning.
    Never,
    /// Clear the buffer before appending an `Add`.
    OnAdd,
    /// Clear the buffer before appending a `Remove`.
    OnRemove,
    /// Clear the buffer before every append.
    OnAll,
    /// Clear the buffer before appending anything but a `PartialUpdate`.
    OnAllExceptPartialUpdate,
}

impl Default for ClearHistoryPolicy {
    fn default() -> Self {
        ClearHistoryPolicy::Never
    }
}

impl ClearHistoryPolicy {
    /// Whether an incoming event of this kind clears the buffer first.
    pub fn clears_on(self, event: SampleEvent) -> bool {
        match self {
            ClearHistoryPolicy::Never => false,
            ClearHistoryPolicy::OnAdd => event == SampleEvent::Add,
            ClearHistoryPolicy::OnRemove => event == SampleEvent::Remove,
            ClearHistoryPolicy::OnAll => true,
            ClearHistoryPolicy::OnAllExceptPartialUpdate => event != SampleEvent::PartialUpdate,
        }
    }
}

/// Which admitted-but-competing samples a reader actually receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscardPolicy {
    /// Always admit.
    None,
    /// Admit only samples from the highest-priority connected writer per key.
    Priority,
    /// Last-value-wins coalescing; delivered timestamps strictly increase per key.
    SendTime,
}

impl Default for DiscardPolicy {
    fn default() -> Self {
        DiscardPolicy::None
    }
}

/// Retention and arbitration configuration, shared shape for writers and readers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Retained sample bound per key (-1 = unbounded, 0 = deliver live only).
    pub sample_count: i64,

    /// Retained sample age bound (zero = unbounded).
    pub sample_lifetime: Duration,

    /// Structural truncation rule applied on append.
    pub clear_history: ClearHistoryPolicy,

    /// Writer-side publish priority, copied into each sample.
    pub priority: i32,

    /// Reader-side arbitration rule.
    pub discard_policy: DiscardPolicy,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            sample_count: -1,
            sample_lifetime: Duration::ZERO,
            clear_history: ClearHistoryPolicy::default(),
            priority: 0,
            discard_policy: DiscardPolicy::default(),
        }
    }
}

impl RetentionConfig {
    pub fn with_sample_count(mut self, count: i64) -> Self {
        self.sample_count = count;
        self
    }

    pub fn with_sample_lifetime(mut self, lifetime: Duration) -> Self {
        self.sample_lifetime = lifetime;
        self
    }

    pub fn with_clear_history(mut self, policy: ClearHistoryPolicy) -> Self {
        self.clear_history = policy;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_discard_policy(mut self, policy: DiscardPolicy) -> Self {
        self.discard_policy = policy;
        self
    }

    /// Check the configuration at writer/reader creation time.
    pub fn validate(&self) -> Result<()> {
        if self.sample_count < -1 {
            return Err(BusError::Configuration(format!(
                "sample_count must be -1 (unbounded) or >= 0, got {}",
                self.sample_count
            )));
        }
        Ok(())
    }

    /// Count bound as a usize, `None` when unbounded.
    pub(crate) fn count_bound(&self) -> Option<usize> {
        if self.sample_count < 0 {
            None
        } else {
            Some(self.sample_count as usize)
        }
    }

    /// Lifetime bound, `None` when unbounded.
    pub(crate) fn lifetime_bound(&self) -> Option<Duration> {
        if self.sample_lifetime.is_zero() {
            None
        } else {
            Some(self.sample_lifetime)
        }
    }
}
