//! Ordered, bounded sample buffer for one (key, writer) on the write side,
//! or one key's merged view on the read side.

use crate::types::{
    RetentionConfig, Sample, SampleEvent, SequenceNr, SessionId, Timestamp,
};
use std::collections::VecDeque;
use tracing::trace;

/// Ordered, bounded buffer of samples.
///
/// Invariants: timestamps strictly increase (per writer), length stays within
/// `sample_count` when bounded, no entry is older than `sample_lifetime` when
/// bounded, and the buffer satisfies the active clear policy's structural
/// constraint after every append.
pub struct HistoryStore<K, V> {
    /// Retention configuration for this buffer.
    config: RetentionConfig,

    /// Retained samples, oldest first.
    entries: VecDeque<Sample<K, V>>,

    /// Next sequence number to assign (writer side).
    next_seq: SequenceNr,

    /// Last assigned timestamp (writer side, for monotonicity).
    last_timestamp: Timestamp,

    /// Total samples dropped by retention so far (diagnostic).
    evicted: u64,
}

impl<K: Clone, V: Clone> HistoryStore<K, V> {
    pub fn new(config: RetentionConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
            next_seq: SequenceNr(1),
            last_timestamp: Timestamp(0),
            evicted: 0,
        }
    }

    /// Build and retain a new sample (writer side).
    ///
    /// Assigns the next sequence number and a strictly-monotonic timestamp,
    /// then applies the full retention pipeline. The built sample is returned
    /// for routing even when `sample_count == 0` evicts it immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn publish(
        &mut self,
        key: K,
        event: SampleEvent,
        value: Option<V>,
        update_tag: Option<String>,
        origin: SessionId,
        priority: i32,
        now: Timestamp,
    ) -> Sample<K, V> {
        let timestamp = if now > self.last_timestamp {
            now
        } else {
            self.last_timestamp.bumped()
        };
        self.last_timestamp = timestamp;

        let sequence = self.next_seq;
        self.next_seq = self.next_seq.next();

        let sample = Sample {
            key,
            value,
            event,
            timestamp,
            sequence,
            origin,
            update_tag,
            priority,
        };

        self.append(sample.clone(), now);
        sample
    }

    /// Retain an already-built sample (reader side).
    ///
    /// Applies, in order: the conditional clear for the active
    /// `clear_history` policy, the append, the `sample_count` bound, and the
    /// `sample_lifetime` bound.
    pub fn append(&mut self, sample: Sample<K, V>, now: Timestamp) {
        if self.config.clear_history.clears_on(sample.event) {
            self.evicted += self.entries.len() as u64;
            self.entries.clear();
        }

        self.entries.push_back(sample);

        if let Some(bound) = self.config.count_bound() {
            while self.entries.len() > bound {
                self.entries.pop_front();
                self.evicted += 1;
            }
        }

        self.trim_expired(now);
    }

    /// Remove lifetime-expired entries. Idempotent for a fixed `now`.
    pub fn evict_expired(&mut self, now: Timestamp) -> usize {
        self.trim_expired(now)
    }

    fn trim_expired(&mut self, now: Timestamp) -> usize {
        let lifetime = match self.config.lifetime_bound() {
            Some(lifetime) => lifetime,
            None => return 0,
        };

        let mut dropped = 0;
        while let Some(head) = self.entries.front() {
            if head.timestamp.age(now) > lifetime {
                self.entries.pop_front();
                self.evicted += 1;
                dropped += 1;
            } else {
                break;
            }
        }

        if dropped > 0 {
            trace!(dropped, "expired samples evicted");
        }
        dropped
    }

    /// The currently retained sequence, oldest first.
    pub fn snapshot(&self) -> Vec<Sample<K, V>> {
        self.entries.iter().cloned().collect()
    }

    /// Retained samples with a sequence number after `cursor` (replay).
    pub fn iter_after(&self, cursor: SequenceNr) -> impl Iterator<Item = &Sample<K, V>> {
        self.entries.iter().filter(move |s| s.sequence > cursor)
    }

    /// The retained sample matching (origin, sequence), if any.
    pub fn get(&self, origin: SessionId, sequence: SequenceNr) -> Option<&Sample<K, V>> {
        self.entries
            .iter()
            .find(|s| s.origin == origin && s.sequence == sequence)
    }

    /// Remove and return the sample matching (origin, sequence), if retained.
    pub fn take(&mut self, origin: SessionId, sequence: SequenceNr) -> Option<Sample<K, V>> {
        let idx = self
            .entries
            .iter()
            .position(|s| s.origin == origin && s.sequence == sequence)?;
        self.entries.remove(idx)
    }

    /// Drop every retained sample older than `timestamp` (send-time coalescing).
    pub fn prune_older_than(&mut self, timestamp: Timestamp) -> usize {
        let before = self.entries.len();
        self.entries.retain(|s| s.timestamp >= timestamp);
        let dropped = before - self.entries.len();
        self.evicted += dropped as u64;
        dropped
    }

    /// Value of the most recent retained sample (current state for partial updates).
    pub fn last_value(&self) -> Option<&V> {
        self.entries.back().and_then(|s| s.value.as_ref())
    }

    /// Sequence number of the oldest retained sample.
    pub fn first_sequence(&self) -> Option<SequenceNr> {
        self.entries.front().map(|s| s.sequence)
    }

    /// Next sequence number the writer side will assign.
    pub fn next_sequence(&self) -> SequenceNr {
        self.next_seq
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total samples dropped by retention since creation.
    pub fn evicted_count(&self) -> u64 {
        self.evicted
    }
}
