//! Priority- and send-time-based sample filtering.

use crate::types::{DiscardPolicy, KeyId, Sample, Timestamp};
use std::collections::HashMap;
use tracing::trace;

/// Per-sample routing context, computed by the registry at delivery time.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdmitContext {
    /// Highest priority among writers currently connected for the sample's
    /// key, from the receiving reader's point of view. `None` when no
    /// connected writer is known (the sample's own writer is then the only
    /// candidate and the sample is admitted).
    pub max_connected_priority: Option<i32>,
}

/// Decides which samples a reader actually receives.
///
/// One arbiter per reader. Decisions are final: a dropped sample is never
/// queued or retried, and the cursor advances past it. State is local and is
/// reset on session re-establishment, then rebuilt from newly observed
/// writers.
pub struct DiscardArbiter {
    policy: DiscardPolicy,

    /// Send timestamp of the last admitted sample, per key (`SendTime`).
    last_admitted: HashMap<KeyId, Timestamp>,
}

impl DiscardArbiter {
    pub fn new(policy: DiscardPolicy) -> Self {
        Self {
            policy,
            last_admitted: HashMap::new(),
        }
    }

    pub fn policy(&self) -> DiscardPolicy {
        self.policy
    }

    /// Decide whether `sample` reaches the reader. Invoked once per sample
    /// per bound reader, before the reader's history sees it.
    pub fn admit<K, V>(&mut self, key: KeyId, sample: &Sample<K, V>, ctx: &AdmitContext) -> bool {
        match self.policy {
            DiscardPolicy::None => true,
            DiscardPolicy::Priority => match ctx.max_connected_priority {
                Some(max) if sample.priority < max => {
                    trace!(
                        priority = sample.priority,
                        max,
                        "sample dropped below max connected priority"
                    );
                    false
                }
                _ => true,
            },
            DiscardPolicy::SendTime => match self.last_admitted.get(&key) {
                Some(&last) if sample.timestamp <= last => {
                    trace!(?key, "stale sample dropped by send-time arbitration");
                    false
                }
                _ => {
                    self.last_admitted.insert(key, sample.timestamp);
                    true
                }
            },
        }
    }

    /// Forget all per-key state. Called when a session to this reader is
    /// re-established; the state is rebuilt from newly observed writers.
    pub fn reset(&mut self) {
        self.last_admitted.clear();
    }
}
