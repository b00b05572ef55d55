//! Connectivity hub: fans out peer/key membership changes to watches.

use super::types::{ChangeReason, KeyEvent, KeyWatch, PeerEvent, PeerWatch, WatchId};
use crate::types::SessionId;
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;

/// Buffered changes per watch before it is dropped as a slow watcher.
const WATCH_BUFFER: usize = 256;

/// Which side of the bus a peer watch observes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PeerKind {
    Writers,
    Readers,
}

struct PeerWatcher {
    id: WatchId,
    owner: SessionId,
    kind: PeerKind,
    sender: Sender<PeerEvent>,
}

struct KeyWatcher<K> {
    id: WatchId,
    owner: SessionId,
    sender: Sender<KeyEvent<K>>,
}

struct Watchers<K> {
    peers: Vec<PeerWatcher>,
    keys: Vec<KeyWatcher<K>>,
}

/// Fans out membership changes and wakes blocking `wait_for_*` helpers.
///
/// Callers hold the topic registry lock while creating watches and while
/// sending change events so that snapshot-then-changes ordering holds;
/// `bump` is called only after that lock is released.
pub(crate) struct ConnectivityHub<K> {
    watchers: Mutex<Watchers<K>>,
    next_id: AtomicU64,
    generation: Mutex<u64>,
    changed: Condvar,
}

impl<K: Clone> ConnectivityHub<K> {
    pub fn new() -> Self {
        Self {
            watchers: Mutex::new(Watchers {
                peers: Vec::new(),
                keys: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
            generation: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    /// Register a peer watch with its initial snapshot.
    pub fn watch_peers(
        &self,
        owner: SessionId,
        kind: PeerKind,
        snapshot: Vec<String>,
    ) -> PeerWatch {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(WATCH_BUFFER);
        self.watchers.lock().peers.push(PeerWatcher {
            id,
            owner,
            kind,
            sender,
        });
        PeerWatch {
            id,
            snapshot,
            receiver,
        }
    }

    /// Register a key watch with its initial snapshot.
    pub fn watch_keys(&self, owner: SessionId, snapshot: Vec<K>) -> KeyWatch<K> {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(WATCH_BUFFER);
        self.watchers.lock().keys.push(KeyWatcher { id, owner, sender });
        KeyWatch {
            id,
            snapshot,
            receiver,
        }
    }

    /// Deliver a peer change to the watches a given owner holds.
    pub fn notify_peers(&self, owner: SessionId, kind: PeerKind, reason: ChangeReason, name: &str) {
        let mut watchers = self.watchers.lock();
        watchers.peers.retain(|w| {
            if w.owner != owner || w.kind != kind {
                return true;
            }
            match w.sender.try_send(PeerEvent {
                reason,
                name: name.to_string(),
            }) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    debug!(watch = ?w.id, "peer watch dropped");
                    false
                }
            }
        });
    }

    /// Deliver a key change to the watches held by any of `owners`.
    pub fn notify_keys(&self, reason: ChangeReason, key: &K, owners: &[SessionId]) {
        let mut watchers = self.watchers.lock();
        watchers.keys.retain(|w| {
            if !owners.contains(&w.owner) {
                return true;
            }
            match w.sender.try_send(KeyEvent {
                reason,
                key: key.clone(),
            }) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    debug!(watch = ?w.id, "key watch dropped");
                    false
                }
            }
        });
    }

    /// Drop all watches an owner holds (owner teardown).
    pub fn drop_watches_of(&self, owner: SessionId) {
        let mut watchers = self.watchers.lock();
        watchers.peers.retain(|w| w.owner != owner);
        watchers.keys.retain(|w| w.owner != owner);
    }

    /// Record a membership change and wake blocked waiters.
    pub fn bump(&self) {
        *self.generation.lock() += 1;
        self.changed.notify_all();
    }

    /// Block until `pred` holds or the deadline passes. Returns the final
    /// predicate value. `pred` must not touch hub state.
    pub fn wait_until(&self, deadline: Option<Instant>, mut pred: impl FnMut() -> bool) -> bool {
        let mut generation = self.generation.lock();
        loop {
            if pred() {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut generation, deadline).timed_out() {
                        return pred();
                    }
                }
                None => self.changed.wait(&mut generation),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const OWNER: SessionId = SessionId(1);

    #[test]
    fn test_snapshot_then_changes() {
        let hub: ConnectivityHub<u32> = ConnectivityHub::new();
        let watch = hub.watch_peers(OWNER, PeerKind::Writers, vec!["w1".to_string()]);
        assert_eq!(watch.snapshot(), ["w1".to_string()]);

        hub.notify_peers(OWNER, PeerKind::Writers, ChangeReason::Connect, "w2");
        let event = watch.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(event.reason, ChangeReason::Connect);
        assert_eq!(event.name, "w2");
    }

    #[test]
    fn test_notify_filters_owner_and_kind() {
        let hub: ConnectivityHub<u32> = ConnectivityHub::new();
        let writers = hub.watch_peers(OWNER, PeerKind::Writers, vec![]);
        let readers = hub.watch_peers(OWNER, PeerKind::Readers, vec![]);
        let other = hub.watch_peers(SessionId(2), PeerKind::Writers, vec![]);

        hub.notify_peers(OWNER, PeerKind::Writers, ChangeReason::Disconnect, "w");

        assert!(writers.try_recv().is_ok());
        assert!(readers.try_recv().is_err());
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn test_key_events_to_interested_owners() {
        let hub: ConnectivityHub<u32> = ConnectivityHub::new();
        let watch = hub.watch_keys(OWNER, vec![]);

        hub.notify_keys(ChangeReason::Connect, &42, &[OWNER]);
        assert_eq!(watch.try_recv().unwrap().key, 42);

        hub.notify_keys(ChangeReason::Connect, &43, &[SessionId(9)]);
        assert!(watch.try_recv().is_err());
    }

    #[test]
    fn test_slow_watcher_is_dropped() {
        let hub: ConnectivityHub<u32> = ConnectivityHub::new();
        let watch = hub.watch_peers(OWNER, PeerKind::Writers, vec![]);

        for i in 0..WATCH_BUFFER + 10 {
            hub.notify_peers(
                OWNER,
                PeerKind::Writers,
                ChangeReason::Connect,
                &format!("w{i}"),
            );
        }

        // Drain what was buffered; the channel then reports disconnection.
        let mut received = 0;
        loop {
            match watch.try_recv() {
                Ok(_) => received += 1,
                Err(crossbeam_channel::TryRecvError::Disconnected) => break,
                Err(crossbeam_channel::TryRecvError::Empty) => {
                    panic!("slow watch should have been dropped")
                }
            }
        }
        assert_eq!(received, WATCH_BUFFER);
    }

    #[test]
    fn test_wait_until_wakes_on_bump() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let hub: Arc<ConnectivityHub<u32>> = Arc::new(ConnectivityHub::new());
        let flag = Arc::new(AtomicBool::new(false));

        let h = Arc::clone(&hub);
        let f = Arc::clone(&flag);
        let waiter = std::thread::spawn(move || {
            h.wait_until(Some(Instant::now() + Duration::from_secs(5)), || {
                f.load(Ordering::SeqCst)
            })
        });

        std::thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::SeqCst);
        hub.bump();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_until_times_out() {
        let hub: ConnectivityHub<u32> = ConnectivityHub::new();
        let reached = hub.wait_until(
            Some(Instant::now() + Duration::from_millis(20)),
            || false,
        );
        assert!(!reached);
    }
}
