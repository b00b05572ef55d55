//! Connectivity event and watch types.

use serde::{Deserialize, Serialize};

/// Why a connectivity change was reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeReason {
    Connect,
    Disconnect,
}

/// A peer (writer or reader) appearing or disappearing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerEvent {
    pub reason: ChangeReason,
    /// Peer name as returned by `connected_writers`/`connected_readers`.
    pub name: String,
}

/// A key gaining its first connected writer, or losing its last.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyEvent<K> {
    pub reason: ChangeReason,
    pub key: K,
}

/// Unique identifier for a watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Handle to a peer-connectivity watch.
///
/// Dropping the handle ends the watch; a watch that falls behind is dropped
/// by the hub and its receiver disconnects.
pub struct PeerWatch {
    pub(crate) id: WatchId,
    pub(crate) snapshot: Vec<String>,
    pub(crate) receiver: crossbeam_channel::Receiver<PeerEvent>,
}

impl PeerWatch {
    pub fn id(&self) -> WatchId {
        self.id
    }

    /// Peers connected at watch creation, before any change event.
    pub fn snapshot(&self) -> &[String] {
        &self.snapshot
    }

    /// Receive the next change (blocking).
    pub fn recv(&self) -> Result<PeerEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a change (non-blocking).
    pub fn try_recv(&self) -> Result<PeerEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<PeerEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Handle to a key-connectivity watch.
pub struct KeyWatch<K> {
    pub(crate) id: WatchId,
    pub(crate) snapshot: Vec<K>,
    pub(crate) receiver: crossbeam_channel::Receiver<KeyEvent<K>>,
}

impl<K> KeyWatch<K> {
    pub fn id(&self) -> WatchId {
        self.id
    }

    /// Keys active at watch creation, before any change event.
    pub fn snapshot(&self) -> &[K] {
        &self.snapshot
    }

    pub fn recv(&self) -> Result<KeyEvent<K>, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<KeyEvent<K>, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<KeyEvent<K>, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
