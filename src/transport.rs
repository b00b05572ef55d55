//! Transport collaborator interfaces.
//!
//! The bus core does not open sockets or encode wire messages; it consumes a
//! connection abstraction from the surrounding transport layer and reacts to
//! its lifecycle. `InProcessConnection` is the loopback implementation used
//! by local sessions and tests.

use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One established, reliable, ordered channel to a peer.
///
/// Close notification is edge-triggered: a callback registered after the
/// connection already closed fires immediately.
pub trait Connection: Send + Sync {
    /// Send an encoded message. Encoding is the transport's concern.
    fn send(&self, payload: &[u8]) -> io::Result<()>;

    /// Whether the connection is currently open.
    fn is_open(&self) -> bool;

    /// Close the connection, firing close callbacks.
    fn close(&self);

    /// Register a callback invoked once when the connection drops.
    fn on_close(&self, callback: Box<dyn FnOnce() + Send>);
}

/// A candidate peer endpoint for a topic.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub name: String,
    pub endpoint: String,
}

/// Peer enumeration for a topic name.
pub trait Discovery: Send + Sync {
    fn peers(&self, topic: &str) -> Vec<PeerInfo>;
}

/// Loopback connection for local sessions and tests.
pub struct InProcessConnection {
    open: AtomicBool,
    callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl InProcessConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            callbacks: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Payloads sent so far (test observation point).
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }
}

impl Connection for InProcessConnection {
    fn send(&self, payload: &[u8]) -> io::Result<()> {
        if !self.is_open() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        self.sent.lock().push(payload.to_vec());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let callbacks = std::mem::take(&mut *self.callbacks.lock());
            for callback in callbacks {
                callback();
            }
        }
    }

    fn on_close(&self, callback: Box<dyn FnOnce() + Send>) {
        if self.is_open() {
            self.callbacks.lock().push(callback);
        } else {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_send_and_capture() {
        let conn = InProcessConnection::new();
        conn.send(b"hello").unwrap();
        assert_eq!(conn.sent(), vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_close_fires_callbacks_once() {
        let conn = InProcessConnection::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&fired);
        conn.on_close(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        conn.close();
        conn.close();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!conn.is_open());
        assert!(conn.send(b"x").is_err());
    }

    #[test]
    fn test_late_registration_fires_immediately() {
        let conn = InProcessConnection::new();
        conn.close();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        conn.on_close(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
