//! Listener registries and event callback traits
//!
//! Sessions and the registration manager never surface raw errors across the
//! API boundary; every user-visible outcome arrives through one of these
//! callbacks. Broadcast always iterates a snapshot of the registry so a
//! listener may add or remove listeners from within a callback.

use super::error::SessionErrorCode;
use std::sync::{Arc, Mutex};

/// Session lifecycle callbacks
pub trait SessionEventListener: Send + Sync {
    /// Media negotiation finished and transport is up
    fn on_started(&self) {}

    /// Session was aborted locally
    fn on_aborted(&self) {}

    /// Remote side sent BYE or CANCEL
    fn on_terminated_by_remote(&self) {}

    /// Session failed with a specific reason code
    fn on_error(&self, _code: SessionErrorCode) {}

    /// A reassembled message arrived over the session's media transport
    fn on_message_received(&self, _mime_type: &str, _data: &[u8]) {}

    /// Transfer progress in bytes
    fn on_transfer_progress(&self, _current: u64, _total: u64) {}

    /// A file transfer finished successfully
    fn on_transfer_complete(&self) {}

    /// Result of an add-participant REFER (group chat only)
    fn on_participant_result(&self, _participant: &str, _success: bool) {}
}

/// Registration state callbacks
pub trait RegistrationListener: Send + Sync {
    fn on_registered(&self) {}

    fn on_registration_failed(&self, _reason: &str) {}

    fn on_unregistered(&self) {}
}

/// Registry of shared listener handles, iterated under a stable snapshot
pub struct ListenerSet<L: ?Sized> {
    listeners: Mutex<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<L>) {
        let mut listeners = self.listeners.lock().expect("listener set poisoned");
        listeners.push(listener);
    }

    pub fn clear(&self) {
        let mut listeners = self.listeners.lock().expect("listener set poisoned");
        listeners.clear();
    }

    pub fn is_empty(&self) -> bool {
        let listeners = self.listeners.lock().expect("listener set poisoned");
        listeners.is_empty()
    }

    /// Stable snapshot for broadcast; mutation during iteration cannot
    /// invalidate it
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        let listeners = self.listeners.lock().expect("listener set poisoned");
        listeners.clone()
    }

    /// Invoke `f` on every listener registered at the time of the call
    pub fn broadcast(&self, f: impl Fn(&L)) {
        for listener in self.snapshot() {
            f(&listener);
        }
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingListener {
        started: AtomicU32,
    }

    impl SessionEventListener for CountingListener {
        fn on_started(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_broadcast_reaches_all_listeners() {
        let set: ListenerSet<dyn SessionEventListener> = ListenerSet::new();
        let a = Arc::new(CountingListener {
            started: AtomicU32::new(0),
        });
        let b = Arc::new(CountingListener {
            started: AtomicU32::new(0),
        });
        set.add(a.clone());
        set.add(b.clone());

        set.broadcast(|l| l.on_started());

        assert_eq!(a.started.load(Ordering::SeqCst), 1);
        assert_eq!(b.started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_snapshot_is_stable() {
        let set: ListenerSet<dyn SessionEventListener> = ListenerSet::new();
        let a = Arc::new(CountingListener {
            started: AtomicU32::new(0),
        });
        set.add(a.clone());

        let snapshot = set.snapshot();
        set.clear();

        // The snapshot taken before clear still holds the listener
        assert_eq!(snapshot.len(), 1);
        assert!(set.is_empty());
    }
}
