//! Change streams
//!
//! A [`WatchStream`] is a blocking iterator over snapshots of a watched
//! key set. The backend pushes a fresh snapshot (one entry per key, in
//! the order the keys were given) on every commit that touches any of
//! them, plus one initial snapshot at subscription time. Dropping the
//! stream releases the underlying watcher.

use crate::backend::Entry;
use std::sync::mpsc::Receiver;

/// Blocking stream of key-set snapshots.
pub struct WatchStream {
    rx: Receiver<Vec<Entry>>,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchStream {
    /// Build a stream from a channel and an unsubscribe hook.
    pub fn new(rx: Receiver<Vec<Entry>>, unsubscribe: Box<dyn FnOnce() + Send>) -> Self {
        WatchStream {
            rx,
            unsubscribe: Some(unsubscribe),
        }
    }

    /// Block until the next snapshot. Returns `None` once the backend is
    /// closed or the watcher was released.
    pub fn next(&self) -> Option<Vec<Entry>> {
        self.rx.recv().ok()
    }

    /// Non-blocking variant of [`WatchStream::next`].
    pub fn try_next(&self) -> Option<Vec<Entry>> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next snapshot with a timeout, distinguishing an idle
    /// stream from a closed one.
    pub fn next_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<Vec<Entry>, std::sync::mpsc::RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}
