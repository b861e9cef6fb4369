//! Watch manager
//!
//! Coalesces a backend watch stream into document-level change
//! callbacks. On every snapshot the manager compares the versionstamp
//! set against the last one it forwarded and only invokes the callback
//! when something changed, unless `raw` is requested, in which case
//! every snapshot is forwarded. Stopping the handle (or dropping it)
//! releases the upstream watcher.

use kvdex_core::{Document, KvdexResult, Versionstamp};
use kvdex_kv::{Entry, WatchStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::warn;

/// Options for watch operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    /// Forward every snapshot, even when no versionstamp changed.
    pub raw: bool,
}

/// Handle over a running watcher thread.
pub struct WatchHandle {
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WatchHandle {
    /// Stop the watcher and wait for its thread to exit.
    pub fn stop(mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Drive a watch stream on its own thread, forwarding decoded documents.
pub(crate) fn spawn_watcher<T, D, F>(
    stream: WatchStream,
    raw: bool,
    decode: D,
    on_change: F,
) -> KvdexResult<WatchHandle>
where
    T: Send + 'static,
    D: Fn(&[Entry]) -> KvdexResult<Vec<Option<Document<T>>>> + Send + 'static,
    F: Fn(Vec<Option<Document<T>>>) + Send + 'static,
{
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    let thread = std::thread::Builder::new()
        .name("kvdex-watch".to_string())
        .spawn(move || {
            let mut last: Option<Vec<Option<Versionstamp>>> = None;
            loop {
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                let entries = match stream.next_timeout(POLL_INTERVAL) {
                    Ok(entries) => entries,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                let stamps: Vec<Option<Versionstamp>> =
                    entries.iter().map(|e| e.versionstamp.clone()).collect();
                let changed = last.as_ref() != Some(&stamps);
                if raw || changed {
                    match decode(&entries) {
                        Ok(documents) => on_change(documents),
                        Err(err) => warn!(error = %err, "failed to decode watched entries"),
                    }
                }
                last = Some(stamps);
            }
        })
        .map_err(|e| kvdex_core::KvdexError::storage(format!("failed to spawn watcher: {}", e)))?;

    Ok(WatchHandle {
        cancel,
        thread: Some(thread),
    })
}
