//! Queue-backed schedulers
//!
//! Interval and loop callbacks are built on queue delivery rather than
//! timers: each scheduler instance owns a fresh uuid topic and a single
//! undelivered id, and every tick re-enqueues the next one. Delivery of
//! a tick is verified through the undelivered key: after the delay
//! passes, a captured message means the tick was lost, so the capture is
//! deleted and the enqueue retried (ten attempts by default).
//!
//! The first delivery is clamped below by the configured minimum start
//! delay so the queue listener is registered before it fires.

use crate::envelope::{self, QueueRegistry};
use crate::ids;
use crate::keys::{root_key, UNDELIVERED_KEY_PREFIX};
use kvdex_core::{from_value, to_value, KeyPart, KvKey, KvLimits, KvdexResult};
use kvdex_kv::{Backend, Consistency};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The envelope data of one scheduler tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMessage {
    /// Zero-based tick number.
    pub count: u64,
    /// Delay that preceded this tick, in milliseconds.
    pub delay_ms: u64,
    /// When the tick was enqueued, milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// True only for the first tick.
    pub first: bool,
}

/// Delay between ticks: a constant, or derived from the last message.
#[derive(Clone)]
pub enum Interval {
    /// Constant delay.
    Fixed(Duration),
    /// Delay computed from the previous tick's message.
    Dynamic(Arc<dyn Fn(&SchedulerMessage) -> Duration + Send + Sync>),
}

impl Interval {
    fn next(&self, last: &SchedulerMessage) -> Duration {
        match self {
            Interval::Fixed(duration) => *duration,
            Interval::Dynamic(f) => f(last),
        }
    }
}

/// Termination predicates and hooks for a scheduler.
#[derive(Default)]
pub struct SchedulerOptions {
    /// Delay before the first tick. Clamped below by the configured
    /// minimum.
    pub start_delay: Option<Duration>,
    /// Keep running while this returns true (default: always).
    pub while_fn: Option<Arc<dyn Fn(&SchedulerMessage) -> bool + Send + Sync>>,
    /// Stop when this returns true (default: never).
    pub exit_on: Option<Arc<dyn Fn(&SchedulerMessage) -> bool + Send + Sync>>,
    /// Invoked exactly once when the scheduler terminates.
    pub on_exit: Option<Box<dyn FnOnce() + Send>>,
    /// Enqueue attempts per tick before giving up (default: 10).
    pub retry_attempts: Option<usize>,
}

const DEFAULT_RETRY_ATTEMPTS: usize = 10;

/// Handle over a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    stopped: Arc<AtomicBool>,
}

impl SchedulerHandle {
    /// Stop scheduling further ticks. Termination hooks do not fire.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// True once the scheduler has terminated or was stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Block until the scheduler terminates, up to `timeout`. Returns
    /// true when it terminated in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if self.is_stopped() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.is_stopped()
    }
}

struct SchedulerState {
    backend: Arc<dyn Backend>,
    limits: Arc<KvLimits>,
    handler_id: String,
    undelivered_key: KvKey,
    interval: Interval,
    stopped: Arc<AtomicBool>,
    while_fn: Option<Arc<dyn Fn(&SchedulerMessage) -> bool + Send + Sync>>,
    exit_on: Option<Arc<dyn Fn(&SchedulerMessage) -> bool + Send + Sync>>,
    on_exit: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    retry_attempts: usize,
}

impl SchedulerState {
    fn exit(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(on_exit) = self.on_exit.lock().take() {
            on_exit();
        }
    }

    /// Enqueue one tick and verify it was delivered, retrying through the
    /// undelivered capture.
    fn enqueue_verified(&self, message: SchedulerMessage, delay: Duration) {
        let grace: u64 = self.limits.queue_backoff_schedule.iter().sum::<u64>() + 100;
        for attempt in 0..self.retry_attempts {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            let data = match to_value(&message) {
                Ok(data) => data,
                Err(err) => {
                    warn!(error = %err, "failed to encode scheduler tick");
                    return;
                }
            };
            let envelope = envelope::wrap(data, self.handler_id.clone());
            if let Err(err) = self.backend.enqueue(
                envelope,
                kvdex_kv::EnqueueOptions {
                    delay: Some(delay),
                    keys_if_undelivered: vec![self.undelivered_key.clone()],
                    backoff_schedule: None,
                },
            ) {
                warn!(error = %err, attempt, "scheduler enqueue failed");
                continue;
            }

            std::thread::sleep(delay + Duration::from_millis(grace));
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            let captured = self
                .backend
                .get(&self.undelivered_key, Consistency::Strong)
                .map(|entry| entry.is_present())
                .unwrap_or(false);
            if !captured {
                return; // delivered
            }
            debug!(attempt, "scheduler tick was captured undelivered, retrying");
            let _ = self.backend.delete(&self.undelivered_key);
        }
        warn!(
            attempts = self.retry_attempts,
            "scheduler tick undelivered after all attempts"
        );
    }
}

/// Start a scheduler on the database facade's queue.
pub(crate) fn start_scheduler<F>(
    backend: Arc<dyn Backend>,
    limits: Arc<KvLimits>,
    queue: &Arc<QueueRegistry>,
    interval: Interval,
    min_start_delay: Duration,
    options: SchedulerOptions,
    tick: F,
) -> KvdexResult<SchedulerHandle>
where
    F: Fn(&SchedulerMessage) + Send + Sync + 'static,
{
    let topic = ids::uuid();
    let undelivered_id = KeyPart::String(ids::uuid());
    let undelivered_key = root_key()
        .extended(UNDELIVERED_KEY_PREFIX)
        .extended(undelivered_id);
    let stopped = Arc::new(AtomicBool::new(false));

    let state = Arc::new(SchedulerState {
        backend: Arc::clone(&backend),
        limits,
        handler_id: envelope::handler_id(&root_key(), Some(&topic)),
        undelivered_key,
        interval,
        stopped: Arc::clone(&stopped),
        while_fn: options.while_fn,
        exit_on: options.exit_on,
        on_exit: Mutex::new(options.on_exit),
        retry_attempts: options.retry_attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS),
    });

    // listener first, then the first tick: the start-delay clamp
    // guarantees registration wins the race
    let handler_state = Arc::clone(&state);
    queue.register(
        state.handler_id.clone(),
        Arc::new(move |value| {
            let message: SchedulerMessage = from_value(value)?;
            let state = &handler_state;
            if state.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }
            let keep_running = state.while_fn.as_ref().map_or(true, |f| f(&message))
                && !state.exit_on.as_ref().is_some_and(|f| f(&message));
            if !keep_running {
                state.exit();
                return Ok(());
            }
            tick(&message);

            let delay = state.interval.next(&message);
            let next = SchedulerMessage {
                count: message.count + 1,
                delay_ms: delay.as_millis() as u64,
                timestamp: crate::collection::now_millis(),
                first: false,
            };
            let schedule_state = Arc::clone(state);
            std::thread::spawn(move || schedule_state.enqueue_verified(next, delay));
            Ok(())
        }),
    );
    QueueRegistry::activate(queue, &backend)?;

    let start_delay = options
        .start_delay
        .unwrap_or(min_start_delay)
        .max(min_start_delay);
    let first = SchedulerMessage {
        count: 0,
        delay_ms: start_delay.as_millis() as u64,
        timestamp: crate::collection::now_millis(),
        first: true,
    };
    let first_state = Arc::clone(&state);
    std::thread::spawn(move || first_state.enqueue_verified(first, start_delay));

    Ok(SchedulerHandle { stopped })
}
