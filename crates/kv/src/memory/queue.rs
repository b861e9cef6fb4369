//! In-process queue broker
//!
//! One delivery worker drains a deadline heap of scheduled messages.
//! Messages enqueued before any dispatcher is registered are held.
//! A failed delivery reschedules per the message's backoff schedule;
//! exhausting the schedule hands the message back to the backend for
//! undelivered capture.

use crate::backend::QueueHandler;
use kvdex_core::{KvKey, KvValue};
use parking_lot::{Condvar, Mutex};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

pub(crate) struct QueueMessage {
    pub(crate) value: KvValue,
    pub(crate) attempt: usize,
    pub(crate) backoff: Vec<u64>,
    pub(crate) keys_if_undelivered: Vec<KvKey>,
}

pub(crate) struct Scheduled {
    pub(crate) deliver_at: Instant,
    seq: u64,
    pub(crate) msg: QueueMessage,
}

// Ordering over (deliver_at, seq) only; the payload does not participate.
impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deliver_at == other.deliver_at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deliver_at
            .cmp(&other.deliver_at)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) struct BrokerState {
    pub(crate) heap: BinaryHeap<Reverse<Scheduled>>,
    pub(crate) handler: Option<QueueHandler>,
    seq: u64,
    pub(crate) shutdown: bool,
}

/// Scheduling state plus the condvar the worker parks on.
pub(crate) struct Broker {
    pub(crate) state: Mutex<BrokerState>,
    pub(crate) cv: Condvar,
    default_backoff: Vec<u64>,
}

impl Broker {
    pub(crate) fn new(default_backoff: Vec<u64>) -> Self {
        Broker {
            state: Mutex::new(BrokerState {
                heap: BinaryHeap::new(),
                handler: None,
                seq: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
            default_backoff,
        }
    }

    /// Schedule a fresh message.
    pub(crate) fn submit(
        &self,
        value: KvValue,
        delay: Option<Duration>,
        keys_if_undelivered: Vec<KvKey>,
        backoff_schedule: Option<Vec<u64>>,
    ) {
        let msg = QueueMessage {
            value,
            attempt: 0,
            backoff: backoff_schedule.unwrap_or_else(|| self.default_backoff.clone()),
            keys_if_undelivered,
        };
        self.schedule(msg, Instant::now() + delay.unwrap_or(Duration::ZERO));
    }

    /// Put a message (back) on the heap with an explicit deadline.
    pub(crate) fn schedule(&self, msg: QueueMessage, deliver_at: Instant) {
        let mut state = self.state.lock();
        state.seq += 1;
        let seq = state.seq;
        state.heap.push(Reverse(Scheduled {
            deliver_at,
            seq,
            msg,
        }));
        self.cv.notify_one();
    }

    /// Install the process-wide dispatcher. Replaces any previous one and
    /// releases messages held while no dispatcher existed.
    pub(crate) fn register(&self, handler: QueueHandler) {
        self.state.lock().handler = Some(handler);
        self.cv.notify_all();
    }

    pub(crate) fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cv.notify_all();
    }
}
