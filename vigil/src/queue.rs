//! The shared event queue between emitters and the dispatcher.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use vigil_types::Event;

use crate::ObservedWatch;

/// Why a `get` returned without an entry.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PopError {
    /// The timeout elapsed with the queue empty.
    Timeout,
    /// The queue is closed and fully drained.
    Closed,
}

struct Inner {
    entries: VecDeque<(Event, ObservedWatch)>,
    closed: bool,
}

/// Bounded multi-producer queue of `(event, watch)` pairs with adjacent
/// de-duplication.
///
/// Kernel-level coalescing is inconsistent across platforms; dropping an
/// entry that is structurally equal to the current tail gives handlers a
/// uniform story without reordering distinct events. `put` blocks once the
/// configured capacity is reached, which is what backpressures emitters
/// when handlers are slow.
pub(crate) struct EventQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl EventQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                closed: false,
            }),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Enqueues one entry, blocking while the queue is at capacity.
    ///
    /// An entry equal to the current tail is dropped silently. Entries
    /// offered after `close` are discarded.
    pub(crate) fn put(&self, event: Event, watch: ObservedWatch) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if inner.closed {
                return;
            }
            if let Some((tail_event, tail_watch)) = inner.entries.back() {
                if *tail_event == event && *tail_watch == watch {
                    return;
                }
            }
            if inner.entries.len() < self.capacity {
                inner.entries.push_back((event, watch));
                self.not_empty.notify_one();
                return;
            }
            inner = self
                .not_full
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Dequeues the oldest entry, waiting up to `timeout` for one to
    /// arrive. A closed queue keeps handing out entries until it is
    /// drained, then reports [`PopError::Closed`].
    pub(crate) fn get(&self, timeout: Duration) -> Result<(Event, ObservedWatch), PopError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(entry) = inner.entries.pop_front() {
                self.not_full.notify_one();
                return Ok(entry);
            }
            if inner.closed {
                return Err(PopError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PopError::Timeout);
            }
            let (guard, _timed_out) = self
                .not_empty
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
        }
    }

    /// Closes the queue: pending entries remain readable, further `put`s
    /// are discarded, and blocked producers and the consumer wake up.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }
}
