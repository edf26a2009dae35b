//! A queue whose items become visible only after a per-item delay.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Holds items back until their individual delay has elapsed.
///
/// The inotify backend parks lone `moved_from` halves here while waiting
/// for the matching `moved_to`; the Windows backend does the same for
/// rename halves split across read buffers. Emitter loops are driven by a
/// kernel wait, so this queue is polled rather than blocked on:
/// [`next_deadline`](DelayedQueue::next_deadline) bounds the kernel-wait
/// timeout and [`pop_ready`](DelayedQueue::pop_ready) drains items whose
/// time has come.
#[derive(Debug)]
pub struct DelayedQueue<T> {
    items: Mutex<VecDeque<(Instant, T)>>,
}

impl<T> DelayedQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueues an item that becomes ready after `delay`.
    pub fn put(&self, item: T, delay: Duration) {
        let ready_at = Instant::now() + delay;
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        // Uniform delays keep the deque sorted by readiness; insert from
        // the back to preserve that for mixed delays.
        let pos = items
            .iter()
            .rposition(|(at, _)| *at <= ready_at)
            .map(|p| p + 1)
            .unwrap_or(0);
        items.insert(pos, (ready_at, item));
    }

    /// Removes and returns the oldest item whose delay has elapsed.
    pub fn pop_ready(&self) -> Option<T> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        match items.front() {
            Some((ready_at, _)) if *ready_at <= Instant::now() => {
                items.pop_front().map(|(_, item)| item)
            }
            _ => None,
        }
    }

    /// Removes and returns the first item matching the predicate,
    /// regardless of its delay.
    pub fn remove<F>(&self, predicate: F) -> Option<T>
    where
        F: Fn(&T) -> bool,
    {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let pos = items.iter().position(|(_, item)| predicate(item))?;
        items.remove(pos).map(|(_, item)| item)
    }

    /// When the head item becomes ready, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.front().map(|(ready_at, _)| *ready_at)
    }

    /// Removes and returns everything, ready or not.
    pub fn drain(&self) -> Vec<T> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.drain(..).map(|(_, item)| item).collect()
    }

    /// Whether the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}

impl<T> Default for DelayedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
