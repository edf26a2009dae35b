//! Burst-collapsing helper offered to handlers.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use vigil_types::Event;

use crate::EventHandler;

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    interval: Duration,
}

struct State {
    events: Vec<Event>,
    running: bool,
}

/// Collapses bursts of events into periodic batches.
///
/// Events received within the configured interval are collected and
/// flushed together, in arrival order, to the callback. The emitters never
/// debounce on their own; wrap a `EventDebouncer` around your own logic
/// and register it as the handler when per-event granularity is noise.
///
/// The flush thread is joined on [`stop`](EventDebouncer::stop); dropping
/// the debouncer without stopping leaves any final partial batch
/// unflushed.
pub struct EventDebouncer {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventDebouncer {
    /// Spawns the flush thread.
    pub fn new<F>(interval: Duration, callback: F) -> Self
    where
        F: Fn(Vec<Event>) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                events: Vec::new(),
                running: true,
            }),
            cond: Condvar::new(),
            interval,
        });

        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("vigil debouncer".to_string())
            .spawn(move || run(&worker, callback))
            .expect("failed to spawn debouncer thread");

        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Adds one event to the current batch.
    pub fn put(&self, event: Event) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        state.events.push(event);
        self.shared.cond.notify_one();
    }

    /// Stops the flush thread, delivering any pending batch first.
    pub fn stop(mut self) {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            state.running = false;
            self.shared.cond.notify_one();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl EventHandler for EventDebouncer {
    fn dispatch(&self, event: &Event) {
        self.put(event.clone());
    }
}

fn run<F>(shared: &Shared, callback: F)
where
    F: Fn(Vec<Event>),
{
    let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
    loop {
        // Wait for the first event of a batch.
        while state.running && state.events.is_empty() {
            state = shared
                .cond
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        if !state.running {
            break;
        }

        // Collect follow-up events until the interval has passed.
        let batch_started = Instant::now();
        while state.running {
            let elapsed = batch_started.elapsed();
            if elapsed >= shared.interval {
                break;
            }
            let (guard, _) = shared
                .cond
                .wait_timeout(state, shared.interval - elapsed)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }

        let batch = std::mem::take(&mut state.events);
        drop(state);
        callback(batch);
        state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
    }

    // Flush whatever arrived before the stop signal.
    let batch = std::mem::take(&mut state.events);
    drop(state);
    if !batch.is_empty() {
        callback(batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn burst_arrives_as_one_batch() {
        let (tx, rx) = unbounded();
        let debouncer = EventDebouncer::new(Duration::from_millis(50), move |batch| {
            tx.send(batch).unwrap();
        });

        debouncer.put(Event::file_created("/a"));
        debouncer.put(Event::file_modified("/a"));
        debouncer.put(Event::file_closed("/a"));

        let batch = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(
            batch,
            vec![
                Event::file_created("/a"),
                Event::file_modified("/a"),
                Event::file_closed("/a"),
            ]
        );
        debouncer.stop();
    }

    #[test]
    fn stop_flushes_the_pending_batch() {
        let (tx, rx) = unbounded();
        let debouncer = EventDebouncer::new(Duration::from_secs(3600), move |batch| {
            tx.send(batch).unwrap();
        });

        debouncer.put(Event::file_created("/a"));
        debouncer.stop();

        let batch = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(batch, vec![Event::file_created("/a")]);
    }

    #[test]
    fn usable_as_a_handler() {
        let (tx, rx) = unbounded();
        let debouncer = EventDebouncer::new(Duration::from_millis(10), move |batch| {
            for event in batch {
                tx.send(event).unwrap();
            }
        });

        EventHandler::dispatch(&debouncer, &Event::dir_created("/d"));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Event::dir_created("/d")
        );
        debouncer.stop();
    }
}
