//! Shared helpers for the end-to-end observer tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use vigil::{Event, EventHandler};

pub const WAIT: Duration = Duration::from_secs(10);

/// A channel-backed handler plus its receiving end.
pub fn channel_handler() -> (Arc<dyn EventHandler>, Receiver<Event>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (Arc::new(tx), rx)
}

/// Canonical form of a path that is expected to exist.
pub fn canon(path: &Path) -> PathBuf {
    path.canonicalize().expect("canonicalize")
}

/// Waits until an event matching the predicate arrives, returning it.
/// Non-matching events are discarded. Panics on timeout.
pub fn wait_for<F>(rx: &Receiver<Event>, what: &str, predicate: F) -> Event
where
    F: Fn(&Event) -> bool,
{
    let deadline = Instant::now() + WAIT;
    loop {
        let now = Instant::now();
        assert!(now < deadline, "timed out waiting for {what}");
        match rx.recv_timeout(deadline - now) {
            Ok(event) => {
                if predicate(&event) {
                    return event;
                }
            }
            Err(_) => panic!("timed out waiting for {what}"),
        }
    }
}

/// Waits for an event with the given wire name at the given path.
pub fn wait_for_named(rx: &Receiver<Event>, name: &str, path: &Path) -> Event {
    wait_for(rx, &format!("{name} at {}", path.display()), |event| {
        event.name() == name && event.src_path() == path
    })
}

/// Asserts that no event at all arrives within `quiet`.
pub fn assert_silent(rx: &Receiver<Event>, quiet: Duration) {
    match rx.recv_timeout(quiet) {
        Ok(event) => panic!("expected silence, received {event:?}"),
        Err(_) => {}
    }
}

/// Asserts that no event concerning `path` arrives within `quiet`;
/// unrelated events are ignored.
pub fn assert_silent_about(rx: &Receiver<Event>, path: &Path, quiet: Duration) {
    let deadline = Instant::now() + quiet;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        if let Ok(event) = rx.recv_timeout(deadline - now) {
            assert!(
                event.src_path() != path && event.dest_path() != Some(path),
                "expected no events about {}, received {event:?}",
                path.display()
            );
        }
    }
}
