//! The contract between the observer kernel and the platform backends.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vigil_types::{Event, EventKind};

use crate::queue::EventQueue;
use crate::{Config, Error, ObservedWatch, Result};

/// Which notification mechanism an observer drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ObserverKind {
    /// inotify backend (Linux)
    INotify,
    /// FSEvents backend (macOS)
    FsEvent,
    /// kqueue backend (BSD, optionally macOS)
    Kqueue,
    /// ReadDirectoryChangesW backend (Windows)
    ReadDirectoryChanges,
    /// Snapshot-diff polling backend (portable fallback)
    Polling,
    /// Inert backend for tests
    Null,
}

impl ObserverKind {
    /// The best native mechanism for the compilation target.
    pub fn native() -> Self {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        return ObserverKind::INotify;

        #[cfg(all(target_os = "macos", feature = "macos_fsevent"))]
        return ObserverKind::FsEvent;

        #[cfg(any(
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd",
            target_os = "dragonfly",
            target_os = "ios",
            all(target_os = "macos", not(feature = "macos_fsevent"))
        ))]
        return ObserverKind::Kqueue;

        #[cfg(windows)]
        return ObserverKind::ReadDirectoryChanges;

        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd",
            target_os = "dragonfly",
            windows
        )))]
        return ObserverKind::Polling;
    }
}

/// One running emitter: the thread and kernel resources serving a single
/// watch.
///
/// `stop` only signals; the emitter thread wakes from its kernel wait and
/// exits on its own. `join_deadline` bounds how long the kernel waits for
/// that to happen — a thread that overstays is abandoned, its kernel
/// resources released by the drop of its owned state.
pub(crate) trait Emitter: Send {
    fn watch(&self) -> &ObservedWatch;

    /// Signals the emitter thread to exit and wakes it from its wait.
    fn stop(&mut self);

    /// Waits until `deadline` for the emitter thread to terminate.
    /// Returns `false` if the thread had to be abandoned.
    fn join_deadline(&mut self, deadline: Instant) -> bool;
}

/// Waits on a thread handle until the deadline, abandoning it after.
pub(crate) fn join_thread_deadline(
    handle: &mut Option<thread::JoinHandle<()>>,
    deadline: Instant,
) -> bool {
    let Some(thread) = handle.take() else {
        return true;
    };
    while Instant::now() < deadline {
        if thread.is_finished() {
            let _ = thread.join();
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    let finished = thread.is_finished();
    if finished {
        let _ = thread.join();
    } else {
        *handle = Some(thread);
    }
    finished
}

/// Where an emitter delivers its events: the shared queue, bound to the
/// originating watch.
///
/// The sink applies the policy that is uniform across backends: access
/// events are dropped unless enabled, and the watch's kind filter is
/// enforced here for backends that could not push it into the kernel.
#[derive(Clone)]
pub(crate) struct EventSink {
    queue: Arc<EventQueue>,
    watch: ObservedWatch,
    access_events: bool,
}

impl EventSink {
    pub(crate) fn new(queue: Arc<EventQueue>, watch: ObservedWatch, config: &Config) -> Self {
        Self {
            queue,
            watch,
            access_events: config.access_events(),
        }
    }

    pub(crate) fn watch(&self) -> &ObservedWatch {
        &self.watch
    }

    pub(crate) fn send(&self, event: Event) {
        if !self.access_events
            && matches!(
                event.kind(),
                EventKind::Opened | EventKind::Closed | EventKind::ClosedNoWrite
            )
        {
            return;
        }
        if !self.watch.accepts(&event) {
            return;
        }
        self.queue.put(event, self.watch.clone());
    }
}

/// Creates and starts the emitter serving `watch` on the given mechanism.
pub(crate) fn spawn_emitter(
    kind: ObserverKind,
    watch: ObservedWatch,
    sink: EventSink,
    config: &Config,
) -> Result<Box<dyn Emitter>> {
    match kind {
        ObserverKind::Polling => Ok(Box::new(crate::poll::PollingEmitter::spawn(
            watch, sink, config,
        )?)),
        ObserverKind::Null => Ok(Box::new(crate::null::NullEmitter::new(watch))),

        #[cfg(any(target_os = "linux", target_os = "android"))]
        ObserverKind::INotify => Ok(Box::new(crate::inotify::INotifyEmitter::spawn(
            watch, sink, config,
        )?)),

        #[cfg(all(
            any(target_os = "macos", target_os = "ios"),
            feature = "macos_fsevent"
        ))]
        ObserverKind::FsEvent => Ok(Box::new(crate::fsevent::FsEventEmitter::spawn(
            watch, sink, config,
        )?)),

        #[cfg(any(
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd",
            target_os = "dragonfly",
            all(any(target_os = "macos", target_os = "ios"), feature = "macos_kqueue")
        ))]
        ObserverKind::Kqueue => Ok(Box::new(crate::kqueue::KqueueEmitter::spawn(
            watch, sink, config,
        )?)),

        #[cfg(windows)]
        ObserverKind::ReadDirectoryChanges => Ok(Box::new(
            crate::windows::ReadDirectoryChangesEmitter::spawn(watch, sink, config)?,
        )),

        #[allow(unreachable_patterns)]
        other => Err(Error::generic(&format!(
            "backend {other:?} is not available on this platform"
        ))),
    }
}
