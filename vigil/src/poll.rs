//! The portable polling backend: snapshot, diff, repeat.
//!
//! This is the only backend with correct semantics on filesystems whose
//! change notification is weak or absent (network mounts, some FUSE
//! filesystems), at the cost of walking the tree every tick.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use vigil_types::Event;

use crate::backend::{join_thread_deadline, Emitter, EventSink};
use crate::snapshot::{diff, DirectorySnapshot, FsSource, SnapshotSource};
use crate::{Config, Error, ObservedWatch, Result};

struct Shared {
    stopped: Mutex<bool>,
    cond: Condvar,
}

pub(crate) struct PollingEmitter {
    watch: ObservedWatch,
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PollingEmitter {
    pub(crate) fn spawn(watch: ObservedWatch, sink: EventSink, config: &Config) -> Result<Self> {
        let ignore_device = config.ignore_device();
        let recursive = watch.is_recursive();

        // Fail scheduling synchronously if the root is not walkable.
        FsSource
            .metadata(watch.path())
            .map_err(|e| Error::io(e).add_path(watch.path().into()))?;

        let baseline = if config.poll_catch_up() {
            DirectorySnapshot::empty(watch.path(), recursive, ignore_device)
        } else {
            DirectorySnapshot::new(watch.path(), recursive, ignore_device)
                .map_err(|e| Error::io(e).add_path(watch.path().into()))?
        };

        let shared = Arc::new(Shared {
            stopped: Mutex::new(false),
            cond: Condvar::new(),
        });

        let interval = config.poll_interval();
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("vigil polling emitter".to_string())
            .spawn(move || run(&worker, sink, baseline, interval, ignore_device))
            .map_err(Error::io)?;

        Ok(Self {
            watch,
            shared,
            thread: Some(thread),
        })
    }
}

fn run(
    shared: &Shared,
    sink: EventSink,
    baseline: DirectorySnapshot,
    interval: Duration,
    ignore_device: bool,
) {
    let root = sink.watch().path().to_path_buf();
    let recursive = sink.watch().is_recursive();
    let mut previous = baseline;

    loop {
        // The tick interval doubles as the shutdown observation point.
        let mut stopped = shared.stopped.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = Instant::now() + interval;
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = shared
                .cond
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            stopped = guard;
        }
        if *stopped {
            return;
        }
        drop(stopped);

        if FsSource.metadata(&root).is_err() {
            // The watched root itself vanished: one terminal event, then
            // the emitter winds down.
            sink.send(Event::dir_deleted(&root).into_synthetic());
            return;
        }

        match DirectorySnapshot::new(&root, recursive, ignore_device) {
            Ok(current) => {
                for event in diff(&previous, &current) {
                    sink.send(event);
                }
                previous = current;
            }
            Err(err) => {
                log::debug!("polling scan of {} failed: {err}", root.display());
            }
        }
    }
}

impl Emitter for PollingEmitter {
    fn watch(&self) -> &ObservedWatch {
        &self.watch
    }

    fn stop(&mut self) {
        let mut stopped = self
            .shared
            .stopped
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *stopped = true;
        self.shared.cond.notify_all();
    }

    fn join_deadline(&mut self, deadline: Instant) -> bool {
        join_thread_deadline(&mut self.thread, deadline)
    }
}

impl Drop for PollingEmitter {
    fn drop(&mut self) {
        self.stop();
    }
}
