//! Emitter implementation for the inotify Linux API
//!
//! The inotify API provides a mechanism for monitoring filesystem events.
//! inotify watches single directories only, so a recursive watch is a set
//! of kernel watches the emitter grows and shrinks as directories appear
//! and vanish below the root.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use vigil_types::Event;
use walkdir::WalkDir;

use crate::backend::{join_thread_deadline, Emitter, EventSink};
use crate::snapshot::{diff, DirectorySnapshot};
use crate::utils::DelayedQueue;
use crate::{Config, Error, ObservedWatch, Result};

const INOTIFY: mio::Token = mio::Token(0);
const WAKE: mio::Token = mio::Token(1);

/// A `moved_from` half waiting in the move grouper for its `moved_to`.
struct PendingMove {
    cookie: u32,
    path: PathBuf,
    is_dir: bool,
}

// The event loop blocks on a mio::Poll watching two sources: the inotify
// file descriptor, and the waker the emitter handle fires on stop. The
// poll timeout is bounded by the move grouper so expired rename halves
// degrade promptly.
struct EventLoop {
    poll: mio::Poll,
    inotify: Inotify,
    sink: EventSink,
    recursive: bool,
    /// wd -> directory it watches
    watches: HashMap<WatchDescriptor, PathBuf>,
    /// directory -> its wd
    descriptors: HashMap<PathBuf, WatchDescriptor>,
    pending_moves: DelayedQueue<PendingMove>,
    move_window: Duration,
    /// Kept in step with every translated event; the baseline an
    /// overflow catch-up diffs against.
    retained: DirectorySnapshot,
    ignore_device: bool,
    access_events: bool,
    stopped: Arc<AtomicBool>,
    root_gone: bool,
}

/// Emitter implementation based on inotify
pub(crate) struct INotifyEmitter {
    watch: ObservedWatch,
    waker: Arc<mio::Waker>,
    stopped: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl INotifyEmitter {
    pub(crate) fn spawn(watch: ObservedWatch, sink: EventSink, config: &Config) -> Result<Self> {
        let inotify = Inotify::init().map_err(Error::io)?;
        let poll = mio::Poll::new().map_err(Error::io)?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKE).map_err(Error::io)?);

        {
            use std::os::unix::io::AsRawFd;
            let fd = inotify.as_raw_fd();
            poll.registry()
                .register(&mut mio::unix::SourceFd(&fd), INOTIFY, mio::Interest::READABLE)
                .map_err(Error::io)?;
        }

        let stopped = Arc::new(AtomicBool::new(false));
        let mut event_loop = EventLoop {
            poll,
            inotify,
            sink,
            recursive: watch.is_recursive(),
            watches: HashMap::new(),
            descriptors: HashMap::new(),
            pending_moves: DelayedQueue::new(),
            move_window: config.move_window(),
            retained: DirectorySnapshot::empty(
                watch.path(),
                watch.is_recursive(),
                config.ignore_device(),
            ),
            ignore_device: config.ignore_device(),
            access_events: config.access_events(),
            stopped: Arc::clone(&stopped),
            root_gone: false,
        };

        // Register the kernel watches on the caller thread so that
        // resource exhaustion fails `schedule` synchronously. Dropping
        // the Inotify on the error path releases every watch added so
        // far, which is the rollback the contract asks for.
        event_loop.seed_watches(watch.path())?;
        event_loop.retained =
            DirectorySnapshot::new(watch.path(), watch.is_recursive(), config.ignore_device())
                .map_err(|e| Error::io(e).add_path(watch.path().into()))?;

        let thread = thread::Builder::new()
            .name("vigil inotify emitter".to_string())
            .spawn(move || event_loop.run())
            .map_err(Error::io)?;

        Ok(Self {
            watch,
            waker,
            stopped,
            thread: Some(thread),
        })
    }
}

impl Emitter for INotifyEmitter {
    fn watch(&self) -> &ObservedWatch {
        &self.watch
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }

    fn join_deadline(&mut self, deadline: Instant) -> bool {
        join_thread_deadline(&mut self.thread, deadline)
    }
}

impl Drop for INotifyEmitter {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

impl EventLoop {
    fn mask(&self, watch_self: bool) -> WatchMask {
        let mut mask = WatchMask::ATTRIB
            | WatchMask::MODIFY
            | WatchMask::CREATE
            | WatchMask::DELETE
            | WatchMask::MOVED_FROM
            | WatchMask::MOVED_TO;
        if self.access_events {
            mask |= WatchMask::OPEN | WatchMask::CLOSE_WRITE | WatchMask::CLOSE_NOWRITE;
        }
        if watch_self {
            mask |= WatchMask::DELETE_SELF | WatchMask::MOVE_SELF;
        }
        mask
    }

    fn seed_watches(&mut self, root: &Path) -> Result<()> {
        self.add_dir_watch(root, true)?;
        if self.recursive {
            for entry in WalkDir::new(root)
                .min_depth(1)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_dir())
            {
                self.add_dir_watch(entry.path(), false)?;
            }
        }
        Ok(())
    }

    fn add_dir_watch(&mut self, path: &Path, watch_self: bool) -> Result<()> {
        let mask = self.mask(watch_self);
        log::trace!("adding inotify watch: {}", path.display());
        match self.inotify.watches().add(path, mask) {
            Ok(wd) => {
                self.watches.insert(wd.clone(), path.to_path_buf());
                self.descriptors.insert(path.to_path_buf(), wd);
                Ok(())
            }
            Err(e) => Err(if e.raw_os_error() == Some(libc::ENOSPC) {
                // inotify reports its user-watch limit as "no space left"
                Error::watch_limit()
            } else if e.kind() == std::io::ErrorKind::NotFound {
                Error::path_not_found()
            } else {
                Error::io(e)
            }
            .add_path(path.into())),
        }
    }

    fn remove_subtree_watches(&mut self, path: &Path) {
        let stale: Vec<PathBuf> = self
            .descriptors
            .keys()
            .filter(|p| *p == path || p.starts_with(path))
            .cloned()
            .collect();
        for dir in stale {
            if let Some(wd) = self.descriptors.remove(&dir) {
                log::trace!("removing inotify watch: {}", dir.display());
                let _ = self.inotify.watches().remove(wd.clone());
                self.watches.remove(&wd);
            }
        }
    }

    fn rename_subtree_watches(&mut self, from: &Path, to: &Path) {
        let moved: Vec<PathBuf> = self
            .descriptors
            .keys()
            .filter(|p| *p == from || p.starts_with(from))
            .cloned()
            .collect();
        for old_dir in moved {
            if let Some(wd) = self.descriptors.remove(&old_dir) {
                let suffix = old_dir.strip_prefix(from).expect("prefix checked above");
                let new_dir = if suffix.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(suffix)
                };
                self.watches.insert(wd.clone(), new_dir.clone());
                self.descriptors.insert(new_dir, wd);
            }
        }
    }

    fn run(mut self) {
        let mut events = mio::Events::with_capacity(16);
        loop {
            let timeout = self
                .pending_moves
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));

            match self.poll.poll(&mut events, timeout) {
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::error!("inotify poll failed: {e}");
                    break;
                }
                Ok(()) => {}
            }

            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            for event in events.iter() {
                if event.token() == INOTIFY {
                    self.handle_inotify();
                }
            }

            self.flush_expired_moves();

            if self.root_gone {
                break;
            }
        }

        let _ = self.inotify.close();
    }

    fn handle_inotify(&mut self) {
        struct RawEvent {
            mask: EventMask,
            cookie: u32,
            wd: WatchDescriptor,
            name: Option<std::ffi::OsString>,
        }

        let mut buffer = [0u8; 4096];
        let mut overflowed = false;
        let mut raw = Vec::new();

        loop {
            match self.inotify.read_events(&mut buffer) {
                Ok(events) => {
                    let mut num_events = 0;
                    for event in events {
                        log::trace!("inotify event: {event:?}");
                        num_events += 1;

                        if event.mask.contains(EventMask::Q_OVERFLOW) {
                            overflowed = true;
                            continue;
                        }
                        if event.mask.contains(EventMask::IGNORED) {
                            continue;
                        }
                        raw.push(RawEvent {
                            mask: event.mask,
                            cookie: event.cookie,
                            wd: event.wd.clone(),
                            name: event.name.map(|n| n.to_os_string()),
                        });
                    }
                    if num_events == 0 {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("inotify read failed: {e}");
                    break;
                }
            }
        }

        for event in raw {
            let base = match self.watches.get(&event.wd) {
                Some(base) => base.clone(),
                None => {
                    log::debug!("inotify event with unknown descriptor");
                    continue;
                }
            };
            let path = match event.name {
                Some(name) => base.join(name),
                None => base,
            };
            let is_dir = event.mask.contains(EventMask::ISDIR);

            self.translate(event.mask, event.cookie, path, is_dir);
            if self.root_gone {
                return;
            }
        }

        if overflowed {
            log::error!(
                "inotify queue overflowed for {}; resynchronizing",
                self.sink.watch().path().display()
            );
            self.catch_up();
        }
    }

    fn translate(&mut self, mask: EventMask, cookie: u32, path: PathBuf, is_dir: bool) {
        if mask.contains(EventMask::MOVED_FROM) {
            self.pending_moves.put(
                PendingMove {
                    cookie,
                    path,
                    is_dir,
                },
                self.move_window,
            );
            return;
        }

        if mask.contains(EventMask::MOVED_TO) {
            match self
                .pending_moves
                .remove(|pending| pending.cookie == cookie)
            {
                Some(pending) => {
                    let event = if is_dir {
                        Event::dir_moved(&pending.path, &path)
                    } else {
                        Event::file_moved(&pending.path, &path)
                    };
                    self.sink.send(event);
                    self.retained.record_rename(&pending.path, &path);
                    if is_dir {
                        self.rename_subtree_watches(&pending.path, &path);
                    }
                }
                None => {
                    // The source was outside this watch (or the window
                    // expired): the entry effectively appeared here.
                    self.emit_created(path, is_dir);
                }
            }
            return;
        }

        if mask.contains(EventMask::CREATE) {
            self.emit_created(path, is_dir);
            return;
        }

        if mask.contains(EventMask::DELETE) {
            self.sink.send(if is_dir {
                Event::dir_deleted(&path)
            } else {
                Event::file_deleted(&path)
            });
            self.retained.record_remove(&path);
            if is_dir {
                self.remove_subtree_watches(&path);
            }
            return;
        }

        if mask.contains(EventMask::DELETE_SELF) || mask.contains(EventMask::MOVE_SELF) {
            if path == self.sink.watch().path() {
                self.sink.send(Event::dir_deleted(&path));
                self.root_gone = true;
            }
            return;
        }

        if mask.contains(EventMask::MODIFY) {
            self.sink.send(if is_dir {
                Event::dir_modified(&path)
            } else {
                Event::file_modified(&path)
            });
        }
        if mask.contains(EventMask::ATTRIB) {
            self.sink.send(if is_dir {
                Event::dir_modified(&path)
            } else {
                Event::file_modified(&path)
            });
        }
        if mask.contains(EventMask::CLOSE_WRITE) {
            self.sink.send(if is_dir {
                Event::dir_closed(&path)
            } else {
                Event::file_closed(&path)
            });
        }
        if mask.contains(EventMask::CLOSE_NOWRITE) {
            self.sink.send(if is_dir {
                Event::dir_closed_no_write(&path)
            } else {
                Event::file_closed_no_write(&path)
            });
        }
        if mask.contains(EventMask::OPEN) {
            self.sink.send(if is_dir {
                Event::dir_opened(&path)
            } else {
                Event::file_opened(&path)
            });
        }
    }

    fn emit_created(&mut self, path: PathBuf, is_dir: bool) {
        // A catch-up replay under a freshly watched subdirectory may have
        // reported this entry already; the retained snapshot knows.
        if self.retained.entry(&path).is_none() {
            self.sink.send(if is_dir {
                Event::dir_created(&path)
            } else {
                Event::file_created(&path)
            });
            self.retained.record_create(&path);
        }

        if is_dir && self.recursive {
            self.watch_new_subtree(&path);
        }
    }

    /// A directory appeared under a recursive watch: bring it under
    /// observation and replay anything that was created inside before the
    /// kernel watch took effect.
    fn watch_new_subtree(&mut self, dir: &Path) {
        if let Err(err) = self.add_dir_watch(dir, false) {
            log::error!("cannot watch new directory {}: {err}", dir.display());
            return;
        }

        for entry in WalkDir::new(dir)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path().to_path_buf();
            if self.retained.entry(&path).is_some() {
                continue;
            }
            let entry_is_dir = entry.file_type().is_dir();
            if entry_is_dir {
                if let Err(err) = self.add_dir_watch(&path, false) {
                    log::error!("cannot watch new directory {}: {err}", path.display());
                    if matches!(err.kind, crate::ErrorKind::WatchLimit) {
                        break;
                    }
                    continue;
                }
            }
            self.sink.send(
                if entry_is_dir {
                    Event::dir_created(&path)
                } else {
                    Event::file_created(&path)
                }
                .into_synthetic(),
            );
            self.retained.record_create(&path);
        }
    }

    fn flush_expired_moves(&mut self) {
        while let Some(pending) = self.pending_moves.pop_ready() {
            self.sink.send(if pending.is_dir {
                Event::dir_deleted(&pending.path)
            } else {
                Event::file_deleted(&pending.path)
            });
            self.retained.record_remove(&pending.path);
            if pending.is_dir {
                self.remove_subtree_watches(&pending.path);
            }
        }
    }

    /// Resynchronize after a kernel-side overflow: diff the retained
    /// snapshot against the tree as it is now, emit the difference as
    /// synthetic events, and rebuild the kernel watch set.
    fn catch_up(&mut self) {
        let root = self.sink.watch().path().to_path_buf();
        let current = match DirectorySnapshot::new(&root, self.recursive, self.ignore_device) {
            Ok(current) => current,
            Err(_) => {
                self.sink.send(Event::dir_deleted(&root));
                self.root_gone = true;
                return;
            }
        };

        for event in diff(&self.retained, &current) {
            self.sink.send(event);
        }
        self.retained = current;

        // Rebuild the watch set against ground truth.
        let stale: Vec<PathBuf> = self.descriptors.keys().cloned().collect();
        for dir in stale {
            if !dir.is_dir() {
                if let Some(wd) = self.descriptors.remove(&dir) {
                    let _ = self.inotify.watches().remove(wd.clone());
                    self.watches.remove(&wd);
                }
            }
        }
        if self.recursive {
            let missing: Vec<PathBuf> = self
                .retained
                .entries()
                .filter(|e| e.is_dir() && !self.descriptors.contains_key(e.path()))
                .map(|e| e.path().to_path_buf())
                .collect();
            for dir in missing {
                if let Err(err) = self.add_dir_watch(&dir, false) {
                    log::error!("cannot re-watch {}: {err}", dir.display());
                    if matches!(err.kind, crate::ErrorKind::WatchLimit) {
                        break;
                    }
                }
            }
        }
    }
}
