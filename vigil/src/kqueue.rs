//! Emitter implementation for the kqueue API
//!
//! kqueue watches file descriptors, not paths: the emitter opens one
//! descriptor per file and directory under the watch root and registers
//! an `EVFILT_VNODE` kevent for each. kqueue also never says *what*
//! changed inside a directory, so a write notification on a directory
//! triggers a mini-diff of its children against the retained snapshot,
//! and a rename notification is resolved by looking the inode up under
//! its parent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use kqueue::{EventData, EventFilter, FilterFlag, Ident, Vnode};
use vigil_types::Event;
use walkdir::WalkDir;

use crate::backend::{join_thread_deadline, Emitter, EventSink};
use crate::snapshot::{DirectorySnapshot, FsSource, SnapshotSource};
use crate::{Config, Error, ObservedWatch, Result};

const KQUEUE: mio::Token = mio::Token(0);
const WAKE: mio::Token = mio::Token(1);

/// Descriptors held back from the budget so the process can still open
/// ordinary files.
const FD_RESERVE: u64 = 64;

fn fd_budget() -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let soft = if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } == 0 {
        limit.rlim_cur as u64
    } else {
        1024
    };
    soft.saturating_sub(FD_RESERVE) as usize
}

struct EventLoop {
    poll: mio::Poll,
    kqueue: kqueue::Watcher,
    sink: EventSink,
    recursive: bool,
    retained: DirectorySnapshot,
    ignore_device: bool,
    /// path -> is_dir, one entry per open descriptor
    watched: HashMap<PathBuf, bool>,
    budget: usize,
    budget_warned: bool,
    stopped: Arc<AtomicBool>,
    root_gone: bool,
}

/// Emitter implementation based on kqueue
pub(crate) struct KqueueEmitter {
    watch: ObservedWatch,
    waker: Arc<mio::Waker>,
    stopped: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl KqueueEmitter {
    pub(crate) fn spawn(watch: ObservedWatch, sink: EventSink, config: &Config) -> Result<Self> {
        let kq = kqueue::Watcher::new().map_err(Error::io)?;
        let poll = mio::Poll::new().map_err(Error::io)?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKE).map_err(Error::io)?);

        {
            use std::os::unix::io::AsRawFd;
            let fd = kq.as_raw_fd();
            poll.registry()
                .register(&mut mio::unix::SourceFd(&fd), KQUEUE, mio::Interest::READABLE)
                .map_err(Error::io)?;
        }

        let retained =
            DirectorySnapshot::new(watch.path(), watch.is_recursive(), config.ignore_device())
                .map_err(|e| Error::io(e).add_path(watch.path().into()))?;

        let stopped = Arc::new(AtomicBool::new(false));
        let mut event_loop = EventLoop {
            poll,
            kqueue: kq,
            sink,
            recursive: watch.is_recursive(),
            retained,
            ignore_device: config.ignore_device(),
            watched: HashMap::new(),
            budget: fd_budget(),
            budget_warned: false,
            stopped: Arc::clone(&stopped),
            root_gone: false,
        };

        // Seed on the caller thread: descriptor exhaustion here must fail
        // `schedule`, and dropping the kqueue watcher on the error path
        // closes every descriptor registered so far.
        event_loop.seed(watch.path())?;

        let thread = thread::Builder::new()
            .name("vigil kqueue emitter".to_string())
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

impl Emitter for KqueueEmitter {
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

impl Drop for KqueueEmitter {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

impl EventLoop {
    fn seed(&mut self, root: &Path) -> Result<()> {
        self.add_descriptor(root, root.is_dir(), true)?;
        let walk_depth = if self.recursive { usize::MAX } else { 1 };
        for entry in WalkDir::new(root)
            .min_depth(1)
            .max_depth(walk_depth)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            self.add_descriptor(entry.path(), entry.file_type().is_dir(), true)?;
        }
        self.kqueue.watch().map_err(Error::io)?;
        Ok(())
    }

    /// Registers one vnode watch. With `strict`, running out of budget is
    /// an error (scheduling); otherwise it is logged once and further
    /// registration quietly stops, leaving existing watches intact.
    fn add_descriptor(&mut self, path: &Path, is_dir: bool, strict: bool) -> Result<()> {
        if self.watched.contains_key(path) {
            return Ok(());
        }
        if self.watched.len() >= self.budget {
            if strict {
                return Err(Error::watch_limit().add_path(path.into()));
            }
            if !self.budget_warned {
                self.budget_warned = true;
                log::warn!(
                    "open-file budget ({}) exhausted; new entries under {} will not be watched",
                    self.budget,
                    self.sink.watch().path().display()
                );
            }
            return Ok(());
        }

        let filter_flags = FilterFlag::NOTE_DELETE
            | FilterFlag::NOTE_WRITE
            | FilterFlag::NOTE_EXTEND
            | FilterFlag::NOTE_ATTRIB
            | FilterFlag::NOTE_LINK
            | FilterFlag::NOTE_RENAME
            | FilterFlag::NOTE_REVOKE;

        log::trace!("adding kqueue watch: {}", path.display());
        self.kqueue
            .add_filename(path, EventFilter::EVFILT_VNODE, filter_flags)
            .map_err(|e| Error::io(e).add_path(path.into()))?;
        self.watched.insert(path.to_path_buf(), is_dir);
        Ok(())
    }

    fn remove_descriptor(&mut self, path: &Path) {
        if self.watched.remove(path).is_some() {
            log::trace!("removing kqueue watch: {}", path.display());
            let _ = self.kqueue.remove_filename(path, EventFilter::EVFILT_VNODE);
        }
    }

    fn remove_subtree(&mut self, path: &Path) {
        let stale: Vec<PathBuf> = self
            .watched
            .keys()
            .filter(|p| *p == path || p.starts_with(path))
            .cloned()
            .collect();
        for p in stale {
            self.remove_descriptor(&p);
        }
    }

    fn run(mut self) {
        let mut events = mio::Events::with_capacity(16);
        loop {
            match self.poll.poll(&mut events, None) {
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::error!("kqueue poll failed: {e}");
                    break;
                }
                Ok(()) => {}
            }

            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            for event in events.iter() {
                if event.token() == KQUEUE {
                    self.drain_kqueue();
                }
            }

            if self.root_gone {
                break;
            }
        }
    }

    fn drain_kqueue(&mut self) {
        let mut dirty = false;
        while let Some(event) = self.kqueue.poll(None) {
            log::trace!("kqueue event: {event:?}");
            let kqueue::Event {
                data: EventData::Vnode(data),
                ident: Ident::Filename(_, path),
            } = event
            else {
                continue;
            };
            let path = PathBuf::from(path);
            let is_dir = self.watched.get(&path).copied().unwrap_or(false);

            match data {
                Vnode::Delete | Vnode::Revoke => {
                    if path == self.sink.watch().path() {
                        self.sink.send(Event::dir_deleted(&path));
                        self.root_gone = true;
                        return;
                    }
                    // The parent's write notification may already have
                    // reported this through the mini-diff.
                    if self.retained.entry(&path).is_some() {
                        self.sink.send(if is_dir {
                            Event::dir_deleted(&path)
                        } else {
                            Event::file_deleted(&path)
                        });
                        self.retained.record_remove(&path);
                    }
                    self.remove_subtree(&path);
                    dirty = true;
                }
                Vnode::Write if is_dir => {
                    dirty |= self.diff_directory(&path);
                }
                Vnode::Write | Vnode::Extend | Vnode::Truncate => {
                    self.sink.send(Event::file_modified(&path));
                    self.retained.record_create(&path);
                }
                Vnode::Attrib => {
                    self.sink.send(if is_dir {
                        Event::dir_modified(&path)
                    } else {
                        Event::file_modified(&path)
                    });
                }
                Vnode::Link => {
                    // Link count changed on a directory: a subdirectory
                    // appeared or vanished.
                    if is_dir {
                        dirty |= self.diff_directory(&path);
                    }
                }
                Vnode::Rename => {
                    self.resolve_rename(&path, is_dir);
                    dirty = true;
                }
                #[allow(unreachable_patterns)]
                _ => {}
            }
        }

        if dirty {
            if let Err(e) = self.kqueue.watch() {
                log::error!("kqueue re-registration failed: {e}");
            }
        }
    }

    /// Something changed inside `dir`: list it and compare with the
    /// retained snapshot's idea of its children.
    fn diff_directory(&mut self, dir: &Path) -> bool {
        let listing = match FsSource.list_dir(dir) {
            Ok(listing) => listing,
            Err(_) => return false,
        };
        let mut changed = false;

        let known: Vec<PathBuf> = self
            .retained
            .entries()
            .filter(|e| e.path().parent() == Some(dir))
            .map(|e| e.path().to_path_buf())
            .collect();

        for (path, meta) in &listing {
            if self.retained.entry(path).is_none() {
                let is_dir = matches!(meta.entry_type, crate::snapshot::EntryType::Dir);
                self.sink.send(if is_dir {
                    Event::dir_created(path)
                } else {
                    Event::file_created(path)
                });
                self.retained.record_create(path);
                if self.recursive || Some(self.sink.watch().path()) == path.parent() {
                    let _ = self.add_descriptor(path, is_dir, false);
                    changed = true;
                }
                if is_dir && self.recursive {
                    changed |= self.diff_directory(path);
                }
            }
        }

        let current: std::collections::HashSet<&PathBuf> =
            listing.iter().map(|(p, _)| p).collect();
        for path in known {
            if !current.contains(&path) {
                let is_dir = self.watched.get(&path).copied().unwrap_or(false);
                self.sink.send(if is_dir {
                    Event::dir_deleted(&path)
                } else {
                    Event::file_deleted(&path)
                });
                self.retained.record_remove(&path);
                self.remove_subtree(&path);
                changed = true;
            }
        }
        changed
    }

    /// A rename fired on a descriptor: the old name is known, the new one
    /// is found by inode under the old parent. A target outside the
    /// watched subtree reads as a deletion.
    fn resolve_rename(&mut self, old_path: &Path, is_dir: bool) {
        let inode = self.retained.entry(old_path).map(|e| e.id());

        let mut new_path = None;
        if let (Some(id), Some(parent)) = (inode, old_path.parent()) {
            if let Ok(listing) = FsSource.list_dir(parent) {
                for (candidate, meta) in listing {
                    if candidate == old_path {
                        continue;
                    }
                    let candidate_id =
                        crate::snapshot::EntryId::new(&meta, &candidate, self.ignore_device);
                    if candidate_id == id {
                        new_path = Some(candidate);
                        break;
                    }
                }
            }
        }

        match new_path {
            Some(new_path) => {
                self.sink.send(if is_dir {
                    Event::dir_moved(old_path, &new_path)
                } else {
                    Event::file_moved(old_path, &new_path)
                });
                self.retained.record_rename(old_path, &new_path);
                self.remove_subtree(old_path);
                let _ = self.add_descriptor(&new_path, is_dir, false);
                if is_dir && self.recursive {
                    for entry in WalkDir::new(&new_path)
                        .min_depth(1)
                        .follow_links(false)
                        .into_iter()
                        .filter_map(|e| e.ok())
                    {
                        let _ =
                            self.add_descriptor(entry.path(), entry.file_type().is_dir(), false);
                    }
                }
            }
            None => {
                if self.retained.entry(old_path).is_some() {
                    self.sink.send(if is_dir {
                        Event::dir_deleted(old_path)
                    } else {
                        Event::file_deleted(old_path)
                    });
                    self.retained.record_remove(old_path);
                }
                self.remove_subtree(old_path);
            }
        }
    }
}
