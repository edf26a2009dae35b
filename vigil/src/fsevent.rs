//! Emitter implementation for Darwin's FSEvents API
//!
//! The FSEvents API notifies clients about directories they ought to
//! re-scan to keep their internal structures up-to-date. Notifications
//! arrive "in bulk": one callback may carry several paths, and one path's
//! flag word may be a coalesced bundle of several distinct transitions
//! (created, removed and renamed all set at once). The emitter resolves
//! such bundles against filesystem ground truth and emits the minimum
//! sequence of canonical events consistent with both.
//!
//! For more information see the [FSEvents API reference][ref].
//!
//! [ref]: https://developer.apple.com/library/mac/documentation/Darwin/Reference/FSEvents_Ref/

#![allow(non_upper_case_globals)]

use std::ffi::CStr;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::Mutex;
use std::thread;
use std::time::Instant;

use objc2_core_foundation as cf;
use objc2_core_services as fs;
use vigil_types::Event;

use crate::backend::{join_thread_deadline, Emitter, EventSink};
use crate::snapshot::{diff, DirectorySnapshot};
use crate::{Config, Error, ObservedWatch, Result};

bitflags::bitflags! {
  #[repr(C)]
  #[derive(Debug, Clone, Copy)]
  struct StreamFlags: u32 {
    const NONE = fs::kFSEventStreamEventFlagNone;
    const MUST_SCAN_SUBDIRS = fs::kFSEventStreamEventFlagMustScanSubDirs;
    const USER_DROPPED = fs::kFSEventStreamEventFlagUserDropped;
    const KERNEL_DROPPED = fs::kFSEventStreamEventFlagKernelDropped;
    const IDS_WRAPPED = fs::kFSEventStreamEventFlagEventIdsWrapped;
    const HISTORY_DONE = fs::kFSEventStreamEventFlagHistoryDone;
    const ROOT_CHANGED = fs::kFSEventStreamEventFlagRootChanged;
    const MOUNT = fs::kFSEventStreamEventFlagMount;
    const UNMOUNT = fs::kFSEventStreamEventFlagUnmount;
    const ITEM_CREATED = fs::kFSEventStreamEventFlagItemCreated;
    const ITEM_REMOVED = fs::kFSEventStreamEventFlagItemRemoved;
    const INODE_META_MOD = fs::kFSEventStreamEventFlagItemInodeMetaMod;
    const ITEM_RENAMED = fs::kFSEventStreamEventFlagItemRenamed;
    const ITEM_MODIFIED = fs::kFSEventStreamEventFlagItemModified;
    const FINDER_INFO_MOD = fs::kFSEventStreamEventFlagItemFinderInfoMod;
    const ITEM_CHANGE_OWNER = fs::kFSEventStreamEventFlagItemChangeOwner;
    const ITEM_XATTR_MOD = fs::kFSEventStreamEventFlagItemXattrMod;
    const IS_FILE = fs::kFSEventStreamEventFlagItemIsFile;
    const IS_DIR = fs::kFSEventStreamEventFlagItemIsDir;
    const IS_SYMLINK = fs::kFSEventStreamEventFlagItemIsSymlink;
    const OWN_EVENT = fs::kFSEventStreamEventFlagOwnEvent;
    const IS_HARDLINK = fs::kFSEventStreamEventFlagItemIsHardlink;
    const IS_LAST_HARDLINK = fs::kFSEventStreamEventFlagItemIsLastHardlink;
    const ITEM_CLONED = fs::kFSEventStreamEventFlagItemCloned;
  }
}

/// Per-stream state the C callback works against.
struct StreamContext {
    translator: Mutex<Translator>,
}

struct Translator {
    sink: EventSink,
    recursive: bool,
    retained: DirectorySnapshot,
    ignore_device: bool,
    /// The first half of a rename, waiting for the adjacent event id.
    pending_rename: Option<(fs::FSEventStreamEventId, PathBuf, bool)>,
}

/// FSEvents-based emitter: one stream per watch, scheduled on a dedicated
/// run loop owned by the emitter thread.
pub(crate) struct FsEventEmitter {
    watch: ObservedWatch,
    runloop: Option<cf::CFRetained<cf::CFRunLoop>>,
    thread: Option<thread::JoinHandle<()>>,
}

// The runloop reference is only used to stop the loop from the kernel
// thread; Apple documents CFRunLoop as safe to message across threads.
unsafe impl Send for FsEventEmitter {}

impl FsEventEmitter {
    pub(crate) fn spawn(watch: ObservedWatch, sink: EventSink, config: &Config) -> Result<Self> {
        if !watch.path().exists() {
            return Err(Error::path_not_found().add_path(watch.path().into()));
        }

        let retained =
            DirectorySnapshot::new(watch.path(), watch.is_recursive(), config.ignore_device())
                .map_err(|e| Error::io(e).add_path(watch.path().into()))?;

        let context = Box::into_raw(Box::new(StreamContext {
            translator: Mutex::new(Translator {
                sink,
                recursive: watch.is_recursive(),
                retained,
                ignore_device: config.ignore_device(),
                pending_rename: None,
            }),
        }));

        let stream_context = fs::FSEventStreamContext {
            version: 0,
            info: context as *mut libc::c_void,
            retain: None,
            release: Some(release_context),
            copyDescription: None,
        };

        let paths = cf::CFMutableArray::<cf::CFString>::empty();
        let cf_path = cf::CFString::from_str(&watch.path().to_string_lossy());
        paths.append(&cf_path);

        let stream = unsafe {
            fs::FSEventStreamCreate(
                cf::kCFAllocatorDefault,
                Some(callback),
                &stream_context as *const _ as *mut _,
                paths.as_opaque(),
                fs::kFSEventStreamEventIdSinceNow,
                0.0,
                fs::kFSEventStreamCreateFlagFileEvents | fs::kFSEventStreamCreateFlagNoDefer,
            )
        };

        struct FSEventStreamSendWrapper(fs::FSEventStreamRef);
        // The stream is handed to exactly one thread and never shared.
        unsafe impl Send for FSEventStreamSendWrapper {}

        struct CFRunLoopSendWrapper(cf::CFRetained<cf::CFRunLoop>);
        // CFRunLoop may be messaged across threads per Apple's thread
        // safety summary.
        unsafe impl Send for CFRunLoopSendWrapper {}

        let stream = FSEventStreamSendWrapper(stream);
        let (rl_tx, rl_rx) = std::sync::mpsc::channel();

        let thread = thread::Builder::new()
            .name("vigil fsevents emitter".to_string())
            .spawn(move || {
                let stream = stream.0;
                unsafe {
                    let cur_runloop = cf::CFRunLoop::current().expect("current runloop");

                    #[allow(deprecated)]
                    fs::FSEventStreamScheduleWithRunLoop(
                        stream,
                        &cur_runloop,
                        cf::kCFRunLoopDefaultMode.expect("default runloop mode"),
                    );
                    if !fs::FSEventStreamStart(stream) {
                        fs::FSEventStreamInvalidate(stream);
                        fs::FSEventStreamRelease(stream);
                        rl_tx
                            .send(Err(Error::generic("unable to start FSEvent stream")))
                            .expect("emitter spawn is waiting for the runloop");
                        return;
                    }

                    rl_tx
                        .send(Ok(CFRunLoopSendWrapper(cur_runloop)))
                        .expect("emitter spawn is waiting for the runloop");

                    // Terminated by CFRunLoopStop from `stop`.
                    cf::CFRunLoop::run();

                    fs::FSEventStreamStop(stream);
                    // Pending callbacks may still fire after the stream is
                    // stopped; purging prevents that.
                    let event_id = fs::FSEventsGetCurrentEventId();
                    let device = fs::FSEventStreamGetDeviceBeingWatched(stream);
                    fs::FSEventsPurgeEventsForDeviceUpToEventId(device, event_id);
                    fs::FSEventStreamInvalidate(stream);
                    fs::FSEventStreamRelease(stream);
                }
            })
            .map_err(Error::io)?;

        let runloop = rl_rx.recv().map_err(Error::from)??;

        Ok(Self {
            watch,
            runloop: Some(runloop.0),
            thread: Some(thread),
        })
    }
}

impl Emitter for FsEventEmitter {
    fn watch(&self) -> &ObservedWatch {
        &self.watch
    }

    fn stop(&mut self) {
        if let Some(runloop) = self.runloop.take() {
            while !runloop.is_waiting() {
                thread::yield_now();
            }
            runloop.stop();
        }
    }

    fn join_deadline(&mut self, deadline: Instant) -> bool {
        join_thread_deadline(&mut self.thread, deadline)
    }
}

impl Drop for FsEventEmitter {
    fn drop(&mut self) {
        self.stop();
    }
}

// Free the context when the stream created by `FSEventStreamCreate` is
// released; the documentation guarantees this runs exactly once, at
// stream deallocation.
unsafe extern "C-unwind" fn release_context(info: *const libc::c_void) {
    unsafe {
        drop(Box::from_raw(info as *const StreamContext as *mut StreamContext));
    }
}

unsafe extern "C-unwind" fn callback(
    stream_ref: fs::ConstFSEventStreamRef,
    info: *mut libc::c_void,
    num_events: libc::size_t,
    event_paths: NonNull<libc::c_void>,
    event_flags: NonNull<fs::FSEventStreamEventFlags>,
    event_ids: NonNull<fs::FSEventStreamEventId>,
) {
    unsafe {
        callback_impl(
            stream_ref,
            info,
            num_events,
            event_paths,
            event_flags,
            event_ids,
        )
    }
}

unsafe fn callback_impl(
    _stream_ref: fs::ConstFSEventStreamRef,
    info: *mut libc::c_void,
    num_events: libc::size_t,
    event_paths: NonNull<libc::c_void>,
    event_flags: NonNull<fs::FSEventStreamEventFlags>,
    event_ids: NonNull<fs::FSEventStreamEventId>,
) {
    let event_paths = event_paths.as_ptr() as *const *const libc::c_char;
    let context = &*(info as *const StreamContext);
    let mut translator = context
        .translator
        .lock()
        .unwrap_or_else(|e| e.into_inner());

    for i in 0..num_events {
        let path = match CStr::from_ptr(*event_paths.add(i)).to_str() {
            Ok(path) => PathBuf::from(path),
            Err(_) => {
                log::debug!("FSEvent path is not valid UTF-8; skipping");
                continue;
            }
        };
        let raw_flags = *event_flags.as_ptr().add(i);
        let flags = StreamFlags::from_bits_retain(raw_flags);
        let event_id = *event_ids.as_ptr().add(i);

        log::trace!("FSEvent: path = `{}`, flags = {flags:?}", path.display());
        translator.handle(path, flags, event_id);
    }
    translator.resolve_pending_rename();
}

impl Translator {
    /// Non-recursive watches ride a natively recursive stream; everything
    /// below the first level is filtered out here.
    fn in_scope(&self, path: &Path) -> bool {
        let root = self.sink.watch().path();
        if self.recursive {
            path.starts_with(root)
        } else {
            path == root || path.parent() == Some(root)
        }
    }

    fn handle(&mut self, path: PathBuf, flags: StreamFlags, event_id: fs::FSEventStreamEventId) {
        // Sentinel closing the "historical events" preamble; the path
        // accompanying it is meaningless.
        if flags.contains(StreamFlags::HISTORY_DONE) {
            return;
        }

        if flags.contains(StreamFlags::MUST_SCAN_SUBDIRS) || flags.contains(StreamFlags::IDS_WRAPPED)
        {
            if flags.contains(StreamFlags::USER_DROPPED) {
                log::warn!("FSEvents dropped events in userspace; resynchronizing");
            } else if flags.contains(StreamFlags::KERNEL_DROPPED) {
                log::warn!("FSEvents dropped events in the kernel; resynchronizing");
            }
            self.catch_up();
            return;
        }

        if !self.in_scope(&path) {
            return;
        }

        let is_dir = flags.contains(StreamFlags::IS_DIR);
        let root = self.sink.watch().path().to_path_buf();

        if flags.contains(StreamFlags::ROOT_CHANGED) || flags.contains(StreamFlags::UNMOUNT) {
            self.sink.send(Event::dir_deleted(&root));
            return;
        }

        if flags.contains(StreamFlags::ITEM_RENAMED) {
            match self.pending_rename.take() {
                Some((prev_id, prev_path, prev_is_dir)) if event_id == prev_id + 1 => {
                    // FSEvents reports the two endpoints of one rename as
                    // two ItemRenamed notifications with consecutive ids.
                    self.emit_moved(prev_path, path, prev_is_dir || is_dir);
                }
                stale => {
                    if let Some((_, stale_path, stale_dir)) = stale {
                        self.resolve_lone_rename(stale_path, stale_dir);
                    }
                    self.pending_rename = Some((event_id, path, is_dir));
                }
            }
            return;
        }

        // The remaining flags may be coalesced: several transitions on one
        // path folded into a single notification. Stat the path and emit
        // the minimum sequence consistent with the bundle and the ground
        // truth.
        let exists = path.symlink_metadata().is_ok();
        let created = flags.contains(StreamFlags::ITEM_CREATED);
        let removed = flags.contains(StreamFlags::ITEM_REMOVED);
        let modified = flags.contains(StreamFlags::ITEM_MODIFIED)
            || flags.contains(StreamFlags::INODE_META_MOD)
            || flags.contains(StreamFlags::ITEM_CHANGE_OWNER)
            || flags.contains(StreamFlags::ITEM_XATTR_MOD)
            || flags.contains(StreamFlags::FINDER_INFO_MOD);

        if flags.contains(StreamFlags::MOUNT) {
            self.emit_created(path.clone(), true);
            return;
        }

        let known_before = self.retained.entry(&path).is_some();

        if created && removed {
            // Created|Removed in one bundle: the path either reappeared or
            // is finally gone; ground truth decides which half is current.
            if exists {
                if known_before {
                    self.emit_deleted(path.clone(), is_dir);
                }
                self.emit_created(path.clone(), is_dir);
            } else {
                if !known_before {
                    self.emit_created(path.clone(), is_dir);
                }
                self.emit_deleted(path.clone(), is_dir);
            }
        } else if created {
            if !known_before {
                self.emit_created(path.clone(), is_dir);
            }
        } else if removed {
            self.emit_deleted(path.clone(), is_dir);
        }

        if modified && exists {
            self.sink.send(if is_dir {
                Event::dir_modified(&path)
            } else {
                Event::file_modified(&path)
            });
        }

        if path == self.sink.watch().path() && !exists {
            self.sink.send(Event::dir_deleted(&path));
        }
    }

    fn emit_created(&mut self, path: PathBuf, is_dir: bool) {
        self.sink.send(if is_dir {
            Event::dir_created(&path)
        } else {
            Event::file_created(&path)
        });
        self.retained.record_create(&path);
    }

    fn emit_deleted(&mut self, path: PathBuf, is_dir: bool) {
        self.sink.send(if is_dir {
            Event::dir_deleted(&path)
        } else {
            Event::file_deleted(&path)
        });
        self.retained.record_remove(&path);
    }

    fn emit_moved(&mut self, from: PathBuf, to: PathBuf, is_dir: bool) {
        let from_inside = self.in_scope(&from);
        let to_inside = self.in_scope(&to);
        match (from_inside, to_inside) {
            (true, true) => {
                self.sink.send(if is_dir {
                    Event::dir_moved(&from, &to)
                } else {
                    Event::file_moved(&from, &to)
                });
                self.retained.record_rename(&from, &to);
            }
            (true, false) => self.emit_deleted(from, is_dir),
            (false, true) => self.emit_created(to, is_dir),
            (false, false) => {}
        }
    }

    /// A rename notification whose partner never showed up: decide by
    /// ground truth whether the path arrived or left.
    fn resolve_lone_rename(&mut self, path: PathBuf, is_dir: bool) {
        if !self.in_scope(&path) {
            return;
        }
        if path.symlink_metadata().is_ok() {
            self.emit_created(path, is_dir);
        } else {
            self.emit_deleted(path, is_dir);
        }
    }

    fn resolve_pending_rename(&mut self) {
        if let Some((_, path, is_dir)) = self.pending_rename.take() {
            self.resolve_lone_rename(path, is_dir);
        }
    }

    /// Identical in semantics to polling's snapshot-vs-current diff,
    /// keyed off the retained snapshot.
    fn catch_up(&mut self) {
        let root = self.sink.watch().path().to_path_buf();
        let current = match DirectorySnapshot::new(&root, self.recursive, self.ignore_device) {
            Ok(current) => current,
            Err(_) => {
                self.sink.send(Event::dir_deleted(&root));
                return;
            }
        };
        for event in diff(&self.retained, &current) {
            self.sink.send(event);
        }
        self.retained = current;
    }
}
