//! Emitter implementation for Windows' directory management APIs
//!
//! One asynchronous `ReadDirectoryChangesW` call is kept in flight per
//! watched root; each completion delivers a buffer of
//! `FILE_NOTIFY_INFORMATION` records and immediately re-arms the read.
//! Completion routines run as APCs on the emitter thread itself (the
//! thread waits alertably), so the translation state needs no locking.
//!
//! For more information see the [ReadDirectoryChangesW reference][ref].
//!
//! [ref]: https://msdn.microsoft.com/en-us/library/windows/desktop/aa363950(v=vs.85).aspx

use std::alloc;
use std::ffi::OsString;
use std::os::raw::c_void;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vigil_types::Event;
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, ERROR_OPERATION_ABORTED, ERROR_SUCCESS, HANDLE,
    INVALID_HANDLE_VALUE, WAIT_OBJECT_0,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
    FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
    FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME,
    FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SECURITY,
    FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION, FILE_SHARE_DELETE, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::{
    CreateSemaphoreW, ReleaseSemaphore, WaitForSingleObjectEx,
};
use windows_sys::Win32::System::IO::{CancelIo, OVERLAPPED};

use crate::backend::{join_thread_deadline, Emitter, EventSink};
use crate::snapshot::{diff, DirectorySnapshot};
use crate::utils::DelayedQueue;
use crate::{Config, Error, ObservedWatch, Result};

const BUF_SIZE: u32 = 64 * 1024;

/// Mutable translation state. Completion routines and the wait loop both
/// execute on the emitter thread, which is what makes the raw pointer
/// sharing below sound.
struct EmitterState {
    sink: EventSink,
    root: PathBuf,
    handle: HANDLE,
    recursive: bool,
    retained: DirectorySnapshot,
    ignore_device: bool,
    /// Rename halves whose partner record did not arrive in the same
    /// buffer; they degrade to delete/create after the move window.
    pending_renames: DelayedQueue<(PathBuf, bool)>,
    move_window: Duration,
    complete_sem: HANDLE,
    root_gone: bool,
    reading: bool,
}

struct ReadRequest {
    state: *mut EmitterState,
    buffer: [u8; BUF_SIZE as usize],
}

struct SendHandle(HANDLE);
// Handles are process-global kernel object references; sending the raw
// value across threads is fine, concurrent use is what would not be.
unsafe impl Send for SendHandle {}

/// Emitter implementation based on ReadDirectoryChangesW
pub(crate) struct ReadDirectoryChangesEmitter {
    watch: ObservedWatch,
    stopped: Arc<AtomicBool>,
    wakeup_sem: SendHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl ReadDirectoryChangesEmitter {
    pub(crate) fn spawn(watch: ObservedWatch, sink: EventSink, config: &Config) -> Result<Self> {
        if !watch.path().is_dir() {
            return Err(Error::path_not_found().add_path(watch.path().into()));
        }

        let encoded_path: Vec<u16> = watch
            .path()
            .as_os_str()
            .encode_wide()
            .chain(Some(0))
            .collect();
        let handle = unsafe {
            CreateFileW(
                encoded_path.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_DELETE | FILE_SHARE_WRITE,
                ptr::null_mut(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(Error::path_not_found().add_path(watch.path().into()));
        }

        let wakeup_sem = unsafe { CreateSemaphoreW(ptr::null_mut(), 0, 1, ptr::null_mut()) };
        let complete_sem = unsafe { CreateSemaphoreW(ptr::null_mut(), 0, 1, ptr::null_mut()) };
        if wakeup_sem.is_null() || complete_sem.is_null() {
            unsafe { CloseHandle(handle) };
            return Err(Error::generic("failed to create emitter semaphores"));
        }

        let retained =
            DirectorySnapshot::new(watch.path(), watch.is_recursive(), config.ignore_device())
                .map_err(|e| Error::io(e).add_path(watch.path().into()))?;

        let state = Box::new(EmitterState {
            sink,
            root: watch.path().to_path_buf(),
            handle,
            recursive: watch.is_recursive(),
            retained,
            ignore_device: config.ignore_device(),
            pending_renames: DelayedQueue::new(),
            move_window: config.move_window(),
            complete_sem,
            root_gone: false,
            reading: false,
        });

        let stopped = Arc::new(AtomicBool::new(false));
        let thread_stopped = Arc::clone(&stopped);
        let thread_handles = (SendHandle(handle), SendHandle(wakeup_sem), SendHandle(complete_sem));
        let state = SendState(Box::into_raw(state));

        let thread = thread::Builder::new()
            .name("vigil windows emitter".to_string())
            .spawn(move || {
                let (dir, wakeup, complete) = thread_handles;
                run(state.0, dir.0, wakeup.0, complete.0, &thread_stopped);
            })
            .map_err(Error::io)?;

        Ok(Self {
            watch,
            stopped,
            wakeup_sem: SendHandle(wakeup_sem),
            thread: Some(thread),
        })
    }
}

struct SendState(*mut EmitterState);
// Handed to the emitter thread once; never touched from this side again.
unsafe impl Send for SendState {}

impl Emitter for ReadDirectoryChangesEmitter {
    fn watch(&self) -> &ObservedWatch {
        &self.watch
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        unsafe {
            ReleaseSemaphore(self.wakeup_sem.0, 1, ptr::null_mut());
        }
    }

    fn join_deadline(&mut self, deadline: Instant) -> bool {
        join_thread_deadline(&mut self.thread, deadline)
    }
}

impl Drop for ReadDirectoryChangesEmitter {
    fn drop(&mut self) {
        self.stop();
        unsafe {
            CloseHandle(self.wakeup_sem.0);
        }
    }
}

fn run(
    state: *mut EmitterState,
    dir_handle: HANDLE,
    wakeup_sem: HANDLE,
    complete_sem: HANDLE,
    stopped: &AtomicBool,
) {
    unsafe {
        start_read(state);

        loop {
            let timeout = (*state)
                .pending_renames
                .next_deadline()
                .map(|deadline| {
                    deadline
                        .saturating_duration_since(Instant::now())
                        .as_millis()
                        .max(1) as u32
                })
                .unwrap_or(100);

            // Alertable wait: completion routines fire here as APCs.
            let wait = WaitForSingleObjectEx(wakeup_sem, timeout, 1);
            if wait == WAIT_OBJECT_0 || stopped.load(Ordering::SeqCst) {
                break;
            }

            let state_ref = &mut *state;
            flush_expired_renames(state_ref);
            if state_ref.root_gone {
                break;
            }
        }

        // Tear down: cancel the outstanding read, then drain the APC
        // queue until the completion routine acknowledges.
        let was_reading = (*state).reading;
        let cio = CancelIo(dir_handle);
        let ch = CloseHandle(dir_handle);
        if was_reading && cio != 0 && ch != 0 {
            while WaitForSingleObjectEx(complete_sem, 5000, 1) != WAIT_OBJECT_0 {
                if !(*state).reading {
                    break;
                }
            }
        }
        CloseHandle(complete_sem);

        drop(Box::from_raw(state));
    }
}

unsafe fn start_read(state: *mut EmitterState) {
    let state_ref = &mut *state;

    let flags = FILE_NOTIFY_CHANGE_FILE_NAME
        | FILE_NOTIFY_CHANGE_DIR_NAME
        | FILE_NOTIFY_CHANGE_ATTRIBUTES
        | FILE_NOTIFY_CHANGE_SIZE
        | FILE_NOTIFY_CHANGE_LAST_WRITE
        | FILE_NOTIFY_CHANGE_CREATION
        | FILE_NOTIFY_CHANGE_SECURITY;

    let monitor_subdir = if state_ref.recursive { 1 } else { 0 };

    let request = Box::leak(Box::new(ReadRequest {
        state,
        buffer: [0u8; BUF_SIZE as usize],
    }));

    let overlapped = alloc::alloc_zeroed(alloc::Layout::new::<OVERLAPPED>()) as *mut OVERLAPPED;
    // With completion-routine async requests the hEvent member is free
    // for application use.
    (*overlapped).hEvent = request as *mut _ as HANDLE;

    let ret = ReadDirectoryChangesW(
        state_ref.handle,
        request.buffer.as_mut_ptr() as *mut c_void,
        BUF_SIZE,
        monitor_subdir,
        flags,
        &mut 0u32 as *mut u32,
        overlapped,
        Some(handle_completion),
    );

    if ret == 0 {
        // The kernel never took ownership; reclaim both allocations.
        let _overlapped = Box::from_raw(overlapped);
        let request = Box::from_raw(request);
        let state_ref = &mut *request.state;
        state_ref.reading = false;
        if !state_ref.root.exists() {
            state_ref
                .sink
                .send(Event::dir_deleted(&state_ref.root));
            state_ref.root_gone = true;
        }
        ReleaseSemaphore(state_ref.complete_sem, 1, ptr::null_mut());
    } else {
        state_ref.reading = true;
    }
}

unsafe extern "system" fn handle_completion(
    error_code: u32,
    bytes_written: u32,
    overlapped: *mut OVERLAPPED,
) {
    let overlapped: Box<OVERLAPPED> = Box::from_raw(overlapped);
    let request: Box<ReadRequest> = Box::from_raw(overlapped.hEvent as *mut _);
    let state = &mut *request.state;
    state.reading = false;

    match error_code {
        ERROR_OPERATION_ABORTED => {
            ReleaseSemaphore(state.complete_sem, 1, ptr::null_mut());
            return;
        }
        ERROR_ACCESS_DENIED => {
            // Typically the watched directory itself was deleted or
            // trashed.
            if !state.root.exists() {
                state.sink.send(Event::dir_deleted(&state.root));
                state.root_gone = true;
                ReleaseSemaphore(state.complete_sem, 1, ptr::null_mut());
                return;
            }
        }
        ERROR_SUCCESS => {}
        other => {
            log::error!(
                "ReadDirectoryChangesW failed for {}: error {other}",
                state.root.display()
            );
            state.root_gone = true;
            ReleaseSemaphore(state.complete_sem, 1, ptr::null_mut());
            return;
        }
    }

    if bytes_written == 0 && error_code == ERROR_SUCCESS {
        // Zero-length completion: the 64 KiB buffer overflowed and the
        // kernel dropped records. Resynchronize by diffing.
        log::warn!(
            "change buffer overflowed for {}; resynchronizing",
            state.root.display()
        );
        catch_up(state);
    } else {
        translate_buffer(state, &request.buffer);
    }

    // Queue the next read before returning to the alertable wait.
    start_read(request.state);
}

unsafe fn translate_buffer(state: &mut EmitterState, buffer: &[u8]) {
    let mut pending_old: Option<(PathBuf, bool)> = None;
    let mut cur_offset: *const u8 = buffer.as_ptr();
    // In Wine the records are aligned to 16-bit boundaries rather than
    // the 32-bit alignment FILE_NOTIFY_INFORMATION asks for, hence the
    // unaligned reads.
    let mut cur_entry = ptr::read_unaligned(cur_offset as *const FILE_NOTIFY_INFORMATION);

    loop {
        // FileNameLength is in bytes.
        let len = cur_entry.FileNameLength as usize / 2;
        let encoded_path: &[u16] = slice::from_raw_parts(
            cur_offset.offset(std::mem::offset_of!(FILE_NOTIFY_INFORMATION, FileName) as isize)
                as _,
            len,
        );
        let path = state
            .root
            .join(PathBuf::from(OsString::from_wide(encoded_path)));

        log::trace!(
            "windows event: path = `{}`, action = {}",
            path.display(),
            cur_entry.Action
        );

        match cur_entry.Action {
            FILE_ACTION_RENAMED_OLD_NAME => {
                if let Some((stale, stale_dir)) = pending_old.take() {
                    emit_deleted(state, &stale, stale_dir);
                }
                let is_dir = state
                    .retained
                    .entry(&path)
                    .map(|e| e.is_dir())
                    .unwrap_or(false);
                pending_old = Some((path, is_dir));
            }
            FILE_ACTION_RENAMED_NEW_NAME => {
                let old = pending_old
                    .take()
                    .or_else(|| state.pending_renames.remove(|_| true));
                match old {
                    Some((old_path, old_is_dir)) => {
                        let is_dir = old_is_dir || path.is_dir();
                        state.sink.send(if is_dir {
                            Event::dir_moved(&old_path, &path)
                        } else {
                            Event::file_moved(&old_path, &path)
                        });
                        state.retained.record_rename(&old_path, &path);
                    }
                    None => emit_created(state, &path),
                }
            }
            FILE_ACTION_ADDED => emit_created(state, &path),
            FILE_ACTION_REMOVED => {
                let is_dir = state
                    .retained
                    .entry(&path)
                    .map(|e| e.is_dir())
                    .unwrap_or(false);
                emit_deleted(state, &path, is_dir);
            }
            FILE_ACTION_MODIFIED => {
                let is_dir = path.is_dir();
                state.sink.send(if is_dir {
                    Event::dir_modified(&path)
                } else {
                    Event::file_modified(&path)
                });
            }
            _ => {}
        }

        if cur_entry.NextEntryOffset == 0 {
            break;
        }
        cur_offset = cur_offset.offset(cur_entry.NextEntryOffset as isize);
        cur_entry = ptr::read_unaligned(cur_offset as *const FILE_NOTIFY_INFORMATION);
    }

    // An old-name half with no partner in this buffer waits out the move
    // window; its new-name half may arrive in the next completion.
    if let Some((path, is_dir)) = pending_old {
        let window = state.move_window;
        state.pending_renames.put((path, is_dir), window);
    }
}

fn emit_created(state: &mut EmitterState, path: &Path) {
    let is_dir = path.is_dir();
    state.sink.send(if is_dir {
        Event::dir_created(path)
    } else {
        Event::file_created(path)
    });
    state.retained.record_create(path);
}

fn emit_deleted(state: &mut EmitterState, path: &Path, is_dir: bool) {
    state.sink.send(if is_dir {
        Event::dir_deleted(path)
    } else {
        Event::file_deleted(path)
    });
    state.retained.record_remove(path);
}

fn flush_expired_renames(state: &mut EmitterState) {
    while let Some((path, is_dir)) = state.pending_renames.pop_ready() {
        emit_deleted(state, &path, is_dir);
    }
}

fn catch_up(state: &mut EmitterState) {
    let current = match DirectorySnapshot::new(&state.root, state.recursive, state.ignore_device)
    {
        Ok(current) => current,
        Err(_) => {
            state.sink.send(Event::dir_deleted(&state.root));
            state.root_gone = true;
            return;
        }
    };
    for event in diff(&state.retained, &current) {
        state.sink.send(event);
    }
    state.retained = current;
}
