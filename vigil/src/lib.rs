//! Cross-platform filesystem event observation
//!
//! # Installation
//!
//! ```toml
//! [dependencies]
//! vigil = "0.4"
//! ```
//!
//! An [`Observer`] watches one or more directory subtrees and fans a
//! stream of canonical [`Event`]s out to the handlers scheduled on each
//! watch. The same programmatic contract is served by whichever kernel
//! notification mechanism the host offers — inotify on Linux, FSEvents on
//! macOS, kqueue on the BSDs, `ReadDirectoryChangesW` on Windows — plus a
//! portable polling backend built on directory snapshots.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vigil::{new_observer, Config, RecursiveMode};
//!
//! fn main() -> vigil::Result<()> {
//!     let (tx, rx) = crossbeam_channel::unbounded();
//!
//!     // `new_observer` picks the best backend for the platform. Handlers
//!     // can be closures, `crossbeam_channel` senders, or any type
//!     // implementing `EventHandler`.
//!     let observer = new_observer(Config::default())?;
//!     observer.schedule(Arc::new(tx), std::path::Path::new("."), RecursiveMode::Recursive)?;
//!     observer.start()?;
//!
//!     while let Ok(event) = rx.recv_timeout(Duration::from_millis(100)) {
//!         println!("{event:?}");
//!     }
//!
//!     observer.stop()?;
//!     observer.join(Duration::from_secs(5));
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `serde` for serialization of events
//! - `macos_fsevent` enabled by default, for the FSEvents backend on macOS
//! - `macos_kqueue` for the kqueue backend on macOS
//!
//! # Known Problems
//!
//! ### Network filesystems
//!
//! Network mounted filesystems like NFS and SMB may not emit any native
//! change notifications. Use [`new_polling_observer`] there; it is the
//! only backend with correct semantics on such mounts.
//!
//! ### Linux: no space left on device
//!
//! Watching a large tree recursively can exhaust the per-user inotify
//! watch budget; scheduling then fails with
//! [`ErrorKind::WatchLimit`]. Raise the limit:
//!
//! ```sh
//! sudo sysctl fs.inotify.max_user_watches=524288
//! ```
//!
//! ### Editor behaviour
//!
//! Editors disagree on how to save a file: some write in place, some
//! write a sibling and rename over the original. The event sequences
//! differ accordingly — do not expect one canonical "file saved" shape.
//!
//! ### Event granularity across platforms
//!
//! `opened`/`closed` events exist natively only on Linux and are off by
//! default everywhere (see [`Config::with_access_events`]). Move pairing
//! depends on what the kernel reports; a rename whose second half never
//! arrives degrades to delete + create after the configured window.

#![deny(missing_docs)]

pub use backend::ObserverKind;
pub use config::{Config, RecursiveMode};
pub use error::{Error, ErrorKind, Result};
pub use handler::EventHandler;
pub use observer::Observer;
pub use watch::ObservedWatch;

pub use vigil_types::{event, Event, EventKind, KindFilter};

pub mod snapshot;
pub mod utils;

mod backend;
mod config;
mod error;
mod handler;
mod null;
mod observer;
mod poll;
mod queue;
mod watch;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod inotify;

#[cfg(all(any(target_os = "macos", target_os = "ios"), feature = "macos_fsevent"))]
mod fsevent;

#[cfg(any(
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    all(any(target_os = "macos", target_os = "ios"), feature = "macos_kqueue")
))]
mod kqueue;

#[cfg(windows)]
mod windows;

/// Creates an observer on the best native mechanism for this platform.
///
/// Platform detection is explicit and happens here, once: inotify on
/// Linux, FSEvents on macOS (kqueue with the `macos_kqueue` feature),
/// `ReadDirectoryChangesW` on Windows, kqueue on the BSDs, and polling
/// where nothing native exists.
pub fn new_observer(config: Config) -> Result<Observer> {
    Ok(Observer::with_kind(ObserverKind::native(), config))
}

/// Creates an observer on the snapshot-diff polling backend.
///
/// This is the correct choice for filesystems with weak or absent change
/// notification, such as network mounts.
pub fn new_polling_observer(config: Config) -> Observer {
    Observer::with_kind(ObserverKind::Polling, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_impl() {
        macro_rules! assert_debug_impl {
            ($t:ty) => {{
                #[allow(dead_code)]
                trait NeedsDebug: std::fmt::Debug {}
                impl NeedsDebug for $t {}
            }};
        }

        assert_debug_impl!(Config);
        assert_debug_impl!(Error);
        assert_debug_impl!(ErrorKind);
        assert_debug_impl!(Event);
        assert_debug_impl!(KindFilter);
        assert_debug_impl!(ObservedWatch);
        assert_debug_impl!(ObserverKind);
        assert_debug_impl!(RecursiveMode);
    }

    #[test]
    fn native_kind_matches_the_platform() {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        assert_eq!(ObserverKind::native(), ObserverKind::INotify);

        #[cfg(windows)]
        assert_eq!(ObserverKind::native(), ObserverKind::ReadDirectoryChanges);
    }
}
