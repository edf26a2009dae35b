//! The canonical `Event` type, its kind tags, and the watch-level filter.

use std::fmt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// What happened to the object an event describes.
///
/// Every backend translates its native notification vocabulary into these
/// seven tags. `Opened`, `Closed` and `ClosedNoWrite` are only produced
/// natively on Linux and only when access events are enabled; all other
/// kinds are produced on every platform (natively or through snapshot
/// diffing).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum EventKind {
    /// A file or directory came into existence.
    Created,

    /// A file or directory was removed.
    Deleted,

    /// The data or metadata of a file or directory changed.
    Modified,

    /// A file or directory was renamed; both endpoints are known.
    Moved,

    /// A handle to the file was opened.
    Opened,

    /// A handle that was open for writing was closed.
    Closed,

    /// A handle that was open read-only was closed.
    ClosedNoWrite,
}

/// A single filesystem change.
///
/// Events are immutable once constructed: emitters and the snapshot
/// differ build them, the dispatcher hands out shared references, and
/// handlers only read them.
///
/// `src_path` is always the absolute path the change happened at. Only
/// [`EventKind::Moved`] events carry a `dest_path`. `is_synthetic` marks
/// events that were derived from comparing directory snapshots (polling
/// ticks, catch-up walks after an overflow or under a freshly created
/// subdirectory) rather than from a native kernel notification.
#[derive(Clone, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Event {
    kind: EventKind,
    src_path: PathBuf,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    dest_path: Option<PathBuf>,
    is_directory: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    is_synthetic: bool,
}

impl Event {
    fn new(kind: EventKind, src_path: PathBuf, is_directory: bool) -> Self {
        Self {
            kind,
            src_path,
            dest_path: None,
            is_directory,
            is_synthetic: false,
        }
    }

    /// A file appeared.
    pub fn file_created(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::Created, path.into(), false)
    }

    /// A file vanished.
    pub fn file_deleted(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::Deleted, path.into(), false)
    }

    /// A file's contents or metadata changed.
    pub fn file_modified(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::Modified, path.into(), false)
    }

    /// A file was renamed from `src` to `dest`.
    pub fn file_moved(src: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        let mut ev = Self::new(EventKind::Moved, src.into(), false);
        ev.dest_path = Some(dest.into());
        ev
    }

    /// A handle to the file was opened.
    pub fn file_opened(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::Opened, path.into(), false)
    }

    /// A writable handle to the file was closed.
    pub fn file_closed(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::Closed, path.into(), false)
    }

    /// A read-only handle to the file was closed.
    pub fn file_closed_no_write(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::ClosedNoWrite, path.into(), false)
    }

    /// A directory appeared.
    pub fn dir_created(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::Created, path.into(), true)
    }

    /// A directory vanished.
    pub fn dir_deleted(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::Deleted, path.into(), true)
    }

    /// A directory's metadata or listing changed.
    pub fn dir_modified(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::Modified, path.into(), true)
    }

    /// A directory was renamed from `src` to `dest`.
    pub fn dir_moved(src: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        let mut ev = Self::new(EventKind::Moved, src.into(), true);
        ev.dest_path = Some(dest.into());
        ev
    }

    /// A handle to the directory was opened.
    pub fn dir_opened(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::Opened, path.into(), true)
    }

    /// A handle to the directory was closed.
    pub fn dir_closed(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::Closed, path.into(), true)
    }

    /// A read-only handle to the directory was closed.
    pub fn dir_closed_no_write(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::ClosedNoWrite, path.into(), true)
    }

    /// Marks the event as produced by snapshot comparison rather than a
    /// native kernel notification.
    pub fn into_synthetic(mut self) -> Self {
        self.is_synthetic = true;
        self
    }

    /// The kind tag.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The path the change happened at.
    pub fn src_path(&self) -> &Path {
        &self.src_path
    }

    /// The rename target, present only on [`EventKind::Moved`] events.
    pub fn dest_path(&self) -> Option<&Path> {
        self.dest_path.as_deref()
    }

    /// Whether the event describes a directory.
    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// Whether the event was derived from a snapshot diff or catch-up walk.
    pub fn is_synthetic(&self) -> bool {
        self.is_synthetic
    }

    /// The stable wire identifier of the event, e.g. `file_created` or
    /// `dir_moved`. These strings are the contract consumers filter on.
    pub fn name(&self) -> &'static str {
        match (self.is_directory, self.kind) {
            (false, EventKind::Created) => "file_created",
            (false, EventKind::Deleted) => "file_deleted",
            (false, EventKind::Modified) => "file_modified",
            (false, EventKind::Moved) => "file_moved",
            (false, EventKind::Opened) => "file_opened",
            (false, EventKind::Closed) => "file_closed",
            (false, EventKind::ClosedNoWrite) => "file_closed_no_write",
            (true, EventKind::Created) => "dir_created",
            (true, EventKind::Deleted) => "dir_deleted",
            (true, EventKind::Modified) => "dir_modified",
            (true, EventKind::Moved) => "dir_moved",
            (true, EventKind::Opened) => "dir_opened",
            (true, EventKind::Closed) => "dir_closed",
            (true, EventKind::ClosedNoWrite) => "dir_closed_no_write",
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Event");
        d.field("name", &self.name())
            .field("src_path", &self.src_path);
        if let Some(dest) = &self.dest_path {
            d.field("dest_path", dest);
        }
        if self.is_synthetic {
            d.field("synthetic", &true);
        }
        d.finish()
    }
}

bitflags! {
    /// An allowlist of event names a watch or handler is interested in.
    ///
    /// One bit per wire name. The default mask accepts everything; an
    /// empty mask accepts nothing. Backends apply the mask kernel-side
    /// where the native API permits it (inotify) and in userspace
    /// everywhere else.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct KindFilter: u32 {
        /// `file_created`
        const FILE_CREATED = 1 << 0;
        /// `file_deleted`
        const FILE_DELETED = 1 << 1;
        /// `file_modified`
        const FILE_MODIFIED = 1 << 2;
        /// `file_moved`
        const FILE_MOVED = 1 << 3;
        /// `file_opened`
        const FILE_OPENED = 1 << 4;
        /// `file_closed`
        const FILE_CLOSED = 1 << 5;
        /// `file_closed_no_write`
        const FILE_CLOSED_NO_WRITE = 1 << 6;
        /// `dir_created`
        const DIR_CREATED = 1 << 7;
        /// `dir_deleted`
        const DIR_DELETED = 1 << 8;
        /// `dir_modified`
        const DIR_MODIFIED = 1 << 9;
        /// `dir_moved`
        const DIR_MOVED = 1 << 10;
        /// `dir_opened`
        const DIR_OPENED = 1 << 11;
        /// `dir_closed`
        const DIR_CLOSED = 1 << 12;
        /// `dir_closed_no_write`
        const DIR_CLOSED_NO_WRITE = 1 << 13;

        /// Every `file_*` name.
        const ALL_FILE = Self::FILE_CREATED.bits()
            | Self::FILE_DELETED.bits()
            | Self::FILE_MODIFIED.bits()
            | Self::FILE_MOVED.bits()
            | Self::FILE_OPENED.bits()
            | Self::FILE_CLOSED.bits()
            | Self::FILE_CLOSED_NO_WRITE.bits();

        /// Every `dir_*` name.
        const ALL_DIR = Self::DIR_CREATED.bits()
            | Self::DIR_DELETED.bits()
            | Self::DIR_MODIFIED.bits()
            | Self::DIR_MOVED.bits()
            | Self::DIR_OPENED.bits()
            | Self::DIR_CLOSED.bits()
            | Self::DIR_CLOSED_NO_WRITE.bits();

        /// Every name.
        const ALL = Self::ALL_FILE.bits() | Self::ALL_DIR.bits();
    }
}

impl Default for KindFilter {
    fn default() -> Self {
        KindFilter::ALL
    }
}

impl KindFilter {
    /// The bit corresponding to one wire name, or `None` for an unknown
    /// name.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "file_created" => KindFilter::FILE_CREATED,
            "file_deleted" => KindFilter::FILE_DELETED,
            "file_modified" => KindFilter::FILE_MODIFIED,
            "file_moved" => KindFilter::FILE_MOVED,
            "file_opened" => KindFilter::FILE_OPENED,
            "file_closed" => KindFilter::FILE_CLOSED,
            "file_closed_no_write" => KindFilter::FILE_CLOSED_NO_WRITE,
            "dir_created" => KindFilter::DIR_CREATED,
            "dir_deleted" => KindFilter::DIR_DELETED,
            "dir_modified" => KindFilter::DIR_MODIFIED,
            "dir_moved" => KindFilter::DIR_MOVED,
            "dir_opened" => KindFilter::DIR_OPENED,
            "dir_closed" => KindFilter::DIR_CLOSED,
            "dir_closed_no_write" => KindFilter::DIR_CLOSED_NO_WRITE,
            _ => return None,
        })
    }

    /// Builds a mask from a list of wire names, failing on the first
    /// unknown one.
    pub fn from_names<'a, I>(names: I) -> Result<Self, UnknownEventName>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut mask = KindFilter::empty();
        for name in names {
            mask |= Self::from_name(name).ok_or_else(|| UnknownEventName(name.to_owned()))?;
        }
        Ok(mask)
    }

    /// Whether the mask accepts the given event.
    pub fn matches(&self, event: &Event) -> bool {
        let bit = match (event.is_directory(), event.kind()) {
            (false, EventKind::Created) => KindFilter::FILE_CREATED,
            (false, EventKind::Deleted) => KindFilter::FILE_DELETED,
            (false, EventKind::Modified) => KindFilter::FILE_MODIFIED,
            (false, EventKind::Moved) => KindFilter::FILE_MOVED,
            (false, EventKind::Opened) => KindFilter::FILE_OPENED,
            (false, EventKind::Closed) => KindFilter::FILE_CLOSED,
            (false, EventKind::ClosedNoWrite) => KindFilter::FILE_CLOSED_NO_WRITE,
            (true, EventKind::Created) => KindFilter::DIR_CREATED,
            (true, EventKind::Deleted) => KindFilter::DIR_DELETED,
            (true, EventKind::Modified) => KindFilter::DIR_MODIFIED,
            (true, EventKind::Moved) => KindFilter::DIR_MOVED,
            (true, EventKind::Opened) => KindFilter::DIR_OPENED,
            (true, EventKind::Closed) => KindFilter::DIR_CLOSED,
            (true, EventKind::ClosedNoWrite) => KindFilter::DIR_CLOSED_NO_WRITE,
        };
        self.contains(bit)
    }
}

/// An event name that is not part of the stable vocabulary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownEventName(pub String);

impl fmt::Display for UnknownEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event name `{}`", self.0)
    }
}

impl std::error::Error for UnknownEventName {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moved_event_carries_both_endpoints() {
        let ev = Event::file_moved("/tmp/a", "/tmp/b");
        assert_eq!(ev.kind(), EventKind::Moved);
        assert_eq!(ev.src_path(), Path::new("/tmp/a"));
        assert_eq!(ev.dest_path(), Some(Path::new("/tmp/b")));
        assert!(!ev.is_directory());
    }

    #[test]
    fn non_moved_events_have_no_dest() {
        assert_eq!(Event::file_created("/tmp/a").dest_path(), None);
        assert_eq!(Event::dir_deleted("/tmp/a").dest_path(), None);
    }

    #[test]
    fn names_round_trip_through_the_filter() {
        let events = [
            Event::file_created("/x"),
            Event::file_deleted("/x"),
            Event::file_modified("/x"),
            Event::file_moved("/x", "/y"),
            Event::file_opened("/x"),
            Event::file_closed("/x"),
            Event::file_closed_no_write("/x"),
            Event::dir_created("/x"),
            Event::dir_deleted("/x"),
            Event::dir_modified("/x"),
            Event::dir_moved("/x", "/y"),
            Event::dir_opened("/x"),
            Event::dir_closed("/x"),
            Event::dir_closed_no_write("/x"),
        ];
        for ev in &events {
            let mask = KindFilter::from_name(ev.name()).expect("known name");
            assert!(mask.matches(ev), "{} must match its own bit", ev.name());
            // and no other event matches that single bit
            for other in events.iter().filter(|o| o.name() != ev.name()) {
                assert!(!mask.matches(other), "{} matched {}", other.name(), ev.name());
            }
        }
    }

    #[test]
    fn filter_from_names_rejects_unknown() {
        let err = KindFilter::from_names(["file_created", "banana"]).unwrap_err();
        assert_eq!(err, UnknownEventName("banana".into()));
    }

    #[test]
    fn default_filter_accepts_everything() {
        assert!(KindFilter::default().matches(&Event::dir_moved("/a", "/b")));
        assert!(KindFilter::default().matches(&Event::file_opened("/a")));
    }

    #[test]
    fn empty_filter_accepts_nothing() {
        assert!(!KindFilter::empty().matches(&Event::file_created("/a")));
    }

    #[test]
    fn synthetic_flag_is_part_of_equality() {
        let a = Event::file_created("/x");
        let b = Event::file_created("/x").into_synthetic();
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
    }

    #[test]
    fn file_and_dir_variants_are_distinct() {
        assert_ne!(Event::file_created("/x"), Event::dir_created("/x"));
        assert_eq!(Event::file_created("/x").name(), "file_created");
        assert_eq!(Event::dir_created("/x").name(), "dir_created");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serializes_with_snake_case_kind() {
        let ev = Event::file_moved("/a", "/b");
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"moved\""), "json: {json}");
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }
}
