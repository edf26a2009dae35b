//! Directory snapshots and the structural differ.
//!
//! A snapshot records the contents of one directory tree at one instant,
//! keyed both by path and by stable entry identity. The differ turns two
//! snapshots of the same root into the minimum sequence of canonical
//! events between them; every event it produces is marked synthetic. The
//! polling backend lives on this, and the kernel backends reuse it for
//! catch-up after overflows and under freshly created subdirectories.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use vigil_types::Event;

/// Stable identity of one filesystem entry.
///
/// On POSIX this is the inode number, optionally qualified by the device
/// id (see [`Config::with_ignore_device`](crate::Config::with_ignore_device)).
/// Windows exposes no inode semantics through directory enumeration, so
/// identity degrades to a hash of the absolute path there — which means
/// moves degrade to delete + create, exactly as the native Windows
/// backend reports them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId {
    device: Option<u64>,
    inode: u64,
}

impl EntryId {
    pub(crate) fn new(meta: &EntryMeta, path: &Path, ignore_device: bool) -> Self {
        match meta.file_id {
            Some((device, inode)) => Self {
                device: if ignore_device { None } else { Some(device) },
                inode,
            },
            None => {
                let mut hasher = DefaultHasher::new();
                path.hash(&mut hasher);
                Self {
                    device: None,
                    inode: hasher.finish(),
                }
            }
        }
    }
}

/// What kind of object an entry is. Symlinks are recorded as themselves
/// and never followed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryType {
    /// A regular file (or anything that is neither directory nor symlink).
    File,
    /// A directory.
    Dir,
    /// A symbolic link.
    Symlink,
}

impl EntryType {
    fn is_dir(self) -> bool {
        matches!(self, EntryType::Dir)
    }
}

/// Metadata for one entry, as delivered by a [`SnapshotSource`].
#[derive(Clone, Copy, Debug)]
pub struct EntryMeta {
    /// File, directory, or symlink.
    pub entry_type: EntryType,
    /// Last-modified time.
    pub mtime: SystemTime,
    /// Size in bytes.
    pub size: u64,
    /// `(device, inode)` where the platform provides them.
    pub file_id: Option<(u64, u64)>,
}

/// One recorded entry of a snapshot.
#[derive(Clone, Debug)]
pub struct EntryInfo {
    path: PathBuf,
    entry_type: EntryType,
    mtime: SystemTime,
    size: u64,
    id: EntryId,
}

impl EntryInfo {
    /// Absolute path of the entry.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.entry_type.is_dir()
    }

    /// The identity key.
    pub fn id(&self) -> EntryId {
        self.id
    }
}

/// Where the walker gets its filesystem answers from.
///
/// The default source reads the real filesystem; tests inject an
/// in-memory one to drive the walker and differ without touching disk.
pub trait SnapshotSource {
    /// Metadata for a single path, without following symlinks.
    fn metadata(&self, path: &Path) -> io::Result<EntryMeta>;

    /// The direct children of a directory, with metadata.
    fn list_dir(&self, path: &Path) -> io::Result<Vec<(PathBuf, EntryMeta)>>;
}

/// The real filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsSource;

fn meta_of(metadata: &fs::Metadata) -> EntryMeta {
    let entry_type = if metadata.file_type().is_symlink() {
        EntryType::Symlink
    } else if metadata.is_dir() {
        EntryType::Dir
    } else {
        EntryType::File
    };

    #[cfg(unix)]
    let file_id = {
        use std::os::unix::fs::MetadataExt;
        Some((metadata.dev(), metadata.ino()))
    };
    #[cfg(not(unix))]
    let file_id = None;

    EntryMeta {
        entry_type,
        mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        size: metadata.len(),
        file_id,
    }
}

impl SnapshotSource for FsSource {
    fn metadata(&self, path: &Path) -> io::Result<EntryMeta> {
        Ok(meta_of(&fs::symlink_metadata(path)?))
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<(PathBuf, EntryMeta)>> {
        let mut children = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            // DirEntry::metadata does not traverse symlinks.
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            children.push((entry.path(), meta_of(&metadata)));
        }
        Ok(children)
    }
}

/// An immutable record of a directory tree's contents at one instant.
///
/// Paths are unique within a snapshot. Identities are unique too, with
/// one documented exception: hardlinked siblings share an identity, in
/// which case the entry with the newer modification time claims it.
#[derive(Clone, Debug)]
pub struct DirectorySnapshot {
    root: PathBuf,
    recursive: bool,
    ignore_device: bool,
    entries: HashMap<PathBuf, EntryInfo>,
    ids: HashMap<EntryId, PathBuf>,
}

impl DirectorySnapshot {
    /// Walks `root` on the real filesystem.
    pub fn new(root: impl Into<PathBuf>, recursive: bool, ignore_device: bool) -> io::Result<Self> {
        Self::with_source(root, recursive, ignore_device, &FsSource)
    }

    /// Walks `root` through the given source.
    ///
    /// The root itself must be readable; unreadable subdirectories are
    /// skipped without error.
    pub fn with_source(
        root: impl Into<PathBuf>,
        recursive: bool,
        ignore_device: bool,
        source: &dyn SnapshotSource,
    ) -> io::Result<Self> {
        let root = root.into();
        source.metadata(&root)?;

        let mut snapshot = Self::empty_with(root, recursive, ignore_device);
        let mut pending = vec![snapshot.root.clone()];
        while let Some(dir) = pending.pop() {
            let children = match source.list_dir(&dir) {
                Ok(children) => children,
                Err(err) => {
                    log::debug!("skipping unreadable directory {}: {err}", dir.display());
                    continue;
                }
            };
            for (path, meta) in children {
                if recursive && meta.entry_type.is_dir() {
                    pending.push(path.clone());
                }
                snapshot.insert(path, &meta);
            }
        }
        Ok(snapshot)
    }

    /// An empty snapshot of `root`, the baseline that makes the first
    /// polling tick replay every existing entry.
    pub fn empty(root: impl Into<PathBuf>, recursive: bool, ignore_device: bool) -> Self {
        Self::empty_with(root.into(), recursive, ignore_device)
    }

    fn empty_with(root: PathBuf, recursive: bool, ignore_device: bool) -> Self {
        Self {
            root,
            recursive,
            ignore_device,
            entries: HashMap::new(),
            ids: HashMap::new(),
        }
    }

    fn insert(&mut self, path: PathBuf, meta: &EntryMeta) {
        let id = EntryId::new(meta, &path, self.ignore_device);
        let info = EntryInfo {
            path: path.clone(),
            entry_type: meta.entry_type,
            mtime: meta.mtime,
            size: meta.size,
            id,
        };

        // Hardlinked siblings collide on identity; the newer entry wins
        // the id slot so that move detection follows the live name.
        match self.ids.get(&id) {
            Some(existing) => {
                let keep_new = self
                    .entries
                    .get(existing)
                    .map(|old| old.mtime <= meta.mtime)
                    .unwrap_or(true);
                if keep_new {
                    self.ids.insert(id, path.clone());
                }
            }
            None => {
                self.ids.insert(id, path.clone());
            }
        }
        self.entries.insert(path, info);
    }

    /// The watched root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the snapshot covered the whole subtree.
    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    /// The entry recorded at `path`, if any.
    pub fn entry(&self, path: &Path) -> Option<&EntryInfo> {
        self.entries.get(path)
    }

    /// The path currently holding `id`, if any.
    pub fn path_for_id(&self, id: EntryId) -> Option<&Path> {
        self.ids.get(&id).map(PathBuf::as_path)
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot records nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all recorded entries in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = &EntryInfo> {
        self.entries.values()
    }

    /// Records a newly appeared entry by stat'ing it, keeping a retained
    /// snapshot in step with translated kernel events.
    pub(crate) fn record_create(&mut self, path: &Path) {
        if let Ok(meta) = FsSource.metadata(path) {
            self.insert(path.to_path_buf(), &meta);
        }
    }

    /// Forgets an entry and, for directories, everything below it.
    pub(crate) fn record_remove(&mut self, path: &Path) {
        let removed: Vec<PathBuf> = self
            .entries
            .keys()
            .filter(|p| *p == path || p.starts_with(path))
            .cloned()
            .collect();
        for p in removed {
            if let Some(info) = self.entries.remove(&p) {
                if self.ids.get(&info.id) == Some(&p) {
                    self.ids.remove(&info.id);
                }
            }
        }
    }

    /// Re-keys an entry (and its subtree) from `from` to `to`.
    pub(crate) fn record_rename(&mut self, from: &Path, to: &Path) {
        let moved: Vec<PathBuf> = self
            .entries
            .keys()
            .filter(|p| *p == from || p.starts_with(from))
            .cloned()
            .collect();
        for old_path in moved {
            if let Some(mut info) = self.entries.remove(&old_path) {
                let suffix = old_path
                    .strip_prefix(from)
                    .expect("prefix checked above");
                let new_path = if suffix.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(suffix)
                };
                info.path = new_path.clone();
                if self.ids.get(&info.id) == Some(&old_path) {
                    self.ids.insert(info.id, new_path.clone());
                }
                self.entries.insert(new_path, info);
            }
        }
    }
}

/// Compares two snapshots of the same root.
///
/// Returned events are all synthetic and ordered so that handlers can
/// replay them against a model of the tree: moves first (directories
/// before their contents), then creations (directories before files, both
/// sorted so parents precede children), then modifications, then
/// deletions (files before directories, children before parents).
pub fn diff(prev: &DirectorySnapshot, cur: &DirectorySnapshot) -> Vec<Event> {
    let mut moved_dirs: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut moved_files: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut created_dirs: Vec<PathBuf> = Vec::new();
    let mut created_files: Vec<PathBuf> = Vec::new();
    let mut modified: Vec<PathBuf> = Vec::new();
    let mut deleted_dirs: Vec<PathBuf> = Vec::new();
    let mut deleted_files: Vec<PathBuf> = Vec::new();

    for (id, cur_path) in &cur.ids {
        let info = match cur.entries.get(cur_path) {
            Some(info) => info,
            None => continue,
        };
        match prev.ids.get(id).and_then(|p| prev.entries.get(p)) {
            None => {
                if info.is_dir() {
                    created_dirs.push(cur_path.clone());
                } else {
                    created_files.push(cur_path.clone());
                }
            }
            Some(prev_info) => {
                if prev_info.path != *cur_path {
                    if info.is_dir() {
                        moved_dirs.push((prev_info.path.clone(), cur_path.clone()));
                    } else {
                        moved_files.push((prev_info.path.clone(), cur_path.clone()));
                    }
                }
                // Directory mtime churn is already covered by the events
                // of the children that caused it.
                if !info.is_dir() && (prev_info.mtime != info.mtime || prev_info.size != info.size)
                {
                    modified.push(cur_path.clone());
                }
            }
        }
    }

    for (id, prev_path) in &prev.ids {
        if cur.ids.contains_key(id) {
            continue;
        }
        let info = match prev.entries.get(prev_path) {
            Some(info) => info,
            None => continue,
        };
        if info.is_dir() {
            deleted_dirs.push(prev_path.clone());
        } else {
            deleted_files.push(prev_path.clone());
        }
    }

    // Deterministic order: parents before children for arrivals, children
    // before parents for departures.
    moved_dirs.sort();
    moved_files.sort();
    created_dirs.sort();
    created_files.sort();
    modified.sort();
    deleted_files.sort();
    deleted_dirs.sort_by(|a, b| b.cmp(a));

    let mut events = Vec::new();
    for (from, to) in moved_dirs {
        events.push(Event::dir_moved(from, to).into_synthetic());
    }
    for (from, to) in moved_files {
        events.push(Event::file_moved(from, to).into_synthetic());
    }
    for path in created_dirs {
        events.push(Event::dir_created(path).into_synthetic());
    }
    for path in created_files {
        events.push(Event::file_created(path).into_synthetic());
    }
    for path in modified {
        events.push(Event::file_modified(path).into_synthetic());
    }
    for path in deleted_files {
        events.push(Event::file_deleted(path).into_synthetic());
    }
    for path in deleted_dirs {
        events.push(Event::dir_deleted(path).into_synthetic());
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn snap(dir: &Path) -> DirectorySnapshot {
        DirectorySnapshot::new(dir, true, true).expect("snapshot")
    }

    #[test]
    fn diff_of_identical_snapshots_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"one").unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();

        let snapshot = snap(dir.path());
        assert!(diff(&snapshot, &snapshot).is_empty());
        assert!(diff(&snapshot, &snapshot.clone()).is_empty());
    }

    #[test]
    fn single_created_file_is_the_only_event() {
        let dir = tempfile::tempdir().unwrap();
        let before = snap(dir.path());

        let path = dir.path().join("a");
        fs::write(&path, b"one").unwrap();
        let after = snap(dir.path());

        let events = diff(&before, &after);
        assert_eq!(events, vec![Event::file_created(&path).into_synthetic()]);
        assert!(events[0].is_synthetic());
    }

    #[test]
    fn empty_baseline_replays_the_tree_dirs_first() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("f"), b"x").unwrap();
        fs::write(dir.path().join("g"), b"y").unwrap();

        let baseline = DirectorySnapshot::empty(dir.path(), true, true);
        let events = diff(&baseline, &snap(dir.path()));

        assert_eq!(
            events,
            vec![
                Event::dir_created(&sub).into_synthetic(),
                Event::file_created(dir.path().join("g")).into_synthetic(),
                Event::file_created(sub.join("f")).into_synthetic(),
            ]
        );
    }

    #[test]
    fn rename_is_reported_as_one_move() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a");
        let to = dir.path().join("b");
        fs::write(&from, b"one").unwrap();

        let before = snap(dir.path());
        fs::rename(&from, &to).unwrap();
        let after = snap(dir.path());

        let events = diff(&before, &after);
        assert_eq!(events, vec![Event::file_moved(&from, &to).into_synthetic()]);
    }

    #[test]
    fn moved_directory_reports_container_before_contents() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("olddir");
        let to = dir.path().join("newdir");
        fs::create_dir(&from).unwrap();
        fs::write(from.join("f"), b"x").unwrap();

        let before = snap(dir.path());
        fs::rename(&from, &to).unwrap();
        let after = snap(dir.path());

        let events = diff(&before, &after);
        assert_eq!(
            events,
            vec![
                Event::dir_moved(&from, &to).into_synthetic(),
                Event::file_moved(from.join("f"), to.join("f")).into_synthetic(),
            ]
        );
    }

    #[test]
    fn grown_file_is_modified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        fs::write(&path, b"one").unwrap();

        let before = snap(dir.path());
        fs::write(&path, b"one and then some").unwrap();
        let after = snap(dir.path());

        let events = diff(&before, &after);
        assert_eq!(events, vec![Event::file_modified(&path).into_synthetic()]);
    }

    #[test]
    fn deletions_list_files_before_their_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        let file = sub.join("f");
        fs::write(&file, b"x").unwrap();

        let before = snap(dir.path());
        fs::remove_dir_all(&sub).unwrap();
        let after = snap(dir.path());

        let events = diff(&before, &after);
        assert_eq!(
            events,
            vec![
                Event::file_deleted(&file).into_synthetic(),
                Event::dir_deleted(&sub).into_synthetic(),
            ]
        );
    }

    #[test]
    fn creations_precede_modifications_precede_deletions() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("kept");
        let doomed = dir.path().join("doomed");
        fs::write(&kept, b"old").unwrap();
        fs::write(&doomed, b"bye").unwrap();

        let before = snap(dir.path());
        fs::write(dir.path().join("fresh"), b"hi").unwrap();
        fs::write(&kept, b"new content longer").unwrap();
        fs::remove_file(&doomed).unwrap();
        let after = snap(dir.path());

        let events = diff(&before, &after);
        assert_eq!(
            events,
            vec![
                Event::file_created(dir.path().join("fresh")).into_synthetic(),
                Event::file_modified(&kept).into_synthetic(),
                Event::file_deleted(&doomed).into_synthetic(),
            ]
        );
    }

    #[test]
    fn nonrecursive_snapshot_stops_at_the_first_level() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("deep"), b"x").unwrap();
        fs::write(dir.path().join("shallow"), b"y").unwrap();

        let snapshot = DirectorySnapshot::new(dir.path(), false, true).unwrap();
        assert!(snapshot.entry(&dir.path().join("shallow")).is_some());
        assert!(snapshot.entry(&sub).is_some());
        assert!(snapshot.entry(&sub.join("deep")).is_none());
    }

    #[test]
    fn missing_root_fails_the_walk() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        assert!(DirectorySnapshot::new(&gone, true, true).is_err());
    }

    #[test]
    fn record_rename_rekeys_the_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("f"), b"x").unwrap();

        let mut snapshot = snap(dir.path());
        let dest = dir.path().join("renamed");
        snapshot.record_rename(&sub, &dest);

        assert!(snapshot.entry(&sub).is_none());
        assert!(snapshot.entry(&dest).is_some());
        assert!(snapshot.entry(&dest.join("f")).is_some());
    }

    #[test]
    fn record_remove_drops_the_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("f"), b"x").unwrap();

        let mut snapshot = snap(dir.path());
        snapshot.record_remove(&sub);
        assert!(snapshot.entry(&sub).is_none());
        assert!(snapshot.entry(&sub.join("f")).is_none());
    }

    #[test]
    fn record_create_tracks_a_new_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut snapshot = snap(dir.path());

        let path = dir.path().join("late");
        fs::write(&path, b"x").unwrap();
        snapshot.record_create(&path);
        assert!(snapshot.entry(&path).is_some());

        let fresh = snap(dir.path());
        assert!(diff(&snapshot, &fresh).is_empty());
    }

    /// Applying a diff to a model of the previous tree must describe the
    /// current tree: create/move/delete events alone rebuild the path
    /// set.
    #[test]
    fn diff_transforms_prev_path_set_into_cur_path_set() {
        use std::collections::BTreeSet;

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"1").unwrap();
        fs::create_dir(dir.path().join("d1")).unwrap();
        fs::write(dir.path().join("d1/inner"), b"2").unwrap();

        let before = snap(dir.path());

        fs::rename(dir.path().join("d1"), dir.path().join("d2")).unwrap();
        fs::remove_file(dir.path().join("a")).unwrap();
        fs::write(dir.path().join("b"), b"3").unwrap();

        let after = snap(dir.path());

        let mut model: BTreeSet<PathBuf> =
            before.entries().map(|e| e.path().to_path_buf()).collect();
        for event in diff(&before, &after) {
            match event.kind() {
                vigil_types::EventKind::Created => {
                    model.insert(event.src_path().to_path_buf());
                }
                vigil_types::EventKind::Deleted => {
                    model.remove(event.src_path());
                }
                vigil_types::EventKind::Moved => {
                    model.remove(event.src_path());
                    model.insert(event.dest_path().unwrap().to_path_buf());
                }
                _ => {}
            }
        }

        let target: BTreeSet<PathBuf> =
            after.entries().map(|e| e.path().to_path_buf()).collect();
        assert_eq!(model, target);
    }

    struct MockSource {
        listings: HashMap<PathBuf, Vec<(PathBuf, EntryMeta)>>,
    }

    impl SnapshotSource for MockSource {
        fn metadata(&self, path: &Path) -> io::Result<EntryMeta> {
            if self.listings.contains_key(path) {
                Ok(EntryMeta {
                    entry_type: EntryType::Dir,
                    mtime: SystemTime::UNIX_EPOCH,
                    size: 0,
                    file_id: Some((1, 1)),
                })
            } else {
                Err(io::Error::new(io::ErrorKind::NotFound, "not in mock"))
            }
        }

        fn list_dir(&self, path: &Path) -> io::Result<Vec<(PathBuf, EntryMeta)>> {
            self.listings
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::PermissionDenied, "unreadable"))
        }
    }

    fn file_meta(inode: u64, size: u64) -> EntryMeta {
        EntryMeta {
            entry_type: EntryType::File,
            mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(inode),
            size,
            file_id: Some((1, inode)),
        }
    }

    #[test]
    fn injected_source_drives_the_walker() {
        let root = PathBuf::from("/mock");
        let sub = root.join("sub");
        let mut listings = HashMap::new();
        listings.insert(
            root.clone(),
            vec![
                (root.join("a"), file_meta(10, 3)),
                (
                    sub.clone(),
                    EntryMeta {
                        entry_type: EntryType::Dir,
                        mtime: SystemTime::UNIX_EPOCH,
                        size: 0,
                        file_id: Some((1, 2)),
                    },
                ),
            ],
        );
        listings.insert(sub.clone(), vec![(sub.join("b"), file_meta(11, 4))]);

        let source = MockSource { listings };
        let snapshot =
            DirectorySnapshot::with_source(&root, true, true, &source).expect("walk mock");

        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.entry(&sub.join("b")).is_some());
    }

    #[test]
    fn unreadable_subdirectory_is_skipped_silently() {
        let root = PathBuf::from("/mock");
        let secret = root.join("secret");
        let mut listings = HashMap::new();
        listings.insert(
            root.clone(),
            vec![(
                secret.clone(),
                EntryMeta {
                    entry_type: EntryType::Dir,
                    mtime: SystemTime::UNIX_EPOCH,
                    size: 0,
                    file_id: Some((1, 2)),
                },
            )],
        );
        // no listing for `secret`: the walker must swallow the error

        let source = MockSource { listings };
        let snapshot =
            DirectorySnapshot::with_source(&root, true, true, &source).expect("walk mock");
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.entry(&secret).is_some());
    }

    #[test]
    fn same_path_with_new_identity_is_create_plus_delete() {
        let root = PathBuf::from("/mock");
        let path = root.join("swapped");

        let mut first = HashMap::new();
        first.insert(root.clone(), vec![(path.clone(), file_meta(10, 3))]);
        let before =
            DirectorySnapshot::with_source(&root, true, true, &MockSource { listings: first })
                .unwrap();

        let mut second = HashMap::new();
        second.insert(root.clone(), vec![(path.clone(), file_meta(99, 3))]);
        let after =
            DirectorySnapshot::with_source(&root, true, true, &MockSource { listings: second })
                .unwrap();

        let events = diff(&before, &after);
        assert_eq!(
            events,
            vec![
                Event::file_created(&path).into_synthetic(),
                Event::file_deleted(&path).into_synthetic(),
            ]
        );
    }
}
