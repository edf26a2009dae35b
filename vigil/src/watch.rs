//! The watch descriptor value handed back from scheduling.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use vigil_types::KindFilter;

use crate::RecursiveMode;

/// A scheduled watch: the path being observed, whether the subtree below
/// it is included, and an optional allowlist of event kinds.
///
/// Watches are cheap immutable values. Equality and hashing are defined
/// over the `(path, recursive)` pair only, so scheduling the same pair
/// twice yields the same watch regardless of the filter; the path is the
/// canonical form computed at schedule time.
#[derive(Clone)]
pub struct ObservedWatch {
    inner: Arc<WatchInner>,
}

struct WatchInner {
    path: PathBuf,
    recursive: bool,
    filter: Option<KindFilter>,
}

impl ObservedWatch {
    pub(crate) fn new(path: PathBuf, mode: RecursiveMode, filter: Option<KindFilter>) -> Self {
        Self {
            inner: Arc::new(WatchInner {
                path,
                recursive: mode.is_recursive(),
                filter,
            }),
        }
    }

    /// The canonicalized path this watch monitors.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Whether subdirectories are watched as well.
    pub fn is_recursive(&self) -> bool {
        self.inner.recursive
    }

    /// The event-kind allowlist, or `None` for "all kinds".
    pub fn filter(&self) -> Option<KindFilter> {
        self.inner.filter
    }

    /// Whether the watch accepts the given event per its filter.
    pub(crate) fn accepts(&self, event: &vigil_types::Event) -> bool {
        match self.inner.filter {
            Some(mask) => mask.matches(event),
            None => true,
        }
    }
}

impl PartialEq for ObservedWatch {
    fn eq(&self, other: &Self) -> bool {
        self.inner.path == other.inner.path && self.inner.recursive == other.inner.recursive
    }
}

impl Eq for ObservedWatch {}

impl Hash for ObservedWatch {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.path.hash(state);
        self.inner.recursive.hash(state);
    }
}

impl fmt::Debug for ObservedWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservedWatch")
            .field("path", &self.inner.path)
            .field("recursive", &self.inner.recursive)
            .field("filter", &self.inner.filter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(watch: &ObservedWatch) -> u64 {
        let mut hasher = DefaultHasher::new();
        watch.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn identity_is_path_and_recursion() {
        let a = ObservedWatch::new("/tmp/x".into(), RecursiveMode::Recursive, None);
        let b = ObservedWatch::new(
            "/tmp/x".into(),
            RecursiveMode::Recursive,
            Some(KindFilter::FILE_CREATED),
        );
        let c = ObservedWatch::new("/tmp/x".into(), RecursiveMode::NonRecursive, None);

        assert_eq!(a, b, "filter must not affect identity");
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, c, "recursion flag is part of identity");
    }

    #[test]
    fn filter_gates_events() {
        let watch = ObservedWatch::new(
            "/tmp/x".into(),
            RecursiveMode::Recursive,
            Some(KindFilter::FILE_CREATED),
        );
        assert!(watch.accepts(&vigil_types::Event::file_created("/tmp/x/a")));
        assert!(!watch.accepts(&vigil_types::Event::file_deleted("/tmp/x/a")));

        let open = ObservedWatch::new("/tmp/x".into(), RecursiveMode::Recursive, None);
        assert!(open.accepts(&vigil_types::Event::file_deleted("/tmp/x/a")));
    }
}
