//! Error types

use std::path::PathBuf;
use std::{fmt, io};

/// Type alias to use this library's `Error` type in a Result
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds
#[derive(Debug)]
pub enum ErrorKind {
    /// Generic error
    ///
    /// May be used in cases where a platform specific error is mapped to
    /// this type, or for opaque internal errors.
    Generic(String),

    /// I/O errors.
    Io(io::Error),

    /// A path to schedule or unschedule does not exist.
    PathNotFound,

    /// Attempted to remove a watch that does not exist.
    WatchNotFound,

    /// An operation was attempted in a lifecycle state that forbids it,
    /// such as scheduling on a stopped observer.
    IllegalState,

    /// The platform ran out of watch resources: inotify user-watch limit
    /// (`ENOSPC`) or the kqueue open-descriptor budget.
    ///
    /// The message carries a hint on how to raise the limit.
    WatchLimit,

    /// The kernel-side notification queue overflowed and events were lost.
    ///
    /// Emitters recover from this themselves with a catch-up walk; the
    /// kind exists for the rare paths that surface it synchronously.
    QueueOverflow,
}

/// Observation engine error.
///
/// Errors produced by the public API are returned synchronously; errors
/// inside emitters are logged and, where the condition is recoverable,
/// followed by synthetic catch-up events instead of surfacing here.
#[derive(Debug)]
pub struct Error {
    /// Kind of the error.
    pub kind: ErrorKind,

    /// Relevant paths to the error, if any.
    pub paths: Vec<PathBuf>,
}

impl Error {
    /// Creates a new Error with empty paths
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            paths: Vec::new(),
        }
    }

    /// Creates a new generic Error from a message
    pub fn generic(msg: &str) -> Self {
        Self::new(ErrorKind::Generic(msg.into()))
    }

    /// Creates a new i/o Error from a stdlib `io::Error`
    pub fn io(err: io::Error) -> Self {
        Self::new(ErrorKind::Io(err))
    }

    /// Creates a new "path not found" error
    pub fn path_not_found() -> Self {
        Self::new(ErrorKind::PathNotFound)
    }

    /// Creates a new "watch not found" error
    pub fn watch_not_found() -> Self {
        Self::new(ErrorKind::WatchNotFound)
    }

    /// Creates a new "illegal state" error
    pub fn illegal_state() -> Self {
        Self::new(ErrorKind::IllegalState)
    }

    /// Creates a new "watch limit reached" error
    pub fn watch_limit() -> Self {
        Self::new(ErrorKind::WatchLimit)
    }

    /// Adds a path to the error
    pub fn add_path(mut self, path: PathBuf) -> Self {
        self.paths.push(path);
        self
    }

    /// Sets the paths of the error
    pub fn set_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.paths = paths;
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let error = match &self.kind {
            ErrorKind::PathNotFound => "No path was found.".into(),
            ErrorKind::WatchNotFound => "No watch was found.".into(),
            ErrorKind::IllegalState => "Operation not permitted in the current state.".into(),
            ErrorKind::WatchLimit => {
                "OS watch limit reached; raise fs.inotify.max_user_watches or the \
                 open-file limit, or fall back to the polling observer."
                    .into()
            }
            ErrorKind::QueueOverflow => "Kernel notification queue overflowed.".into(),
            ErrorKind::Io(err) => err.to_string(),
            ErrorKind::Generic(err) => err.clone(),
        };

        if self.paths.is_empty() {
            write!(f, "{error}")
        } else {
            let paths: Vec<_> = self.paths.iter().map(|p| p.display().to_string()).collect();
            write!(f, "{} about [{}]", error, paths.join(", "))
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::io(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::generic(&format!("internal mutex poisoned: {err}"))
    }
}

impl From<std::sync::mpsc::RecvError> for Error {
    fn from(err: std::sync::mpsc::RecvError) -> Self {
        Self::generic(&format!("internal channel disconnected: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn display_includes_paths() {
        let err = Error::path_not_found().add_path(Path::new("/tmp/gone").into());
        let msg = err.to_string();
        assert!(msg.contains("/tmp/gone"), "message was: {msg}");
    }

    #[test]
    fn io_errors_keep_their_source() {
        use std::error::Error as _;
        let err = Error::io(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(err.source().is_some());
    }
}
