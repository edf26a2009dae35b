//! Configuration types

use std::time::Duration;

/// Indicates whether only the provided directory or its sub-directories as well should be watched
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum RecursiveMode {
    /// Watch all sub-directories as well, including directories created after installing the watch
    Recursive,

    /// Watch only the provided directory
    NonRecursive,
}

impl RecursiveMode {
    pub(crate) fn is_recursive(&self) -> bool {
        match *self {
            RecursiveMode::Recursive => true,
            RecursiveMode::NonRecursive => false,
        }
    }
}

/// Observer and backend configuration
///
/// This contains multiple settings that may relate to only one specific backend,
/// such as to correctly configure each backend regardless of what is selected during runtime.
///
/// ```rust
/// # use std::time::Duration;
/// # use vigil::Config;
/// let config = Config::default()
///     .with_poll_interval(Duration::from_secs(2))
///     .with_access_events(true);
/// ```
///
/// All options have to be set before constructing the observer.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct Config {
    dispatch_timeout: Duration,
    poll_interval: Duration,
    poll_catch_up: bool,
    queue_capacity: usize,
    move_window: Duration,
    access_events: bool,
    ignore_device: bool,
}

impl Config {
    /// How long the dispatcher blocks on the event queue before checking
    /// for shutdown.
    ///
    /// The default is 1 second. Lowering it makes `stop` more responsive
    /// at the cost of more wake-ups.
    pub fn with_dispatch_timeout(mut self, dur: Duration) -> Self {
        self.dispatch_timeout = dur;
        self
    }

    /// Returns current setting
    pub fn dispatch_timeout(&self) -> Duration {
        self.dispatch_timeout
    }

    /// For the polling observer: interval between re-scan attempts.
    ///
    /// Re-scans walk the whole watched tree and can be extremely expensive
    /// for large trees, so measure and tune accordingly. The default is
    /// 1 second.
    pub fn with_poll_interval(mut self, dur: Duration) -> Self {
        self.poll_interval = dur;
        self
    }

    /// Returns current setting
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// For the polling observer: whether the first tick replays the
    /// existing tree as synthetic `created` events.
    ///
    /// On by default. When disabled, the baseline snapshot is taken at
    /// schedule time and only subsequent changes are reported.
    pub fn with_poll_catch_up(mut self, catch_up: bool) -> Self {
        self.poll_catch_up = catch_up;
        self
    }

    /// Returns current setting
    pub fn poll_catch_up(&self) -> bool {
        self.poll_catch_up
    }

    /// Capacity of the shared event queue.
    ///
    /// Once the queue is full, emitters block and kernel-side buffers
    /// absorb further events until the kernel itself drops them. The
    /// default is 4096 entries.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Returns current setting
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// How long a lone rename half is held back waiting for its partner.
    ///
    /// inotify reports the two halves of a rename separately, correlated
    /// by cookie; Windows may split them across read buffers. A half that
    /// is still unmatched when the window expires degrades to a plain
    /// delete or create. Renames across filesystems always degrade this
    /// way. The default is 10 milliseconds.
    pub fn with_move_window(mut self, dur: Duration) -> Self {
        self.move_window = dur;
        self
    }

    /// Returns current setting
    pub fn move_window(&self) -> Duration {
        self.move_window
    }

    /// Whether `opened`/`closed` events are emitted at all.
    ///
    /// Only Linux produces these natively, so they are off by default to
    /// keep event streams comparable across platforms.
    pub fn with_access_events(mut self, enabled: bool) -> Self {
        self.access_events = enabled;
        self
    }

    /// Returns current setting
    pub fn access_events(&self) -> bool {
        self.access_events
    }

    /// Whether snapshot entry identity is the bare inode (`true`) or the
    /// (device, inode) pair (`false`).
    ///
    /// Keying by bare inode makes moves across mount boundaries visible
    /// to the snapshot differ. On by default; Windows has no inode
    /// semantics and always behaves as if this were set.
    pub fn with_ignore_device(mut self, ignore: bool) -> Self {
        self.ignore_device = ignore;
        self
    }

    /// Returns current setting
    pub fn ignore_device(&self) -> bool {
        self.ignore_device
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            poll_catch_up: true,
            queue_capacity: 4096,
            move_window: Duration::from_millis(10),
            access_events: false,
            ignore_device: true,
        }
    }
}
