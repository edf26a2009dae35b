//! The observer kernel: watch registry, emitter ownership, and the
//! dispatcher thread.

use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use vigil_types::KindFilter;

use crate::backend::{join_thread_deadline, spawn_emitter, Emitter, EventSink, ObserverKind};
use crate::queue::{EventQueue, PopError};
use crate::utils::OrderedSet;
use crate::{Config, Error, EventHandler, ObservedWatch, RecursiveMode, Result};

/// A handler reference compared and hashed by pointer identity, so the
/// same `Arc` registered under two watches counts as the same handler
/// while two equal-behaving handlers stay distinct.
#[derive(Clone)]
struct HandlerRef(Arc<dyn EventHandler>);

impl PartialEq for HandlerRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for HandlerRef {}

impl Hash for HandlerRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as *const () as usize).hash(state);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Started,
    Stopped,
}

/// Registry and lifecycle share one mutex: every check of "may I still
/// schedule?" happens under the same lock as the mutation it guards, so
/// a concurrent `stop` cannot slip between the check and the spawn.
struct Registry {
    lifecycle: Lifecycle,
    handlers: HashMap<ObservedWatch, OrderedSet<HandlerRef>>,
    emitters: HashMap<ObservedWatch, Box<dyn Emitter>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            lifecycle: Lifecycle::Idle,
            handlers: HashMap::new(),
            emitters: HashMap::new(),
        }
    }
}

struct Inner {
    kind: ObserverKind,
    config: Config,
    queue: Arc<EventQueue>,
    registry: Mutex<Registry>,
    dispatcher: Mutex<Option<thread::JoinHandle<()>>>,
    drained: Mutex<bool>,
    drained_cond: Condvar,
}

/// Watches filesystem subtrees and fans canonical events out to handlers.
///
/// One `Observer` owns one emitter thread per scheduled watch plus a
/// single dispatcher thread that drains the shared event queue. The value
/// is cheap to clone; clones share the same kernel, which is what lets a
/// handler re-enter [`schedule`](Observer::schedule) and
/// [`unschedule`](Observer::unschedule) from inside a dispatch. Calling
/// [`stop`](Observer::stop) from inside a handler deadlocks — the
/// dispatcher cannot drain itself.
///
/// ```no_run
/// use std::sync::Arc;
/// use vigil::{new_observer, Config, RecursiveMode};
///
/// # fn main() -> vigil::Result<()> {
/// let (tx, rx) = crossbeam_channel::unbounded();
/// let observer = new_observer(Config::default())?;
/// observer.schedule(Arc::new(tx), std::path::Path::new("."), RecursiveMode::Recursive)?;
/// observer.start()?;
/// for event in rx.iter() {
///     println!("{event:?}");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Observer {
    inner: Arc<Inner>,
}

impl Observer {
    /// Creates an observer on an explicitly chosen mechanism.
    pub fn with_kind(kind: ObserverKind, config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                config,
                queue: Arc::new(EventQueue::new(config.queue_capacity())),
                registry: Mutex::new(Registry::default()),
                dispatcher: Mutex::new(None),
                drained: Mutex::new(false),
                drained_cond: Condvar::new(),
            }),
        }
    }

    /// Which notification mechanism this observer drives.
    pub fn kind(&self) -> ObserverKind {
        self.inner.kind
    }

    /// Schedules `handler` for events under `path`.
    ///
    /// Idempotent on the canonicalized `(path, recursive)` pair: a second
    /// call returns the same watch and merely attaches the handler. A new
    /// watch starts its emitter immediately, so events raised between
    /// `schedule` and [`start`](Observer::start) are queued and delivered
    /// once started.
    pub fn schedule(
        &self,
        handler: Arc<dyn EventHandler>,
        path: &Path,
        mode: RecursiveMode,
    ) -> Result<ObservedWatch> {
        self.schedule_filtered(handler, path, mode, None)
    }

    /// [`schedule`](Observer::schedule) with an event-kind allowlist for
    /// the watch.
    ///
    /// The filter is fixed by whichever call creates the watch; later
    /// idempotent calls attach handlers without changing it.
    pub fn schedule_filtered(
        &self,
        handler: Arc<dyn EventHandler>,
        path: &Path,
        mode: RecursiveMode,
        filter: Option<KindFilter>,
    ) -> Result<ObservedWatch> {
        let canonical = fs::canonicalize(path)
            .map_err(|_| Error::path_not_found().add_path(path.into()))?;
        let watch = ObservedWatch::new(canonical, mode, filter);

        let mut registry = self.inner.registry.lock()?;
        if registry.lifecycle == Lifecycle::Stopped {
            return Err(Error::illegal_state());
        }
        if !registry.emitters.contains_key(&watch) {
            let sink = EventSink::new(
                Arc::clone(&self.inner.queue),
                watch.clone(),
                &self.inner.config,
            );
            // Spawn before touching the handler table: a failed backend
            // leaves no trace in the registry.
            let emitter = spawn_emitter(self.inner.kind, watch.clone(), sink, &self.inner.config)?;
            registry.emitters.insert(watch.clone(), emitter);
        }
        registry
            .handlers
            .entry(watch.clone())
            .or_default()
            .insert(HandlerRef(handler));
        Ok(watch)
    }

    /// Attaches another handler to an existing watch.
    pub fn add_handler_for_watch(
        &self,
        handler: Arc<dyn EventHandler>,
        watch: &ObservedWatch,
    ) -> Result<()> {
        let mut registry = self.inner.registry.lock()?;
        match registry.handlers.get_mut(watch) {
            Some(handlers) => {
                handlers.insert(HandlerRef(handler));
                Ok(())
            }
            None => Err(Error::watch_not_found().add_path(watch.path().into())),
        }
    }

    /// Detaches one handler from a watch. Removing the last handler
    /// unschedules the watch and stops its emitter.
    pub fn remove_handler_for_watch(
        &self,
        handler: &Arc<dyn EventHandler>,
        watch: &ObservedWatch,
    ) -> Result<()> {
        let emitter = {
            let mut registry = self.inner.registry.lock()?;
            let handlers = registry
                .handlers
                .get_mut(watch)
                .ok_or_else(|| Error::watch_not_found().add_path(watch.path().into()))?;
            handlers.remove(&HandlerRef(Arc::clone(handler)));
            if handlers.is_empty() {
                registry.handlers.remove(watch);
                registry.emitters.remove(watch)
            } else {
                None
            }
        };
        if let Some(emitter) = emitter {
            stop_emitter(emitter, self.grace());
        }
        Ok(())
    }

    /// Removes all handlers from the watch and stops its emitter.
    ///
    /// Unscheduling a watch that is already gone — torn down earlier, or
    /// dead because its root vanished — succeeds silently.
    pub fn unschedule(&self, watch: &ObservedWatch) -> Result<()> {
        let emitter = {
            let mut registry = self.inner.registry.lock()?;
            registry.handlers.remove(watch);
            registry.emitters.remove(watch)
        };
        if let Some(emitter) = emitter {
            stop_emitter(emitter, self.grace());
        }
        Ok(())
    }

    /// Removes every watch and stops every emitter.
    pub fn unschedule_all(&self) -> Result<()> {
        let emitters = {
            let mut registry = self.inner.registry.lock()?;
            registry.handlers.clear();
            std::mem::take(&mut registry.emitters)
        };
        stop_all_emitters(emitters, self.grace());
        Ok(())
    }

    /// The currently scheduled watches.
    pub fn watches(&self) -> Vec<ObservedWatch> {
        self.inner
            .registry
            .lock()
            .map(|registry| registry.emitters.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Starts the dispatcher thread. Idempotent; fails with
    /// [`ErrorKind::IllegalState`](crate::ErrorKind::IllegalState) on a
    /// stopped observer.
    pub fn start(&self) -> Result<()> {
        let mut registry = self.inner.registry.lock()?;
        match registry.lifecycle {
            Lifecycle::Started => return Ok(()),
            Lifecycle::Stopped => return Err(Error::illegal_state()),
            Lifecycle::Idle => {}
        }

        let inner = Arc::downgrade(&self.inner);
        let queue = Arc::clone(&self.inner.queue);
        let timeout = self.inner.config.dispatch_timeout();
        let handle = thread::Builder::new()
            .name("vigil dispatcher".to_string())
            .spawn(move || dispatch_loop(&inner, &queue, timeout))
            .map_err(Error::io)?;

        *self.inner.dispatcher.lock()? = Some(handle);
        registry.lifecycle = Lifecycle::Started;
        Ok(())
    }

    /// Stops every emitter, lets the dispatcher drain the queue for up to
    /// a grace period, and returns.
    ///
    /// Must not be called from inside a handler; the dispatcher cannot
    /// wait for itself.
    pub fn stop(&self) -> Result<()> {
        // Flip the lifecycle and empty the registry under one lock: any
        // `schedule` that loses the race to this lock sees Stopped.
        let emitters = {
            let mut registry = self.inner.registry.lock()?;
            match registry.lifecycle {
                Lifecycle::Idle => return Err(Error::illegal_state()),
                Lifecycle::Stopped => return Ok(()),
                Lifecycle::Started => {}
            }
            registry.lifecycle = Lifecycle::Stopped;
            registry.handlers.clear();
            std::mem::take(&mut registry.emitters)
        };

        stop_all_emitters(emitters, self.grace());
        self.inner.queue.close();

        // Give the dispatcher a bounded chance to finish handing out what
        // was already queued.
        let deadline = Instant::now() + self.grace();
        let mut drained = self.inner.drained.lock()?;
        while !*drained {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .inner
                .drained_cond
                .wait_timeout(drained, deadline - now)?;
            drained = guard;
        }
        Ok(())
    }

    /// Blocks until the dispatcher thread has terminated or the timeout
    /// elapsed. Returns whether it terminated.
    pub fn join(&self, timeout: Duration) -> bool {
        let mut handle = match self.inner.dispatcher.lock() {
            Ok(mut dispatcher) => dispatcher.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        join_thread_deadline(&mut handle, Instant::now() + timeout)
    }

    fn grace(&self) -> Duration {
        self.inner.config.dispatch_timeout()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.queue.close();
        let emitters = match self.registry.lock() {
            Ok(mut registry) => std::mem::take(&mut registry.emitters),
            Err(poisoned) => std::mem::take(&mut poisoned.into_inner().emitters),
        };
        for (_, mut emitter) in emitters {
            emitter.stop();
        }
    }
}

fn stop_emitter(mut emitter: Box<dyn Emitter>, grace: Duration) {
    emitter.stop();
    if !emitter.join_deadline(Instant::now() + grace) {
        log::error!(
            "emitter for {} did not stop in time; abandoning thread",
            emitter.watch().path().display()
        );
    }
}

fn stop_all_emitters(emitters: HashMap<ObservedWatch, Box<dyn Emitter>>, grace: Duration) {
    let deadline = Instant::now() + grace;
    let mut emitters: Vec<_> = emitters.into_values().collect();
    for emitter in &mut emitters {
        emitter.stop();
    }
    for emitter in &mut emitters {
        if !emitter.join_deadline(deadline) {
            log::error!(
                "emitter for {} did not stop in time; abandoning thread",
                emitter.watch().path().display()
            );
        }
    }
}

fn dispatch_loop(inner: &Weak<Inner>, queue: &Arc<EventQueue>, timeout: Duration) {
    loop {
        match queue.get(timeout) {
            Ok((event, watch)) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                // Handlers run outside the registry lock so they can
                // re-enter schedule/unschedule.
                let handlers: Vec<HandlerRef> = match inner.registry.lock() {
                    Ok(registry) => registry
                        .handlers
                        .get(&watch)
                        .map(|set| set.iter().cloned().collect())
                        .unwrap_or_default(),
                    Err(_) => Vec::new(),
                };
                for HandlerRef(handler) in handlers {
                    let result = catch_unwind(AssertUnwindSafe(|| handler.dispatch(&event)));
                    if result.is_err() {
                        log::error!("handler panicked while dispatching {event:?}");
                    }
                }
            }
            Err(PopError::Timeout) => {
                if inner.upgrade().is_none() {
                    break;
                }
            }
            Err(PopError::Closed) => break,
        }
    }

    if let Some(inner) = inner.upgrade() {
        if let Ok(mut drained) = inner.drained.lock() {
            *drained = true;
            inner.drained_cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_types::Event;

    fn null_observer() -> Observer {
        Observer::with_kind(ObserverKind::Null, Config::default())
    }

    fn noop_handler() -> Arc<dyn EventHandler> {
        Arc::new(|_event: &Event| {})
    }

    #[test]
    fn schedule_is_idempotent_on_path_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let observer = null_observer();
        let handler = noop_handler();

        let first = observer
            .schedule(Arc::clone(&handler), dir.path(), RecursiveMode::Recursive)
            .unwrap();
        let second = observer
            .schedule(Arc::clone(&handler), dir.path(), RecursiveMode::Recursive)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(observer.watches().len(), 1);
    }

    #[test]
    fn recursive_and_nonrecursive_are_distinct_watches() {
        let dir = tempfile::tempdir().unwrap();
        let observer = null_observer();

        observer
            .schedule(noop_handler(), dir.path(), RecursiveMode::Recursive)
            .unwrap();
        observer
            .schedule(noop_handler(), dir.path(), RecursiveMode::NonRecursive)
            .unwrap();
        assert_eq!(observer.watches().len(), 2);
    }

    #[test]
    fn trailing_separator_is_normalized_away() {
        let dir = tempfile::tempdir().unwrap();
        let observer = null_observer();
        let with_sep = format!("{}/", dir.path().display());

        let first = observer
            .schedule(noop_handler(), dir.path(), RecursiveMode::Recursive)
            .unwrap();
        let second = observer
            .schedule(noop_handler(), Path::new(&with_sep), RecursiveMode::Recursive)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(observer.watches().len(), 1);
    }

    #[test]
    fn schedule_unschedule_schedule_yields_an_equal_watch() {
        let dir = tempfile::tempdir().unwrap();
        let observer = null_observer();

        let first = observer
            .schedule(noop_handler(), dir.path(), RecursiveMode::Recursive)
            .unwrap();
        observer.unschedule(&first).unwrap();
        assert!(observer.watches().is_empty());

        let again = observer
            .schedule(noop_handler(), dir.path(), RecursiveMode::Recursive)
            .unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn unschedule_twice_succeeds_silently() {
        let dir = tempfile::tempdir().unwrap();
        let observer = null_observer();

        let watch = observer
            .schedule(noop_handler(), dir.path(), RecursiveMode::Recursive)
            .unwrap();
        observer.unschedule(&watch).unwrap();
        observer.unschedule(&watch).unwrap();
    }

    #[test]
    fn schedule_on_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let observer = null_observer();
        let err = observer
            .schedule(
                noop_handler(),
                &dir.path().join("not-here"),
                RecursiveMode::Recursive,
            )
            .unwrap_err();
        assert!(matches!(err.kind, crate::ErrorKind::PathNotFound));
        assert!(observer.watches().is_empty(), "no partial registration");
    }

    #[test]
    fn removing_the_last_handler_unschedules() {
        let dir = tempfile::tempdir().unwrap();
        let observer = null_observer();
        let a = noop_handler();
        let b = noop_handler();

        let watch = observer
            .schedule(Arc::clone(&a), dir.path(), RecursiveMode::Recursive)
            .unwrap();
        observer.add_handler_for_watch(Arc::clone(&b), &watch).unwrap();

        observer.remove_handler_for_watch(&a, &watch).unwrap();
        assert_eq!(observer.watches().len(), 1, "one handler remains");

        observer.remove_handler_for_watch(&b, &watch).unwrap();
        assert!(observer.watches().is_empty());
    }

    #[test]
    fn stop_before_start_is_illegal() {
        let observer = null_observer();
        let err = observer.stop().unwrap_err();
        assert!(matches!(err.kind, crate::ErrorKind::IllegalState));
    }

    #[test]
    fn schedule_after_stop_is_illegal() {
        let dir = tempfile::tempdir().unwrap();
        let observer = null_observer();
        observer.start().unwrap();
        observer.stop().unwrap();

        let err = observer
            .schedule(noop_handler(), dir.path(), RecursiveMode::Recursive)
            .unwrap_err();
        assert!(matches!(err.kind, crate::ErrorKind::IllegalState));
    }

    #[test]
    fn start_is_idempotent_and_stop_twice_is_ok() {
        let observer = null_observer();
        observer.start().unwrap();
        observer.start().unwrap();
        observer.stop().unwrap();
        observer.stop().unwrap();
        assert!(observer.join(Duration::from_secs(5)));
    }
}
