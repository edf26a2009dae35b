//! Handler trait and dispatch plumbing.

use vigil_types::{Event, EventKind};

/// The set of requirements for event handling values.
///
/// `dispatch` is the entry point the dispatcher thread calls; the default
/// implementation forwards to `on_any_event` and then to the hook
/// matching the event's kind, so most handlers only override the hooks
/// they care about.
///
/// Handlers run on the dispatcher thread and must not block for long: a
/// slow handler backpressures the whole observer once the event queue
/// fills up. Handlers must also not call `Observer::stop` from inside
/// `dispatch` — that deadlocks. Scheduling and unscheduling watches from
/// inside a handler is fine and takes effect once the current dispatch
/// returns.
///
/// # Example implementation
///
/// ```no_run
/// use vigil::EventHandler;
/// use vigil_types::Event;
///
/// /// Prints received events
/// struct EventPrinter;
///
/// impl EventHandler for EventPrinter {
///     fn on_any_event(&self, event: &Event) {
///         println!("{event:?}");
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    /// Routes the event to the per-kind hooks.
    fn dispatch(&self, event: &Event) {
        self.on_any_event(event);
        match event.kind() {
            EventKind::Created => self.on_created(event),
            EventKind::Deleted => self.on_deleted(event),
            EventKind::Modified => self.on_modified(event),
            EventKind::Moved => self.on_moved(event),
            EventKind::Opened => self.on_opened(event),
            EventKind::Closed | EventKind::ClosedNoWrite => self.on_closed(event),
        }
    }

    /// Called for every event, before the kind-specific hook.
    fn on_any_event(&self, _event: &Event) {}

    /// A file or directory was created.
    fn on_created(&self, _event: &Event) {}

    /// A file or directory was deleted.
    fn on_deleted(&self, _event: &Event) {}

    /// A file or directory was modified.
    fn on_modified(&self, _event: &Event) {}

    /// A file or directory was renamed.
    fn on_moved(&self, _event: &Event) {}

    /// A handle was opened.
    fn on_opened(&self, _event: &Event) {}

    /// A handle was closed.
    fn on_closed(&self, _event: &Event) {}
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn dispatch(&self, event: &Event) {
        (self)(event);
    }
}

impl EventHandler for crossbeam_channel::Sender<Event> {
    fn dispatch(&self, event: &Event) {
        let _ = self.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        any: AtomicUsize,
        created: AtomicUsize,
        closed: AtomicUsize,
    }

    impl EventHandler for Counter {
        fn on_any_event(&self, _event: &Event) {
            self.any.fetch_add(1, Ordering::SeqCst);
        }
        fn on_created(&self, _event: &Event) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }
        fn on_closed(&self, _event: &Event) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dispatch_routes_by_kind() {
        let handler = Counter::default();
        handler.dispatch(&Event::file_created("/a"));
        handler.dispatch(&Event::file_closed("/a"));
        handler.dispatch(&Event::file_closed_no_write("/a"));
        handler.dispatch(&Event::file_modified("/a"));

        assert_eq!(handler.any.load(Ordering::SeqCst), 4);
        assert_eq!(handler.created.load(Ordering::SeqCst), 1);
        assert_eq!(handler.closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn channel_sender_is_a_handler() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.dispatch(&Event::dir_created("/d"));
        assert_eq!(rx.try_recv().unwrap(), Event::dir_created("/d"));
    }
}
