//! An inert backend that observes nothing.
//!
//! Useful to exercise the observer kernel — registry bookkeeping,
//! scheduling laws, dispatcher lifecycle — without touching any kernel
//! notification API.

use std::time::Instant;

use crate::backend::Emitter;
use crate::ObservedWatch;

pub(crate) struct NullEmitter {
    watch: ObservedWatch,
}

impl NullEmitter {
    pub(crate) fn new(watch: ObservedWatch) -> Self {
        Self { watch }
    }
}

impl Emitter for NullEmitter {
    fn watch(&self) -> &ObservedWatch {
        &self.watch
    }

    fn stop(&mut self) {}

    fn join_deadline(&mut self, _deadline: Instant) -> bool {
        true
    }
}
