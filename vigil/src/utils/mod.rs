//! Small reusable bricks: collections and thread helpers that the engine
//! and its front-ends build on.

mod debouncer;
mod delayed_queue;
mod ordered_set;
mod supervisor;

pub use debouncer::EventDebouncer;
pub use delayed_queue::DelayedQueue;
pub use ordered_set::OrderedSet;
pub use supervisor::ProcessSupervisor;
