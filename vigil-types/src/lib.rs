//! Shared data types for the [vigil](https://docs.rs/vigil) filesystem
//! observation engine.
//!
//! This crate holds the canonical event model and the per-watch kind
//! filter, without any of the engine machinery. Depend on it directly when
//! a component only needs to *describe* filesystem activity — for example
//! a front-end that deserializes events produced elsewhere.
//!
//! ## Features
//!
//! - `serde` for serialization of events and filters

#![deny(missing_docs)]

pub mod event;

pub use event::{Event, EventKind, KindFilter};
