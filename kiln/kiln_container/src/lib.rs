//! # Kiln Container
//!
//! A [`Container`] is one bootstrapped application instance: a keyed table
//! of capabilities that hosted logic resolves at request time. The pool
//! hands out whole containers, never individual capabilities, so state
//! isolation between requests is isolation between containers.
//!
//! A [`RebindTable`] lists the capabilities that must be rebuilt every time
//! a container goes back to the pool, so that request-scoped state never
//! leaks into the next request served by the same container.
//!
//! The [`context`] module exposes the container serving the current task.

pub mod container;
pub mod context;
pub mod rebind;

pub use container::{CapabilityKey, Container, Factory, Instance};
pub use rebind::{RebindTable, RebindTableBuilder};
