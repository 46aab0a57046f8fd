//! # Kiln Pool
//!
//! A fixed-capacity pool of bootstrapped [`Container`]s.
//!
//! The pool is filled eagerly at startup by a [`Bootstrapper`] and never
//! grows or shrinks afterwards. Requests borrow a container with
//! [`InstancePool::acquire`], which suspends the calling task (first come,
//! first served) while every container is on loan, and give it back with
//! [`InstancePool::recycle`], which rebuilds the capabilities named by the
//! pool's [`RebindTable`] before the container becomes idle again.
//!
//! [`Container`]: kiln_container::Container
//! [`RebindTable`]: kiln_container::RebindTable

pub mod bootstrap;
pub mod pool;

pub use bootstrap::Bootstrapper;
pub use pool::{InstancePool, InstancePoolConfig, Lease, PoolStats};
