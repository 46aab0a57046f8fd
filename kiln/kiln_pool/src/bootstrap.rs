//! Producing the containers a pool is filled with.

use kiln_container::Container;
use kiln_core::error::BootstrapError;

/// Builds one fully bootstrapped application instance.
///
/// Called `capacity` times, synchronously, while the pool is filled. Any
/// error aborts the fill; no partially filled pool is ever returned.
///
/// Closures taking the fill index implement this trait:
///
/// ```
/// use kiln_container::Container;
/// use kiln_core::error::BootstrapError;
/// use kiln_pool::Bootstrapper;
///
/// let boot = |index: usize| -> Result<Container, BootstrapError> {
///     let container = Container::new();
///     container.instance("worker", index);
///     Ok(container)
/// };
/// assert!(boot.boot(0).unwrap().has("worker"));
/// ```
pub trait Bootstrapper: Send + Sync {
    /// Boot the instance at position `index` of the fill sequence.
    fn boot(&self, index: usize) -> Result<Container, BootstrapError>;
}

impl<F> Bootstrapper for F
where
    F: Fn(usize) -> Result<Container, BootstrapError> + Send + Sync,
{
    fn boot(&self, index: usize) -> Result<Container, BootstrapError> {
        self(index)
    }
}
