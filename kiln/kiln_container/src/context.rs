//! The container serving the current task.
//!
//! While the request lifecycle dispatches a request, the leased container
//! is installed as a task-local. Code deep inside hosted logic can reach it
//! with [`current`] instead of threading it through every call.

use std::future::Future;
use std::sync::Arc;

use crate::container::Container;

tokio::task_local! {
    static CURRENT: Arc<Container>;
}

/// Run `future` with `container` installed as the current container.
pub async fn scope<F>(container: Arc<Container>, future: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(container, future).await
}

/// The container serving the current task, if any.
pub fn current() -> Option<Arc<Container>> {
    CURRENT.try_with(Arc::clone).ok()
}

/// Run `f` against the current container, if any.
pub fn with_current<R>(f: impl FnOnce(&Container) -> R) -> Option<R> {
    CURRENT.try_with(|container| f(container)).ok()
}
