//! The instance pool.
//!
//! Idle containers sit in a FIFO queue guarded by a mutex; a semaphore with
//! one permit per idle container decides who may take one. Tokio's
//! semaphore queues waiters in arrival order and forgets a waiter whose
//! future is dropped, which gives first-blocked-first-served wakeups and
//! side-effect-free cancellation.
//!
//! Every container is always in exactly one of two places: the idle queue
//! or the on-loan set. Both live under the same lock, so
//! `idle + on_loan == capacity` holds at every observable point.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_container::{Container, RebindTable};
use kiln_core::error::{BootstrapError, PoolError};
use kiln_core::id::{ContainerId, PoolId};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore, TryAcquireError};
use tracing::{error, info, trace, warn};

use crate::bootstrap::Bootstrapper;

/// Configuration for an instance pool
#[derive(Debug, Clone)]
pub struct InstancePoolConfig {
    /// Number of containers, fixed for the pool's lifetime
    pub capacity: usize,

    /// Upper bound on how long [`InstancePool::acquire`] may suspend
    pub acquire_timeout: Option<Duration>,
}

impl Default for InstancePoolConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            acquire_timeout: None,
        }
    }
}

impl InstancePoolConfig {
    /// A configuration with the given capacity and no acquire timeout.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }
}

/// Point-in-time statistics about a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Fixed number of containers
    pub capacity: usize,

    /// Containers waiting to be borrowed
    pub idle: usize,

    /// Containers currently borrowed
    pub on_loan: usize,

    /// Successful acquisitions since startup
    pub total_acquired: u64,

    /// Completed recycles since startup
    pub total_recycled: u64,

    /// Protocol violations detected since startup
    pub total_violations: u64,
}

struct PoolState {
    idle: VecDeque<Arc<Container>>,
    on_loan: HashSet<ContainerId>,
}

/// A fixed-capacity pool of warm containers.
///
/// # Examples
///
/// ```
/// use kiln_container::{Container, RebindTable};
/// use kiln_core::error::BootstrapError;
/// use kiln_pool::{InstancePool, InstancePoolConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pool = InstancePool::fill(
///     InstancePoolConfig::with_capacity(2),
///     &|_: usize| Ok::<_, BootstrapError>(Container::new()),
///     RebindTable::new(),
/// )
/// .unwrap();
///
/// let lease = pool.acquire().await.unwrap();
/// assert_eq!(pool.idle_count(), 1);
///
/// pool.recycle(lease).unwrap();
/// assert_eq!(pool.idle_count(), 2);
/// # }
/// ```
pub struct InstancePool {
    id: PoolId,
    capacity: usize,
    default_timeout: Option<Duration>,
    rebind: RebindTable,
    state: Mutex<PoolState>,
    permits: Semaphore,
    drained: Notify,
    total_acquired: AtomicU64,
    total_recycled: AtomicU64,
    total_violations: AtomicU64,
}

impl InstancePool {
    /// Boot `config.capacity` containers and build a pool around them.
    ///
    /// Every container is checked against the rebind table before the pool
    /// exists, so recycling can never meet an unknown capability.
    pub fn fill<B>(
        config: InstancePoolConfig,
        bootstrapper: &B,
        rebind: RebindTable,
    ) -> Result<Arc<Self>, BootstrapError>
    where
        B: Bootstrapper + ?Sized,
    {
        if config.capacity == 0 {
            return Err(BootstrapError::InvalidCapacity);
        }

        let id = PoolId::new();
        info!(pool = %id, capacity = config.capacity, rebind = rebind.len(), "Filling instance pool");

        let mut idle = VecDeque::with_capacity(config.capacity);
        for index in 0..config.capacity {
            let container = bootstrapper.boot(index)?;
            rebind.validate(&container)?;
            trace!(pool = %id, container = %container.id(), index, "Booted container");
            idle.push_back(Arc::new(container));
        }

        info!(pool = %id, capacity = config.capacity, "Instance pool ready");

        Ok(Arc::new(Self {
            id,
            capacity: config.capacity,
            default_timeout: config.acquire_timeout,
            rebind,
            state: Mutex::new(PoolState {
                idle,
                on_loan: HashSet::with_capacity(config.capacity),
            }),
            permits: Semaphore::new(config.capacity),
            drained: Notify::new(),
            total_acquired: AtomicU64::new(0),
            total_recycled: AtomicU64::new(0),
            total_violations: AtomicU64::new(0),
        }))
    }

    /// The pool's identity.
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Number of containers, fixed at startup.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of containers waiting to be borrowed.
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Number of containers currently borrowed.
    pub fn on_loan_count(&self) -> usize {
        self.state.lock().on_loan.len()
    }

    /// The rebind table applied on every recycle.
    pub fn rebind_table(&self) -> &RebindTable {
        &self.rebind
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Borrow an idle container, suspending until one is available.
    ///
    /// Waiters are served in the order they started waiting. If the pool
    /// was configured with an acquire timeout, waiting longer than that
    /// fails with [`PoolError::Timeout`].
    pub async fn acquire(self: &Arc<Self>) -> Result<Lease, PoolError> {
        match self.default_timeout {
            Some(limit) => self.acquire_timeout(limit).await,
            None => self.acquire_unbounded().await,
        }
    }

    /// Borrow an idle container, waiting at most `limit`.
    pub async fn acquire_timeout(self: &Arc<Self>, limit: Duration) -> Result<Lease, PoolError> {
        tokio::time::timeout(limit, self.acquire_unbounded())
            .await
            .map_err(|_| PoolError::Timeout(timeout_millis(limit)))?
    }

    /// Borrow an idle container without waiting.
    pub fn try_acquire(self: &Arc<Self>) -> Result<Lease, PoolError> {
        match self.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.checkout()
            }
            Err(TryAcquireError::Closed) => Err(PoolError::Closed),
            Err(TryAcquireError::NoPermits) => Err(PoolError::Exhausted),
        }
    }

    async fn acquire_unbounded(self: &Arc<Self>) -> Result<Lease, PoolError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PoolError::Closed)?;
        // The permit now stands for the container on loan; it comes back
        // through `add_permits` when the container is recycled.
        permit.forget();
        self.checkout()
    }

    fn checkout(self: &Arc<Self>) -> Result<Lease, PoolError> {
        let container = {
            let mut state = self.state.lock();
            let container = state.idle.pop_front().ok_or_else(|| {
                self.violation(ContainerId::nil(), "permit granted with no idle container")
            })?;
            state.on_loan.insert(container.id());
            container
        };

        self.total_acquired.fetch_add(1, Ordering::Relaxed);
        trace!(pool = %self.id, container = %container.id(), "Acquired container");

        Ok(Lease {
            container,
            pool: Arc::clone(self),
            acquired_at: Instant::now(),
            returned: false,
        })
    }

    /// Give a borrowed container back.
    ///
    /// The rebind table is applied in full before the container becomes
    /// idle and exactly one waiter, if any, is woken. A lease taken from a
    /// different pool is a protocol violation; its container still goes
    /// back to the pool it came from.
    pub fn recycle(&self, mut lease: Lease) -> Result<(), PoolError> {
        let foreign = !std::ptr::eq(Arc::as_ptr(&lease.pool), self);
        let released = lease.pool.release(&lease.container, lease.leaked_references());
        lease.returned = true;

        if foreign {
            return Err(self.violation(lease.container.id(), "lease belongs to another pool"));
        }
        released
    }

    fn release(&self, container: &Arc<Container>, leaked: usize) -> Result<(), PoolError> {
        let id = container.id();

        if !self.state.lock().on_loan.contains(&id) {
            return Err(self.violation(id, "container is not on loan"));
        }

        if leaked > 0 {
            warn!(
                pool = %self.id,
                container = %id,
                leaked,
                "Container still referenced by hosted logic at recycle"
            );
        }

        // A failed rebind leaves the capability unbound; the container still
        // goes back so the pool keeps its capacity.
        let rebound = self.rebind.apply(container);

        let drained = {
            let mut state = self.state.lock();
            if !state.on_loan.remove(&id) {
                return Err(self.violation(id, "container is not on loan"));
            }
            if state.idle.len() >= self.capacity {
                return Err(self.violation(id, "idle set is already at capacity"));
            }
            state.idle.push_back(Arc::clone(container));
            state.on_loan.is_empty()
        };

        self.permits.add_permits(1);
        self.total_recycled.fetch_add(1, Ordering::Relaxed);
        trace!(pool = %self.id, container = %id, "Recycled container");

        if drained {
            self.drained.notify_waiters();
        }

        match rebound {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(pool = %self.id, container = %id, error = %err, "Recycled container with a failed rebind");
                Err(self.violation(id, "rebind factory panicked"))
            }
        }
    }

    fn violation(&self, container: ContainerId, reason: &'static str) -> PoolError {
        self.total_violations.fetch_add(1, Ordering::Relaxed);
        error!(pool = %self.id, container = %container, reason, "Pool protocol violation");
        PoolError::ProtocolViolation { container, reason }
    }

    /// Stop handing out containers.
    ///
    /// Every suspended and future `acquire` fails with [`PoolError::Closed`].
    /// Containers already on loan can still be recycled.
    pub fn close(&self) {
        if !self.permits.is_closed() {
            info!(pool = %self.id, on_loan = self.on_loan_count(), "Closing instance pool");
            self.permits.close();
        }
    }

    /// Resolve once no container is on loan.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.drained.notified();
            if self.on_loan_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> PoolStats {
        let (idle, on_loan) = {
            let state = self.state.lock();
            (state.idle.len(), state.on_loan.len())
        };

        PoolStats {
            capacity: self.capacity,
            idle,
            on_loan,
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            total_recycled: self.total_recycled.load(Ordering::Relaxed),
            total_violations: self.total_violations.load(Ordering::Relaxed),
        }
    }
}

fn timeout_millis(limit: Duration) -> u64 {
    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX)
}

impl fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstancePool")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Exclusive access to one borrowed container.
///
/// Dereferences to the [`Container`]. Hand it back with
/// [`InstancePool::recycle`]; a lease dropped without being recycled, for
/// example because its task was cancelled, recycles itself.
pub struct Lease {
    container: Arc<Container>,
    pool: Arc<InstancePool>,
    acquired_at: Instant,
    returned: bool,
}

impl Lease {
    /// The borrowed container as a shared handle.
    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    /// Identity of the pool this lease came from.
    pub fn pool_id(&self) -> PoolId {
        self.pool.id
    }

    /// Time since the container was acquired.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Handles to the container held outside this lease.
    fn leaked_references(&self) -> usize {
        Arc::strong_count(&self.container).saturating_sub(1)
    }
}

impl Deref for Lease {
    type Target = Container;

    fn deref(&self) -> &Container {
        &self.container
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        trace!(container = %self.container.id(), "Lease dropped without recycle");
        // Errors are already logged and counted by the pool.
        let _ = self.pool.release(&self.container, self.leaked_references());
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("container", &self.container.id())
            .field("pool", &self.pool.id)
            .field("held_for", &self.held_for())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    type Log = parking_lot::Mutex<Vec<String>>;

    fn boot(_: usize) -> Result<Container, BootstrapError> {
        let container = Container::new();
        container.instance("log", Log::default());
        container.instance("config", String::from("shared"));
        Ok(container)
    }

    fn rebind() -> RebindTable {
        RebindTable::builder().rebind("log", |_| Log::default()).build()
    }

    fn pool(capacity: usize) -> Arc<InstancePool> {
        InstancePool::fill(InstancePoolConfig::with_capacity(capacity), &boot, rebind()).unwrap()
    }

    fn assert_accounting(pool: &InstancePool) {
        let stats = pool.stats();
        assert_eq!(stats.idle + stats.on_loan, stats.capacity);
    }

    #[test]
    fn test_fill_boots_capacity_containers() {
        let booted = AtomicUsize::new(0);
        let bootstrapper = |index: usize| {
            booted.fetch_add(1, Ordering::SeqCst);
            boot(index)
        };

        let pool = InstancePool::fill(InstancePoolConfig::with_capacity(3), &bootstrapper, rebind())
            .unwrap();

        assert_eq!(booted.load(Ordering::SeqCst), 3);
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.idle_count(), 3);
        assert_eq!(pool.on_loan_count(), 0);
    }

    #[test]
    fn test_fill_rejects_zero_capacity() {
        let result = InstancePool::fill(InstancePoolConfig::with_capacity(0), &boot, rebind());
        assert!(matches!(result, Err(BootstrapError::InvalidCapacity)));
    }

    #[test]
    fn test_fill_aborts_on_boot_failure() {
        let bootstrapper = |index: usize| {
            if index == 2 {
                Err(BootstrapError::BootFailed {
                    index,
                    reason: "database unreachable".into(),
                })
            } else {
                boot(index)
            }
        };

        let result = InstancePool::fill(InstancePoolConfig::with_capacity(4), &bootstrapper, rebind());
        assert!(matches!(result, Err(BootstrapError::BootFailed { index: 2, .. })));
    }

    #[test]
    fn test_fill_rejects_unknown_rebind_key() {
        let table = RebindTable::builder().rebind("session", |_| 0u64).build();
        let result = InstancePool::fill(InstancePoolConfig::with_capacity(2), &boot, table);
        assert!(matches!(
            result,
            Err(BootstrapError::UnknownCapability { capability }) if capability == "session"
        ));
    }

    #[tokio::test]
    async fn test_accounting_invariant() {
        let pool = pool(3);
        assert_accounting(&pool);

        let a = pool.acquire().await.unwrap();
        assert_accounting(&pool);
        let b = pool.acquire().await.unwrap();
        assert_accounting(&pool);
        assert_eq!(pool.on_loan_count(), 2);

        pool.recycle(a).unwrap();
        assert_accounting(&pool);
        let c = pool.try_acquire().unwrap();
        assert_accounting(&pool);
        pool.recycle(b).unwrap();
        pool.recycle(c).unwrap();
        assert_accounting(&pool);

        let stats = pool.stats();
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.total_acquired, 3);
        assert_eq!(stats.total_recycled, 3);
        assert_eq!(stats.total_violations, 0);
    }

    #[tokio::test]
    async fn test_recycle_rebinds_listed_capabilities() {
        let pool = pool(1);

        let lease = pool.acquire().await.unwrap();
        let container_id = lease.id();
        let first_log = lease.resolve::<Log>("log").unwrap();
        first_log.lock().push("secret".into());
        let first_config = lease.resolve::<String>("config").unwrap();
        pool.recycle(lease).unwrap();

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.id(), container_id);
        let second_log = lease.resolve::<Log>("log").unwrap();
        assert!(!Arc::ptr_eq(&first_log, &second_log));
        assert!(second_log.lock().is_empty());

        let second_config = lease.resolve::<String>("config").unwrap();
        assert!(Arc::ptr_eq(&first_config, &second_config));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_waiters_served_in_arrival_order() {
        let pool = pool(1);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let held = pool.acquire().await.unwrap();

        let mut handles = Vec::new();
        for name in ["first", "second", "third"] {
            let pool = Arc::clone(&pool);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let lease = pool.acquire().await.unwrap();
                order.lock().push(name);
                tokio::task::yield_now().await;
                pool.recycle(lease).unwrap();
            }));
            for _ in 0..5 {
                tokio::task::yield_now().await;
            }
        }

        assert!(order.lock().is_empty());
        pool.recycle(held).unwrap();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_backpressure_one_waiter_over_capacity() {
        let pool = pool(2);
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(|lease| lease.id()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(pool.idle_count(), 0);

        let recycled = a.id();
        pool.recycle(a).unwrap();

        let served = waiter.await.unwrap().unwrap();
        assert_eq!(served, recycled);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_not_granted() {
        let pool = pool(1);
        let held = pool.acquire().await.unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(10), pool.acquire()).await;
        assert!(timed_out.is_err());

        pool.recycle(held).unwrap();
        assert_eq!(pool.idle_count(), 1);
        let lease = pool.try_acquire().unwrap();
        pool.recycle(lease).unwrap();
        assert_accounting(&pool);
    }

    #[tokio::test]
    async fn test_dropped_lease_recycles() {
        let pool = pool(1);

        let lease = pool.acquire().await.unwrap();
        let first_log = lease.resolve::<Log>("log").unwrap();
        drop(lease);

        assert_eq!(pool.idle_count(), 1);
        let lease = pool.try_acquire().unwrap();
        assert!(!Arc::ptr_eq(&first_log, &lease.resolve::<Log>("log").unwrap()));
    }

    #[tokio::test]
    async fn test_aborted_task_returns_container() {
        let pool = pool(1);
        let (tx, rx) = tokio::sync::oneshot::channel();

        let task = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let _lease = pool.acquire().await.unwrap();
                let _ = tx.send(());
                std::future::pending::<()>().await;
            })
        };

        rx.await.unwrap();
        assert_eq!(pool.on_loan_count(), 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(pool.idle_count(), 1);
        assert_accounting(&pool);
    }

    #[tokio::test]
    async fn test_try_acquire_and_timeout() {
        let pool = pool(1);
        let held = pool.try_acquire().unwrap();

        assert!(matches!(pool.try_acquire(), Err(PoolError::Exhausted)));
        assert!(matches!(
            pool.acquire_timeout(Duration::from_millis(20)).await,
            Err(PoolError::Timeout(20))
        ));

        pool.recycle(held).unwrap();
    }

    #[tokio::test]
    async fn test_configured_acquire_timeout() {
        let config = InstancePoolConfig {
            capacity: 1,
            acquire_timeout: Some(Duration::from_millis(15)),
        };
        let pool = InstancePool::fill(config, &boot, rebind()).unwrap();
        let _held = pool.acquire().await.unwrap();

        assert!(matches!(pool.acquire().await, Err(PoolError::Timeout(15))));
    }

    #[tokio::test]
    async fn test_foreign_lease_is_violation() {
        let home = pool(1);
        let other = pool(1);

        let lease = home.acquire().await.unwrap();
        let err = other.recycle(lease).unwrap_err();
        assert!(matches!(err, PoolError::ProtocolViolation { .. }));

        assert_eq!(home.idle_count(), 1);
        assert_eq!(other.idle_count(), 1);
        assert_eq!(other.stats().total_violations, 1);
        assert_accounting(&home);
        assert_accounting(&other);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let pool = pool(1);
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;

        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed)));
        assert!(matches!(pool.try_acquire(), Err(PoolError::Closed)));

        pool.recycle(held).unwrap();
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_timeout_millis_saturates() {
        assert_eq!(timeout_millis(Duration::from_millis(250)), 250);
        assert_eq!(timeout_millis(Duration::MAX), u64::MAX);
    }

    fn failing_pool() -> Arc<InstancePool> {
        let table = RebindTable::builder()
            .rebind("log", |_| -> Log { panic!("log store offline") })
            .build();
        InstancePool::fill(InstancePoolConfig::with_capacity(1), &boot, table).unwrap()
    }

    #[tokio::test]
    async fn test_failed_rebind_keeps_container() {
        let pool = failing_pool();

        let lease = pool.acquire().await.unwrap();
        lease.resolve::<Log>("log").unwrap().lock().push("secret".into());
        let err = pool.recycle(lease).unwrap_err();
        assert!(matches!(
            err,
            PoolError::ProtocolViolation { reason: "rebind factory panicked", .. }
        ));

        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.on_loan_count(), 0);
        assert_eq!(pool.stats().total_violations, 1);
        tokio::time::timeout(Duration::from_secs(1), pool.wait_idle())
            .await
            .unwrap();

        // The stale value is gone rather than handed to the next borrower.
        let lease = pool.try_acquire().unwrap();
        assert!(!lease.has("log"));
        assert_eq!(lease.resolve::<String>("config").unwrap().as_str(), "shared");
    }

    #[tokio::test]
    async fn test_failed_rebind_on_drop() {
        let pool = failing_pool();

        let lease = pool.acquire().await.unwrap();
        drop(lease);

        assert_eq!(pool.idle_count(), 1);
        assert_accounting(&pool);
        assert!(pool.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_wait_idle_after_recycle() {
        let pool = pool(2);
        let lease = pool.acquire().await.unwrap();

        let drained = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!drained.is_finished());

        pool.recycle(lease).unwrap();
        tokio::time::timeout(Duration::from_secs(1), drained)
            .await
            .unwrap()
            .unwrap();
    }
}
