//! Bounded connection pool with scoped leases
//!
//! At most `max_size` connections are leased at any time. Callers beyond that
//! wait in arrival order on a fair semaphore. A [`Lease`] hands its
//! connection back when dropped, so a handler releases exactly once no matter
//! which path it returns through.

use log::{debug, info, warn};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::config::PoolConfig;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Connection pool is closed")]
    Closed,

    #[error("Timed out after {0:?} waiting for a database connection")]
    Timeout(Duration),

    #[error("{0}")]
    Connect(String),
}

/// Opens and closes the connections a [`Pool`] hands out
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send;

    fn close(&self, conn: Self::Connection) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    /// Established connections, idle or leased
    pub open: usize,
    pub idle: usize,
    pub leased: usize,
}

struct IdleSet<C> {
    conns: Vec<C>,
    /// Set once `close` has taken the idle connections
    drained: bool,
}

struct Shared<M: ManageConnection> {
    manager: M,
    config: PoolConfig,
    max_size: usize,
    idle: Mutex<IdleSet<M::Connection>>,
    permits: Arc<Semaphore>,
    open: AtomicUsize,
    leased: AtomicUsize,
    closed: AtomicBool,
    released: Notify,
}

impl<M: ManageConnection> Shared<M> {
    fn idle(&self) -> MutexGuard<'_, IdleSet<M::Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, conn: M::Connection, broken: bool) {
        let mut idle = self.idle();
        if broken || idle.drained {
            drop(idle);
            drop(conn);
            self.open.fetch_sub(1, Ordering::SeqCst);
            debug!("Release: connection closed (broken: {})", broken);
        } else {
            idle.conns.push(conn);
            drop(idle);
            debug!("Release: connection returned to pool");
        }

        self.leased.fetch_sub(1, Ordering::SeqCst);
        self.released.notify_waiters();
    }
}

pub struct Pool<M: ManageConnection> {
    shared: Arc<Shared<M>>,
}

impl<M: ManageConnection> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ManageConnection> Pool<M> {
    /// Build a pool. In eager mode every connection is opened before this
    /// returns, and the first failure aborts construction.
    pub async fn new(manager: M, config: PoolConfig) -> Result<Self, PoolError> {
        let max_size = config.max_size.max(1);

        let pool = Self {
            shared: Arc::new(Shared {
                manager,
                max_size,
                idle: Mutex::new(IdleSet {
                    conns: Vec::with_capacity(max_size),
                    drained: false,
                }),
                permits: Arc::new(Semaphore::new(max_size)),
                open: AtomicUsize::new(0),
                leased: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                released: Notify::new(),
                config,
            }),
        };

        if pool.shared.config.eager {
            for _ in 0..max_size {
                match pool.shared.manager.connect().await {
                    Ok(conn) => {
                        pool.shared.open.fetch_add(1, Ordering::SeqCst);
                        pool.shared.idle().conns.push(conn);
                    }
                    Err(err) => {
                        pool.close().await;
                        return Err(PoolError::Connect(err.to_string()));
                    }
                }
            }
            info!("Opened {} database connections", max_size);
        }

        Ok(pool)
    }

    /// Lease a connection, waiting up to the configured acquire timeout when
    /// every connection is in use.
    pub async fn acquire(&self) -> Result<Lease<M>, PoolError> {
        let shared = &self.shared;
        let wait = shared.config.acquire_timeout;

        let permit =
            match tokio::time::timeout(wait, Arc::clone(&shared.permits).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(PoolError::Closed),
                Err(_) => return Err(PoolError::Timeout(wait)),
            };

        let reused = shared.idle().conns.pop();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                let conn = shared.manager.connect().await.map_err(|err| {
                    warn!("Failed to open database connection: {}", err);
                    PoolError::Connect(err.to_string())
                })?;
                shared.open.fetch_add(1, Ordering::SeqCst);
                debug!("Opened database connection");
                conn
            }
        };

        shared.leased.fetch_add(1, Ordering::SeqCst);

        Ok(Lease {
            conn: Some(conn),
            broken: false,
            shared: Arc::clone(shared),
            _permit: permit,
        })
    }

    /// Stop handing out connections and close every connection the pool owns.
    ///
    /// Waiting and future `acquire` calls fail with [`PoolError::Closed`].
    /// Outstanding leases get `shutdown_grace` to come back; any that return
    /// later have their connection dropped instead of pooled. Only the first
    /// call drains.
    pub async fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        shared.permits.close();

        let grace = shared.config.shutdown_grace;
        let outstanding = async {
            loop {
                let released = shared.released.notified();
                if shared.leased.load(Ordering::SeqCst) == 0 {
                    break;
                }
                released.await;
            }
        };

        if tokio::time::timeout(grace, outstanding).await.is_err() {
            warn!(
                "{} connection(s) still leased after {:?}; closing them on release",
                shared.leased.load(Ordering::SeqCst),
                grace
            );
        }

        let conns = {
            let mut idle = shared.idle();
            idle.drained = true;
            std::mem::take(&mut idle.conns)
        };

        let count = conns.len();
        for conn in conns {
            shared.manager.close(conn).await;
            shared.open.fetch_sub(1, Ordering::SeqCst);
        }

        info!("Connection pool closed ({} connection(s) closed)", count);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> PoolStatus {
        let shared = &self.shared;
        PoolStatus {
            max_size: shared.max_size,
            open: shared.open.load(Ordering::SeqCst),
            idle: shared.idle().conns.len(),
            leased: shared.leased.load(Ordering::SeqCst),
        }
    }
}

/// Exclusive use of one pooled connection, returned to the pool on drop
pub struct Lease<M: ManageConnection> {
    conn: Option<M::Connection>,
    broken: bool,
    shared: Arc<Shared<M>>,
    // Dropped after `conn` has been put back, so a woken waiter finds it idle.
    _permit: OwnedSemaphorePermit,
}

impl<M: ManageConnection> Lease<M> {
    /// Discard the connection on release instead of reusing it
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<M: ManageConnection> Deref for Lease<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("lease used after release")
    }
}

impl<M: ManageConnection> DerefMut for Lease<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("lease used after release")
    }
}

impl<M: ManageConnection> Drop for Lease<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.release(conn, self.broken);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::pin;

    #[derive(Debug, Error)]
    #[error("connection refused")]
    struct Refused;

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        closes: AtomicUsize,
    }

    struct TestManager {
        counters: Arc<Counters>,
        refuse: bool,
    }

    impl ManageConnection for TestManager {
        type Connection = usize;
        type Error = Refused;

        async fn connect(&self) -> Result<usize, Refused> {
            if self.refuse {
                return Err(Refused);
            }
            Ok(self.counters.connects.fetch_add(1, Ordering::SeqCst))
        }

        async fn close(&self, _conn: usize) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn test_pool(config: PoolConfig) -> (Pool<TestManager>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let manager = TestManager {
            counters: counters.clone(),
            refuse: false,
        };
        let pool = Pool::new(manager, config).await.unwrap();
        (pool, counters)
    }

    fn quick() -> PoolConfig {
        PoolConfig::default()
            .with_acquire_timeout(Duration::from_millis(50))
            .with_shutdown_grace(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_lease_and_release_are_balanced() {
        let (pool, counters) = test_pool(quick().with_max_size(2)).await;

        let lease = pool.acquire().await.unwrap();
        assert_eq!(pool.status().leased, 1);
        drop(lease);

        let status = pool.status();
        assert_eq!(status.leased, 0);
        assert_eq!(status.idle, 1);
        assert_eq!(status.open, 1);

        // The idle connection is reused rather than reopened
        let again = pool.acquire().await.unwrap();
        assert_eq!(*again, 0);
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release_when_exhausted() {
        let (pool, _) = test_pool(PoolConfig::default().with_max_size(1)).await;

        let first = pool.acquire().await.unwrap();
        let mut waiting = pin!(pool.acquire());

        let still_waiting =
            tokio::time::timeout(Duration::from_millis(30), waiting.as_mut()).await;
        assert!(still_waiting.is_err());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("waiter should be woken by the release");
        assert!(second.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_exceeds_max_size() {
        let (pool, counters) = test_pool(
            PoolConfig::default()
                .with_max_size(3)
                .with_acquire_timeout(Duration::from_secs(5)),
        )
        .await;
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let pool = pool.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let lease = pool.acquire().await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                drop(lease);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(counters.connects.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.status().leased, 0);
    }

    #[tokio::test]
    async fn test_eager_pool_opens_every_connection() {
        let (pool, counters) = test_pool(quick().with_max_size(3).with_eager(true)).await;

        assert_eq!(counters.connects.load(Ordering::SeqCst), 3);
        let status = pool.status();
        assert_eq!(status.open, 3);
        assert_eq!(status.idle, 3);
    }

    #[tokio::test]
    async fn test_eager_pool_fails_fast_when_unreachable() {
        let manager = TestManager {
            counters: Arc::new(Counters::default()),
            refuse: true,
        };
        let result = Pool::new(manager, quick().with_eager(true)).await;
        assert!(matches!(result, Err(PoolError::Connect(_))));
    }

    #[tokio::test]
    async fn test_failed_connect_frees_the_slot() {
        let manager = TestManager {
            counters: Arc::new(Counters::default()),
            refuse: true,
        };
        let pool = Pool::new(manager, quick().with_max_size(1)).await.unwrap();

        for _ in 0..2 {
            let result = pool.acquire().await;
            assert!(matches!(result, Err(PoolError::Connect(ref msg)) if msg == "connection refused"));
        }
        assert_eq!(pool.status().leased, 0);
    }

    #[tokio::test]
    async fn test_acquire_times_out() {
        let (pool, _) = test_pool(quick().with_max_size(1)).await;

        let _held = pool.acquire().await.unwrap();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(PoolError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_closes_idle_connections() {
        let (pool, counters) = test_pool(
            PoolConfig::default()
                .with_max_size(1)
                .with_shutdown_grace(Duration::from_secs(1)),
        )
        .await;

        let lease = pool.acquire().await.unwrap();
        let waiter = pool.acquire();

        let ((), waited) = tokio::join!(pool.close(), async move {
            let result = waiter.await;
            drop(lease);
            result
        });

        assert!(matches!(waited, Err(PoolError::Closed)));
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().open, 0);
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));

        // A second close is a no-op
        pool.close().await;
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lease_returned_after_drain_is_dropped() {
        let (pool, counters) = test_pool(quick().with_max_size(2)).await;

        let lease = pool.acquire().await.unwrap();
        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(pool.status().open, 1);

        drop(lease);
        let status = pool.status();
        assert_eq!(status.open, 0);
        assert_eq!(status.idle, 0);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_broken_lease_is_not_reused() {
        let (pool, counters) = test_pool(quick().with_max_size(1)).await;

        let mut lease = pool.acquire().await.unwrap();
        lease.mark_broken();
        drop(lease);

        let status = pool.status();
        assert_eq!(status.open, 0);
        assert_eq!(status.idle, 0);

        let fresh = pool.acquire().await.unwrap();
        assert_eq!(*fresh, 1);
        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
    }
}
