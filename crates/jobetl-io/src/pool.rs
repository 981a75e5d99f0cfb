//! Bounded connection pool over a [`Connector`].
//!
//! The pool is the only resource shared by a processor's in-flight
//! documents. Acquisition waits on a semaphore; the number of waiting
//! callers is the pool's queue length, which drives the processor's window.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jobetl_core::cache::Row;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("{0} is an unsupported output engine")]
    UnsupportedEngine(String),
    #[error("pool is closed")]
    Closed,
}

/// Result of one (possibly multi-statement) query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Rows of the last statement that returned any.
    pub rows: Vec<Row>,
    /// Generated id of the last insert, if the statement produced one.
    pub insert_id: Option<u64>,
    pub affected_rows: u64,
}

#[async_trait]
pub trait Connection: Send {
    /// Session id; per-connection caches are keyed by it.
    fn id(&self) -> u64;

    /// Run `sql`. Statements separated by `"; "` run in order.
    async fn query(&mut self, sql: &str) -> Result<QueryResult, PoolError>;

    async fn close(&mut self) -> Result<(), PoolError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<Box<dyn Connection>, PoolError>;
}

pub struct Pool {
    connector: Arc<dyn Connector>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn Connection>>>,
    waiting: AtomicUsize,
    closed: AtomicBool,
    size: usize,
}

impl Pool {
    pub fn new(connector: Arc<dyn Connector>, size: usize) -> Arc<Self> {
        let size = size.max(1);
        Arc::new(Self {
            connector,
            permits: Arc::new(Semaphore::new(size)),
            idle: Mutex::new(Vec::new()),
            waiting: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Callers currently waiting for a connection.
    pub fn queue_len(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait for a free slot, then reuse an idle connection or open a new one.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let permit = {
            let _queued = Queued::enter(&self.waiting);
            self.permits.clone().acquire_owned().await
        };
        let permit = permit.map_err(|_| PoolError::Closed)?;

        let reused = self.lock_idle().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                let conn = self.connector.connect().await?;
                debug!(connector = %self.connector.name(), id = conn.id(), "opened connection");
                conn
            }
        };
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Refuse further acquisitions and close every idle connection.
    /// Connections still checked out are closed when they come back.
    pub async fn end(&self) -> Result<(), PoolError> {
        self.closed.store(true, Ordering::SeqCst);
        self.permits.close();
        let idle: Vec<Box<dyn Connection>> = std::mem::take(&mut *self.lock_idle());
        let mut first_err = None;
        for mut conn in idle {
            if let Err(e) = conn.close().await {
                warn!(connector = %self.connector.name(), id = conn.id(), error = %e, "close failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<Box<dyn Connection>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn give_back(&self, conn: Box<dyn Connection>) {
        if self.is_closed() {
            warn!(id = conn.id(), "connection returned after pool end, dropped");
            return;
        }
        self.lock_idle().push(conn);
    }
}

/// Counts a caller as waiting until dropped, including when the acquiring
/// future is cancelled.
struct Queued<'a>(&'a AtomicUsize);

impl<'a> Queued<'a> {
    fn enter(waiting: &'a AtomicUsize) -> Self {
        waiting.fetch_add(1, Ordering::SeqCst);
        Self(waiting)
    }
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A checked-out connection. Dropping it releases it to the pool.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<Pool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.conn.as_ref().map_or(0, |c| c.id())
    }

    pub async fn query(&mut self, sql: &str) -> Result<QueryResult, PoolError> {
        match self.conn.as_mut() {
            Some(conn) => conn.query(sql).await,
            None => Err(PoolError::Closed),
        }
    }

    pub fn release(self) {}
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    struct Counting {
        opened: AtomicU64,
        closed: Arc<AtomicU64>,
    }

    struct Conn {
        id: u64,
        closed: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Connection for Conn {
        fn id(&self) -> u64 {
            self.id
        }
        async fn query(&mut self, _sql: &str) -> Result<QueryResult, PoolError> {
            Ok(QueryResult::default())
        }
        async fn close(&mut self) -> Result<(), PoolError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl Connector for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        async fn connect(&self) -> Result<Box<dyn Connection>, PoolError> {
            let id = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Box::new(Conn {
                id,
                closed: self.closed.clone(),
            }))
        }
    }

    fn pool(size: usize) -> (Arc<Pool>, Arc<AtomicU64>) {
        let closed = Arc::new(AtomicU64::new(0));
        let connector = Arc::new(Counting {
            opened: AtomicU64::new(0),
            closed: closed.clone(),
        });
        (Pool::new(connector, size), closed)
    }

    #[tokio::test]
    async fn reuses_released_connections() {
        let (pool, _) = pool(2);
        let a = pool.acquire().await.unwrap();
        let id = a.id();
        a.release();
        let b = pool.acquire().await.unwrap();
        assert_eq!(b.id(), id);
    }

    #[tokio::test]
    async fn waiting_callers_form_the_queue() {
        let (pool, _) = pool(1);
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| c.id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.queue_len(), 1);
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(pool.queue_len(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiters_leave_the_queue() {
        let (pool, _) = pool(1);
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| c.id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.queue_len(), 1);
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(pool.queue_len(), 0);

        let timed_out = tokio::time::timeout(Duration::from_millis(10), pool.acquire()).await;
        assert!(timed_out.is_err());
        assert_eq!(pool.queue_len(), 0);
        drop(held);
    }

    #[tokio::test]
    async fn end_closes_idle_and_refuses_new() {
        let (pool, closed) = pool(2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(a);
        drop(b);
        pool.end().await.unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    }
}
