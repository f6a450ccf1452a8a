//! Single-node connection pool: a bounded, recyclable set of opened
//! connections, handed out as [`PooledConnection`] guards that return
//! themselves to idle (or close) on drop.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::aio::{connect, Connection, ConnectionLike};
use crate::connection::{ConnectionInfo, PoolConfig};
use crate::fail;
use crate::types::{ErrorKind, RedisError, RedisResult};

struct Inner {
    idle: Mutex<VecDeque<Connection>>,
    created: AtomicUsize,
    pid: AtomicU32,
    connection_info: ConnectionInfo,
    config: PoolConfig,
    readonly: bool,
}

impl Inner {
    fn new(connection_info: ConnectionInfo, config: PoolConfig, readonly: bool) -> Self {
        Inner {
            idle: Mutex::new(VecDeque::new()),
            created: AtomicUsize::new(0),
            pid: AtomicU32::new(std::process::id()),
            connection_info,
            config,
            readonly,
        }
    }

    /// Redis-py's pools are reset on a fork mismatch because the child
    /// inherits file descriptors it must not share with the parent. Tokio
    /// doesn't fork under us, but the check is kept as a defensive
    /// invariant: if it ever fires, start from a clean slate rather than
    /// handing out a connection descriptor two processes both think they
    /// own.
    fn check_fork(&self) {
        let current = std::process::id();
        if self.pid.swap(current, Ordering::SeqCst) != current {
            self.idle.lock().unwrap().clear();
            self.created.store(0, Ordering::SeqCst);
        }
    }

    fn pop_idle(&self) -> Option<Connection> {
        self.idle.lock().unwrap().pop_front()
    }

    fn push_idle(&self, conn: Connection) {
        self.idle.lock().unwrap().push_back(conn);
    }

    /// Reserves a construction slot under `max_connections`, returning
    /// `false` if the pool is already at capacity.
    fn try_reserve(&self) -> bool {
        self.created
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |created| {
                if created < self.config.max_connections {
                    Some(created + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn unreserve(&self) {
        self.created.fetch_sub(1, Ordering::SeqCst);
    }

    async fn acquire(&self) -> RedisResult<Connection> {
        self.check_fork();
        if let Some(conn) = self.pop_idle() {
            return Ok(conn);
        }
        if self.try_reserve() {
            match connect(&self.connection_info, self.readonly).await {
                Ok(conn) => Ok(conn),
                Err(err) => {
                    self.unreserve();
                    Err(err)
                }
            }
        } else {
            fail!((ErrorKind::PoolExhausted, "connection pool exhausted"));
        }
    }

    fn release(&self, conn: Connection, awaiting_response: bool) {
        self.check_fork();
        if conn.is_closed() || awaiting_response {
            self.unreserve();
        } else {
            self.push_idle(conn);
        }
    }

    fn disconnect(&self) {
        self.idle.lock().unwrap().clear();
        self.created.store(0, Ordering::SeqCst);
    }

    fn idle_len(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    fn created_len(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

/// A leased connection. Dropping it returns the connection to the pool's
/// idle list, unless it was left mid-command or has been marked closed,
/// in which case the slot is freed instead.
pub struct PooledConnection {
    inner: Arc<Inner>,
    conn: Option<Connection>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    fn new(inner: Arc<Inner>, conn: Connection, permit: Option<OwnedSemaphorePermit>) -> Self {
        PooledConnection { inner, conn: Some(conn), _permit: permit }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let awaiting = conn.is_awaiting_response();
            self.inner.release(conn, awaiting);
        }
    }
}

impl crate::aio::ConnectionLike for PooledConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a crate::cmd::Cmd) -> crate::types::RedisFuture<'a, crate::types::Value> {
        (**self).req_packed_command(cmd)
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmds: &'a [crate::cmd::Cmd],
        offset: usize,
        count: usize,
    ) -> crate::types::RedisFuture<'a, Vec<crate::types::Value>> {
        (**self).req_packed_commands(cmds, offset, count)
    }

    fn get_db(&self) -> i64 {
        (**self).get_db()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

/// A non-blocking single-node pool: the `N+1`th concurrent `acquire()`
/// fails immediately with [`ErrorKind::PoolExhausted`] rather than
/// waiting for a connection to be returned.
pub struct Pool {
    inner: Arc<Inner>,
}

impl Pool {
    pub fn new(connection_info: ConnectionInfo, config: PoolConfig, readonly: bool) -> Self {
        Pool { inner: Arc::new(Inner::new(connection_info, config, readonly)) }
    }

    pub async fn acquire(&self) -> RedisResult<PooledConnection> {
        let conn = self.inner.acquire().await?;
        Ok(PooledConnection::new(self.inner.clone(), conn, None))
    }

    pub async fn disconnect(&self) {
        self.inner.disconnect();
    }

    pub fn idle_len(&self) -> usize {
        self.inner.idle_len()
    }

    pub fn created_len(&self) -> usize {
        self.inner.created_len()
    }

    /// Spawns the idle reaper: wakes every `idle_check_interval`, dropping
    /// idle connections that have been unused for longer than
    /// `max_idle_time`. Returns a handle the caller can abort on shutdown.
    pub fn spawn_idle_reaper(&self) -> tokio::task::JoinHandle<()> {
        spawn_idle_reaper(self.inner.clone())
    }
}

/// A bounded-wait single-node pool: the `N+1`th concurrent `acquire()`
/// suspends until a connection is released or `blocking_timeout` elapses,
/// instead of failing outright.
pub struct BlockingPool {
    inner: Arc<Inner>,
    semaphore: Arc<Semaphore>,
    blocking_timeout: Option<Duration>,
}

impl BlockingPool {
    pub fn new(connection_info: ConnectionInfo, config: PoolConfig, readonly: bool, blocking_timeout: Option<Duration>) -> Self {
        let max_connections = config.max_connections;
        BlockingPool {
            inner: Arc::new(Inner::new(connection_info, config, readonly)),
            semaphore: Arc::new(Semaphore::new(max_connections)),
            blocking_timeout,
        }
    }

    pub async fn acquire(&self) -> RedisResult<PooledConnection> {
        let permit_fut = self.semaphore.clone().acquire_owned();
        let permit = match self.blocking_timeout {
            Some(timeout) => tokio::time::timeout(timeout, permit_fut)
                .await
                .map_err(|_| RedisError::from((ErrorKind::Timeout, "timed out waiting for a pooled connection")))?
                .expect("semaphore never closed"),
            None => permit_fut.await.expect("semaphore never closed"),
        };
        match self.inner.acquire().await {
            Ok(conn) => Ok(PooledConnection::new(self.inner.clone(), conn, Some(permit))),
            Err(err) => Err(err),
        }
    }

    pub async fn disconnect(&self) {
        self.inner.disconnect();
    }

    pub fn idle_len(&self) -> usize {
        self.inner.idle_len()
    }

    pub fn created_len(&self) -> usize {
        self.inner.created_len()
    }

    pub fn spawn_idle_reaper(&self) -> tokio::task::JoinHandle<()> {
        spawn_idle_reaper(self.inner.clone())
    }
}

/// Either flavor of single-node pool, so [`Client`] doesn't have to pick
/// one at compile time.
enum PoolHandle {
    NonBlocking(Pool),
    Blocking(BlockingPool),
}

impl PoolHandle {
    async fn acquire(&self) -> RedisResult<PooledConnection> {
        match self {
            PoolHandle::NonBlocking(pool) => pool.acquire().await,
            PoolHandle::Blocking(pool) => pool.acquire().await,
        }
    }
}

/// The single-node counterpart to [`crate::cluster::ClusterClient`]:
/// acquires a pooled connection per call and shapes the raw reply
/// through the response-callback registry before handing it back.
pub struct Client {
    pool: PoolHandle,
}

impl Client {
    pub fn new(connection_info: ConnectionInfo, config: PoolConfig, readonly: bool) -> Self {
        Client { pool: PoolHandle::NonBlocking(Pool::new(connection_info, config, readonly)) }
    }

    pub fn with_blocking_pool(
        connection_info: ConnectionInfo,
        config: PoolConfig,
        readonly: bool,
        blocking_timeout: Option<Duration>,
    ) -> Self {
        Client { pool: PoolHandle::Blocking(BlockingPool::new(connection_info, config, readonly, blocking_timeout)) }
    }

    /// Acquires a connection, sends `command`, and shapes the reply
    /// through `crate::callbacks`.
    pub async fn execute(&self, command: &crate::cmd::Cmd) -> RedisResult<crate::types::Value> {
        let mut conn = self.pool.acquire().await?;
        let value = conn.req_packed_command(command).await?;
        crate::callbacks::apply(&command.name(), value)
    }

    /// Hands out a raw pooled connection, for callers that want to build
    /// a [`crate::pipeline::Pipeline`] or otherwise bypass per-command
    /// callback shaping.
    pub async fn acquire(&self) -> RedisResult<PooledConnection> {
        self.pool.acquire().await
    }

    pub async fn disconnect(&self) {
        match &self.pool {
            PoolHandle::NonBlocking(pool) => pool.disconnect().await,
            PoolHandle::Blocking(pool) => pool.disconnect().await,
        }
    }
}

fn spawn_idle_reaper(inner: Arc<Inner>) -> tokio::task::JoinHandle<()> {
    let interval = inner.config.idle_check_interval;
    let max_idle = inner.config.max_idle_time;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let mut idle = inner.idle.lock().unwrap();
            let before = idle.len();
            idle.retain(|conn| conn.last_active_at().elapsed() <= max_idle);
            let removed = before - idle.len();
            drop(idle);
            if removed > 0 {
                inner.created.fetch_sub(removed, Ordering::SeqCst);
            }
        }
    })
}
