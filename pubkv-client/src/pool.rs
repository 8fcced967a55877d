//! # Connection Pool
//!
//! Purpose: Reuse TCP connections for request/response commands, validating
//! long-idle connections before handing them out.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections;
//!    never across an await.
//! 3. **Fail Fast**: Exceeding the active limit returns an error immediately.
//! 4. **RAII Release**: `PooledConnection` goes back to the pool on drop, so
//!    every exit path of a caller releases it.
//!
//! ## Notes
//! - Idle connections are kept most-recently-used first; eviction of stale
//!   ones happens from the back on every acquire.
//! - A connection that saw an IO/protocol error, or that still has replies
//!   outstanding, is closed instead of returned.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use pubkv_common::RespValue;

use crate::conn::{Connection, DialOptions};
use crate::error::{ServiceError, ServiceResult};

/// Idle connections used more recently than this skip the borrow PING.
pub const BORROW_TEST_THRESHOLD: Duration = Duration::from_secs(60);

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    /// Maximum number of idle connections to keep.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use); 0 means unlimited.
    pub max_active: usize,
    /// Idle connections older than this are closed; zero disables eviction.
    pub idle_timeout: Duration,
    /// Socket options for dialed connections.
    pub dial: DialOptions,
}

/// Connection counts at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections owned by the pool, idle or checked out.
    pub active_count: usize,
    /// Connections sitting idle.
    pub idle_count: usize,
}

struct IdleConn {
    conn: Connection,
    last_used: Instant,
}

struct PoolState {
    idle: VecDeque<IdleConn>,
    active: usize,
    closed: bool,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

/// Connection pool handle.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool; connections are dialed lazily.
    pub fn new(config: PoolConfig) -> Self {
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_idle),
            active: 0,
            closed: false,
        };
        ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
            }),
        }
    }

    /// Dials a fresh connection that is not tracked by the pool.
    pub async fn dial(&self) -> ServiceResult<Connection> {
        let config = &self.inner.config;
        let conn = Connection::dial(&config.addr, &config.dial).await?;
        debug!(addr = %config.addr, "dialed connection");
        Ok(conn)
    }

    /// Acquires a connection, reusing a healthy idle one when possible.
    pub async fn acquire(&self) -> ServiceResult<PooledConnection> {
        while let Some(IdleConn { mut conn, last_used }) = self.pop_idle()? {
            match test_on_borrow(&mut conn, last_used).await {
                Ok(()) => return Ok(PooledConnection::new(self.inner.clone(), conn)),
                Err(err) => {
                    debug!(error = %err, "discarding idle connection that failed borrow test");
                    self.release_slot();
                }
            }
        }

        self.try_reserve()?;
        match self.dial().await {
            Ok(conn) => Ok(PooledConnection::new(self.inner.clone(), conn)),
            Err(err) => {
                self.release_slot();
                Err(err)
            }
        }
    }

    /// Returns current connection counts.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().expect("pool mutex poisoned");
        PoolStats {
            active_count: state.active,
            idle_count: state.idle.len(),
        }
    }

    /// Closes every idle connection and refuses further acquisitions.
    ///
    /// Checked-out connections are closed when their guards drop. The first
    /// shutdown error is reported after all idle connections were attempted.
    pub async fn close(&self) -> ServiceResult<()> {
        let drained: Vec<IdleConn> = {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            state.closed = true;
            let drained: Vec<IdleConn> = state.idle.drain(..).collect();
            state.active = state.active.saturating_sub(drained.len());
            drained
        };

        let mut first_err = None;
        for IdleConn { mut conn, .. } in drained {
            if let Err(err) = conn.shutdown().await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn pop_idle(&self) -> ServiceResult<Option<IdleConn>> {
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
        if state.closed {
            return Err(ServiceError::NotRunning);
        }

        let idle_timeout = self.inner.config.idle_timeout;
        if !idle_timeout.is_zero() {
            while state
                .idle
                .back()
                .is_some_and(|entry| entry.last_used.elapsed() >= idle_timeout)
            {
                state.idle.pop_back();
                state.active = state.active.saturating_sub(1);
                debug!("evicted stale idle connection");
            }
        }
        Ok(state.idle.pop_front())
    }

    fn try_reserve(&self) -> ServiceResult<()> {
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
        let max_active = self.inner.config.max_active;
        if max_active != 0 && state.active >= max_active {
            return Err(ServiceError::PoolExhausted);
        }
        state.active += 1;
        Ok(())
    }

    fn release_slot(&self) {
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
        state.active = state.active.saturating_sub(1);
    }

    fn return_connection(&self, conn: Connection) {
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
        if !state.closed && state.idle.len() < self.inner.config.max_idle {
            state.idle.push_front(IdleConn {
                conn,
                last_used: Instant::now(),
            });
        } else {
            state.active = state.active.saturating_sub(1);
        }
    }
}

/// Validates an idle connection before reuse.
///
/// Connections used within [`BORROW_TEST_THRESHOLD`] are assumed healthy;
/// older ones must answer PING.
pub async fn test_on_borrow(conn: &mut Connection, last_used: Instant) -> ServiceResult<()> {
    if last_used.elapsed() < BORROW_TEST_THRESHOLD {
        return Ok(());
    }
    conn.ping().await
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    valid: bool,
    pending: usize,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            valid: true,
            pending: 0,
        }
    }

    /// Executes a RESP command and returns the parsed response.
    ///
    /// The request counts as pending until its reply is read, so a caller
    /// cancelled mid-call never hands the reply to the next borrower.
    pub async fn exec(&mut self, args: &[&[u8]]) -> ServiceResult<RespValue> {
        self.pending += 1;
        let result = self.conn_mut().exec(args).await;
        let result = self.track(result);
        if result.is_ok() {
            self.pending -= 1;
        }
        result
    }

    /// Buffers a command; its reply must be read with `receive`.
    pub fn queue(&mut self, args: &[&[u8]]) {
        self.conn_mut().queue(args);
        self.pending += 1;
    }

    /// Writes buffered commands.
    pub async fn flush(&mut self) -> ServiceResult<()> {
        // A write cut off by cancellation leaves a partial frame on the wire.
        let was_valid = std::mem::replace(&mut self.valid, false);
        let result = self.conn_mut().flush().await;
        self.valid = was_valid;
        self.track(result)
    }

    /// Reads the next reply.
    pub async fn receive(&mut self) -> ServiceResult<RespValue> {
        let result = self.conn_mut().receive().await;
        let result = self.track(result);
        if result.is_ok() {
            self.pending = self.pending.saturating_sub(1);
        }
        result
    }

    fn conn_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection exists")
    }

    fn track<T>(&mut self, result: ServiceResult<T>) -> ServiceResult<T> {
        if result.is_err() {
            // If IO/protocol fails, do not return this connection to the pool.
            self.valid = false;
        }
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        let pool = ConnectionPool {
            inner: self.pool.clone(),
        };

        if self.valid && self.pending == 0 {
            pool.return_connection(conn);
        } else {
            pool.release_slot();
        }
    }
}
