//! # Connection Pool
//!
//! Purpose: Reuse store connections to reduce handshake latency, building
//! (and authenticating) new ones lazily up to a fixed capacity.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections;
//!    the factory runs outside the lock with its slot reserved.
//! 3. **Identity Tracking**: Checked-out connections are tracked by id so a
//!    foreign or repeated checkin is rejected instead of corrupting counts.
//! 4. **RAII Checkin**: `PooledConnection` returns itself on drop, so every
//!    path out of a command balances the checkout.
//!
//! ## Accounting
//!
//! ```text
//! idle.len() + checked_out.len() + constructing <= capacity
//! ```
//!
//! A connection that failed mid-command is still returned to the idle set
//! unless `PoolConfig::discard_broken` is set.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::config::{BlockingPolicy, PoolConfig};
use crate::connection::{ConnectionFactory, Session, StoreConnector};
use crate::error::{ClientError, ClientResult};
use crate::resp::{Command, RespValue};

// Ids are unique across pools so a connection can never match another pool's set.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Point-in-time view of pool accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub checked_out: usize,
    /// Slots reserved for connections the factory is still building.
    pub constructing: usize,
}

impl PoolStats {
    /// Total slots in use, idle connections included.
    pub fn total(&self) -> usize {
        self.idle + self.checked_out + self.constructing
    }
}

struct Connection {
    id: u64,
    session: Box<dyn Session>,
}

struct PoolState {
    idle: Vec<Connection>,
    checked_out: HashSet<u64>,
    constructing: usize,
    closed: bool,
}

impl PoolState {
    fn in_use(&self) -> usize {
        self.idle.len() + self.checked_out.len() + self.constructing
    }
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// A construction slot counted in `constructing`.
///
/// Settled under the lock once the factory returns. Dropped unsettled (the
/// factory panicked) it gives the slot back and wakes a waiter.
struct Reservation<'a> {
    inner: &'a PoolInner,
    armed: bool,
}

impl Reservation<'_> {
    fn settle(mut self, state: &mut PoolState) {
        self.armed = false;
        state.constructing -= 1;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.state.lock().constructing -= 1;
            self.inner.available.notify_one();
        }
    }
}

/// Connection pool handle.
///
/// Cloning is cheap and every clone shares the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool that builds connections with `StoreConnector`.
    pub fn new(config: PoolConfig) -> ClientResult<Self> {
        let factory = Arc::new(StoreConnector::from_config(&config));
        Self::with_factory(config, factory)
    }

    /// Creates a pool that builds connections with a custom factory.
    pub fn with_factory(
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> ClientResult<Self> {
        config.validate()?;
        let state = PoolState {
            idle: Vec::with_capacity(config.capacity),
            checked_out: HashSet::with_capacity(config.capacity),
            constructing: 0,
            closed: false,
        };
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                factory,
                state: Mutex::new(state),
                available: Condvar::new(),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrows a connection, building one if none is idle and capacity allows.
    ///
    /// When the pool is saturated the configured `BlockingPolicy` decides
    /// whether to wait (possibly forever) or fail.
    pub fn checkout(&self) -> ClientResult<PooledConnection> {
        let mut state = self.inner.state.lock();
        let deadline = match self.inner.config.blocking {
            BlockingPolicy::WaitFor(timeout) => Some(Instant::now() + timeout),
            _ => None,
        };

        loop {
            if state.closed {
                return Err(ClientError::PoolClosed);
            }
            if let Some(conn) = state.idle.pop() {
                state.checked_out.insert(conn.id);
                debug!(id = conn.id, "reusing idle connection");
                return Ok(PooledConnection::new(self.inner.clone(), conn));
            }
            if state.in_use() < self.inner.config.capacity {
                state.constructing += 1;
                break;
            }
            self.wait_for_slot(&mut state, deadline)?;
        }
        drop(state);

        self.construct(Reservation {
            inner: &self.inner,
            armed: true,
        })
    }

    fn wait_for_slot(
        &self,
        state: &mut MutexGuard<'_, PoolState>,
        deadline: Option<Instant>,
    ) -> ClientResult<()> {
        match (self.inner.config.blocking, deadline) {
            (BlockingPolicy::FailFast, _) => Err(ClientError::PoolExhausted {
                capacity: self.inner.config.capacity,
            }),
            (BlockingPolicy::WaitFor(timeout), Some(deadline)) => {
                if Instant::now() >= deadline {
                    return Err(ClientError::PoolTimeout { waited: timeout });
                }
                self.inner.available.wait_until(state, deadline);
                Ok(())
            }
            _ => {
                self.inner.available.wait(state);
                Ok(())
            }
        }
    }

    fn construct(&self, reservation: Reservation<'_>) -> ClientResult<PooledConnection> {
        let config = &self.inner.config;
        let result = self.inner.factory.connect(&config.address, config.network);

        let mut state = self.inner.state.lock();
        reservation.settle(&mut state);

        match result {
            Ok(mut session) => {
                if state.closed {
                    drop(state);
                    session.close();
                    self.inner.available.notify_all();
                    return Err(ClientError::PoolClosed);
                }
                let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
                state.checked_out.insert(id);
                debug!(id, address = %config.address, "constructed connection");
                Ok(PooledConnection::new(
                    self.inner.clone(),
                    Connection { id, session },
                ))
            }
            Err(err) => {
                drop(state);
                // The reserved slot is free again; let a waiter try to build it.
                self.inner.available.notify_one();
                Err(err)
            }
        }
    }

    /// Returns a connection to the pool explicitly.
    ///
    /// Dropping the guard does the same; this variant reports misuse. A
    /// connection that belongs to another pool is rejected with
    /// `DoubleRelease` and goes back to the pool that issued it.
    pub fn checkin(&self, mut conn: PooledConnection) -> ClientResult<()> {
        if !Arc::ptr_eq(&self.inner, &conn.pool) {
            let id = conn.id();
            warn!(id, "rejected checkin of a connection from another pool");
            return Err(ClientError::DoubleRelease { id });
        }
        match conn.conn.take() {
            Some(inner) => self.inner.release(inner, conn.broken),
            None => Err(ClientError::DoubleRelease { id: conn.id }),
        }
    }

    /// Closes every idle connection and fails current and future waiters.
    ///
    /// Checked-out connections are closed when they come back.
    pub fn close(&self) {
        let idle = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        self.inner.available.notify_all();

        debug!(closed = idle.len(), "closing connection pool");
        for mut conn in idle {
            conn.session.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            capacity: self.inner.config.capacity,
            idle: state.idle.len(),
            checked_out: state.checked_out.len(),
            constructing: state.constructing,
        }
    }
}

impl PoolInner {
    fn release(&self, mut conn: Connection, broken: bool) -> ClientResult<()> {
        let mut state = self.state.lock();
        if !state.checked_out.remove(&conn.id) {
            drop(state);
            warn!(id = conn.id, "connection released twice");
            conn.session.close();
            return Err(ClientError::DoubleRelease { id: conn.id });
        }

        if state.closed || (broken && self.config.discard_broken) {
            drop(state);
            debug!(id = conn.id, broken, "discarding connection on checkin");
            conn.session.close();
            self.available.notify_one();
            return Ok(());
        }

        state.idle.push(conn);
        drop(state);
        self.available.notify_one();
        Ok(())
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    id: u64,
    broken: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            id: conn.id,
            conn: Some(conn),
            broken: false,
        }
    }

    /// Pool-assigned identity of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True once a command on this connection hit a transport error.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Sends one command and returns the raw reply.
    pub fn exec(&mut self, command: &Command) -> ClientResult<RespValue> {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Err(ClientError::PoolClosed),
        };
        let response = conn.session.send(command);
        if let Err(err) = &response {
            if err.is_transport() {
                self.broken = true;
            }
        }
        response
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(err) = self.pool.release(conn, self.broken) {
                warn!(id = self.id, error = %err, "failed to return connection to pool");
            }
        }
    }
}
