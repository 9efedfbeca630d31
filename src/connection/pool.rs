use super::{Connection, config::ConnectionConfig};
use crate::core::{DbError, Result};
use crate::storage::AggregateStore;
use crate::transaction::TransactionId;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Reusable connections onto one shared [`AggregateStore`].
///
/// A checkout never waits: it takes a parked connection or opens a new one.
/// Units of work blocked on one row's lock therefore cannot starve work on
/// other rows. `max_connections` caps how many connections are parked for
/// reuse; surplus connections are closed when they come back.
pub struct ConnectionPool {
    config: ConnectionConfig,
    idle: Arc<Mutex<VecDeque<IdleConnection>>>,
    checked_out: Arc<AtomicUsize>,
    store: Arc<AggregateStore>,
    next_id: AtomicU64,
}

struct IdleConnection {
    connection: Connection,
    opened_at: Instant,
    parked_at: Instant,
}

impl IdleConnection {
    fn park(connection: Connection, opened_at: Instant) -> Self {
        Self {
            connection,
            opened_at,
            parked_at: Instant::now(),
        }
    }

    fn is_stale(&self, config: &ConnectionConfig) -> bool {
        let too_old = config
            .max_lifetime
            .is_some_and(|lifetime| self.opened_at.elapsed() > lifetime);
        let idle_too_long = config
            .idle_timeout
            .is_some_and(|timeout| self.parked_at.elapsed() > timeout);
        too_old || idle_too_long
    }
}

impl ConnectionPool {
    /// Create a pool over a fresh, empty store
    pub async fn new(config: ConnectionConfig) -> Result<Self> {
        Self::new_with_store(config, Arc::new(AggregateStore::new())).await
    }

    /// Create a pool over an existing store
    pub async fn new_with_store(
        config: ConnectionConfig,
        store: Arc<AggregateStore>,
    ) -> Result<Self> {
        config.validate().map_err(DbError::ConfigError)?;

        let pool = Self {
            idle: Arc::new(Mutex::new(VecDeque::new())),
            checked_out: Arc::new(AtomicUsize::new(0)),
            config,
            store,
            next_id: AtomicU64::new(1),
        };
        pool.warm_up()?;

        Ok(pool)
    }

    pub fn store(&self) -> &Arc<AggregateStore> {
        &self.store
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Check out a connection: a parked one if available, otherwise a new one
    pub async fn get_connection(&self) -> Result<PoolGuard> {
        let (connection, opened_at) = match self.take_idle()? {
            Some(idle) => (idle.connection, idle.opened_at),
            None => (self.open(), Instant::now()),
        };
        self.checked_out.fetch_add(1, Ordering::SeqCst);

        Ok(PoolGuard {
            connection: Some(connection),
            opened_at,
            idle: Arc::clone(&self.idle),
            checked_out: Arc::clone(&self.checked_out),
            max_idle: self.config.max_connections,
        })
    }

    fn take_idle(&self) -> Result<Option<IdleConnection>> {
        let mut idle = self.idle.lock()?;

        let before = idle.len();
        idle.retain(|parked| !parked.is_stale(&self.config));
        let evicted = before - idle.len();
        if evicted > 0 {
            debug!("Evicted {} stale idle connections", evicted);
        }

        Ok(idle.pop_front())
    }

    fn open(&self) -> Connection {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!("Opened connection {} to {}", id, self.config.database);
        Connection::new(id, Arc::clone(&self.store), self.config.lock_timeout)
    }

    /// Park `min_connections` ready connections
    fn warm_up(&self) -> Result<()> {
        let mut idle = self.idle.lock()?;
        while idle.len() < self.config.min_connections {
            idle.push_back(IdleConnection::park(self.open(), Instant::now()));
        }
        Ok(())
    }

    pub async fn stats(&self) -> PoolStats {
        let available = self.idle.lock().map(|idle| idle.len()).unwrap_or(0);
        let active = self.checked_out.load(Ordering::SeqCst);

        PoolStats {
            total_connections: active + available,
            available_connections: available,
            active_connections: active,
            max_connections: self.config.max_connections,
        }
    }
}

/// Connection pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    /// Cap on parked connections
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} checked out, {} idle, max {}",
            self.active_connections, self.available_connections, self.max_connections
        )
    }
}

/// Checked-out connection.
///
/// Dropping the guard rolls back any open transaction, which releases its
/// row locks, then parks the connection (or closes it when the pool is
/// already full).
pub struct PoolGuard {
    connection: Option<Connection>,
    opened_at: Instant,
    idle: Arc<Mutex<VecDeque<IdleConnection>>>,
    checked_out: Arc<AtomicUsize>,
    max_idle: usize,
}

impl PoolGuard {
    pub fn connection(&mut self) -> &mut Connection {
        self.connection
            .as_mut()
            .expect("Connection already returned to pool")
    }

    pub async fn begin(&mut self) -> Result<TransactionId> {
        self.connection().begin().await
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.connection().commit().await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.connection().rollback().await
    }

    /// Return the connection to the pool, rolling back any open transaction.
    pub async fn close(mut self) -> Result<()> {
        if let Some(mut connection) = self.connection.take() {
            if connection.is_in_transaction() {
                connection.rollback().await?;
            }
            self.park(connection);
        }
        Ok(())
    }

    fn park(&self, connection: Connection) {
        match self.idle.lock() {
            Ok(mut idle) if idle.len() < self.max_idle => {
                idle.push_back(IdleConnection::park(connection, self.opened_at))
            }
            Ok(_) => debug!("Pool full; closing connection {}", connection.id()),
            Err(_) => warn!("Idle queue poisoned; discarding connection {}", connection.id()),
        }
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        self.checked_out.fetch_sub(1, Ordering::SeqCst);

        let Some(mut connection) = self.connection.take() else {
            return;
        };

        // Typically a cancelled unit of work.
        if connection.is_in_transaction() {
            warn!(
                "PoolGuard dropped with active transaction on connection {}; rolling back",
                connection.id()
            );
            if let Err(err) = connection.rollback_now() {
                warn!("Rollback on drop failed, discarding connection: {}", err);
                return;
            }
        }

        self.park(connection);
    }
}
