//! Bounded pool of PostgreSQL connections dialed through the tunnel's local port.

mod connection;
mod interaction;

pub use connection::PooledConnection;
pub use interaction::ConnectionFuture;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use deadpool::managed::TimeoutType;
use deadpool_postgres::{
    Config as PgConfig, ManagerConfig, Pool, PoolConfig, PoolError, RecyclingMethod, Runtime,
    Timeouts,
};
use serde::Serialize;
use tokio_postgres::NoTls;

use crate::config::{DatabaseConfig, PoolSettings};
use crate::error::BrokerError;
use crate::logging::worker;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Where pooled connections are dialed.
#[derive(Debug, Clone, Copy)]
pub struct DialTarget<'a> {
    pub host: &'a str,
    pub port: u16,
    pub database: &'a DatabaseConfig,
}

impl<'a> DialTarget<'a> {
    /// Loopback target for a tunnel bound on `local_port`.
    #[must_use]
    pub fn loopback(local_port: u16, database: &'a DatabaseConfig) -> Self {
        Self {
            host: "127.0.0.1",
            port: local_port,
            database,
        }
    }
}

/// Point-in-time view of the pool's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub min_size: usize,
    pub max_size: usize,
    /// Live connections, idle plus checked out.
    pub size: usize,
    pub idle: usize,
    pub checked_out: usize,
    /// Callers currently blocked in `checkout`.
    pub waiting: usize,
    pub closed: bool,
}

pub(crate) struct PoolInner {
    pub(crate) id: u64,
    pool: Pool,
    settings: PoolSettings,
    pub(crate) checked_out: AtomicUsize,
}

/// Cheaply cloneable handle to one connection pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionPool {
    /// Build the pool and open `settings.min_size` connections up front.
    ///
    /// # Errors
    /// Returns `BrokerError::InvalidConfiguration` for inconsistent sizes and
    /// `BrokerError::Connection` when the pool cannot be created or warmed up.
    pub async fn connect(
        target: DialTarget<'_>,
        settings: &PoolSettings,
    ) -> Result<Self, BrokerError> {
        settings.validate()?;

        let mut pg_config = PgConfig::new();
        pg_config.host = Some(target.host.to_string());
        pg_config.port = Some(target.port);
        pg_config.user = Some(target.database.user.clone());
        pg_config.password = Some(target.database.password.clone());
        pg_config.dbname = Some(target.database.dbname.clone());
        pg_config.application_name = Some(env!("CARGO_PKG_NAME").to_string());
        pg_config.connect_timeout = Some(settings.connect_timeout);

        let mut manager = ManagerConfig::default();
        manager.recycling_method = RecyclingMethod::Fast;
        pg_config.manager = Some(manager);

        let mut timeouts = Timeouts::default();
        timeouts.wait = settings.acquire_timeout;
        timeouts.create = Some(settings.connect_timeout);
        timeouts.recycle = Some(settings.connect_timeout);
        let mut pool_config = PoolConfig::new(settings.max_size);
        pool_config.timeouts = timeouts;
        pg_config.pool = Some(pool_config);

        let pool = pg_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| {
                BrokerError::Connection(format!("Failed to create Postgres pool: {e}"))
            })?;

        let this = Self {
            inner: Arc::new(PoolInner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                pool,
                settings: *settings,
                checked_out: AtomicUsize::new(0),
            }),
        };

        if let Err(e) = this.warm_up().await {
            this.close_all();
            return Err(BrokerError::Connection(format!(
                "Failed to open initial connections to {}:{}: {e}",
                target.host, target.port
            )));
        }
        tracing::warn!(
            min = settings.min_size,
            max = settings.max_size,
            "Database connection pool created successfully."
        );
        Ok(this)
    }

    async fn warm_up(&self) -> Result<(), BrokerError> {
        let mut opened = Vec::with_capacity(self.inner.settings.min_size);
        for _ in 0..self.inner.settings.min_size {
            opened.push(self.checkout(None).await?);
        }
        for conn in opened {
            self.checkin(None, conn)?;
        }
        Ok(())
    }

    /// Take a live connection, waiting while every connection is checked out.
    ///
    /// # Errors
    /// `BrokerError::PoolExhausted` when the acquisition timeout expires,
    /// `BrokerError::PoolClosed` after `close_all`, `BrokerError::Connection` when a
    /// new connection cannot be opened.
    pub async fn checkout(&self, label: Option<&str>) -> Result<PooledConnection, BrokerError> {
        let object = self.inner.pool.get().await.map_err(|e| {
            let err = self.map_pool_error(e);
            tracing::error!(
                worker = worker(label),
                "Failed to obtain database connection from the pool: {err}"
            );
            err
        })?;
        let outstanding = self.inner.checked_out.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(worker = worker(label), outstanding, "Database connection checked out.");
        Ok(PooledConnection::new(object, Arc::clone(&self.inner)))
    }

    /// Return a connection to the idle set.
    ///
    /// Consuming the connection makes a second checkin of the same checkout
    /// impossible. A connection from another pool is rejected, but it still goes
    /// back to the pool it came from.
    ///
    /// # Errors
    /// Returns `BrokerError::ForeignConnection` for a connection this pool does not own.
    pub fn checkin(&self, label: Option<&str>, conn: PooledConnection) -> Result<(), BrokerError> {
        if conn.pool_id() != self.inner.id {
            tracing::warn!(
                worker = worker(label),
                "Rejected checkin of a connection owned by another pool."
            );
            drop(conn);
            return Err(BrokerError::ForeignConnection);
        }
        drop(conn);
        tracing::debug!(worker = worker(label), "Database connection returned to the pool.");
        Ok(())
    }

    /// Close the pool. Idle connections close now, outstanding ones when they are
    /// returned; later checkouts fail with `PoolClosed`. Safe to call repeatedly.
    pub fn close_all(&self) {
        if !self.inner.pool.is_closed() {
            self.inner.pool.close();
            tracing::warn!("Database connection pool closed.");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }

    #[must_use]
    pub fn checked_out(&self) -> usize {
        self.inner.checked_out.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let status = self.inner.pool.status();
        PoolStatus {
            min_size: self.inner.settings.min_size,
            max_size: self.inner.settings.max_size,
            size: status.size,
            idle: status.available,
            checked_out: self.checked_out(),
            waiting: status.waiting,
            closed: self.is_closed(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    fn map_pool_error(&self, err: PoolError) -> BrokerError {
        match err {
            PoolError::Closed => BrokerError::PoolClosed,
            PoolError::Timeout(TimeoutType::Wait) => BrokerError::PoolExhausted(
                self.inner.settings.acquire_timeout.unwrap_or(Duration::ZERO),
            ),
            PoolError::Backend(e) => {
                BrokerError::Connection(format!("Postgres connect error: {e}"))
            }
            other => BrokerError::Connection(other.to_string()),
        }
    }
}
