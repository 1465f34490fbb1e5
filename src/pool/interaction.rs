use std::future::Future;
use std::pin::Pin;

use super::{ConnectionPool, PooledConnection};
use crate::error::BrokerError;
use crate::logging::worker;

/// Future returned by a scoped operation; it may borrow the connection for `'c`.
pub type ConnectionFuture<'c, T> =
    Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'c>>;

impl ConnectionPool {
    /// Check out one connection, run `op` with it, and check it back in whatever
    /// `op` returned. A failed checkout is returned as-is without a checkin.
    ///
    /// ```rust,no_run
    /// # use tunnel_broker::prelude::*;
    /// # async fn demo(pool: &ConnectionPool) -> Result<(), BrokerError> {
    /// let n: i64 = pool
    ///     .with_connection(Some("w1"), |conn| {
    ///         Box::pin(async move {
    ///             let row = conn.query_one("SELECT count(*) FROM t", &[]).await?;
    ///             Ok(row.get(0))
    ///         })
    ///     })
    ///     .await?;
    /// # let _ = n;
    /// # Ok(()) }
    /// ```
    ///
    /// # Errors
    /// Checkout errors (`PoolExhausted`, `PoolClosed`, `Connection`) or whatever `op` returns.
    pub async fn with_connection<T, F>(&self, label: Option<&str>, op: F) -> Result<T, BrokerError>
    where
        F: for<'c> FnOnce(&'c mut PooledConnection) -> ConnectionFuture<'c, T>,
    {
        let mut conn = self.checkout(label).await?;
        let result = op(&mut conn).await;
        if let Err(e) = &result {
            tracing::debug!(
                worker = worker(label),
                "Scoped operation failed, returning connection: {e}"
            );
        }
        self.checkin(label, conn)?;
        result
    }
}
