use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::runtime::{Builder, Handle, Runtime};

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::executor::{QueryExecutor, QueryOutcome, QueryRequest};
use crate::logging::worker;
use crate::pool::{ConnectionFuture, ConnectionPool, DialTarget, PoolStatus, PooledConnection};
use crate::tunnel::TunnelSession;
use crate::types::{OperationMode, RowValues};

/// Snapshot of a broker's resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BrokerStatus {
    pub pool: PoolStatus,
    pub tunnel_running: bool,
    pub local_port: Option<u16>,
    pub closed: bool,
}

/// Owns the SSH tunnel, the connection pool, and the runtime that drives them.
///
/// All methods block the calling thread and are meant for plain OS worker threads.
/// Calling them from inside an async runtime is rejected with `BrokerError::Runtime`;
/// async code should use the `QueryExecutor` returned by [`Broker::executor`].
///
/// Dropping a broker shuts it down, so a broker built with [`Broker::connect`] can be
/// used as a scoped resource. The process-wide instance lives in [`crate::instance`].
pub struct Broker {
    runtime: Option<Runtime>,
    executor: QueryExecutor,
    tunnel: Mutex<TunnelSession>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("pool", self.executor.pool())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Open the tunnel, then the pool over it.
    ///
    /// Whatever was opened before a failure is closed again before the error is returned.
    ///
    /// # Errors
    /// `BrokerError::InvalidConfiguration`, `BrokerError::Runtime`, `BrokerError::Tunnel`
    /// or `BrokerError::Connection`.
    pub fn connect(config: BrokerConfig) -> Result<Self, BrokerError> {
        config.pool.validate()?;
        ensure_blocking_context()?;
        let runtime = build_runtime()?;

        let mut tunnel = TunnelSession::new(config.tunnel.clone());
        let local_port = runtime.block_on(tunnel.start())?;
        Self::assemble(runtime, tunnel, local_port, &config)
    }

    /// Build the pool on `runtime`, dialing `127.0.0.1:local_port`, and take
    /// ownership of `tunnel`. The tunnel is stopped if the pool cannot be built.
    pub(crate) fn assemble(
        runtime: Runtime,
        mut tunnel: TunnelSession,
        local_port: u16,
        config: &BrokerConfig,
    ) -> Result<Self, BrokerError> {
        let target = DialTarget::loopback(local_port, &config.database);
        let pool = match runtime.block_on(ConnectionPool::connect(target, &config.pool)) {
            Ok(pool) => pool,
            Err(e) => {
                tracing::error!("Unexpected error during initialization: {e}");
                runtime.block_on(tunnel.stop());
                runtime.shutdown_background();
                return Err(e);
            }
        };

        Ok(Self {
            runtime: Some(runtime),
            executor: QueryExecutor::new(pool, config.translate_placeholders),
            tunnel: Mutex::new(tunnel),
            closed: AtomicBool::new(false),
        })
    }

    /// Run one statement; failures are logged under `label` and reported as `NoResult`.
    pub fn execute(
        &self,
        label: Option<&str>,
        query: &str,
        params: &[RowValues],
        mode: OperationMode,
    ) -> QueryOutcome {
        let mut request = QueryRequest::new(query, mode).params(params);
        request.label = label.map(str::to_string);
        self.execute_request(request)
    }

    /// Like [`Broker::execute`] with the mode given by name; unknown names yield `NoResult`.
    pub fn execute_named(
        &self,
        label: Option<&str>,
        query: &str,
        params: &[RowValues],
        mode_name: &str,
    ) -> QueryOutcome {
        match self.block_on(self.executor.execute_named(label, query, params, mode_name)) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(worker = worker(label), "{e}");
                QueryOutcome::NoResult
            }
        }
    }

    pub fn execute_request(&self, request: QueryRequest) -> QueryOutcome {
        let label = request.label.clone();
        match self.block_on(self.executor.execute(request)) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(worker = worker(label.as_deref()), "{e}");
                QueryOutcome::NoResult
            }
        }
    }

    /// Run `request` and return the raw error instead of `NoResult`.
    ///
    /// # Errors
    /// See [`QueryExecutor::try_execute`].
    pub fn try_execute(&self, request: QueryRequest) -> Result<QueryOutcome, BrokerError> {
        self.block_on(self.executor.try_execute(request))?
    }

    /// Scoped acquisition for multi-statement work on one connection.
    ///
    /// # Errors
    /// See [`ConnectionPool::with_connection`].
    pub fn with_connection<T, F>(&self, label: Option<&str>, op: F) -> Result<T, BrokerError>
    where
        F: for<'c> FnOnce(&'c mut PooledConnection) -> ConnectionFuture<'c, T>,
    {
        self.block_on(self.executor.pool().with_connection(label, op))?
    }

    #[must_use]
    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    #[must_use]
    pub fn status(&self) -> BrokerStatus {
        let mut tunnel = self.lock_tunnel();
        BrokerStatus {
            pool: self.executor.pool().status(),
            tunnel_running: tunnel.is_running(),
            local_port: tunnel.local_port(),
            closed: self.is_closed(),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the pool, then stop the tunnel. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.executor.pool().close_all();
        let mut tunnel = self.lock_tunnel();
        if self.block_on(tunnel.stop()).is_err() {
            // Inside an async context or without a runtime the forward is only cancelled.
            tunnel.abort();
        }
    }

    fn block_on<F: Future>(&self, future: F) -> Result<F::Output, BrokerError> {
        ensure_blocking_context()?;
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| BrokerError::Runtime("broker runtime is gone".to_string()))?;
        Ok(runtime.block_on(future))
    }

    fn lock_tunnel(&self) -> MutexGuard<'_, TunnelSession> {
        self.tunnel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn build_runtime() -> Result<Runtime, BrokerError> {
    Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("tunnel-broker")
        .enable_all()
        .build()
        .map_err(|e| BrokerError::Runtime(format!("failed to start broker runtime: {e}")))
}

fn ensure_blocking_context() -> Result<(), BrokerError> {
    if Handle::try_current().is_ok() {
        return Err(BrokerError::Runtime(
            "blocking broker call made from inside an async runtime; use Broker::executor() instead"
                .to_string(),
        ));
    }
    Ok(())
}

#[cfg(all(test, feature = "test-utils"))]
mod tests {
    use super::*;
    use crate::test_utils::{EmbeddedPostgres, setup_postgres_embedded, stop_postgres_embedded};
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn broker_over(pg: &EmbeddedPostgres, max_size: usize) -> Broker {
        let mut config = pg.broker_config();
        config.pool.max_size = max_size;
        config.pool.min_size = 1;
        let tunnel = TunnelSession::new(config.tunnel.clone());
        Broker::assemble(build_runtime().unwrap(), tunnel, pg.port, &config).unwrap()
    }

    #[test]
    fn blocking_calls_share_one_pool_and_shut_down_once() {
        let pg = setup_postgres_embedded("broker_blocking").unwrap();
        let broker = Arc::new(broker_over(&pg, 1));

        let outcome = broker.execute(Some("w1"), "SELECT 1 AS x", &[], OperationMode::Fetch);
        let rows = outcome.rows().expect("fetch returns rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.results[0].get("x"), Some(&RowValues::Int(1)));

        // Thread A holds the only connection; thread B waits for it and then succeeds.
        let (held_tx, held_rx) = mpsc::channel();
        let a = {
            let broker = Arc::clone(&broker);
            thread::spawn(move || {
                broker.with_connection(Some("A"), move |conn| {
                    Box::pin(async move {
                        held_tx.send(()).ok();
                        conn.execute("SELECT pg_sleep(0.5)", &[]).await?;
                        Ok(())
                    })
                })
            })
        };
        held_rx.recv().unwrap();
        assert_eq!(broker.status().pool.checked_out, 1);
        let b = {
            let broker = Arc::clone(&broker);
            thread::spawn(move || {
                broker.execute(Some("B"), "SELECT 2 AS y", &[], OperationMode::Fetch)
            })
        };
        a.join().unwrap().unwrap();
        let b_outcome = b.join().unwrap();
        assert_eq!(
            b_outcome.rows().and_then(|rs| rs.first()).and_then(|r| r.get("y")),
            Some(&RowValues::Int(2))
        );
        assert_eq!(broker.status().pool.checked_out, 0);

        assert!(broker.execute_named(Some("w1"), "SELECT 1", &[], "fetchall").is_no_result());

        broker.shutdown();
        broker.shutdown();
        let status = broker.status();
        assert!(status.closed && status.pool.closed && !status.tunnel_running);
        assert!(broker.execute(None, "SELECT 1", &[], OperationMode::Fetch).is_no_result());

        drop(broker);
        stop_postgres_embedded(pg);
    }

    #[test]
    fn exhausted_pool_times_out_instead_of_hanging() {
        let pg = setup_postgres_embedded("broker_exhaustion").unwrap();
        let mut config = pg.broker_config();
        config.pool.max_size = 1;
        config.pool.acquire_timeout = Some(Duration::from_millis(200));
        let tunnel = TunnelSession::new(config.tunnel.clone());
        let broker =
            Arc::new(Broker::assemble(build_runtime().unwrap(), tunnel, pg.port, &config).unwrap());

        let (held_tx, held_rx) = mpsc::channel();
        let holder = {
            let broker = Arc::clone(&broker);
            thread::spawn(move || {
                broker.with_connection(None, move |conn| {
                    Box::pin(async move {
                        held_tx.send(()).ok();
                        conn.execute("SELECT pg_sleep(1)", &[]).await?;
                        Ok(())
                    })
                })
            })
        };
        held_rx.recv().unwrap();

        let err = broker.try_execute(QueryRequest::fetch("SELECT 1")).unwrap_err();
        assert!(matches!(err, BrokerError::PoolExhausted(_)), "got {err:?}");

        holder.join().unwrap().unwrap();
        assert_eq!(broker.status().pool.checked_out, 0);
        broker.shutdown();
        drop(broker);
        stop_postgres_embedded(pg);
    }
}
