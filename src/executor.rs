use crate::error::BrokerError;
use crate::logging::worker;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::postgres::{Params, begin_transaction, build_result_set_from_statement};
use crate::results::ResultSet;
use crate::translation::{TranslationMode, translate_placeholders};
use crate::types::{OperationMode, RowValues};

/// One unit of work for the executor.
///
/// ```rust
/// use tunnel_broker::prelude::*;
///
/// let req = QueryRequest::commit("INSERT INTO t(id) VALUES (%s)")
///     .params([RowValues::Int(5)])
///     .label("w1");
/// assert_eq!(req.mode, OperationMode::Commit);
/// ```
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub label: Option<String>,
    pub query: String,
    pub params: Vec<RowValues>,
    pub mode: OperationMode,
    pub translation: TranslationMode,
}

impl QueryRequest {
    #[must_use]
    pub fn new(query: impl Into<String>, mode: OperationMode) -> Self {
        Self {
            label: None,
            query: query.into(),
            params: Vec::new(),
            mode,
            translation: TranslationMode::PoolDefault,
        }
    }

    #[must_use]
    pub fn fetch(query: impl Into<String>) -> Self {
        Self::new(query, OperationMode::Fetch)
    }

    #[must_use]
    pub fn commit(query: impl Into<String>) -> Self {
        Self::new(query, OperationMode::Commit)
    }

    #[must_use]
    pub fn execute(query: impl Into<String>) -> Self {
        Self::new(query, OperationMode::Execute)
    }

    #[must_use]
    pub fn params(mut self, params: impl Into<Vec<RowValues>>) -> Self {
        self.params = params.into();
        self
    }

    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn translation(mut self, translation: TranslationMode) -> Self {
        self.translation = translation;
        self
    }
}

/// Result of one executor call.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    /// Rows from a fetch, in statement order.
    Rows(ResultSet),
    /// Affected rows from a commit or execute.
    RowCount(usize),
    /// The call failed; the cause was logged with the caller's label.
    NoResult,
}

impl QueryOutcome {
    #[must_use]
    pub fn is_no_result(&self) -> bool {
        matches!(self, QueryOutcome::NoResult)
    }

    #[must_use]
    pub fn rows(&self) -> Option<&ResultSet> {
        match self {
            QueryOutcome::Rows(rs) => Some(rs),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_rows(self) -> Option<ResultSet> {
        match self {
            QueryOutcome::Rows(rs) => Some(rs),
            _ => None,
        }
    }

    #[must_use]
    pub fn row_count(&self) -> Option<usize> {
        match self {
            QueryOutcome::RowCount(n) => Some(*n),
            _ => None,
        }
    }
}

/// Runs parameterized statements on pooled connections.
///
/// Every call takes one connection through `ConnectionPool::with_connection`, so the
/// pool's checked-out count is the same before and after a call, whatever happened.
#[derive(Clone, Debug)]
pub struct QueryExecutor {
    pool: ConnectionPool,
    translate_placeholders: bool,
}

impl QueryExecutor {
    #[must_use]
    pub fn new(pool: ConnectionPool, translate_placeholders: bool) -> Self {
        Self {
            pool,
            translate_placeholders,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Run `request`, containing every failure as `QueryOutcome::NoResult`.
    pub async fn execute(&self, request: QueryRequest) -> QueryOutcome {
        let label = request.label.clone();
        let mode = request.mode;
        match self.try_execute(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    worker = worker(label.as_deref()),
                    %mode,
                    "SQL error when executing query: {e}"
                );
                QueryOutcome::NoResult
            }
        }
    }

    /// String-moded entry point; unknown mode names are logged and yield `NoResult`.
    pub async fn execute_named(
        &self,
        label: Option<&str>,
        query: &str,
        params: &[RowValues],
        mode_name: &str,
    ) -> QueryOutcome {
        let Some(mode) = OperationMode::parse(mode_name) else {
            tracing::error!(worker = worker(label), "Unknown operation type: {mode_name}");
            return QueryOutcome::NoResult;
        };
        let mut request = QueryRequest::new(query, mode).params(params);
        request.label = label.map(str::to_string);
        self.execute(request).await
    }

    /// Run `request` and hand back the raw error instead of logging it.
    ///
    /// Commit-mode failures are still rolled back before the error is returned.
    ///
    /// # Errors
    /// Checkout errors, driver errors (`BrokerError::Query`) and row conversion errors.
    pub async fn try_execute(&self, request: QueryRequest) -> Result<QueryOutcome, BrokerError> {
        let QueryRequest {
            label,
            query,
            params,
            mode,
            translation,
        } = request;
        let sql = translate_placeholders(&query, translation.resolve(self.translate_placeholders))
            .into_owned();
        let tx_label = label.clone();

        self.pool
            .with_connection(label.as_deref(), move |conn| {
                Box::pin(async move {
                    match mode {
                        OperationMode::Fetch => {
                            fetch(conn, &sql, &params).await.map(QueryOutcome::Rows)
                        }
                        OperationMode::Commit => {
                            commit(conn, &sql, &params, tx_label.as_deref())
                                .await
                                .map(QueryOutcome::RowCount)
                        }
                        OperationMode::Execute => {
                            execute(conn, &sql, &params).await.map(QueryOutcome::RowCount)
                        }
                    }
                })
            })
            .await
    }
}

async fn fetch(
    conn: &mut PooledConnection,
    sql: &str,
    params: &[RowValues],
) -> Result<ResultSet, BrokerError> {
    let stmt = conn.prepare(sql).await?;
    let converted = Params::convert(params);
    let rows = conn.query(&stmt, converted.as_refs()).await?;
    build_result_set_from_statement(&stmt, &rows)
}

async fn execute(
    conn: &mut PooledConnection,
    sql: &str,
    params: &[RowValues],
) -> Result<usize, BrokerError> {
    let stmt = conn.prepare(sql).await?;
    let converted = Params::convert(params);
    let rows = conn.execute(&stmt, converted.as_refs()).await?;
    usize::try_from(rows)
        .map_err(|e| BrokerError::Execution(format!("Invalid rows affected count: {e}")))
}

async fn commit(
    conn: &mut PooledConnection,
    sql: &str,
    params: &[RowValues],
    label: Option<&str>,
) -> Result<usize, BrokerError> {
    let tx = begin_transaction(conn.object_mut()).await?;
    let attempt = async {
        let stmt = tx.prepare(sql).await?;
        tx.execute_prepared(&stmt, params).await
    }
    .await;

    match attempt {
        Ok(rows) => {
            // A failed COMMIT leaves nothing behind: the server aborts the transaction.
            if let Err(e) = tx.commit().await {
                tracing::debug!(
                    worker = worker(label),
                    "Commit failed; transaction rolled back by the server."
                );
                return Err(e);
            }
            Ok(rows)
        }
        Err(e) => {
            match tx.rollback().await {
                Ok(()) => {
                    tracing::debug!(
                        worker = worker(label),
                        "Transaction rolled back due to error."
                    );
                }
                Err(rollback_err) => {
                    tracing::warn!(
                        worker = worker(label),
                        "Rollback after failed statement also failed: {rollback_err}"
                    );
                }
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_defaults() {
        let req = QueryRequest::fetch("SELECT 1 AS x");
        assert_eq!(req.mode, OperationMode::Fetch);
        assert!(req.params.is_empty());
        assert!(req.label.is_none());
        assert_eq!(req.translation, TranslationMode::PoolDefault);

        let req = QueryRequest::execute("DELETE FROM t WHERE id = %s")
            .params(vec![RowValues::Int(3)])
            .label("w2")
            .translation(TranslationMode::ForceOff);
        assert_eq!(req.params, vec![RowValues::Int(3)]);
        assert_eq!(req.label.as_deref(), Some("w2"));
    }

    #[test]
    fn outcome_accessors() {
        assert!(QueryOutcome::NoResult.is_no_result());
        assert_eq!(QueryOutcome::RowCount(3).row_count(), Some(3));
        assert!(QueryOutcome::RowCount(3).rows().is_none());
        assert!(QueryOutcome::Rows(ResultSet::default()).into_rows().is_some());
    }
}
