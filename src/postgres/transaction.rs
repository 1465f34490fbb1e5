use deadpool_postgres::{Object, Transaction as PgTransaction};
use tokio_postgres::Statement;

use crate::error::BrokerError;
use crate::types::RowValues;

use super::Params;

/// Lightweight transaction wrapper for Postgres.
pub struct Tx<'a> {
    tx: PgTransaction<'a>,
}

/// Begin a new transaction on the provided Postgres connection.
///
/// # Errors
/// Returns an error if creating the transaction fails.
pub async fn begin_transaction(conn: &mut Object) -> Result<Tx<'_>, BrokerError> {
    let tx = conn.transaction().await?;
    Ok(Tx { tx })
}

impl Tx<'_> {
    /// Prepare a SQL statement tied to this transaction.
    ///
    /// # Errors
    /// Returns an error if the prepare call fails.
    pub async fn prepare(&self, sql: &str) -> Result<Statement, BrokerError> {
        Ok(self.tx.prepare(sql).await?)
    }

    /// Execute a parameterized statement and return the affected row count.
    ///
    /// # Errors
    /// Returns an error if execution or row-count conversion fails.
    pub async fn execute_prepared(
        &self,
        stmt: &Statement,
        params: &[RowValues],
    ) -> Result<usize, BrokerError> {
        let converted = Params::convert(params);
        let rows = self.tx.execute(stmt, converted.as_refs()).await?;

        usize::try_from(rows)
            .map_err(|e| BrokerError::Execution(format!("Invalid rows affected count: {e}")))
    }

    /// Commit the transaction.
    ///
    /// # Errors
    /// Returns an error if commit fails.
    pub async fn commit(self) -> Result<(), BrokerError> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Roll back the transaction.
    ///
    /// # Errors
    /// Returns an error if rollback fails.
    pub async fn rollback(self) -> Result<(), BrokerError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
