use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Missing required configuration: {}", .0.join(", "))]
    MissingConfiguration(Vec<&'static str>),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("SSH tunnel error: {0}")]
    Tunnel(String),

    #[error("No pooled connection became available within {0:?}")]
    PoolExhausted(Duration),

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error(transparent)]
    Query(#[from] tokio_postgres::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Parameter conversion error: {0}")]
    Parameter(String),

    #[error("Connection was checked out from a different pool")]
    ForeignConnection,

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("SQL execution error: {0}")]
    Execution(String),
}

impl BrokerError {
    /// True for failures that happen while building the broker and are never retried.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MissingConfiguration(_)
                | Self::InvalidConfiguration(_)
                | Self::Tunnel(_)
                | Self::Runtime(_)
        )
    }

    /// True when a checkout failed because of pool capacity or lifecycle; callers may back off.
    #[must_use]
    pub fn is_pool_unavailable(&self) -> bool {
        matches!(self, Self::PoolExhausted(_) | Self::PoolClosed)
    }
}
