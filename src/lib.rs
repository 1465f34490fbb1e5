//! Process-wide broker that reaches a PostgreSQL server through one SSH tunnel
//! and shares a bounded connection pool across worker threads.
//!
//! ```rust,no_run
//! use tunnel_broker::prelude::*;
//!
//! # fn main() -> Result<(), BrokerError> {
//! let broker = tunnel_broker::instance()?;
//! let outcome = broker.execute(
//!     Some("worker-1"),
//!     "SELECT id FROM jobs WHERE state = %s",
//!     &[RowValues::Text("queued".into())],
//!     OperationMode::Fetch,
//! );
//! if let Some(rows) = outcome.rows() {
//!     println!("{} queued", rows.len());
//! }
//! tunnel_broker::shutdown();
//! # Ok(())
//! # }
//! ```

pub mod prelude;

pub mod broker;
pub mod config;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod logging;
pub mod pool;
pub mod results;
pub mod translation;
pub mod tunnel;
pub mod types;

mod postgres;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use broker::{Broker, BrokerStatus};
pub use config::{BrokerConfig, DatabaseConfig, PoolSettings, TunnelConfig};
pub use error::BrokerError;
pub use executor::{QueryExecutor, QueryOutcome, QueryRequest};
pub use lifecycle::{ProcessSlot, current, instance, instance_with, shutdown};
pub use pool::{ConnectionFuture, ConnectionPool, DialTarget, PoolStatus, PooledConnection};
pub use results::{CustomDbRow, ResultSet};
pub use translation::{TranslationMode, translate_placeholders};
pub use tunnel::TunnelSession;
pub use types::{OperationMode, RowValues};
