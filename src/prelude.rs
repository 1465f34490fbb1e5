//! Convenient imports for common functionality.
//!
//! Brings the broker, the executor types and the value types into scope with
//! one `use tunnel_broker::prelude::*;`.

pub use crate::broker::{Broker, BrokerStatus};
pub use crate::config::{BrokerConfig, PoolSettings};
pub use crate::error::BrokerError;
pub use crate::executor::{QueryExecutor, QueryOutcome, QueryRequest};
pub use crate::pool::{ConnectionFuture, ConnectionPool, PooledConnection};
pub use crate::results::{CustomDbRow, ResultSet};
pub use crate::translation::TranslationMode;
pub use crate::types::{OperationMode, RowValues};
