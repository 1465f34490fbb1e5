use std::sync::LazyLock;
use tokio::runtime::Runtime;

/// Shared tokio runtime for the blocking helpers, so tests do not each build one.
pub(crate) static SHARED_RUNTIME: LazyLock<Runtime> =
    LazyLock::new(|| Runtime::new().expect("Failed to create tokio runtime for test utilities"));

/// In-process SSH server for tunnel tests
pub mod bastion;
/// Embedded `PostgreSQL` server for tests that need a real database
pub mod embedded;

pub use bastion::*;
pub use embedded::*;
