// PostgreSQL plumbing used by the executor:
// - params: binding `RowValues` as statement parameters
// - query: turning driver rows into `ResultSet`s
// - transaction: explicit BEGIN/COMMIT/ROLLBACK around a pooled client

pub mod params;
pub mod query;
pub mod transaction;

pub use params::Params;
pub use query::build_result_set_from_statement;
pub use transaction::begin_transaction;
