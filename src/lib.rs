//! Task-scoped SQL transactions over a read/write connector pool.
//!
//! - [`pool::Pool`] hands out connectors per [`types::Role`], bounded by a
//!   live ceiling and a timed wait.
//! - [`transaction::TransactionManager`] keeps one transaction per task in an
//!   [`context::ExecutionContext`]; a task that ends (or is aborted) with a
//!   transaction open gets it rolled back and its connector returned.
//! - [`query_builder::Builder`] compiles select / update / insert / replace /
//!   delete statements with positional parameters.
//! - [`query::Query`] runs builder statements through the task's transaction.
//!
//! Statements always run inside a [`context::task_scope`] (or a task started
//! with [`context::spawn`]).

pub mod config;
pub mod connector;
pub mod context;
pub mod error;
pub mod pool;
pub mod prelude;
pub mod query;
pub mod query_builder;
pub mod registry;
pub mod results;
pub mod transaction;
pub mod types;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::SqlTaskpoolError;
pub use results::{CustomDbRow, ResultSet};
pub use types::{Role, RowValues};
