//! Convenient imports for common functionality.

pub use crate::config::{ConnectionConfig, DatabaseConfig, PoolOptions};
pub use crate::connector::{Connector, ConnectorBuilder, Driver, DriverError, Prepared, Session};
pub use crate::context::{ExecutionContext, TaskId, current_task, defer, spawn, task_scope};
pub use crate::error::SqlTaskpoolError;
pub use crate::pool::{Pool, PoolCounts, PoolStatus};
pub use crate::query::{Page, Query};
pub use crate::query_builder::{
    Arg, Builder, CompiledStatement, Condition, Expression, JoinKind, StatementKind, sanitize,
};
pub use crate::registry::Registry;
pub use crate::results::{CustomDbRow, ResultSet};
pub use crate::transaction::{ExecutedStatement, ExecutionInfo, TransactionManager, infer_role};
pub use crate::types::{Role, RowValues};

#[cfg(feature = "sqlite")]
pub use crate::sqlite::SqliteDriver;
