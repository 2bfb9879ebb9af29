// SQLite backend for the connector layer.
//
// - params: RowValues -> rusqlite values
// - query: statement execution and result extraction
// - session: the Session implementation over one database file

pub mod params;
pub mod query;
mod session;

use std::path::Path;

use crate::config::ConnectionConfig;
use crate::connector::{Driver, Session};
use crate::error::SqlTaskpoolError;

pub use query::build_result_set;
pub use session::SqliteSession;

/// Opens [`SqliteSession`]s. `ConnectionConfig::database` is the database
/// file path (or `:memory:`); `connect_timeout` bounds opening the file and
/// `BEGIN`/`COMMIT`/`ROLLBACK`, and is also the busy timeout.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use sql_taskpool::prelude::*;
///
/// # fn demo() -> Result<(), SqlTaskpoolError> {
/// let registry = Registry::new();
/// let write = ConnectionConfig::new("localhost", "", "", "/tmp/app.db");
/// let builder = registry.builder(Arc::new(SqliteDriver), write, vec![]);
/// let pool = registry.pool(&builder, PoolOptions::default().with_size(4))?;
/// let query = Query::new(Arc::new(TransactionManager::new(pool)));
/// # let _ = query;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

impl SqliteDriver {
    /// Run a setup script (schema, seed data) directly against a database file.
    ///
    /// # Errors
    /// Returns [`SqlTaskpoolError::SqliteError`] if the file cannot be opened or
    /// the script fails.
    pub async fn bootstrap(path: impl AsRef<Path>, script: &str) -> Result<(), SqlTaskpoolError> {
        let path = path.as_ref().to_path_buf();
        let script = script.to_owned();
        tokio::task::spawn_blocking(move || -> Result<(), SqlTaskpoolError> {
            let conn = rusqlite::Connection::open(&path)?;
            conn.execute_batch(&script)?;
            Ok(())
        })
        .await
        .map_err(|e| SqlTaskpoolError::ExecutionError(format!("sqlite bootstrap task failed: {e}")))?
    }
}

impl Driver for SqliteDriver {
    fn open(&self, config: &ConnectionConfig) -> Box<dyn Session> {
        Box::new(SqliteSession::new(
            config.database.clone(),
            config.connect_timeout,
        ))
    }
}
