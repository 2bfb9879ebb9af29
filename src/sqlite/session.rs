use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::Connection;
use tracing::debug;

use crate::connector::driver::CR_SERVER_GONE_ERROR;
use crate::connector::{DriverError, Prepared, Session};
use crate::results::ResultSet;
use crate::types::RowValues;

use super::params::Params;
use super::query::run_statement;

/// `SQLITE_ERROR`, used when rusqlite fails without an engine code.
const SQLITE_ERROR: i32 = 1;

pub(crate) fn driver_error(err: &rusqlite::Error) -> DriverError {
    let code = match err {
        rusqlite::Error::SqliteFailure(failure, _) => failure.extended_code,
        _ => SQLITE_ERROR,
    };
    DriverError::new(code, err.to_string())
}

/// A session on one `SQLite` database file.
///
/// rusqlite calls block, so each one runs on tokio's blocking pool against
/// the shared connection handle.
pub struct SqliteSession {
    path: String,
    control_timeout: Duration,
    conn: Option<Arc<Mutex<Connection>>>,
}

impl SqliteSession {
    pub(crate) fn new(path: String, control_timeout: Duration) -> Self {
        Self {
            path,
            control_timeout,
            conn: None,
        }
    }

    async fn run<T, F>(&self, timeout: Duration, f: F) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let Some(conn) = &self.conn else {
            return Err(DriverError::new(CR_SERVER_GONE_ERROR, "sqlite session is closed"));
        };
        let conn = Arc::clone(conn);
        let task = tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&*guard)
        });
        match tokio::time::timeout(timeout, task).await {
            Err(_) => Err(DriverError::timeout(timeout)),
            Ok(Err(join_err)) => Err(DriverError::new(
                SQLITE_ERROR,
                format!("sqlite worker failed: {join_err}"),
            )),
            Ok(Ok(result)) => result.map_err(|err| driver_error(&err)),
        }
    }
}

#[async_trait]
impl Session for SqliteSession {
    async fn connect(&mut self) -> Result<(), DriverError> {
        let path = self.path.clone();
        let busy_timeout = self.control_timeout;
        let opened = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.busy_timeout(busy_timeout)?;
            Ok::<_, rusqlite::Error>(conn)
        });
        let conn = match tokio::time::timeout(self.control_timeout, opened).await {
            Err(_) => return Err(DriverError::timeout(self.control_timeout)),
            Ok(Err(join_err)) => {
                return Err(DriverError::new(
                    SQLITE_ERROR,
                    format!("sqlite open failed: {join_err}"),
                ));
            }
            Ok(Ok(result)) => result.map_err(|err| driver_error(&err))?,
        };
        debug!(path = %self.path, "sqlite session opened");
        self.conn = Some(Arc::new(Mutex::new(conn)));
        Ok(())
    }

    async fn close(&mut self) {
        if self.conn.take().is_some() {
            debug!(path = %self.path, "sqlite session closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    async fn query(&mut self, sql: &str, timeout: Duration) -> Result<ResultSet, DriverError> {
        let sql = sql.to_owned();
        self.run(timeout, move |conn| run_statement(conn, &sql, &[]))
            .await
    }

    async fn prepare(&mut self, sql: &str, timeout: Duration) -> Result<Prepared, DriverError> {
        let prepared = Prepared::new(sql);
        let sql = sql.to_owned();
        self.run(timeout, move |conn| conn.prepare_cached(&sql).map(|_| ()))
            .await?;
        Ok(prepared)
    }

    async fn execute(
        &mut self,
        statement: &Prepared,
        params: &[RowValues],
        timeout: Duration,
    ) -> Result<ResultSet, DriverError> {
        let sql = statement.sql().to_owned();
        let params = Params::convert(params);
        self.run(timeout, move |conn| run_statement(conn, &sql, params.as_values()))
            .await
    }

    async fn begin(&mut self) -> Result<(), DriverError> {
        self.run(self.control_timeout, |conn| conn.execute_batch("BEGIN"))
            .await
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.run(self.control_timeout, |conn| conn.execute_batch("COMMIT"))
            .await
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.run(self.control_timeout, |conn| conn.execute_batch("ROLLBACK"))
            .await
    }
}
