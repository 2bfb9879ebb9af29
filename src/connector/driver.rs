//! The capability a database driver must provide to back a [`super::Connector`].
//!
//! The pool and transaction layers never talk to a wire protocol directly;
//! they go through [`Driver`] (opens sessions) and [`Session`] (one live
//! server connection).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ConnectionConfig;
use crate::results::ResultSet;
use crate::types::RowValues;

/// MySQL server has gone away.
pub const CR_SERVER_GONE_ERROR: i32 = 2006;
/// Lost connection to MySQL server during query.
pub const CR_SERVER_LOST: i32 = 2013;
/// Too many connections.
pub const ER_CON_COUNT_ERROR: i32 = 1040;
/// Client-side timeout while waiting for the server.
pub const CLIENT_TIMEOUT: i32 = -1;

/// Error reported by a driver call: the server (or client library) code and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    pub code: i32,
    pub message: String,
}

impl DriverError {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn timeout(after: Duration) -> Self {
        Self::new(CLIENT_TIMEOUT, format!("timed out after {after:?}"))
    }

    /// The session died underneath the call; one reconnect is worth trying.
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        matches!(self.code, CR_SERVER_GONE_ERROR | CR_SERVER_LOST)
    }

    #[must_use]
    pub fn is_too_many_connections(&self) -> bool {
        self.code == ER_CON_COUNT_ERROR
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) {}", self.code, self.message)
    }
}

impl std::error::Error for DriverError {}

/// Handle to a statement prepared on a [`Session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    sql: Arc<str>,
}

impl Prepared {
    #[must_use]
    pub fn new(sql: &str) -> Self {
        Self { sql: Arc::from(sql) }
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// Opens sessions for a connection config.
pub trait Driver: Send + Sync {
    /// Create an unconnected session; [`Session::connect`] performs the I/O.
    fn open(&self, config: &ConnectionConfig) -> Box<dyn Session>;
}

/// One physical connection.
#[async_trait]
pub trait Session: Send {
    async fn connect(&mut self) -> Result<(), DriverError>;

    async fn close(&mut self);

    fn is_connected(&self) -> bool;

    /// Run a statement without bound parameters.
    async fn query(&mut self, sql: &str, timeout: Duration) -> Result<ResultSet, DriverError>;

    async fn prepare(&mut self, sql: &str, timeout: Duration) -> Result<Prepared, DriverError>;

    /// Execute a prepared statement with positional parameters.
    async fn execute(
        &mut self,
        statement: &Prepared,
        params: &[RowValues],
        timeout: Duration,
    ) -> Result<ResultSet, DriverError>;

    async fn begin(&mut self) -> Result<(), DriverError>;

    async fn commit(&mut self) -> Result<(), DriverError>;

    async fn rollback(&mut self) -> Result<(), DriverError>;
}
