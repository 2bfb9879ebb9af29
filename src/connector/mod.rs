mod builder;
pub mod driver;

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::results::ResultSet;
use crate::types::RowValues;

pub use builder::{BuilderKey, ConnectorBuilder};
pub use driver::{Driver, DriverError, Prepared, Session};

/// One physical session plus its usage statistics and last execution state.
///
/// Failed calls do not raise: the error is returned and also kept on the
/// connector so it can be inspected through [`Connector::last_error_code`]
/// after the fact. Every call overwrites the previous outcome.
pub struct Connector {
    session: Box<dyn Session>,
    exec_count: u64,
    last_exec_at: Option<Instant>,
    last_executed: Option<DateTime<Utc>>,
    last_latency: Duration,
    peak_latency: Duration,
    last_error: Option<DriverError>,
    insert_id: i64,
    affected_rows: usize,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("connected", &self.session.is_connected())
            .field("exec_count", &self.exec_count)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl Connector {
    #[must_use]
    pub fn new(session: Box<dyn Session>) -> Self {
        Self {
            session,
            exec_count: 0,
            last_exec_at: None,
            last_executed: None,
            last_latency: Duration::ZERO,
            peak_latency: Duration::ZERO,
            last_error: None,
            insert_id: 0,
            affected_rows: 0,
        }
    }

    /// Open the session. A connected session is left as is.
    ///
    /// # Errors
    /// Returns the driver's error when the session cannot be opened.
    pub async fn connect(&mut self) -> Result<(), DriverError> {
        if self.session.is_connected() {
            return Ok(());
        }
        let result = self.session.connect().await;
        self.record_unit(&result);
        result
    }

    /// Close the session and reset usage statistics.
    pub async fn close(&mut self) {
        self.session.close().await;
        self.exec_count = 0;
        self.last_exec_at = None;
        self.last_executed = None;
        self.last_latency = Duration::ZERO;
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Execute one statement.
    ///
    /// Statements with parameters always go through prepare + execute. A
    /// connection-loss failure triggers exactly one reconnect and one retry.
    ///
    /// # Errors
    /// Returns the driver's error for any other failure, after recording it.
    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[RowValues],
        timeout: Duration,
    ) -> Result<ResultSet, DriverError> {
        self.exec_count += 1;
        let started = Instant::now();
        self.last_exec_at = Some(started);
        self.last_executed = Some(Utc::now());

        let mut result = self.run_once(sql, params, timeout).await;
        if let Err(err) = &result
            && self.reconnect_after(err).await
        {
            result = self.run_once(sql, params, timeout).await;
        }

        self.last_latency = started.elapsed();
        self.peak_latency = self.peak_latency.max(self.last_latency);

        match &result {
            Ok(rs) => {
                self.last_error = None;
                self.affected_rows = rs.rows_affected;
                self.insert_id = rs.last_insert_id;
            }
            Err(err) => {
                self.last_error = Some(err.clone());
                self.affected_rows = 0;
            }
        }
        result
    }

    async fn run_once(
        &mut self,
        sql: &str,
        params: &[RowValues],
        timeout: Duration,
    ) -> Result<ResultSet, DriverError> {
        if params.is_empty() {
            return self.session.query(sql, timeout).await;
        }
        let statement = self.session.prepare(sql, timeout).await?;
        self.session.execute(&statement, params, timeout).await
    }

    async fn reconnect_after(&mut self, err: &DriverError) -> bool {
        if !err.is_connection_lost() {
            return false;
        }
        warn!(code = err.code, message = %err.message, "connection lost, reconnecting once");
        match self.session.connect().await {
            Ok(()) => {
                debug!("reconnected");
                true
            }
            Err(reconnect_err) => {
                warn!(code = reconnect_err.code, "reconnect failed");
                false
            }
        }
    }

    /// # Errors
    /// Returns the driver's error if `BEGIN` fails.
    pub async fn begin(&mut self) -> Result<(), DriverError> {
        let result = self.session.begin().await;
        self.record_unit(&result);
        result
    }

    /// # Errors
    /// Returns the driver's error if `COMMIT` fails.
    pub async fn commit(&mut self) -> Result<(), DriverError> {
        let result = self.session.commit().await;
        self.record_unit(&result);
        result
    }

    /// # Errors
    /// Returns the driver's error if `ROLLBACK` fails.
    pub async fn rollback(&mut self) -> Result<(), DriverError> {
        let result = self.session.rollback().await;
        self.record_unit(&result);
        result
    }

    fn record_unit(&mut self, result: &Result<(), DriverError>) {
        self.last_error = result.as_ref().err().cloned();
    }

    #[must_use]
    pub fn affected_rows(&self) -> usize {
        self.affected_rows
    }

    #[must_use]
    pub fn insert_id(&self) -> i64 {
        self.insert_id
    }

    /// `0` when the last call succeeded.
    #[must_use]
    pub fn last_error_code(&self) -> i32 {
        self.last_error.as_ref().map_or(0, |e| e.code)
    }

    #[must_use]
    pub fn last_error(&self) -> &str {
        self.last_error.as_ref().map_or("", |e| e.message.as_str())
    }

    /// Statements run since the session was opened.
    #[must_use]
    pub fn exec_count(&self) -> u64 {
        self.exec_count
    }

    /// Round-trip time of the most recent statement.
    #[must_use]
    pub fn last_latency(&self) -> Duration {
        self.last_latency
    }

    #[must_use]
    pub fn peak_latency(&self) -> Duration {
        self.peak_latency
    }

    #[must_use]
    pub fn last_exec_at(&self) -> Option<Instant> {
        self.last_exec_at
    }

    /// Wall-clock time of the most recent statement.
    #[must_use]
    pub fn last_executed(&self) -> Option<DateTime<Utc>> {
        self.last_executed
    }
}
