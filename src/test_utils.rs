//! Scriptable in-memory driver for exercising the pool and transaction
//! layers without a database server.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ConnectionConfig;
use crate::connector::driver::CR_SERVER_GONE_ERROR;
use crate::connector::{Driver, DriverError, Prepared, Session};
use crate::results::ResultSet;
use crate::types::RowValues;

/// Something a mock session was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    Connect(u64),
    Close(u64),
    Begin(u64),
    Commit(u64),
    Rollback(u64),
    Execute {
        session: u64,
        sql: String,
        params: Vec<RowValues>,
    },
}

#[derive(Debug, Default)]
struct Script {
    connect_error: Option<DriverError>,
    begin_error: Option<DriverError>,
    commit_error: Option<DriverError>,
    lose_connection_once: bool,
    statement_errors: Vec<(String, DriverError)>,
    rows: Vec<(String, Vec<String>, Vec<Vec<RowValues>>)>,
    delay: Duration,
}

#[derive(Debug, Default)]
struct MockState {
    script: Script,
    events: Vec<MockEvent>,
    next_session: u64,
    next_insert_id: i64,
}

/// Driver whose sessions record every call and fail on demand.
///
/// Clones share state, so a test keeps one handle while the pool owns another.
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every connect fails with `code` until [`MockDriver::allow_connect`].
    pub fn fail_connect(&self, code: i32) {
        self.lock().script.connect_error = Some(DriverError::new(code, "connect refused"));
    }

    pub fn allow_connect(&self) {
        self.lock().script.connect_error = None;
    }

    pub fn fail_begin(&self, code: i32) {
        self.lock().script.begin_error = Some(DriverError::new(code, "begin failed"));
    }

    pub fn fail_commit(&self, code: i32) {
        self.lock().script.commit_error = Some(DriverError::new(code, "commit failed"));
    }

    /// The next statement fails with a connection-lost error.
    pub fn lose_connection_once(&self) {
        self.lock().script.lose_connection_once = true;
    }

    /// Statements containing `pattern` fail with `code`.
    pub fn fail_statements(&self, pattern: &str, code: i32, message: &str) {
        self.lock()
            .script
            .statement_errors
            .push((pattern.to_owned(), DriverError::new(code, message)));
    }

    /// Statements containing `pattern` return these rows.
    pub fn return_rows(&self, pattern: &str, columns: &[&str], rows: Vec<Vec<RowValues>>) {
        self.lock().script.rows.push((
            pattern.to_owned(),
            columns.iter().map(|c| (*c).to_owned()).collect(),
            rows,
        ));
    }

    /// Every statement takes this long.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().script.delay = delay;
    }

    #[must_use]
    pub fn events(&self) -> Vec<MockEvent> {
        self.lock().events.clone()
    }

    fn count(&self, pred: impl Fn(&MockEvent) -> bool) -> usize {
        self.lock().events.iter().filter(|e| pred(e)).count()
    }

    #[must_use]
    pub fn connects(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Connect(_)))
    }

    #[must_use]
    pub fn closes(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Close(_)))
    }

    #[must_use]
    pub fn begins(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Begin(_)))
    }

    #[must_use]
    pub fn commits(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Commit(_)))
    }

    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Rollback(_)))
    }

    /// SQL of every executed statement, in order.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                MockEvent::Execute { sql, .. } => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Driver for MockDriver {
    fn open(&self, _config: &ConnectionConfig) -> Box<dyn Session> {
        let id = {
            let mut state = self.lock();
            state.next_session += 1;
            state.next_session
        };
        Box::new(MockSession {
            id,
            connected: false,
            driver: self.clone(),
        })
    }
}

struct MockSession {
    id: u64,
    connected: bool,
    driver: MockDriver,
}

impl MockSession {
    fn control(&mut self, event: MockEvent, error: Option<DriverError>) -> Result<(), DriverError> {
        if !self.connected {
            return Err(DriverError::new(CR_SERVER_GONE_ERROR, "not connected"));
        }
        self.driver.lock().events.push(event);
        error.map_or(Ok(()), Err)
    }

    async fn run(&mut self, sql: &str, params: &[RowValues]) -> Result<ResultSet, DriverError> {
        if !self.connected {
            return Err(DriverError::new(CR_SERVER_GONE_ERROR, "not connected"));
        }
        let delay = self.driver.lock().script.delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.driver.lock();
        state.events.push(MockEvent::Execute {
            session: self.id,
            sql: sql.to_owned(),
            params: params.to_vec(),
        });
        if std::mem::take(&mut state.script.lose_connection_once) {
            drop(state);
            self.connected = false;
            return Err(DriverError::new(CR_SERVER_GONE_ERROR, "server has gone away"));
        }
        if let Some((_, err)) = state
            .script
            .statement_errors
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
        {
            return Err(err.clone());
        }
        if let Some((_, columns, rows)) = state
            .script
            .rows
            .iter()
            .find(|(pattern, _, _)| sql.contains(pattern.as_str()))
        {
            let mut rs = ResultSet::with_capacity(rows.len());
            rs.set_column_names(Arc::new(columns.clone()));
            for row in rows {
                rs.add_row_values(row.clone());
            }
            return Ok(rs);
        }

        let insert_id = if sql.trim_start().to_ascii_lowercase().starts_with("insert") {
            state.next_insert_id += 1;
            state.next_insert_id
        } else {
            0
        };
        Ok(ResultSet::affected(1, insert_id))
    }
}

#[async_trait]
impl Session for MockSession {
    async fn connect(&mut self) -> Result<(), DriverError> {
        let mut state = self.driver.lock();
        if let Some(err) = &state.script.connect_error {
            return Err(err.clone());
        }
        state.events.push(MockEvent::Connect(self.id));
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) {
        if self.connected {
            self.connected = false;
            self.driver.lock().events.push(MockEvent::Close(self.id));
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn query(&mut self, sql: &str, _timeout: Duration) -> Result<ResultSet, DriverError> {
        self.run(sql, &[]).await
    }

    async fn prepare(&mut self, sql: &str, _timeout: Duration) -> Result<Prepared, DriverError> {
        if !self.connected {
            return Err(DriverError::new(CR_SERVER_GONE_ERROR, "not connected"));
        }
        Ok(Prepared::new(sql))
    }

    async fn execute(
        &mut self,
        statement: &Prepared,
        params: &[RowValues],
        _timeout: Duration,
    ) -> Result<ResultSet, DriverError> {
        self.run(statement.sql(), params).await
    }

    async fn begin(&mut self) -> Result<(), DriverError> {
        let err = self.driver.lock().script.begin_error.clone();
        self.control(MockEvent::Begin(self.id), err)
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        let err = self.driver.lock().script.commit_error.clone();
        self.control(MockEvent::Commit(self.id), err)
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.control(MockEvent::Rollback(self.id), None)
    }
}
