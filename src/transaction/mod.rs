mod model;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::connector::driver::CR_SERVER_LOST;
use crate::connector::{Connector, DriverError};
use crate::context::{ExecutionContext, TaskId, TaskValues};
use crate::error::SqlTaskpoolError;
use crate::pool::{Pool, PooledConnector};
use crate::results::ResultSet;
use crate::types::{Role, RowValues};

pub use model::infer_role;

const RUNNING: &str = "is_running";
const IMPLICIT: &str = "is_implicit";
const MODEL: &str = "model";
const CONNECTOR: &str = "connector";
const STATEMENTS: &str = "sql";
const LAST_EXEC: &str = "last_exec_info";

/// Outcome of the last statement, snapshotted from the connector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionInfo {
    pub insert_id: i64,
    pub affected_rows: usize,
    /// `0` when the last call succeeded.
    pub error_code: i32,
    pub error: String,
}

impl ExecutionInfo {
    fn from_connector(conn: &Connector) -> Self {
        Self {
            insert_id: conn.insert_id(),
            affected_rows: conn.affected_rows(),
            error_code: conn.last_error_code(),
            error: conn.last_error().to_owned(),
        }
    }
}

/// A statement run in the current transaction, kept for introspection.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub sql: String,
    pub params: Vec<RowValues>,
}

/// Per-task transactions over a [`Pool`].
///
/// Each task (see [`crate::context::task_scope`]) has its own view of the
/// running transaction: the connector it holds, the pinned role and the
/// statement log live in an [`ExecutionContext`], so nothing has to be
/// passed between the calls that make up one transaction.
///
/// Per task the manager moves `idle -> running -> idle`. [`command`] while
/// idle wraps the statement in an implicit transaction, which holds a
/// connector for the one statement but sends no `BEGIN`/`COMMIT`.
///
/// A task that ends while running is rolled back and its connector returned
/// to the pool.
///
/// [`command`]: TransactionManager::command
#[derive(Debug)]
pub struct TransactionManager {
    pool: Arc<Pool>,
    ctx: ExecutionContext,
}

impl TransactionManager {
    #[must_use]
    pub fn new(pool: Arc<Pool>) -> Self {
        let teardown_pool = Arc::clone(&pool);
        let ctx = ExecutionContext::with_finalizer(move |task, values| {
            abandon(&teardown_pool, task, values);
        });
        Self { pool, ctx }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn is_running(&self) -> Result<bool, SqlTaskpoolError> {
        Ok(self.ctx.get::<bool>(RUNNING)?.unwrap_or(false))
    }

    /// Start a transaction on a `role` connector. Does nothing if one is running.
    ///
    /// An implicit transaction holds the connector without sending `BEGIN`.
    ///
    /// # Errors
    /// Returns the pool's error when no connector can be acquired, or
    /// [`SqlTaskpoolError::Statement`] when `BEGIN` fails. Either way the
    /// task is left idle and holds no connector.
    pub async fn begin(&self, role: Role, implicit: bool) -> Result<(), SqlTaskpoolError> {
        if self.is_running()? {
            return Ok(());
        }
        self.ctx.set(MODEL, role)?;

        let mut conn = match self.pool.acquire(role).await {
            Ok(conn) => conn,
            Err(err) => {
                self.ctx.unset(MODEL)?;
                return Err(err);
            }
        };

        self.ctx.unset(LAST_EXEC)?;
        self.ctx.set(STATEMENTS, Vec::<ExecutedStatement>::new())?;

        if !implicit && let Err(err) = conn.begin().await {
            warn!(%role, code = err.code, message = %err.message, "BEGIN failed");
            self.ctx.set(LAST_EXEC, ExecutionInfo::from_connector(&conn))?;
            self.ctx.unset(MODEL)?;
            self.pool.release(conn).await;
            return Err(SqlTaskpoolError::statement(&err));
        }

        self.ctx.set(CONNECTOR, conn)?;
        self.ctx.set(IMPLICIT, implicit)?;
        self.ctx.set(RUNNING, true)?;
        debug!(%role, implicit, "transaction started");
        Ok(())
    }

    /// Run one statement in the task's transaction.
    ///
    /// Without a running transaction the statement runs in an implicit one,
    /// on the pinned role (see [`TransactionManager::model`]) or else the
    /// role inferred from `sql`. The implicit transaction is closed whether
    /// or not the statement succeeds, and also when this future is dropped
    /// before it completes (e.g. under `tokio::time::timeout`).
    ///
    /// # Errors
    /// - [`SqlTaskpoolError::ExecutionError`] for an empty statement.
    /// - [`SqlTaskpoolError::Statement`] when the driver rejects it.
    /// - Any error of [`TransactionManager::begin`] for an implicit transaction.
    pub async fn command(
        &self,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SqlTaskpoolError> {
        if sql.trim().is_empty() {
            return Err(SqlTaskpoolError::ExecutionError("empty statement".into()));
        }

        let implicit = !self.is_running()?;
        let mut guard = ImplicitGuard {
            ctx: &self.ctx,
            armed: implicit,
        };
        if implicit {
            let role = match self.ctx.get::<Role>(MODEL)? {
                Some(pinned) => pinned,
                None => infer_role(sql),
            };
            if let Err(err) = self.begin(role, true).await {
                guard.armed = false;
                return Err(err);
            }
        }

        let result = self.exec(sql, params).await;

        if implicit {
            let closed = self.commit(true).await;
            guard.armed = false;
            closed?;
        }
        result
    }

    async fn exec(&self, sql: &str, params: &[RowValues]) -> Result<ResultSet, SqlTaskpoolError> {
        self.ctx
            .update::<Vec<ExecutedStatement>, _>(STATEMENTS, |log| {
                log.push(ExecutedStatement {
                    sql: sql.to_owned(),
                    params: params.to_vec(),
                });
            })?;

        let mut conn = self.take_connector()?;
        let result = conn
            .execute(sql, params, self.pool.options().query_timeout)
            .await;
        self.ctx.set(CONNECTOR, conn)?;

        result.map_err(|err| SqlTaskpoolError::statement(&err))
    }

    /// Commit and release the connector. Does nothing if no transaction runs.
    ///
    /// If `COMMIT` fails the transaction is rolled back instead. The connector
    /// goes back to the pool exactly once on both paths.
    ///
    /// # Errors
    /// Returns [`SqlTaskpoolError::Statement`] with the `COMMIT` failure, or
    /// with code 2013 when a cancelled statement already dropped the
    /// connector. The task is idle afterwards in every case.
    pub async fn commit(&self, implicit: bool) -> Result<(), SqlTaskpoolError> {
        if !self.is_running()? {
            return Ok(());
        }
        let Some(mut conn) = self.ctx.take::<PooledConnector>(CONNECTOR)? else {
            return self.connector_lost();
        };

        let outcome = if implicit {
            Ok(())
        } else {
            conn.commit().await
        };
        if let Err(err) = &outcome {
            warn!(code = err.code, message = %err.message, "COMMIT failed, rolling back");
            if let Err(rollback_err) = conn.rollback().await {
                warn!(code = rollback_err.code, "rollback after failed commit also failed");
            }
        }

        self.release(conn, outcome.as_ref().err()).await?;
        outcome.map_err(|err| SqlTaskpoolError::statement(&err))
    }

    /// Roll back and release the connector. Does nothing if no transaction runs.
    ///
    /// # Errors
    /// Returns [`SqlTaskpoolError::Statement`] when `ROLLBACK` fails; the
    /// connector is released regardless. A transaction whose connector was
    /// dropped by a cancelled statement is ended with code 2013.
    pub async fn rollback(&self) -> Result<(), SqlTaskpoolError> {
        if !self.is_running()? {
            return Ok(());
        }
        let Some(mut conn) = self.ctx.take::<PooledConnector>(CONNECTOR)? else {
            return self.connector_lost();
        };
        let outcome = conn.rollback().await;
        self.release(conn, outcome.as_ref().err()).await?;
        outcome.map_err(|err| SqlTaskpoolError::statement(&err))
    }

    /// Read or pin the role of the task's next transaction.
    ///
    /// The pin is only written while idle; while running the transaction's
    /// role is returned unchanged. It lasts until that transaction ends.
    ///
    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn model(&self, role: Option<Role>) -> Result<Role, SqlTaskpoolError> {
        match role {
            Some(role) if !self.is_running()? => {
                self.ctx.set(MODEL, role)?;
                Ok(role)
            }
            _ => Ok(self.ctx.get::<Role>(MODEL)?.unwrap_or_default()),
        }
    }

    /// Outcome of the task's last statement: live while a transaction runs,
    /// otherwise the snapshot taken when the last one ended.
    ///
    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn last_exec_info(&self) -> Result<ExecutionInfo, SqlTaskpoolError> {
        if let Some(live) = self
            .ctx
            .update::<PooledConnector, _>(CONNECTOR, |conn| ExecutionInfo::from_connector(conn))?
        {
            return Ok(live);
        }
        Ok(self.ctx.get::<ExecutionInfo>(LAST_EXEC)?.unwrap_or_default())
    }

    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn last_insert_id(&self) -> Result<i64, SqlTaskpoolError> {
        Ok(self.last_exec_info()?.insert_id)
    }

    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn affected_rows(&self) -> Result<usize, SqlTaskpoolError> {
        Ok(self.last_exec_info()?.affected_rows)
    }

    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn last_error(&self) -> Result<String, SqlTaskpoolError> {
        Ok(self.last_exec_info()?.error)
    }

    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn last_error_code(&self) -> Result<i32, SqlTaskpoolError> {
        Ok(self.last_exec_info()?.error_code)
    }

    /// Statements of the current (or most recent) transaction, in order.
    ///
    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn executed_statements(&self) -> Result<Vec<ExecutedStatement>, SqlTaskpoolError> {
        Ok(self
            .ctx
            .get::<Vec<ExecutedStatement>>(STATEMENTS)?
            .unwrap_or_default())
    }

    fn take_connector(&self) -> Result<PooledConnector, SqlTaskpoolError> {
        self.ctx.take::<PooledConnector>(CONNECTOR)?.ok_or_else(|| {
            SqlTaskpoolError::ExecutionError(
                "running transaction lost its connector, roll it back".into(),
            )
        })
    }

    async fn release(
        &self,
        conn: PooledConnector,
        failure: Option<&DriverError>,
    ) -> Result<(), SqlTaskpoolError> {
        let mut info = ExecutionInfo::from_connector(&conn);
        if let Some(err) = failure {
            info.error_code = err.code;
            info.error.clone_from(&err.message);
        }
        finish(&self.ctx, info)?;

        let role = conn.role();
        self.pool.release(conn).await;
        debug!(%role, "transaction resources released");
        Ok(())
    }

    /// A statement future of this transaction was dropped mid-flight and took
    /// the connector with it; the session is gone and its work discarded.
    fn connector_lost(&self) -> Result<(), SqlTaskpoolError> {
        let err = DriverError::new(CR_SERVER_LOST, "transaction lost its connector mid-statement");
        warn!(code = err.code, "ending a transaction whose connector was dropped");
        finish(
            &self.ctx,
            ExecutionInfo {
                error_code: err.code,
                error: err.message.clone(),
                ..ExecutionInfo::default()
            },
        )?;
        Err(SqlTaskpoolError::statement(&err))
    }
}

/// Return the task to idle, keeping `info` as its last execution outcome.
fn finish(ctx: &ExecutionContext, info: ExecutionInfo) -> Result<(), SqlTaskpoolError> {
    ctx.set(LAST_EXEC, info)?;
    ctx.unset(MODEL)?;
    ctx.unset(IMPLICIT)?;
    ctx.set(RUNNING, false)
}

/// Closes an implicit transaction whose `command` future was dropped.
struct ImplicitGuard<'a> {
    ctx: &'a ExecutionContext,
    armed: bool,
}

impl Drop for ImplicitGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // The connector, if one was taken, went down with the statement future.
        let _ = self.ctx.unset(CONNECTOR);
        let info = ExecutionInfo {
            error_code: CR_SERVER_LOST,
            error: "statement cancelled before completion".into(),
            ..ExecutionInfo::default()
        };
        if finish(self.ctx, info).is_ok() {
            debug!("cancelled implicit transaction reset");
        }
    }
}

/// Teardown for a task that ended while holding a connector.
fn abandon(pool: &Arc<Pool>, task: TaskId, mut values: TaskValues) {
    let Some(mut conn) = values.take::<PooledConnector>(CONNECTOR) else {
        return;
    };
    let implicit = values.take::<bool>(IMPLICIT).unwrap_or(false);
    let role = conn.role();
    warn!(%task, %role, implicit, "task ended inside a transaction, rolling back");

    // Without a runtime the connector is dropped, which still frees its pool slot.
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let pool = Arc::clone(pool);
        handle.spawn(async move {
            if !implicit && let Err(err) = conn.rollback().await {
                warn!(%role, code = err.code, "teardown rollback failed");
            }
            pool.release(conn).await;
        });
    }
}
