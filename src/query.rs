use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SqlTaskpoolError;
use crate::query_builder::{Arg, Builder, CompiledStatement, Expression, bind_named};
use crate::results::{CustomDbRow, ResultSet};
use crate::transaction::{ExecutedStatement, ExecutionInfo, TransactionManager};
use crate::types::{Role, RowValues};

const DEFAULT_PAGE_SIZE: u64 = 20;

/// One page of rows plus the total number of matching rows.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub total: i64,
    pub data: Vec<CustomDbRow>,
}

/// Builder statements run through the task's transaction.
///
/// Every method runs on the calling task's transaction, or in an implicit
/// one when none is open. A statement that leaves a non-zero error code
/// fails with [`SqlTaskpoolError::Statement`].
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use sql_taskpool::prelude::*;
///
/// # async fn demo(tx: Arc<TransactionManager>) -> Result<(), SqlTaskpoolError> {
/// let query = Query::new(tx);
/// task_scope(async {
///     query.begin(Role::Write).await?;
///     query
///         .execute(&Builder::new().insert("users").values([("name", "ada")]))
///         .await?;
///     let id = query.last_insert_id()?;
///     query.commit().await?;
///
///     let user = query
///         .one(&Builder::new().select("*").from("users").and_where(Condition::fields([("id", id)])))
///         .await?;
///     # let _ = user;
///     Ok::<_, SqlTaskpoolError>(())
/// })
/// .await
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Query {
    tx: Arc<TransactionManager>,
}

impl Query {
    #[must_use]
    pub fn new(tx: Arc<TransactionManager>) -> Self {
        Self { tx }
    }

    #[must_use]
    pub fn transaction(&self) -> &Arc<TransactionManager> {
        &self.tx
    }

    /// # Errors
    /// See [`TransactionManager::begin`].
    pub async fn begin(&self, role: Role) -> Result<(), SqlTaskpoolError> {
        self.tx.begin(role, false).await
    }

    /// # Errors
    /// See [`TransactionManager::commit`].
    pub async fn commit(&self) -> Result<(), SqlTaskpoolError> {
        self.tx.commit(false).await
    }

    /// # Errors
    /// See [`TransactionManager::rollback`].
    pub async fn rollback(&self) -> Result<(), SqlTaskpoolError> {
        self.tx.rollback().await
    }

    /// Pin the role of the task's next transaction (explicit or implicit).
    ///
    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn set_model(&self, role: Role) -> Result<Role, SqlTaskpoolError> {
        self.tx.model(Some(role))
    }

    /// All rows of a select.
    ///
    /// # Errors
    /// Compile, pool and statement errors.
    pub async fn list(&self, builder: &Builder) -> Result<Vec<CustomDbRow>, SqlTaskpoolError> {
        Ok(self.run(builder.compile()?).await?.results)
    }

    /// The first row, with the limit forced to 1.
    ///
    /// # Errors
    /// Compile, pool and statement errors.
    pub async fn one(&self, builder: &Builder) -> Result<Option<CustomDbRow>, SqlTaskpoolError> {
        let stmt = builder.clone().limit(1, 0).compile()?;
        Ok(self.run(stmt).await?.results.into_iter().next())
    }

    /// The first column of the first row.
    ///
    /// # Errors
    /// Compile, pool and statement errors.
    pub async fn column(&self, builder: &Builder) -> Result<Option<RowValues>, SqlTaskpoolError> {
        let rows = self.run(builder.compile()?).await?.results;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.rows.into_iter().next()))
    }

    /// Count the matching rows, then fetch one page of them.
    ///
    /// The page is the builder's limit, or the first 20 rows without one.
    /// When the count is zero the second query is skipped.
    ///
    /// # Errors
    /// Compile, pool and statement errors.
    pub async fn page(&self, builder: &Builder) -> Result<Page, SqlTaskpoolError> {
        let (count, offset) = match builder.limit_value() {
            Some((0, offset)) => (DEFAULT_PAGE_SIZE, offset),
            Some(limit) => limit,
            None => (DEFAULT_PAGE_SIZE, 0),
        };

        let counting = builder
            .clone()
            .fields_expr(&Expression::new("count(*) as cnt"))
            .reset_clause("limit")
            .compile()?;
        let counted = self.run(counting).await?;
        let total = counted
            .first()
            .and_then(|row| row.get("cnt").or_else(|| row.get_by_index(0)))
            .and_then(RowValues::as_int)
            .copied()
            .unwrap_or(0);
        if total == 0 {
            return Ok(Page::default());
        }

        let data = self.list(&builder.clone().limit(count, offset)).await?;
        Ok(Page { total, data })
    }

    /// Run an update / insert / replace / delete (or any builder statement)
    /// and return the driver's result, with affected rows and insert id.
    ///
    /// # Errors
    /// Compile, pool and statement errors.
    pub async fn execute(&self, builder: &Builder) -> Result<ResultSet, SqlTaskpoolError> {
        self.run(builder.compile()?).await
    }

    /// Run hand-written SQL with `:name` placeholders.
    ///
    /// ```rust,no_run
    /// # use sql_taskpool::prelude::*;
    /// # async fn demo(query: &Query) -> Result<(), SqlTaskpoolError> {
    /// query
    ///     .execute_raw(
    ///         "update users set hits = :hits where id = :id",
    ///         [("hits", Arg::from(Expression::new("hits + 1"))), ("id", Arg::from(7))],
    ///     )
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    /// [`SqlTaskpoolError::BuilderMisuse`] when placeholders and params differ,
    /// otherwise pool and statement errors.
    pub async fn execute_raw<I, K, V>(&self, sql: &str, params: I) -> Result<ResultSet, SqlTaskpoolError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Arg>,
    {
        let params: HashMap<String, Arg> = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let stmt = if params.is_empty() {
            CompiledStatement {
                sql: sql.to_owned(),
                params: Vec::new(),
            }
        } else {
            let (sql, params) = bind_named(sql, &params)?;
            CompiledStatement { sql, params }
        };
        self.run(stmt).await
    }

    async fn run(&self, stmt: CompiledStatement) -> Result<ResultSet, SqlTaskpoolError> {
        let result = self.tx.command(&stmt.sql, &stmt.params).await?;
        let info = self.tx.last_exec_info()?;
        if info.error_code != 0 {
            return Err(SqlTaskpoolError::Statement {
                code: info.error_code,
                message: info.error,
            });
        }
        Ok(result)
    }

    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn last_insert_id(&self) -> Result<i64, SqlTaskpoolError> {
        self.tx.last_insert_id()
    }

    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn affected_rows(&self) -> Result<usize, SqlTaskpoolError> {
        self.tx.affected_rows()
    }

    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn last_error(&self) -> Result<String, SqlTaskpoolError> {
        self.tx.last_error()
    }

    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn last_error_code(&self) -> Result<i32, SqlTaskpoolError> {
        self.tx.last_error_code()
    }

    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn last_exec_info(&self) -> Result<ExecutionInfo, SqlTaskpoolError> {
        self.tx.last_exec_info()
    }

    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn executed_statements(&self) -> Result<Vec<ExecutedStatement>, SqlTaskpoolError> {
        self.tx.executed_statements()
    }
}
