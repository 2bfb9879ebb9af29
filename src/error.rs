use thiserror::Error;

use crate::connector::DriverError;
use crate::types::Role;

#[derive(Debug, Error)]
pub enum SqlTaskpoolError {
    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A new session could not be opened.
    #[error("Connection error ({code}): {message}")]
    Connection { code: i32, message: String },

    /// Bounded wait for an idle connector expired. Retryable.
    #[error("Timed out waiting for a {0} connector")]
    PoolExhaustedTimeout(Role),

    /// Too many consecutive waits expired; the database is likely down.
    #[error("Pool fatal: {0}")]
    PoolFatal(String),

    #[error("Pool is closed")]
    PoolClosed,

    /// The connector builder has nothing to build for this role (e.g. no replicas).
    #[error("No {0} connector configured")]
    NoConnector(Role),

    /// The driver rejected a statement.
    #[error("Statement error ({code}): {message}")]
    Statement { code: i32, message: String },

    /// Placeholder / parameter mismatch and similar programmer errors.
    #[error("Builder misuse: {0}")]
    BuilderMisuse(String),

    #[error("Called outside of a task scope")]
    NoTaskScope,

    #[error("SQL execution error: {0}")]
    ExecutionError(String),
}

impl SqlTaskpoolError {
    /// Whether retrying the same call later can reasonably succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhaustedTimeout(_))
    }

    /// Driver error code carried by this error, if any.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Connection { code, .. } | Self::Statement { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn statement(err: &DriverError) -> Self {
        Self::Statement {
            code: err.code,
            message: err.message.clone(),
        }
    }

    pub(crate) fn connection(err: &DriverError) -> Self {
        Self::Connection {
            code: err.code,
            message: err.message.clone(),
        }
    }
}
