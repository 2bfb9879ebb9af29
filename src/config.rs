use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SqlTaskpoolError;

/// Connection parameters for one database endpoint.
///
/// Two configs are equivalent when every field matches; [`ConnectionConfig::normalized`]
/// renders that equivalence as a field-order-independent string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    #[serde(default = "default_charset")]
    pub charset: String,
    #[serde(default = "default_connect_timeout", with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(default)]
    pub auto_connect: bool,
}

fn default_port() -> u16 {
    3306
}

fn default_charset() -> String {
    "utf8".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}

impl ConnectionConfig {
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: user.into(),
            password: password.into(),
            database: database.into(),
            charset: default_charset(),
            connect_timeout: default_connect_timeout(),
            auto_connect: false,
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Field-sorted rendering used for equivalence keys.
    #[must_use]
    pub fn normalized(&self) -> String {
        let mut fields = [
            ("auto_connect", self.auto_connect.to_string()),
            ("charset", self.charset.clone()),
            ("connect_timeout", self.connect_timeout.as_millis().to_string()),
            ("database", self.database.clone()),
            ("host", self.host.clone()),
            ("password", self.password.clone()),
            ("port", self.port.to_string()),
            ("user", self.user.clone()),
        ];
        fields.sort_by(|a, b| a.0.cmp(b.0));
        fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Sizing, recycling and backpressure knobs for [`crate::pool::Pool`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Capacity of each idle collection.
    pub size: usize,
    /// Idle connectors unused for this long are recycled.
    #[serde(with = "duration_ms")]
    pub max_idle: Duration,
    /// Connectors that ran this many statements are recycled.
    pub max_exec_count: u64,
    /// New connectors are created while `live < size * ceiling_factor`.
    pub ceiling_factor: usize,
    /// Consecutive wait timeouts tolerated before failing fast.
    pub max_wait_timeouts: u32,
    /// Pop timeout when the idle collection looked non-empty.
    #[serde(with = "duration_ms")]
    pub idle_pop_timeout: Duration,
    /// Pop timeout when waiting for a connector to be returned.
    #[serde(with = "duration_ms")]
    pub wait_timeout: Duration,
    /// Per-pop timeout while draining on close.
    #[serde(with = "duration_ms")]
    pub close_drain_timeout: Duration,
    /// Timeout handed to the driver for each statement.
    #[serde(with = "duration_ms")]
    pub query_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 25,
            max_idle: Duration::from_secs(600),
            max_exec_count: 1000,
            ceiling_factor: 6,
            max_wait_timeouts: 200,
            idle_pop_timeout: Duration::from_secs(1),
            wait_timeout: Duration::from_secs(4),
            close_drain_timeout: Duration::from_millis(5),
            query_timeout: Duration::from_secs(180),
        }
    }
}

impl PoolOptions {
    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    #[must_use]
    pub fn with_max_exec_count(mut self, max_exec_count: u64) -> Self {
        self.max_exec_count = max_exec_count;
        self
    }

    #[must_use]
    pub fn with_ceiling_factor(mut self, ceiling_factor: usize) -> Self {
        self.ceiling_factor = ceiling_factor;
        self
    }

    #[must_use]
    pub fn with_max_wait_timeouts(mut self, max_wait_timeouts: u32) -> Self {
        self.max_wait_timeouts = max_wait_timeouts;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, idle_pop: Duration, wait: Duration) -> Self {
        self.idle_pop_timeout = idle_pop;
        self.wait_timeout = wait;
        self
    }

    /// Connectors per role beyond which callers wait instead of connecting.
    #[must_use]
    pub fn ceiling(&self) -> usize {
        self.size.saturating_mul(self.ceiling_factor)
    }

    /// Reject settings the pool cannot run with.
    ///
    /// # Errors
    /// Returns [`SqlTaskpoolError::ConfigError`] for a zero size or ceiling factor.
    pub fn validate(&self) -> Result<(), SqlTaskpoolError> {
        if self.size == 0 {
            return Err(SqlTaskpoolError::ConfigError(
                "pool size must be at least 1".into(),
            ));
        }
        if self.ceiling_factor == 0 {
            return Err(SqlTaskpoolError::ConfigError(
                "ceiling factor must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Everything needed to stand up one logical database: primary, replicas, pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub write: ConnectionConfig,
    #[serde(default)]
    pub reads: Vec<ConnectionConfig>,
    #[serde(default)]
    pub pool: PoolOptions,
}

impl DatabaseConfig {
    /// Parse a JSON document such as
    /// `{"write": {"host": "db1", "user": "app", "database": "main"}, "reads": [...]}`.
    ///
    /// # Errors
    /// Returns [`SqlTaskpoolError::ConfigError`] on malformed JSON or invalid pool options.
    pub fn from_json_str(json: &str) -> Result<Self, SqlTaskpoolError> {
        let config: DatabaseConfig = serde_json::from_str(json)
            .map_err(|e| SqlTaskpoolError::ConfigError(format!("invalid database config: {e}")))?;
        config.pool.validate()?;
        Ok(config)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
