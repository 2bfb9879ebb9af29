pub mod channel;
mod info;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};

use tracing::{debug, error, warn};

use crate::config::PoolOptions;
use crate::connector::ConnectorBuilder;
use crate::connector::driver::ER_CON_COUNT_ERROR;
use crate::error::SqlTaskpoolError;
use crate::types::Role;

use channel::{BoundedChannel, PopError};
use info::LiveTicket;

pub use info::{ConnectorInfo, ConnectorStatus, PooledConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Ok,
    /// Reserved for a degraded state; never entered today.
    Unavailable,
    Closed,
}

impl PoolStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => PoolStatus::Ok,
            1 => PoolStatus::Unavailable,
            _ => PoolStatus::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PoolStatus::Ok => 0,
            PoolStatus::Unavailable => 1,
            PoolStatus::Closed => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Discard {
    PoolClosed,
    Unhealthy,
    Stale,
    IdleFull,
}

/// Per-role counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub read: usize,
    pub write: usize,
}

/// Read/write connector pool with bounded creation and timed waits.
///
/// Acquisition order for a role:
/// 1. pop an idle connector (short wait), recycling any that went stale;
/// 2. otherwise connect a new one while fewer than `size * ceiling_factor` are alive;
/// 3. otherwise wait for one to be returned. Expired waits count toward
///    `max_wait_timeouts`; past that the pool fails fast with
///    [`SqlTaskpoolError::PoolFatal`] until an acquisition succeeds again.
pub struct Pool {
    builder: Arc<ConnectorBuilder>,
    options: PoolOptions,
    read_idle: BoundedChannel<PooledConnector>,
    write_idle: BoundedChannel<PooledConnector>,
    read_live: Arc<AtomicUsize>,
    write_live: Arc<AtomicUsize>,
    wait_timeouts: AtomicU32,
    status: AtomicU8,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("builder", &self.builder.key())
            .field("status", &self.status())
            .field("idle", &self.counts())
            .field("live", &self.live_counts())
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// # Errors
    /// Returns [`SqlTaskpoolError::ConfigError`] if `options` are invalid.
    pub fn new(
        builder: Arc<ConnectorBuilder>,
        options: PoolOptions,
    ) -> Result<Self, SqlTaskpoolError> {
        options.validate()?;
        Ok(Self {
            builder,
            read_idle: BoundedChannel::new(options.size),
            write_idle: BoundedChannel::new(options.size),
            options,
            read_live: Arc::new(AtomicUsize::new(0)),
            write_live: Arc::new(AtomicUsize::new(0)),
            wait_timeouts: AtomicU32::new(0),
            status: AtomicU8::new(PoolStatus::Ok.as_u8()),
        })
    }

    #[must_use]
    pub fn builder(&self) -> &Arc<ConnectorBuilder> {
        &self.builder
    }

    #[must_use]
    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        PoolStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn is_ok(&self) -> bool {
        self.status() == PoolStatus::Ok
    }

    fn idle(&self, role: Role) -> &BoundedChannel<PooledConnector> {
        match role {
            Role::Read => &self.read_idle,
            Role::Write => &self.write_idle,
        }
    }

    fn live(&self, role: Role) -> &Arc<AtomicUsize> {
        match role {
            Role::Read => &self.read_live,
            Role::Write => &self.write_live,
        }
    }

    /// Check out a connector for `role`.
    ///
    /// # Errors
    /// - [`SqlTaskpoolError::PoolClosed`] after [`Pool::close`].
    /// - [`SqlTaskpoolError::PoolExhaustedTimeout`] when the bounded wait expires.
    /// - [`SqlTaskpoolError::PoolFatal`] once too many consecutive waits expired.
    /// - [`SqlTaskpoolError::Connection`] when a new session cannot be opened.
    /// - [`SqlTaskpoolError::NoConnector`] when the builder has no config for `role`.
    pub async fn acquire(&self, role: Role) -> Result<PooledConnector, SqlTaskpoolError> {
        if !self.is_ok() {
            return Err(SqlTaskpoolError::PoolClosed);
        }

        let mut conn = match self.pop_idle(role).await? {
            Some(conn) => conn,
            None => self.create_or_wait(role).await?,
        };

        conn.info_mut().mark_busy();
        self.wait_timeouts.store(0, Ordering::Release);
        Ok(conn)
    }

    async fn pop_idle(&self, role: Role) -> Result<Option<PooledConnector>, SqlTaskpoolError> {
        let idle = self.idle(role);
        while !idle.is_empty() {
            match idle.pop(self.options.idle_pop_timeout).await {
                Ok(conn) if self.healthy(&conn) => return Ok(Some(conn)),
                Ok(conn) => self.discard(conn, Discard::Stale).await,
                Err(PopError::Closed) => return Err(SqlTaskpoolError::PoolClosed),
                // Someone else took it first.
                Err(PopError::Timeout) => break,
            }
        }
        Ok(None)
    }

    async fn create_or_wait(&self, role: Role) -> Result<PooledConnector, SqlTaskpoolError> {
        let Some(ticket) = LiveTicket::reserve(self.live(role), self.options.ceiling()) else {
            return self.wait_for_idle(role).await;
        };

        match self.create(role, ticket).await {
            Ok(conn) => Ok(conn),
            Err(err) if err.code() == Some(ER_CON_COUNT_ERROR) => {
                warn!(%role, "server refused connection (too many connections), waiting for idle connector");
                self.wait_for_idle(role).await.map_err(|wait_err| match wait_err {
                    SqlTaskpoolError::PoolExhaustedTimeout(_) => err,
                    other => other,
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn create(
        &self,
        role: Role,
        ticket: LiveTicket,
    ) -> Result<PooledConnector, SqlTaskpoolError> {
        let Some(connector) = self.builder.build(role).await else {
            return Err(SqlTaskpoolError::NoConnector(role));
        };
        let mut conn = PooledConnector::new(connector, role, ticket);
        conn.connect()
            .await
            .map_err(|err| SqlTaskpoolError::connection(&err))?;
        debug!(%role, live = self.live(role).load(Ordering::Acquire), "created connector");
        Ok(conn)
    }

    async fn wait_for_idle(&self, role: Role) -> Result<PooledConnector, SqlTaskpoolError> {
        let timeouts = self.wait_timeouts.load(Ordering::Acquire);
        if timeouts > self.options.max_wait_timeouts {
            error!(%role, timeouts, "repeated connector wait timeouts, failing fast");
            return Err(SqlTaskpoolError::PoolFatal(format!(
                "{timeouts} consecutive waits for a {role} connector timed out; check the database server"
            )));
        }

        match self.idle(role).pop(self.options.wait_timeout).await {
            Ok(conn) => Ok(conn),
            Err(PopError::Timeout) => {
                self.wait_timeouts.fetch_add(1, Ordering::AcqRel);
                Err(SqlTaskpoolError::PoolExhaustedTimeout(role))
            }
            Err(PopError::Closed) => Err(SqlTaskpoolError::PoolClosed),
        }
    }

    /// Return a connector. It is closed instead when the pool is closed, the
    /// idle collection is full, or the connector fails [`Pool::healthy`].
    pub async fn release(&self, mut conn: PooledConnector) {
        conn.info_mut().mark_idle();

        if !self.is_ok() {
            return self.discard(conn, Discard::PoolClosed).await;
        }
        if !self.healthy(&conn) {
            return self.discard(conn, Discard::Unhealthy).await;
        }
        let idle = self.idle(conn.role());
        if idle.is_full() {
            return self.discard(conn, Discard::IdleFull).await;
        }
        if let Err(conn) = idle.push(conn) {
            self.discard(conn, Discard::IdleFull).await;
        }
    }

    /// Whether a connector may be reused. Busy connectors always pass.
    #[must_use]
    pub fn healthy(&self, conn: &PooledConnector) -> bool {
        if conn.info().status == ConnectorStatus::Busy {
            return true;
        }
        if !conn.is_connected() || conn.exec_count() >= self.options.max_exec_count {
            return false;
        }
        let last_used = conn.last_exec_at().unwrap_or_else(|| conn.info().created());
        last_used.elapsed() < self.options.max_idle
    }

    async fn discard(&self, mut conn: PooledConnector, reason: Discard) {
        let role = conn.role();
        match reason {
            Discard::Unhealthy | Discard::Stale => {
                warn!(%role, exec_count = conn.exec_count(), ?reason, "evicting connector");
            }
            Discard::PoolClosed | Discard::IdleFull => {
                debug!(%role, ?reason, "closing connector");
            }
        }
        conn.close().await;
    }

    /// Close the pool: drain and close idle connectors, then the idle collections.
    ///
    /// Connectors checked out at this point are closed when they are released.
    pub async fn close(&self) {
        self.status
            .store(PoolStatus::Closed.as_u8(), Ordering::Release);

        for idle in [&self.read_idle, &self.write_idle] {
            while let Ok(conn) = idle.pop(self.options.close_drain_timeout).await {
                self.discard(conn, Discard::PoolClosed).await;
            }
        }
        self.read_idle.close();
        self.write_idle.close();
    }

    /// Idle connectors per role.
    #[must_use]
    pub fn counts(&self) -> PoolCounts {
        PoolCounts {
            read: self.read_idle.len(),
            write: self.write_idle.len(),
        }
    }

    /// Connectors alive per role, idle or checked out.
    #[must_use]
    pub fn live_counts(&self) -> PoolCounts {
        PoolCounts {
            read: self.read_live.load(Ordering::Acquire),
            write: self.write_live.load(Ordering::Acquire),
        }
    }

    #[must_use]
    pub fn consecutive_timeouts(&self) -> u32 {
        self.wait_timeouts.load(Ordering::Acquire)
    }
}
