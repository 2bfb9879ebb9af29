use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::connector::Connector;
use crate::types::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorStatus {
    /// Checked out to a caller.
    Busy,
    /// Sitting in an idle collection.
    Idle,
}

/// Pool-side bookkeeping for one connector.
#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    pub created_at: DateTime<Utc>,
    pub checked_out_at: Option<DateTime<Utc>>,
    pub returned_at: Option<DateTime<Utc>>,
    pub role: Role,
    pub status: ConnectorStatus,
    created: Instant,
}

impl ConnectorInfo {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            created_at: Utc::now(),
            checked_out_at: None,
            returned_at: None,
            role,
            status: ConnectorStatus::Busy,
            created: Instant::now(),
        }
    }

    pub(crate) fn mark_busy(&mut self) {
        self.status = ConnectorStatus::Busy;
        self.checked_out_at = Some(Utc::now());
    }

    pub(crate) fn mark_idle(&mut self) {
        self.status = ConnectorStatus::Idle;
        self.returned_at = Some(Utc::now());
    }

    pub(crate) fn created(&self) -> Instant {
        self.created
    }
}

/// Counts one live connector of a role for as long as it exists.
///
/// Dropping the ticket (with its connector) gives the slot back, whichever
/// path the connector ends on: eviction, pool close, or a cancelled task.
#[derive(Debug)]
pub(crate) struct LiveTicket {
    counter: Arc<AtomicUsize>,
}

impl LiveTicket {
    /// Take a slot if fewer than `ceiling` are in use.
    pub(crate) fn reserve(counter: &Arc<AtomicUsize>, ceiling: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < ceiling).then_some(live + 1)
            })
            .ok()?;
        Some(Self {
            counter: Arc::clone(counter),
        })
    }
}

impl Drop for LiveTicket {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A connector owned by the pool's bookkeeping; derefs to [`Connector`].
#[derive(Debug)]
pub struct PooledConnector {
    connector: Connector,
    info: ConnectorInfo,
    _ticket: LiveTicket,
}

impl PooledConnector {
    pub(crate) fn new(connector: Connector, role: Role, ticket: LiveTicket) -> Self {
        Self {
            connector,
            info: ConnectorInfo::new(role),
            _ticket: ticket,
        }
    }

    #[must_use]
    pub fn info(&self) -> &ConnectorInfo {
        &self.info
    }

    pub(crate) fn info_mut(&mut self) -> &mut ConnectorInfo {
        &mut self.info
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.info.role
    }
}

impl Deref for PooledConnector {
    type Target = Connector;

    fn deref(&self) -> &Connector {
        &self.connector
    }
}

impl DerefMut for PooledConnector {
    fn deref_mut(&mut self) -> &mut Connector {
        &mut self.connector
    }
}
