use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::types::Role;

use super::Connector;
use super::driver::Driver;

/// Identity of a logical database: the write config plus the set of read configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BuilderKey(u64);

impl BuilderKey {
    /// Derive the key from normalized configs; replica order does not matter.
    #[must_use]
    pub fn derive(write: &ConnectionConfig, reads: &[ConnectionConfig]) -> Self {
        let mut normalized_reads: Vec<String> =
            reads.iter().map(ConnectionConfig::normalized).collect();
        normalized_reads.sort();

        let mut hasher = DefaultHasher::new();
        write.normalized().hash(&mut hasher);
        normalized_reads.hash(&mut hasher);
        BuilderKey(hasher.finish())
    }
}

impl fmt::Display for BuilderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Produces [`Connector`]s for the write config or a random replica.
pub struct ConnectorBuilder {
    driver: Arc<dyn Driver>,
    write: ConnectionConfig,
    reads: Vec<ConnectionConfig>,
    key: BuilderKey,
}

impl fmt::Debug for ConnectorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorBuilder")
            .field("key", &self.key)
            .field("host", &self.write.host)
            .field("replicas", &self.reads.len())
            .finish_non_exhaustive()
    }
}

impl ConnectorBuilder {
    #[must_use]
    pub fn new(
        driver: Arc<dyn Driver>,
        write: ConnectionConfig,
        reads: Vec<ConnectionConfig>,
    ) -> Self {
        let key = BuilderKey::derive(&write, &reads);
        Self {
            driver,
            write,
            reads,
            key,
        }
    }

    #[must_use]
    pub fn key(&self) -> BuilderKey {
        self.key
    }

    /// Config a new connector of `role` would use; `None` for reads without replicas.
    #[must_use]
    pub fn pick_config(&self, role: Role) -> Option<&ConnectionConfig> {
        match role {
            Role::Write => Some(&self.write),
            Role::Read if self.reads.is_empty() => None,
            Role::Read => {
                let idx = rand::thread_rng().gen_range(0..self.reads.len());
                self.reads.get(idx)
            }
        }
    }

    /// Build an unconnected connector, or a connected one when the config asks
    /// for `auto_connect`. `None` means there is nothing to build for `role`.
    pub async fn build(&self, role: Role) -> Option<Connector> {
        let Some(config) = self.pick_config(role) else {
            debug!(%role, "no config for role");
            return None;
        };
        let mut connector = Connector::new(self.driver.open(config));
        if config.auto_connect
            && let Err(err) = connector.connect().await
        {
            warn!(%role, host = %config.host, code = err.code, "auto-connect failed");
        }
        Some(connector)
    }
}
