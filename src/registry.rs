use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::config::{ConnectionConfig, DatabaseConfig, PoolOptions};
use crate::connector::{BuilderKey, ConnectorBuilder, Driver};
use crate::error::SqlTaskpoolError;
use crate::pool::Pool;

/// Shares builders and pools between call sites that name the same database.
///
/// Builders are keyed by [`BuilderKey`], so identical write + replica configs
/// resolve to one builder and one pool no matter how often they are asked for.
/// Create one registry at startup and hand it to whatever builds pools.
#[derive(Debug, Default)]
pub struct Registry {
    builders: Mutex<HashMap<BuilderKey, Arc<ConnectorBuilder>>>,
    pools: Mutex<HashMap<BuilderKey, Arc<Pool>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The builder for these configs, created on first request.
    ///
    /// The driver of the first request is kept for the key.
    pub fn builder(
        &self,
        driver: Arc<dyn Driver>,
        write: ConnectionConfig,
        reads: Vec<ConnectionConfig>,
    ) -> Arc<ConnectorBuilder> {
        let key = BuilderKey::derive(&write, &reads);
        Arc::clone(lock(&self.builders).entry(key).or_insert_with(|| {
            debug!(%key, "registering connector builder");
            Arc::new(ConnectorBuilder::new(driver, write, reads))
        }))
    }

    /// The pool for `builder`, created on first request with `options`.
    /// Later requests get the existing pool and their options are ignored.
    ///
    /// # Errors
    /// Returns [`SqlTaskpoolError::ConfigError`] if a new pool's options are invalid.
    pub fn pool(
        &self,
        builder: &Arc<ConnectorBuilder>,
        options: PoolOptions,
    ) -> Result<Arc<Pool>, SqlTaskpoolError> {
        let key = builder.key();
        let mut pools = lock(&self.pools);
        if let Some(pool) = pools.get(&key) {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(Pool::new(Arc::clone(builder), options)?);
        debug!(%key, "registering pool");
        pools.insert(key, Arc::clone(&pool));
        Ok(pool)
    }

    /// Builder and pool for a [`DatabaseConfig`] in one step.
    ///
    /// # Errors
    /// Returns [`SqlTaskpoolError::ConfigError`] if the pool options are invalid.
    pub fn pool_for(
        &self,
        driver: Arc<dyn Driver>,
        config: &DatabaseConfig,
    ) -> Result<Arc<Pool>, SqlTaskpoolError> {
        let builder = self.builder(driver, config.write.clone(), config.reads.clone());
        self.pool(&builder, config.pool.clone())
    }

    /// Close every registered pool and forget it.
    pub async fn close_all(&self) {
        let pools: Vec<Arc<Pool>> = lock(&self.pools).drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.close().await;
        }
    }

    #[must_use]
    pub fn pool_count(&self) -> usize {
        lock(&self.pools).len()
    }
}
