//! Owner of the pool map.
//!
//! One `ConnectionManager` per client instance. Pools are created lazily,
//! insert-if-absent, keyed by [`RequestKey`], and never removed except on
//! shutdown. The map lock is only ever held for the lookup itself.

use crate::config::PoolConfig;
use crate::connector::Connector;
use crate::key::RequestKey;
use crate::pool::{Pool, PooledHandle};
use crate::Error;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub(crate) struct ConnectionManager {
    pools: Mutex<HashMap<RequestKey, Arc<Pool>>>,
    connector: Arc<dyn Connector>,
    cfg: PoolConfig,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, cfg: PoolConfig) -> Self {
        ConnectionManager {
            pools: Mutex::new(HashMap::new()),
            connector,
            cfg,
        }
    }

    fn pool_for(&self, key: &RequestKey) -> Arc<Pool> {
        let mut pools = self.pools.lock().unwrap();

        pools
            .entry(key.clone())
            .or_insert_with(|| {
                debug!("New pool for {}", key);
                Arc::new(Pool::new(
                    key.clone(),
                    self.cfg.clone(),
                    self.connector.clone(),
                ))
            })
            .clone()
    }

    /// Check out a connection for a buffering exchange.
    pub async fn acquire_for_exchange(&self, key: &RequestKey) -> Result<PooledHandle, Error> {
        let pool = self.pool_for(key);
        pool.acquire().await
    }

    /// Check out a connection for a streaming exchange. Same checkout
    /// discipline; the intent split mirrors the facade operations.
    pub async fn acquire_for_stream(&self, key: &RequestKey) -> Result<PooledHandle, Error> {
        let pool = self.pool_for(key);
        pool.acquire().await
    }

    /// Shut every pool down. In-flight exchanges wind down with their
    /// connections; waiting acquires fail.
    pub fn shutdown(&self) {
        let pools: Vec<Arc<Pool>> = {
            let mut lock = self.pools.lock().unwrap();
            lock.drain().map(|(_, p)| p).collect()
        };

        for pool in pools {
            pool.shutdown();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let pools = self.pools.lock().unwrap();
        write!(f, "ConnectionManager {{ pools: {} }}", pools.len())
    }
}
