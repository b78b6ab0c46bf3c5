//! MySQL-facing engines: connections, the query and transaction engines,
//! the schema cache and the replication tracker.

mod dbconn;
mod query;
mod repl;
mod schema;
mod tx;

#[cfg(test)]
pub(crate) mod testing;

pub use dbconn::*;
pub use query::*;
pub use repl::ReplTracker;
pub use schema::SchemaEngine;
pub use tx::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::PoolConfig;
use crate::error::{Code, TabletError};
use crate::pools::{ResourceFactory, ResourcePool};

/// A resource pool that remembers its configured size across close/open.
pub(crate) struct SizedPool<C: DbConnection> {
    pub(crate) pool: Arc<ResourcePool<C>>,
    capacity: AtomicUsize,
    idle_timeout: Duration,
}

impl<C: DbConnection> SizedPool<C> {
    /// The pool starts closed.
    pub(crate) async fn new(
        factory: Arc<dyn ResourceFactory<C>>,
        cfg: &PoolConfig,
    ) -> Result<Self, TabletError> {
        let max_cap = cfg.max_cap.max(cfg.capacity);
        let pool = ResourcePool::new(factory, cfg.capacity, max_cap, Duration::ZERO, cfg.max_lifetime)?;
        pool.close().await;
        Ok(SizedPool {
            pool,
            capacity: AtomicUsize::new(cfg.capacity),
            idle_timeout: cfg.idle_timeout,
        })
    }

    pub(crate) async fn open(&self) -> Result<(), TabletError> {
        self.pool.set_capacity(self.capacity()).await?;
        self.pool.set_idle_timeout(self.idle_timeout);
        Ok(())
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Applies immediately when open, otherwise on the next open.
    pub(crate) async fn resize(&self, capacity: usize) -> Result<(), TabletError> {
        if capacity == 0 {
            return Err(TabletError::new(
                Code::InvalidArgument,
                "pool size must be positive",
            ));
        }
        if !self.pool.is_closed() {
            self.pool.set_capacity(capacity).await?;
        }
        self.capacity.store(capacity, Ordering::SeqCst);
        Ok(())
    }
}
