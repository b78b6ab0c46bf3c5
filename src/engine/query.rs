//! Query engine: the plain and streaming connection pools for non-transactional traffic.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{DbConnection, SizedPool};
use crate::config::PoolConfig;
use crate::context::RequestContext;
use crate::error::{Code, TabletError};
use crate::lifecycle::{FallibleLifecycle, QueryControl};
use crate::pools::{PoolStats, Pooled, ResourceFactory, Setting};

const REACHABLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Serialize)]
pub struct QueryEngineStats {
    pub conn_pool: PoolStats,
    pub stream_conn_pool: PoolStats,
}

/// Hands out pooled connections for statements that run outside a transaction.
pub struct QueryEngine<C: DbConnection> {
    factory: Arc<dyn ResourceFactory<C>>,
    conns: SizedPool<C>,
    stream_conns: SizedPool<C>,
    is_open: AtomicBool,
}

impl<C: DbConnection> QueryEngine<C> {
    /// Both pools start closed; [`open`](FallibleLifecycle::open) fills them.
    pub async fn new(
        factory: Arc<dyn ResourceFactory<C>>,
        pool: &PoolConfig,
        stream_pool: &PoolConfig,
    ) -> Result<Self, TabletError> {
        let conns = SizedPool::new(factory.clone(), pool).await?;
        let stream_conns = SizedPool::new(factory.clone(), stream_pool).await?;
        Ok(QueryEngine {
            factory,
            conns,
            stream_conns,
            is_open: AtomicBool::new(false),
        })
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), TabletError> {
        if !self.is_open() {
            return Err(TabletError::new(Code::Unavailable, "query engine is closed"));
        }
        Ok(())
    }

    pub async fn get_conn(
        &self,
        ctx: &RequestContext,
        setting: Option<&Setting>,
    ) -> Result<Pooled<C>, TabletError> {
        self.check_open()?;
        Ok(self.conns.pool.get_pooled(ctx, setting).await?)
    }

    pub async fn get_stream_conn(
        &self,
        ctx: &RequestContext,
        setting: Option<&Setting>,
    ) -> Result<Pooled<C>, TabletError> {
        self.check_open()?;
        Ok(self.stream_conns.pool.get_pooled(ctx, setting).await?)
    }

    pub async fn set_pool_size(&self, size: usize) -> Result<(), TabletError> {
        self.conns.resize(size).await
    }

    pub fn pool_size(&self) -> usize {
        self.conns.capacity()
    }

    pub async fn set_stream_pool_size(&self, size: usize) -> Result<(), TabletError> {
        self.stream_conns.resize(size).await
    }

    pub fn stream_pool_size(&self) -> usize {
        self.stream_conns.capacity()
    }

    pub fn stats(&self) -> QueryEngineStats {
        QueryEngineStats {
            conn_pool: self.conns.pool.stats(),
            stream_conn_pool: self.stream_conns.pool.stats(),
        }
    }
}

#[async_trait]
impl<C: DbConnection> FallibleLifecycle for QueryEngine<C> {
    async fn open(&self) -> Result<(), TabletError> {
        if self.is_open() {
            return Ok(());
        }
        self.conns.open().await?;
        self.stream_conns.open().await?;
        self.is_open.store(true, Ordering::SeqCst);
        tracing::info!(
            pool_size = self.pool_size(),
            stream_pool_size = self.stream_pool_size(),
            "query engine opened"
        );
        Ok(())
    }

    async fn close(&self) {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.conns.pool.close().await;
        self.stream_conns.pool.close().await;
        tracing::info!("query engine closed");
    }
}

#[async_trait]
impl<C: DbConnection> QueryControl for QueryEngine<C> {
    async fn is_mysql_reachable(&self) -> Result<(), TabletError> {
        let ctx = RequestContext::background().with_timeout(REACHABLE_TIMEOUT);
        let conn = self.factory.create(&ctx).await?;
        conn.close().await;
        Ok(())
    }

    fn in_use(&self) -> i64 {
        self.conns.pool.in_use() + self.stream_conns.pool.in_use()
    }
}
