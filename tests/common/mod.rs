//! In-memory connection used by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tablet_core::config::PoolConfig;
use tablet_core::lifecycle::SendFn;
use tablet_core::state_manager::Killable;
use tablet_core::{
    Components, DbConnection, QueryResult, RequestContext, Resource, ResourceFactory, Setting,
    TabletConfig, TabletError, TabletServer, TabletType, Target,
};

pub const KEYSPACE: &str = "commerce";

/// Every statement any connection ran, in order.
#[derive(Default)]
pub struct Journal(Mutex<Vec<String>>);

impl Journal {
    pub fn statements(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

struct NoKill(i64);

#[async_trait]
impl Killable for NoKill {
    fn id(&self) -> i64 {
        self.0
    }

    fn current(&self) -> String {
        String::new()
    }

    async fn kill(&self, _reason: &str, _elapsed: Duration) -> Result<(), TabletError> {
        Ok(())
    }
}

pub struct MemConn {
    id: i64,
    journal: Arc<Journal>,
    setting: Option<Setting>,
}

#[async_trait]
impl Resource for MemConn {
    async fn close(self) {}

    fn expired(&self, _lifetime: Duration) -> bool {
        false
    }

    async fn apply_setting(&mut self, _ctx: &RequestContext, setting: &Setting) -> Result<(), TabletError> {
        self.setting = Some(setting.clone());
        Ok(())
    }

    fn is_setting_applied(&self) -> bool {
        self.setting.is_some()
    }

    fn is_same_setting(&self, setting: &Setting) -> bool {
        self.setting.as_ref().is_some_and(|s| s.query() == setting.query())
    }

    async fn reset_setting(&mut self, _ctx: &RequestContext) -> Result<(), TabletError> {
        self.setting = None;
        Ok(())
    }
}

#[async_trait]
impl DbConnection for MemConn {
    fn id(&self) -> i64 {
        self.id
    }

    fn killer(&self) -> Arc<dyn Killable> {
        Arc::new(NoKill(self.id))
    }

    fn is_closed(&self) -> bool {
        false
    }

    async fn exec(
        &mut self,
        _ctx: &RequestContext,
        sql: &str,
        _bind_vars: &tablet_core::BindVars,
    ) -> Result<QueryResult, TabletError> {
        self.journal.0.lock().unwrap().push(sql.to_string());
        Ok(QueryResult::default())
    }

    async fn stream(
        &mut self,
        ctx: &RequestContext,
        sql: &str,
        bind_vars: &tablet_core::BindVars,
        _batch_size: usize,
        send: &mut SendFn<'_>,
    ) -> Result<(), TabletError> {
        let qr = self.exec(ctx, sql, bind_vars).await?;
        send(qr)
    }
}

pub struct MemFactory {
    next: AtomicI64,
    journal: Arc<Journal>,
}

#[async_trait]
impl ResourceFactory<MemConn> for MemFactory {
    async fn create(&self, _ctx: &RequestContext) -> Result<MemConn, TabletError> {
        Ok(MemConn {
            id: self.next.fetch_add(1, Ordering::SeqCst) + 1,
            journal: self.journal.clone(),
            setting: None,
        })
    }
}

pub fn config() -> TabletConfig {
    let pool = PoolConfig {
        capacity: 2,
        max_cap: 2,
        idle_timeout: Duration::ZERO,
        max_lifetime: Duration::ZERO,
    };
    let mut cfg = TabletConfig::default();
    cfg.db.db_name = KEYSPACE.to_string();
    cfg.pool = pool.clone();
    cfg.stream_pool = pool.clone();
    cfg.tx_pool = pool;
    cfg.transition_grace_period = Duration::ZERO;
    cfg.shutdown_grace_period = Duration::ZERO;
    cfg
}

pub fn target() -> Target {
    Target::new(KEYSPACE, "0", TabletType::Primary)
}

/// A tablet over in-memory connections, initialized but not yet serving.
pub async fn tablet() -> (Arc<Journal>, Arc<TabletServer<MemConn>>) {
    let journal = Arc::new(Journal::default());
    let factory: Arc<dyn ResourceFactory<MemConn>> = Arc::new(MemFactory {
        next: AtomicI64::new(0),
        journal: journal.clone(),
    });
    let tsv = TabletServer::new(config(), factory, Components::default())
        .await
        .unwrap();
    tsv.init(target()).await.unwrap();
    (journal, tsv)
}
