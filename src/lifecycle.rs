//! Lifecycle contracts the state manager sequences, plus the role traits
//! built on them. Every method must be safe to call repeatedly.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::context::RequestContext;
use crate::error::{Code, TabletError};
use crate::sql::{BindVars, QueryResult};
use crate::target::TabletType;

/// Open/Close that cannot fail.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn open(&self);
    async fn close(&self);
}

/// Open that can fail, Close that cannot.
#[async_trait]
pub trait FallibleLifecycle: Send + Sync {
    async fn open(&self) -> Result<(), TabletError>;
    async fn close(&self);
}

/// Primary/replica specific startup.
#[async_trait]
pub trait RoleAware: Send + Sync {
    async fn make_primary(&self);
    async fn make_non_primary(&self);
}

/// Schema cache. Owns the first MySQL contact of a transition.
#[async_trait]
pub trait SchemaControl: FallibleLifecycle + RoleAware {
    async fn ensure_connection_and_db(&self, tablet_type: TabletType) -> Result<(), TabletError>;
    /// `CREATE TABLE` text keyed by table name. An empty list means every table.
    async fn get_schema(&self, tables: &[String]) -> Result<HashMap<String, String>, TabletError>;
}

/// Replication tracker.
#[async_trait]
pub trait ReplControl: RoleAware {
    async fn close(&self);
    /// Current replication lag.
    async fn status(&self) -> Result<Duration, TabletError>;
}

#[async_trait]
pub trait QueryControl: FallibleLifecycle {
    async fn is_mysql_reachable(&self) -> Result<(), TabletError>;
    fn in_use(&self) -> i64;
}

#[async_trait]
pub trait TxControl: Send + Sync {
    async fn accept_read_write(&self);
    async fn accept_read_only(&self);
    async fn close(&self);
    fn in_use(&self) -> i64;
}

#[async_trait]
pub trait TxThrottler: FallibleLifecycle {
    /// True when a new transaction should be rejected.
    fn throttle(&self) -> bool;
}

/// Callback receiving one batch of streamed rows.
pub type SendFn<'a> = dyn FnMut(QueryResult) -> Result<(), TabletError> + Send + 'a;

#[async_trait]
pub trait Messager: Lifecycle {
    async fn stream(
        &self,
        ctx: &RequestContext,
        name: &str,
        send: &mut SendFn<'_>,
    ) -> Result<(), TabletError>;
    fn generate_ack_query(&self, name: &str, ids: &[String]) -> Result<(String, BindVars), TabletError>;
    fn generate_purge_query(&self, name: &str, time_cutoff: i64) -> Result<(String, BindVars), TabletError>;
}

#[async_trait]
pub trait DmlJobController: FallibleLifecycle {
    async fn submit(
        &self,
        ctx: &RequestContext,
        sql: &str,
        options: &serde_json::Value,
    ) -> Result<QueryResult, TabletError>;
}

/// Stand-in for roles this crate only sequences.
#[derive(Debug, Default, Clone, Copy)]
pub struct Noop;

#[async_trait]
impl Lifecycle for Noop {
    async fn open(&self) {}
    async fn close(&self) {}
}

#[async_trait]
impl FallibleLifecycle for Noop {
    async fn open(&self) -> Result<(), TabletError> {
        Ok(())
    }
    async fn close(&self) {}
}

#[async_trait]
impl RoleAware for Noop {
    async fn make_primary(&self) {}
    async fn make_non_primary(&self) {}
}

#[async_trait]
impl SchemaControl for Noop {
    async fn ensure_connection_and_db(&self, _tablet_type: TabletType) -> Result<(), TabletError> {
        Ok(())
    }

    async fn get_schema(&self, _tables: &[String]) -> Result<HashMap<String, String>, TabletError> {
        Ok(HashMap::new())
    }
}

#[async_trait]
impl ReplControl for Noop {
    async fn close(&self) {}

    async fn status(&self) -> Result<Duration, TabletError> {
        Ok(Duration::ZERO)
    }
}

#[async_trait]
impl QueryControl for Noop {
    async fn is_mysql_reachable(&self) -> Result<(), TabletError> {
        Ok(())
    }

    fn in_use(&self) -> i64 {
        0
    }
}

#[async_trait]
impl TxControl for Noop {
    async fn accept_read_write(&self) {}
    async fn accept_read_only(&self) {}
    async fn close(&self) {}

    fn in_use(&self) -> i64 {
        0
    }
}

#[async_trait]
impl TxThrottler for Noop {
    fn throttle(&self) -> bool {
        false
    }
}

#[async_trait]
impl Messager for Noop {
    async fn stream(
        &self,
        _ctx: &RequestContext,
        name: &str,
        _send: &mut SendFn<'_>,
    ) -> Result<(), TabletError> {
        Err(unknown_message_table(name))
    }

    fn generate_ack_query(&self, name: &str, _ids: &[String]) -> Result<(String, BindVars), TabletError> {
        Err(unknown_message_table(name))
    }

    fn generate_purge_query(&self, name: &str, _time_cutoff: i64) -> Result<(String, BindVars), TabletError> {
        Err(unknown_message_table(name))
    }
}

fn unknown_message_table(name: &str) -> TabletError {
    TabletError::new(Code::InvalidArgument, format!("message table {} not found", name))
}

#[async_trait]
impl DmlJobController for Noop {
    async fn submit(
        &self,
        _ctx: &RequestContext,
        _sql: &str,
        _options: &serde_json::Value,
    ) -> Result<QueryResult, TabletError> {
        Err(TabletError::new(
            Code::Unimplemented,
            "dml job controller is not configured",
        ))
    }
}

/// The subcomponents a state manager sequences, one per role.
#[derive(Clone)]
pub struct Components {
    pub task_pool: Arc<dyn Lifecycle>,
    pub se: Arc<dyn SchemaControl>,
    pub rt: Arc<dyn ReplControl>,
    pub vstreamer: Arc<dyn Lifecycle>,
    pub tracker: Arc<dyn Lifecycle>,
    pub watcher: Arc<dyn Lifecycle>,
    pub branch_watch: Arc<dyn Lifecycle>,
    pub qe: Arc<dyn QueryControl>,
    pub tx_throttler: Arc<dyn TxThrottler>,
    pub te: Arc<dyn TxControl>,
    pub messager: Arc<dyn Messager>,
    pub ddle: Arc<dyn FallibleLifecycle>,
    pub throttler: Arc<dyn FallibleLifecycle>,
    pub table_gc: Arc<dyn FallibleLifecycle>,
    pub dml_job_controller: Arc<dyn DmlJobController>,
    pub table_acl: Arc<dyn FallibleLifecycle>,
    pub pool_size_controller: Arc<dyn Lifecycle>,
}

impl Default for Components {
    fn default() -> Self {
        let noop = Arc::new(Noop);
        Components {
            task_pool: noop.clone(),
            se: noop.clone(),
            rt: noop.clone(),
            vstreamer: noop.clone(),
            tracker: noop.clone(),
            watcher: noop.clone(),
            branch_watch: noop.clone(),
            qe: noop.clone(),
            tx_throttler: noop.clone(),
            te: noop.clone(),
            messager: noop.clone(),
            ddle: noop.clone(),
            throttler: noop.clone(),
            table_gc: noop.clone(),
            dml_job_controller: noop.clone(),
            table_acl: noop.clone(),
            pool_size_controller: noop,
        }
    }
}
