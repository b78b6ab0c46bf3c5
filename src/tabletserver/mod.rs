//! The tablet server: owns the engines and the state manager and exposes the
//! query RPCs, each one run through the request envelope.

mod envelope;
mod log_stats;
mod query;
mod stats;

pub use envelope::{build_conn_setting, query_as_string};
pub use log_stats::LogStats;
pub use query::{ExecuteOutcome, TransactionState};
pub use stats::{TabletStats, TabletStatsSnapshot, Timing};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::acl::TableAcl;
use crate::config::TabletConfig;
use crate::engine::{DbConnection, QueryEngine, QueryEngineStats, TxEngine, TxEngineStats};
use crate::error::TabletError;
use crate::lifecycle::{Components, DmlJobController, Messager, SchemaControl, TxThrottler};
use crate::logging::ThrottledLogger;
use crate::pools::ResourceFactory;
use crate::state_manager::{QueryDetailView, ServingState, StateManager, StateSnapshot, Timings};
use crate::target::{TabletType, Target};

#[derive(Clone, Debug, Serialize)]
pub struct DebugVars {
    pub state: StateSnapshot,
    pub query_engine: QueryEngineStats,
    pub tx_engine: TxEngineStats,
    pub stats: TabletStatsSnapshot,
}

#[derive(Clone, Debug, Serialize)]
pub struct QueryLists {
    pub stateless: Vec<QueryDetailView>,
    pub stateful: Vec<QueryDetailView>,
    pub olap: Vec<QueryDetailView>,
}

pub struct TabletServer<C: DbConnection> {
    config: TabletConfig,
    sm: StateManager,
    qe: Arc<QueryEngine<C>>,
    te: Arc<TxEngine<C>>,
    se: Arc<dyn SchemaControl>,
    messager: Arc<dyn Messager>,
    tx_throttler: Arc<dyn TxThrottler>,
    dml_job_controller: Arc<dyn DmlJobController>,
    acl: Arc<TableAcl>,
    stats: TabletStats,
    pool_full_log: ThrottledLogger,
}

impl<C: DbConnection> TabletServer<C> {
    /// Builds the engines over `factory` and installs them, plus the table ACL,
    /// into `components`. The other roles are taken as given.
    pub async fn new(
        config: TabletConfig,
        factory: Arc<dyn ResourceFactory<C>>,
        mut components: Components,
    ) -> Result<Arc<Self>, TabletError> {
        let qe = Arc::new(QueryEngine::new(factory.clone(), &config.pool, &config.stream_pool).await?);
        let te = TxEngine::new(factory, &config).await?;
        let acl = Arc::new(TableAcl::new(config.table_acl_file.clone()));
        components.qe = qe.clone();
        components.te = te.clone();
        components.table_acl = acl.clone();
        let tsv = TabletServer {
            sm: StateManager::new(components.clone(), Timings::from_config(&config)),
            qe,
            te,
            se: components.se,
            messager: components.messager,
            tx_throttler: components.tx_throttler,
            dml_job_controller: components.dml_job_controller,
            acl,
            stats: TabletStats::default(),
            pool_full_log: ThrottledLogger::new("pool_full", Duration::from_secs(60)),
            config,
        };
        Ok(Arc::new(tsv))
    }

    pub fn config(&self) -> &TabletConfig {
        &self.config
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.sm
    }

    pub fn query_engine(&self) -> &Arc<QueryEngine<C>> {
        &self.qe
    }

    pub fn tx_engine(&self) -> &Arc<TxEngine<C>> {
        &self.te
    }

    pub fn table_acl(&self) -> &TableAcl {
        &self.acl
    }

    pub fn stats(&self) -> &TabletStats {
        &self.stats
    }

    pub async fn init(&self, target: Target) -> Result<(), TabletError> {
        self.sm.init(target).await
    }

    pub async fn set_serving_type(
        &self,
        tablet_type: TabletType,
        ter_timestamp: Option<DateTime<Utc>>,
        serving: bool,
        reason: &str,
    ) -> Result<(), TabletError> {
        let state = if serving {
            ServingState::Serving
        } else {
            ServingState::NotServing
        };
        self.sm
            .set_serving_type(tablet_type, ter_timestamp, state, reason)
            .await
    }

    pub async fn stop_service(&self) {
        self.sm.stop_service().await;
    }

    pub fn enter_lameduck(&self) {
        self.sm.enter_lameduck();
    }

    pub fn exit_lameduck(&self) {
        self.sm.exit_lameduck();
    }

    pub fn is_serving(&self) -> bool {
        self.sm.is_serving()
    }

    pub async fn set_pool_size(&self, size: usize) -> Result<(), TabletError> {
        self.qe.set_pool_size(size).await
    }

    pub async fn set_stream_pool_size(&self, size: usize) -> Result<(), TabletError> {
        self.qe.set_stream_pool_size(size).await
    }

    pub async fn set_tx_pool_size(&self, size: usize) -> Result<(), TabletError> {
        self.te.set_pool_size(size).await
    }

    pub fn debug_vars(&self) -> DebugVars {
        DebugVars {
            state: self.sm.snapshot(),
            query_engine: self.qe.stats(),
            tx_engine: self.te.stats(),
            stats: self.stats.snapshot(),
        }
    }

    pub fn query_lists(&self) -> QueryLists {
        QueryLists {
            stateless: self.sm.stateless_queries().snapshot(),
            stateful: self.sm.stateful_queries().snapshot(),
            olap: self.sm.olap_queries().snapshot(),
        }
    }
}
