//! In-memory MySQL stand-in used by the unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use super::DbConnection;
use crate::context::RequestContext;
use crate::error::{errno, SqlError, TabletError};
use crate::lifecycle::SendFn;
use crate::pools::{Resource, ResourceFactory, Setting};
use crate::sql::{statement_verb, BindVars, QueryResult};
use crate::state_manager::Killable;

#[derive(Default)]
pub struct FakeDb {
    next_id: AtomicI64,
    created: AtomicUsize,
    closed: AtomicUsize,
    down: AtomicBool,
    log: Mutex<Vec<String>>,
    results: Mutex<HashMap<String, QueryResult>>,
    errors: Mutex<HashMap<String, TabletError>>,
    delays: Mutex<HashMap<String, Duration>>,
    panic_on: Mutex<Option<String>>,
    kills: Mutex<Vec<i64>>,
}

impl FakeDb {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeDb::default())
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn add_result(&self, sql: &str, result: QueryResult) {
        self.results.lock().unwrap().insert(sql.to_string(), result);
    }

    pub fn add_error(&self, sql: &str, err: TabletError) {
        self.errors.lock().unwrap().insert(sql.to_string(), err);
    }

    pub fn add_delay(&self, sql: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(sql.to_string(), delay);
    }

    pub fn panic_on(&self, sql: &str) {
        *self.panic_on.lock().unwrap() = Some(sql.to_string());
    }

    /// Every statement seen so far, settings included.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }

    pub fn kills(&self) -> Vec<i64> {
        self.kills.lock().unwrap().clone()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, sql: &str) {
        self.log.lock().unwrap().push(sql.to_string());
    }
}

pub struct FakeKiller {
    id: i64,
    current: Mutex<String>,
    killed: Notify,
    db: Arc<FakeDb>,
}

#[async_trait]
impl Killable for FakeKiller {
    fn id(&self) -> i64 {
        self.id
    }

    fn current(&self) -> String {
        self.current.lock().unwrap().clone()
    }

    async fn kill(&self, _reason: &str, _elapsed: Duration) -> Result<(), TabletError> {
        self.db.kills.lock().unwrap().push(self.id);
        self.killed.notify_one();
        Ok(())
    }
}

pub struct FakeConn {
    db: Arc<FakeDb>,
    killer: Arc<FakeKiller>,
    setting: Option<Setting>,
    closed: bool,
}

impl FakeConn {
    async fn run(&mut self, ctx: &RequestContext, sql: &str) -> Result<QueryResult, TabletError> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if self.closed {
            return Err(SqlError::new(errno::CR_SERVER_GONE, "HY000", "MySQL server has gone away").into());
        }
        self.db.record(sql);
        let should_panic = self.db.panic_on.lock().unwrap().as_deref() == Some(sql);
        if should_panic {
            panic!("fake mysql crashed on {}", sql);
        }
        let delay = self.db.delays.lock().unwrap().get(sql).copied();
        if let Some(delay) = delay {
            *self.killer.current.lock().unwrap() = sql.to_string();
            let outcome = tokio::select! {
                _ = tokio::time::sleep(delay) => Ok(()),
                _ = self.killer.killed.notified() => Err(SqlError::new(
                    errno::ER_QUERY_INTERRUPTED,
                    "70100",
                    "Query execution was interrupted",
                ).into()),
                _ = ctx.done() => Err(ctx.err().unwrap_or_else(|| {
                    TabletError::new(crate::error::Code::Canceled, "context canceled")
                })),
            };
            self.killer.current.lock().unwrap().clear();
            if let Err(err) = outcome {
                self.closed = true;
                return Err(err);
            }
        }
        let injected = self.db.errors.lock().unwrap().get(sql).cloned();
        if let Some(err) = injected {
            if err.as_sql().is_some_and(|e| e.is_conn_err()) {
                self.closed = true;
            }
            return Err(err);
        }
        if let Some(result) = self.db.results.lock().unwrap().get(sql) {
            return Ok(result.clone());
        }
        let verb = statement_verb(sql).to_ascii_lowercase();
        Ok(match verb.as_str() {
            "insert" | "update" | "delete" => QueryResult::affected(1),
            _ => QueryResult::default(),
        })
    }
}

#[async_trait]
impl Resource for FakeConn {
    async fn close(self) {
        self.db.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn expired(&self, _lifetime: Duration) -> bool {
        false
    }

    async fn apply_setting(&mut self, ctx: &RequestContext, setting: &Setting) -> Result<(), TabletError> {
        if !setting.query().is_empty() {
            self.run(ctx, setting.query()).await?;
        }
        self.setting = Some(setting.clone());
        Ok(())
    }

    fn is_setting_applied(&self) -> bool {
        self.setting.is_some()
    }

    fn is_same_setting(&self, setting: &Setting) -> bool {
        self.setting.as_ref().is_some_and(|s| s.query() == setting.query())
    }

    async fn reset_setting(&mut self, ctx: &RequestContext) -> Result<(), TabletError> {
        let reset = self
            .setting
            .as_ref()
            .map(|s| s.reset_query().to_string())
            .unwrap_or_default();
        if !reset.is_empty() {
            self.run(ctx, &reset).await?;
        }
        self.setting = None;
        Ok(())
    }
}

#[async_trait]
impl DbConnection for FakeConn {
    fn id(&self) -> i64 {
        self.killer.id
    }

    fn killer(&self) -> Arc<dyn Killable> {
        self.killer.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn exec(
        &mut self,
        ctx: &RequestContext,
        sql: &str,
        _bind_vars: &BindVars,
    ) -> Result<QueryResult, TabletError> {
        self.run(ctx, sql).await
    }

    async fn stream(
        &mut self,
        ctx: &RequestContext,
        sql: &str,
        _bind_vars: &BindVars,
        batch_size: usize,
        send: &mut SendFn<'_>,
    ) -> Result<(), TabletError> {
        let result = self.run(ctx, sql).await?;
        send(QueryResult {
            fields: result.fields,
            ..QueryResult::default()
        })?;
        for chunk in result.rows.chunks(batch_size.max(1)) {
            send(QueryResult {
                rows: chunk.to_vec(),
                ..QueryResult::default()
            })?;
        }
        Ok(())
    }
}

pub struct FakeConnFactory {
    db: Arc<FakeDb>,
}

impl FakeConnFactory {
    pub fn new(db: Arc<FakeDb>) -> Self {
        FakeConnFactory { db }
    }
}

#[async_trait]
impl ResourceFactory<FakeConn> for FakeConnFactory {
    async fn create(&self, _ctx: &RequestContext) -> Result<FakeConn, TabletError> {
        if self.db.down.load(Ordering::SeqCst) {
            return Err(SqlError::new(
                errno::CR_CONN_HOST_ERROR,
                "HY000",
                "Can't connect to MySQL server",
            )
            .into());
        }
        self.db.created.fetch_add(1, Ordering::SeqCst);
        let id = self.db.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FakeConn {
            db: self.db.clone(),
            killer: Arc::new(FakeKiller {
                id,
                current: Mutex::new(String::new()),
                killed: Notify::new(),
                db: self.db.clone(),
            }),
            setting: None,
            closed: false,
        })
    }
}
