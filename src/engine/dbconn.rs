//! MySQL connections handed out by the pools, and the side channel that kills them.

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{ConnectOptions, Connection, Executor, Row};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::DbConfig;
use crate::context::RequestContext;
use crate::error::{Code, TabletError};
use crate::lifecycle::SendFn;
use crate::pools::{Resource, ResourceFactory, Setting};
use crate::sql::{bind_positional, result_from_rows, row_to_values, BindVars, MySqlBindValue, QueryResult};
use crate::state_manager::Killable;

/// A pooled connection that can run statements. The pool only sees the
/// [`Resource`] half; the engines use the rest.
#[async_trait]
pub trait DbConnection: Resource {
    /// MySQL thread id.
    fn id(&self) -> i64;
    /// Handle that kills this connection from another task.
    fn killer(&self) -> Arc<dyn Killable>;
    /// True once the connection is broken and must not be reused.
    fn is_closed(&self) -> bool;
    async fn exec(
        &mut self,
        ctx: &RequestContext,
        sql: &str,
        bind_vars: &BindVars,
    ) -> Result<QueryResult, TabletError>;
    /// Sends the field names first, then rows in batches of `batch_size`.
    async fn stream(
        &mut self,
        ctx: &RequestContext,
        sql: &str,
        bind_vars: &BindVars,
        batch_size: usize,
        send: &mut SendFn<'_>,
    ) -> Result<(), TabletError>;
}

pub fn connect_options(db: &DbConfig) -> MySqlConnectOptions {
    let mut opts = MySqlConnectOptions::new()
        .host(&db.host)
        .port(db.port)
        .username(&db.user);
    if !db.password.is_empty() {
        opts = opts.password(&db.password);
    }
    if !db.db_name.is_empty() {
        opts = opts.database(&db.db_name);
    }
    opts
}

/// Kills a connection over a separate short-lived connection.
pub struct ConnKiller {
    id: i64,
    current: Mutex<String>,
    opts: MySqlConnectOptions,
}

impl ConnKiller {
    fn set_current(&self, sql: &str) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        current.clear();
        current.push_str(sql);
    }
}

#[async_trait]
impl Killable for ConnKiller {
    fn id(&self) -> i64 {
        self.id
    }

    fn current(&self) -> String {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn kill(&self, reason: &str, elapsed: Duration) -> Result<(), TabletError> {
        tracing::info!(
            conn_id = self.id,
            reason,
            elapsed = ?elapsed,
            query = %self.current(),
            "killing connection"
        );
        let mut conn = self.opts.connect().await?;
        let stmt = format!("kill {}", self.id);
        let result = (&mut conn).execute(sqlx::raw_sql(&stmt)).await;
        let _ = conn.close().await;
        result?;
        Ok(())
    }
}

pub struct DbConn {
    conn: MySqlConnection,
    created: Instant,
    setting: Option<Setting>,
    killer: Arc<ConnKiller>,
    closed: bool,
}

impl DbConn {
    pub async fn connect(
        ctx: &RequestContext,
        opts: &MySqlConnectOptions,
    ) -> Result<DbConn, TabletError> {
        let connecting = async {
            let mut conn = opts.connect().await?;
            let id: u64 = sqlx::query_scalar("select connection_id()")
                .fetch_one(&mut conn)
                .await?;
            Ok::<_, sqlx::Error>((conn, id))
        };
        let (conn, id) = tokio::select! {
            res = connecting => res?,
            _ = ctx.done() => return Err(ctx_error(ctx)),
        };
        Ok(DbConn {
            conn,
            created: Instant::now(),
            setting: None,
            killer: Arc::new(ConnKiller {
                id: id as i64,
                current: Mutex::new(String::new()),
                opts: opts.clone(),
            }),
            closed: false,
        })
    }

    async fn exec_text(&mut self, sql: &str) -> Result<(), TabletError> {
        if sql.is_empty() {
            return Ok(());
        }
        if let Err(err) = (&mut self.conn).execute(sqlx::raw_sql(sql)).await {
            let err = TabletError::from(err);
            self.mark_if_broken(&err);
            return Err(err);
        }
        Ok(())
    }

    fn mark_if_broken(&mut self, err: &TabletError) {
        if err.as_sql().is_some_and(|e| e.is_conn_err()) {
            self.closed = true;
        }
    }

    /// Called when the context ends mid-statement: the statement is killed
    /// and the connection is no longer trusted.
    async fn abandon(&mut self, ctx: &RequestContext, started: Instant) -> TabletError {
        self.closed = true;
        if let Err(err) = self.killer.kill("context done", started.elapsed()).await {
            tracing::warn!(conn_id = self.killer.id, error = %err, "could not kill connection");
        }
        ctx_error(ctx)
    }
}

fn ctx_error(ctx: &RequestContext) -> TabletError {
    ctx.err()
        .unwrap_or_else(|| TabletError::new(Code::Canceled, "context canceled"))
}

/// Statements whose result is a row set rather than an affected-row count.
fn returns_rows(sql: &str) -> bool {
    let verb = crate::sql::statement_verb(sql).to_ascii_lowercase();
    matches!(
        verb.as_str(),
        "select" | "show" | "describe" | "desc" | "explain" | "with" | "values" | "table"
    )
}

async fn run(
    conn: &mut MySqlConnection,
    sql: &str,
    args: Vec<MySqlBindValue>,
) -> Result<QueryResult, sqlx::Error> {
    let rows = returns_rows(sql);
    if args.is_empty() {
        if rows {
            let fetched = (&mut *conn).fetch_all(sqlx::raw_sql(sql)).await?;
            return Ok(result_from_rows(&fetched));
        }
        let done = (&mut *conn).execute(sqlx::raw_sql(sql)).await?;
        return Ok(QueryResult {
            rows_affected: done.rows_affected(),
            insert_id: done.last_insert_id(),
            ..QueryResult::default()
        });
    }
    let mut query = sqlx::query(sql);
    for arg in args {
        query = query.bind(arg);
    }
    if rows {
        let fetched = (&mut *conn).fetch_all(query).await?;
        return Ok(result_from_rows(&fetched));
    }
    let done = (&mut *conn).execute(query).await?;
    Ok(QueryResult {
        rows_affected: done.rows_affected(),
        insert_id: done.last_insert_id(),
        ..QueryResult::default()
    })
}

async fn stream_rows(
    conn: &mut MySqlConnection,
    sql: &str,
    args: Vec<MySqlBindValue>,
    batch_size: usize,
    send: &mut SendFn<'_>,
) -> Result<(), TabletError> {
    let mut query = sqlx::query(sql);
    for arg in args {
        query = query.bind(arg);
    }
    let mut rows = query.fetch(&mut *conn);
    let mut sent_fields = false;
    let mut batch = Vec::with_capacity(batch_size);
    while let Some(row) = rows.try_next().await? {
        if !sent_fields {
            let fields = row.columns().iter().map(|c| sqlx::Column::name(c).to_string()).collect();
            send(QueryResult {
                fields,
                ..QueryResult::default()
            })?;
            sent_fields = true;
        }
        batch.push(row_to_values(&row));
        if batch.len() >= batch_size {
            send(QueryResult {
                rows: std::mem::take(&mut batch),
                ..QueryResult::default()
            })?;
        }
    }
    if !sent_fields {
        send(QueryResult::default())?;
    }
    if !batch.is_empty() {
        send(QueryResult {
            rows: batch,
            ..QueryResult::default()
        })?;
    }
    Ok(())
}

#[async_trait]
impl Resource for DbConn {
    async fn close(self) {
        if let Err(err) = self.conn.close().await {
            tracing::debug!(error = %err, "error closing connection");
        }
    }

    fn expired(&self, lifetime: Duration) -> bool {
        !lifetime.is_zero() && self.created.elapsed() > lifetime
    }

    async fn apply_setting(
        &mut self,
        ctx: &RequestContext,
        setting: &Setting,
    ) -> Result<(), TabletError> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        self.exec_text(setting.query()).await?;
        self.setting = Some(setting.clone());
        Ok(())
    }

    fn is_setting_applied(&self) -> bool {
        self.setting.is_some()
    }

    fn is_same_setting(&self, setting: &Setting) -> bool {
        self.setting
            .as_ref()
            .is_some_and(|s| s.query() == setting.query())
    }

    async fn reset_setting(&mut self, ctx: &RequestContext) -> Result<(), TabletError> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let reset = self
            .setting
            .as_ref()
            .map(|s| s.reset_query().to_string())
            .unwrap_or_default();
        self.exec_text(&reset).await?;
        self.setting = None;
        Ok(())
    }
}

#[async_trait]
impl DbConnection for DbConn {
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
        bind_vars: &BindVars,
    ) -> Result<QueryResult, TabletError> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let (sql, args) = bind_positional(sql, bind_vars)?;
        let started = Instant::now();
        self.killer.set_current(&sql);
        let outcome = tokio::select! {
            res = run(&mut self.conn, &sql, args) => Some(res),
            _ = ctx.done() => None,
        };
        self.killer.set_current("");
        match outcome {
            Some(Ok(result)) => Ok(result),
            Some(Err(err)) => {
                let err = TabletError::from(err);
                self.mark_if_broken(&err);
                Err(err)
            }
            None => Err(self.abandon(ctx, started).await),
        }
    }

    async fn stream(
        &mut self,
        ctx: &RequestContext,
        sql: &str,
        bind_vars: &BindVars,
        batch_size: usize,
        send: &mut SendFn<'_>,
    ) -> Result<(), TabletError> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let (sql, args) = bind_positional(sql, bind_vars)?;
        let started = Instant::now();
        self.killer.set_current(&sql);
        let outcome = tokio::select! {
            res = stream_rows(&mut self.conn, &sql, args, batch_size.max(1), send) => Some(res),
            _ = ctx.done() => None,
        };
        self.killer.set_current("");
        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(err)) => {
                self.mark_if_broken(&err);
                Err(err)
            }
            None => Err(self.abandon(ctx, started).await),
        }
    }
}

/// Opens [`DbConn`]s for the pools.
pub struct DbConnFactory {
    opts: MySqlConnectOptions,
}

impl DbConnFactory {
    pub fn new(db: &DbConfig) -> Self {
        DbConnFactory {
            opts: connect_options(db),
        }
    }
}

#[async_trait]
impl ResourceFactory<DbConn> for DbConnFactory {
    async fn create(&self, ctx: &RequestContext) -> Result<DbConn, TabletError> {
        DbConn::connect(ctx, &self.opts).await
    }
}
