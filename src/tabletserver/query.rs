//! Query RPCs. Every call goes through [`TabletServer::exec_request`].

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use super::envelope::{build_conn_setting, smaller_timeout, EndRequest, Request};
use super::TabletServer;
use crate::acl::Role;
use crate::context::RequestContext;
use crate::engine::DbConnection;
use crate::error::{Code, TabletError};
use crate::lifecycle::SendFn;
use crate::sql::{BindVars, QueryResult};
use crate::state_manager::{QueryDetail, QueryList};
use crate::target::{ExecuteOptions, Target, Workload};

/// Rows per batch handed to a streaming callback.
const STREAM_BATCH_ROWS: usize = 256;

const HEALTH_QUERY: &str = "/* health */ select 1 from dual";

/// Connection ids a session holds after a call. Zero means none.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TransactionState {
    pub transaction_id: i64,
    pub reserved_id: i64,
}

/// Result of a call that opens a session and then runs a statement. The ids
/// are filled in even when the statement fails so the caller can end the
/// session.
#[derive(Debug)]
pub struct ExecuteOutcome<T = QueryResult> {
    pub state: TransactionState,
    pub result: Result<T, TabletError>,
}

impl<T> ExecuteOutcome<T> {
    fn failed(state: TransactionState, err: TabletError) -> Self {
        ExecuteOutcome {
            state,
            result: Err(err),
        }
    }

    pub fn into_result(self) -> Result<(TransactionState, T), TabletError> {
        let state = self.state;
        self.result.map(|v| (state, v))
    }
}

/// Removes a query from its list when the statement finishes or unwinds.
struct Tracked<'a> {
    list: &'a QueryList,
    conn_id: i64,
}

impl<'a> Tracked<'a> {
    fn new(list: &'a QueryList, detail: QueryDetail) -> Self {
        let conn_id = detail.conn_id();
        list.add(detail);
        Tracked { list, conn_id }
    }
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        self.list.remove(self.conn_id);
    }
}

fn two_pc_disabled() -> TabletError {
    TabletError::new(Code::FailedPrecondition, "2pc is not enabled")
}

impl<C: DbConnection> TabletServer<C> {
    /// Starts a transaction. Returns its id.
    pub async fn begin(
        &self,
        ctx: &RequestContext,
        target: &Target,
        options: &ExecuteOptions,
    ) -> Result<i64, TabletError> {
        self.begin_with(ctx, target, &[], 0, options).await
    }

    async fn begin_with(
        &self,
        ctx: &RequestContext,
        target: &Target,
        savepoint_queries: &[String],
        reserved_id: i64,
        options: &ExecuteOptions,
    ) -> Result<i64, TabletError> {
        let req = Request {
            name: "Begin",
            sql: "begin",
            bind_vars: None,
            target: Some(target),
            options: Some(options),
            timeout: self.query_timeout(Some(options)),
            allow_on_shutdown: false,
        };
        self.exec_request(ctx, req, |ctx, log_stats| async move {
            if self.tx_throttler.throttle() {
                return Err(TabletError::new(Code::ResourceExhausted, "Transaction throttled"));
            }
            let setting = if reserved_id == 0 {
                build_conn_setting(&target.keyspace, &self.config.db.db_name, options)
            } else {
                None
            };
            let (id, begin_sql) = self
                .te
                .begin(&ctx, reserved_id, setting.as_ref(), savepoint_queries, options)
                .await?;
            log_stats.set_ids(id, reserved_id);
            if begin_sql.is_empty() {
                log_stats.set_method("");
            }
            Ok(id)
        })
        .await
    }

    /// Commits transaction `transaction_id`. Returns the id that stays
    /// reserved, or zero when the connection went back to the pool.
    pub async fn commit(
        &self,
        ctx: &RequestContext,
        target: &Target,
        transaction_id: i64,
    ) -> Result<i64, TabletError> {
        self.finish_tx(ctx, target, transaction_id, "Commit", "commit").await
    }

    pub async fn rollback(
        &self,
        ctx: &RequestContext,
        target: &Target,
        transaction_id: i64,
    ) -> Result<i64, TabletError> {
        self.finish_tx(ctx, target, transaction_id, "Rollback", "rollback").await
    }

    async fn finish_tx(
        &self,
        ctx: &RequestContext,
        target: &Target,
        transaction_id: i64,
        name: &'static str,
        sql: &'static str,
    ) -> Result<i64, TabletError> {
        let req = Request {
            name,
            sql,
            bind_vars: None,
            target: Some(target),
            options: None,
            timeout: self.query_timeout(None),
            allow_on_shutdown: true,
        };
        self.exec_request(ctx, req, |ctx, log_stats| async move {
            let (reserved_id, sent) = if name == "Commit" {
                self.te.commit(&ctx, transaction_id).await?
            } else {
                self.te.rollback(&ctx, transaction_id).await?
            };
            log_stats.set_ids(transaction_id, reserved_id);
            if sent.is_empty() {
                log_stats.set_method("");
            }
            Ok(reserved_id)
        })
        .await
    }

    /// Runs one statement, inside the session named by the ids when either is
    /// set and on a pooled connection otherwise.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        ctx: &RequestContext,
        target: Option<&Target>,
        sql: &str,
        bind_vars: &BindVars,
        transaction_id: i64,
        reserved_id: i64,
        options: &ExecuteOptions,
    ) -> Result<QueryResult, TabletError> {
        check_session_ids(transaction_id, reserved_id)?;
        let req = Request {
            name: "Execute",
            sql,
            bind_vars: Some(bind_vars),
            target,
            options: Some(options),
            timeout: self.query_timeout_in_tx(transaction_id, Some(options)),
            allow_on_shutdown: transaction_id != 0,
        };
        self.exec_request(ctx, req, |ctx, log_stats| async move {
            log_stats.set_ids(transaction_id, reserved_id);
            let conn_id = if transaction_id != 0 {
                transaction_id
            } else {
                reserved_id
            };
            let qr = if conn_id != 0 {
                let mut lent = self.te.lend(conn_id)?;
                let result = {
                    let _tracked =
                        Tracked::new(self.sm.stateful_queries(), QueryDetail::new(lent.killer()));
                    lent.exec(&ctx, sql, bind_vars).await
                };
                self.te.unlock(lent).await;
                result?
            } else {
                let keyspace = target.map(|t| t.keyspace.as_str()).unwrap_or("");
                let setting = build_conn_setting(keyspace, &self.config.db.db_name, options);
                let mut conn = self.qe.get_conn(&ctx, setting.as_ref()).await?;
                let list: &Arc<QueryList> = if options.workload == Workload::Olap {
                    self.sm.olap_queries()
                } else {
                    self.sm.stateless_queries()
                };
                let result = {
                    let _tracked = Tracked::new(list, QueryDetail::new(conn.killer()));
                    conn.exec(&ctx, sql, bind_vars).await
                };
                if conn.is_closed() {
                    conn.discard().await;
                } else {
                    conn.recycle().await;
                }
                result?
            };
            log_stats.set_rows(qr.rows_affected, qr.rows.len());
            Ok(qr)
        })
        .await
    }

    /// Streams the rows of one statement to `send`: field names first, then
    /// batches of rows.
    #[allow(clippy::too_many_arguments)]
    pub async fn stream_execute(
        &self,
        ctx: &RequestContext,
        target: &Target,
        sql: &str,
        bind_vars: &BindVars,
        transaction_id: i64,
        reserved_id: i64,
        options: &ExecuteOptions,
        send: &mut SendFn<'_>,
    ) -> Result<(), TabletError> {
        check_session_ids(transaction_id, reserved_id)?;
        let timeout = if transaction_id != 0 {
            self.config.tx_timeout_for(Workload::Olap)
        } else {
            std::time::Duration::ZERO
        };
        let req = Request {
            name: "StreamExecute",
            sql,
            bind_vars: Some(bind_vars),
            target: Some(target),
            options: Some(options),
            timeout,
            allow_on_shutdown: transaction_id != 0,
        };
        self.exec_request(ctx, req, |ctx, log_stats| async move {
            log_stats.set_ids(transaction_id, reserved_id);
            let mut rows = 0usize;
            let mut counting = |qr: QueryResult| {
                rows += qr.rows.len();
                send(qr)
            };
            let conn_id = if transaction_id != 0 {
                transaction_id
            } else {
                reserved_id
            };
            let result = if conn_id != 0 {
                let mut lent = self.te.lend(conn_id)?;
                let result = {
                    let _tracked =
                        Tracked::new(self.sm.stateful_queries(), QueryDetail::new(lent.killer()));
                    lent.stream(&ctx, sql, bind_vars, STREAM_BATCH_ROWS, &mut counting)
                        .await
                };
                self.te.unlock(lent).await;
                result
            } else {
                let setting =
                    build_conn_setting(&target.keyspace, &self.config.db.db_name, options);
                let mut conn = self.qe.get_stream_conn(&ctx, setting.as_ref()).await?;
                let result = {
                    let _tracked =
                        Tracked::new(self.sm.olap_queries(), QueryDetail::new(conn.killer()));
                    conn.stream(&ctx, sql, bind_vars, STREAM_BATCH_ROWS, &mut counting)
                        .await
                };
                if conn.is_closed() {
                    conn.discard().await;
                } else {
                    conn.recycle().await;
                }
                result
            };
            log_stats.set_rows(0, rows);
            result
        })
        .await
    }

    /// Begins a transaction, runs `savepoint_queries` inside it, then runs `sql`.
    #[allow(clippy::too_many_arguments)]
    pub async fn begin_execute(
        &self,
        ctx: &RequestContext,
        target: &Target,
        savepoint_queries: &[String],
        sql: &str,
        bind_vars: &BindVars,
        reserved_id: i64,
        options: &ExecuteOptions,
    ) -> ExecuteOutcome {
        let transaction_id = match self
            .begin_with(ctx, target, savepoint_queries, reserved_id, options)
            .await
        {
            Ok(id) => id,
            Err(err) => return ExecuteOutcome::failed(TransactionState::default(), err),
        };
        let state = TransactionState {
            transaction_id,
            reserved_id,
        };
        let result = self
            .execute(ctx, Some(target), sql, bind_vars, transaction_id, reserved_id, options)
            .await;
        ExecuteOutcome { state, result }
    }

    /// Streaming form of [`begin_execute`](Self::begin_execute).
    #[allow(clippy::too_many_arguments)]
    pub async fn begin_stream_execute(
        &self,
        ctx: &RequestContext,
        target: &Target,
        savepoint_queries: &[String],
        sql: &str,
        bind_vars: &BindVars,
        reserved_id: i64,
        options: &ExecuteOptions,
        send: &mut SendFn<'_>,
    ) -> ExecuteOutcome<()> {
        let transaction_id = match self
            .begin_with(ctx, target, savepoint_queries, reserved_id, options)
            .await
        {
            Ok(id) => id,
            Err(err) => return ExecuteOutcome::failed(TransactionState::default(), err),
        };
        let state = TransactionState {
            transaction_id,
            reserved_id,
        };
        let result = self
            .stream_execute(ctx, target, sql, bind_vars, transaction_id, reserved_id, options, send)
            .await;
        ExecuteOutcome { state, result }
    }

    #[allow(clippy::too_many_arguments)]
    async fn reserve_with(
        &self,
        ctx: &RequestContext,
        target: &Target,
        pre_queries: &[String],
        sql: &str,
        bind_vars: &BindVars,
        transaction_id: i64,
        options: &ExecuteOptions,
        name: &'static str,
    ) -> Result<i64, TabletError> {
        let mut timeout = self.query_timeout(Some(options));
        if transaction_id != 0 {
            timeout = smaller_timeout(timeout, self.config.tx_timeout_for(Workload::Oltp));
        }
        let req = Request {
            name,
            sql,
            bind_vars: Some(bind_vars),
            target: Some(target),
            options: Some(options),
            timeout,
            allow_on_shutdown: transaction_id != 0,
        };
        self.exec_request(ctx, req, |ctx, log_stats| async move {
            let setting = if transaction_id == 0 {
                build_conn_setting(&target.keyspace, &self.config.db.db_name, options)
            } else {
                None
            };
            let reserved_id = self
                .te
                .reserve(&ctx, options, transaction_id, pre_queries, setting.as_ref())
                .await?;
            log_stats.set_ids(transaction_id, reserved_id);
            Ok(reserved_id)
        })
        .await
    }

    /// Reserves a connection, running `pre_queries` on it, then runs `sql`.
    /// With a `transaction_id` the transaction's own connection is reserved.
    #[allow(clippy::too_many_arguments)]
    pub async fn reserve_execute(
        &self,
        ctx: &RequestContext,
        target: &Target,
        pre_queries: &[String],
        sql: &str,
        bind_vars: &BindVars,
        transaction_id: i64,
        options: &ExecuteOptions,
    ) -> ExecuteOutcome {
        let reserved_id = match self
            .reserve_with(ctx, target, pre_queries, sql, bind_vars, transaction_id, options, "ReserveExecute")
            .await
        {
            Ok(id) => id,
            Err(err) => return ExecuteOutcome::failed(TransactionState::default(), err),
        };
        let state = TransactionState {
            transaction_id,
            reserved_id,
        };
        let result = self
            .execute(ctx, Some(target), sql, bind_vars, transaction_id, reserved_id, options)
            .await;
        ExecuteOutcome { state, result }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn reserve_stream_execute(
        &self,
        ctx: &RequestContext,
        target: &Target,
        pre_queries: &[String],
        sql: &str,
        bind_vars: &BindVars,
        transaction_id: i64,
        options: &ExecuteOptions,
        send: &mut SendFn<'_>,
    ) -> ExecuteOutcome<()> {
        let reserved_id = match self
            .reserve_with(ctx, target, pre_queries, sql, bind_vars, transaction_id, options, "ReserveStreamExecute")
            .await
        {
            Ok(id) => id,
            Err(err) => return ExecuteOutcome::failed(TransactionState::default(), err),
        };
        let state = TransactionState {
            transaction_id,
            reserved_id,
        };
        let result = self
            .stream_execute(ctx, target, sql, bind_vars, transaction_id, reserved_id, options, send)
            .await;
        ExecuteOutcome { state, result }
    }

    async fn reserve_begin_with(
        &self,
        ctx: &RequestContext,
        target: &Target,
        pre_queries: &[String],
        post_begin_queries: &[String],
        options: &ExecuteOptions,
        name: &'static str,
    ) -> Result<i64, TabletError> {
        let req = Request {
            name,
            sql: "begin",
            bind_vars: None,
            target: Some(target),
            options: Some(options),
            timeout: self.query_timeout(Some(options)),
            allow_on_shutdown: false,
        };
        self.exec_request(ctx, req, |ctx, log_stats| async move {
            let setting = build_conn_setting(&target.keyspace, &self.config.db.db_name, options);
            let (id, _) = self
                .te
                .reserve_begin(&ctx, options, pre_queries, post_begin_queries, setting.as_ref())
                .await?;
            log_stats.set_ids(id, id);
            Ok(id)
        })
        .await
    }

    /// Reserves a connection, begins a transaction on it, then runs `sql`.
    /// The transaction and reserved ids are the same.
    #[allow(clippy::too_many_arguments)]
    pub async fn reserve_begin_execute(
        &self,
        ctx: &RequestContext,
        target: &Target,
        pre_queries: &[String],
        post_begin_queries: &[String],
        sql: &str,
        bind_vars: &BindVars,
        options: &ExecuteOptions,
    ) -> ExecuteOutcome {
        let id = match self
            .reserve_begin_with(ctx, target, pre_queries, post_begin_queries, options, "ReserveBeginExecute")
            .await
        {
            Ok(id) => id,
            Err(err) => return ExecuteOutcome::failed(TransactionState::default(), err),
        };
        let state = TransactionState {
            transaction_id: id,
            reserved_id: id,
        };
        let result = self
            .execute(ctx, Some(target), sql, bind_vars, id, id, options)
            .await;
        ExecuteOutcome { state, result }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn reserve_begin_stream_execute(
        &self,
        ctx: &RequestContext,
        target: &Target,
        pre_queries: &[String],
        post_begin_queries: &[String],
        sql: &str,
        bind_vars: &BindVars,
        options: &ExecuteOptions,
        send: &mut SendFn<'_>,
    ) -> ExecuteOutcome<()> {
        let id = match self
            .reserve_begin_with(
                ctx,
                target,
                pre_queries,
                post_begin_queries,
                options,
                "ReserveBeginStreamExecute",
            )
            .await
        {
            Ok(id) => id,
            Err(err) => return ExecuteOutcome::failed(TransactionState::default(), err),
        };
        let state = TransactionState {
            transaction_id: id,
            reserved_id: id,
        };
        let result = self
            .stream_execute(ctx, target, sql, bind_vars, id, id, options, send)
            .await;
        ExecuteOutcome { state, result }
    }

    /// Ends a session. A reserved connection is closed; a plain transaction is
    /// rolled back and its connection returned to the pool.
    pub async fn release(
        &self,
        ctx: &RequestContext,
        target: &Target,
        transaction_id: i64,
        reserved_id: i64,
    ) -> Result<(), TabletError> {
        if transaction_id == 0 && reserved_id == 0 {
            return Err(TabletError::new(
                Code::InvalidArgument,
                "connection ID and transaction ID do not exist",
            ));
        }
        let req = Request {
            name: "Release",
            sql: "",
            bind_vars: None,
            target: Some(target),
            options: None,
            timeout: self.query_timeout(None),
            allow_on_shutdown: true,
        };
        self.exec_request(ctx, req, |ctx, log_stats| async move {
            log_stats.set_ids(transaction_id, reserved_id);
            if reserved_id != 0 {
                return self.te.release(&ctx, reserved_id).await;
            }
            self.te.rollback(&ctx, transaction_id).await.map(|_| ())
        })
        .await
    }

    async fn two_pc(&self, ctx: &RequestContext, target: &Target, name: &'static str) -> Result<(), TabletError> {
        let req = Request {
            name,
            sql: "",
            bind_vars: None,
            target: Some(target),
            options: None,
            timeout: self.query_timeout(None),
            allow_on_shutdown: true,
        };
        self.exec_request(ctx, req, |_, _| async { Err(two_pc_disabled()) })
            .await
    }

    pub async fn prepare(&self, ctx: &RequestContext, target: &Target, _transaction_id: i64, _dtid: &str) -> Result<(), TabletError> {
        self.two_pc(ctx, target, "Prepare").await
    }

    pub async fn commit_prepared(&self, ctx: &RequestContext, target: &Target, _dtid: &str) -> Result<(), TabletError> {
        self.two_pc(ctx, target, "CommitPrepared").await
    }

    pub async fn rollback_prepared(
        &self,
        ctx: &RequestContext,
        target: &Target,
        _dtid: &str,
        _original_id: i64,
    ) -> Result<(), TabletError> {
        self.two_pc(ctx, target, "RollbackPrepared").await
    }

    pub async fn create_transaction(
        &self,
        ctx: &RequestContext,
        target: &Target,
        _dtid: &str,
        _participants: &[Target],
    ) -> Result<(), TabletError> {
        self.two_pc(ctx, target, "CreateTransaction").await
    }

    pub async fn start_commit(&self, ctx: &RequestContext, target: &Target, _transaction_id: i64, _dtid: &str) -> Result<(), TabletError> {
        self.two_pc(ctx, target, "StartCommit").await
    }

    pub async fn set_rollback(&self, ctx: &RequestContext, target: &Target, _dtid: &str, _transaction_id: i64) -> Result<(), TabletError> {
        self.two_pc(ctx, target, "SetRollback").await
    }

    pub async fn conclude_transaction(&self, ctx: &RequestContext, target: &Target, _dtid: &str) -> Result<(), TabletError> {
        self.two_pc(ctx, target, "ConcludeTransaction").await
    }

    pub async fn read_transaction(&self, ctx: &RequestContext, target: &Target, _dtid: &str) -> Result<(), TabletError> {
        self.two_pc(ctx, target, "ReadTransaction").await
    }

    /// Streams messages from message table `name`.
    pub async fn message_stream(
        &self,
        ctx: &RequestContext,
        target: &Target,
        name: &str,
        send: &mut SendFn<'_>,
    ) -> Result<(), TabletError> {
        let req = Request {
            name: "MessageStream",
            sql: "stream",
            bind_vars: None,
            target: Some(target),
            options: None,
            timeout: std::time::Duration::ZERO,
            allow_on_shutdown: false,
        };
        self.exec_request(ctx, req, |ctx, _| async move {
            self.acl.check(name, Role::Reader, ctx.caller())?;
            self.messager.stream(&ctx, name, send).await
        })
        .await
    }

    /// Acknowledges messages `ids` of `name`. Returns how many rows changed.
    pub async fn message_ack(
        &self,
        ctx: &RequestContext,
        target: &Target,
        name: &str,
        ids: &[String],
    ) -> Result<u64, TabletError> {
        self.acl.check(name, Role::Writer, ctx.caller())?;
        self.exec_dml(ctx, target, || self.messager.generate_ack_query(name, ids))
            .await
    }

    /// Deletes acknowledged messages of `name` older than `time_cutoff` (unix nanos).
    pub async fn purge_messages(
        &self,
        ctx: &RequestContext,
        target: &Target,
        name: &str,
        time_cutoff: i64,
    ) -> Result<u64, TabletError> {
        self.acl.check(name, Role::Writer, ctx.caller())?;
        self.exec_dml(ctx, target, || self.messager.generate_purge_query(name, time_cutoff))
            .await
    }

    /// Runs one generated DML statement in its own transaction. The
    /// transaction is rolled back if the statement or the commit fails.
    async fn exec_dml<G>(&self, ctx: &RequestContext, target: &Target, generate: G) -> Result<u64, TabletError>
    where
        G: FnOnce() -> Result<(String, BindVars), TabletError>,
    {
        self.sm.start_request(ctx, Some(target), false)?;
        let _end = EndRequest(self);

        let (sql, bind_vars) = generate()?;
        let options = ExecuteOptions::default();
        let transaction_id = self.begin(ctx, target, &options).await?;
        let qr = match self
            .execute(ctx, Some(target), &sql, &bind_vars, transaction_id, 0, &options)
            .await
        {
            Ok(qr) => qr,
            Err(err) => {
                if let Err(rollback_err) = self.rollback(ctx, target, transaction_id).await {
                    tracing::warn!(transaction_id, error = %rollback_err, "rollback after failed dml");
                }
                return Err(err);
            }
        };
        self.commit(ctx, target, transaction_id).await?;
        Ok(qr.rows_affected)
    }

    /// Table definitions keyed by name. An empty list means every table the
    /// caller may read.
    pub async fn get_schema(
        &self,
        ctx: &RequestContext,
        target: &Target,
        tables: &[String],
    ) -> Result<HashMap<String, String>, TabletError> {
        let req = Request {
            name: "GetSchema",
            sql: "",
            bind_vars: None,
            target: Some(target),
            options: None,
            timeout: self.query_timeout(None),
            allow_on_shutdown: false,
        };
        self.exec_request(ctx, req, |ctx, _| async move {
            for table in tables {
                self.acl.check(table, Role::Reader, ctx.caller())?;
            }
            let mut schema = self.se.get_schema(tables).await?;
            if tables.is_empty() {
                schema.retain(|table, _| self.acl.check(table, Role::Reader, ctx.caller()).is_ok());
            }
            Ok(schema)
        })
        .await
    }

    /// Hands a DML statement to the background job controller.
    pub async fn submit_dml_job(
        &self,
        ctx: &RequestContext,
        target: &Target,
        sql: &str,
        job_options: &serde_json::Value,
    ) -> Result<QueryResult, TabletError> {
        let req = Request {
            name: "SubmitDMLJob",
            sql,
            bind_vars: None,
            target: Some(target),
            options: None,
            timeout: self.query_timeout(None),
            allow_on_shutdown: false,
        };
        self.exec_request(ctx, req, |ctx, _| async move {
            self.dml_job_controller.submit(&ctx, sql, job_options).await
        })
        .await
    }

    /// Runs a trivial query when the tablet serves traffic.
    pub async fn is_healthy(&self) -> Result<(), TabletError> {
        if !self.sm.target().tablet_type.is_serving_type() {
            return Ok(());
        }
        self.execute(
            &RequestContext::local(),
            None,
            HEALTH_QUERY,
            &BindVars::new(),
            0,
            0,
            &ExecuteOptions::default(),
        )
        .await
        .map(|_| ())
    }
}

fn check_session_ids(transaction_id: i64, reserved_id: i64) -> Result<(), TabletError> {
    if transaction_id != 0 && reserved_id != 0 && transaction_id != reserved_id {
        return Err(TabletError::new(
            Code::Internal,
            "[BUG] transactionID and reserveID must match if both are non-zero",
        ));
    }
    Ok(())
}
