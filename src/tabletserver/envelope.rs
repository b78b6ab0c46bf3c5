//! The request envelope every query RPC runs in: admission control, timeout,
//! panic recovery, error conversion and the query log.

use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing::Instrument;

use super::{LogStats, TabletServer};
use crate::context::RequestContext;
use crate::engine::DbConnection;
use crate::error::{Code, TabletError};
use crate::pools::Setting;
use crate::sql::{quote_identifier, statement_verb, BindVars};
use crate::target::{ExecuteOptions, Target, Workload};

thread_local! {
    static LAST_PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Keeps the backtrace of the most recent panic on this thread so the
/// envelope can attach it to the converted error.
fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            LAST_PANIC_TRACE.with(|t| *t.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}

/// `Sql: "...", BindVars: {k: "v"}`, with bind variables redacted when `sanitize` is set.
pub fn query_as_string(sql: &str, bind_vars: Option<&BindVars>, sanitize: bool) -> String {
    format!("Sql: {:?}, {}", sql, bind_vars_text(bind_vars, sanitize, 0))
}

fn bind_vars_text(bind_vars: Option<&BindVars>, sanitize: bool, max_len: usize) -> String {
    let mut text = String::from("BindVars: {");
    match bind_vars {
        Some(bv) if !bv.is_empty() && sanitize => text.push_str("[REDACTED]"),
        Some(bv) => {
            let pairs: Vec<String> = bv
                .iter()
                .map(|(k, v)| format!("{}: {:?}", k, v.to_string()))
                .collect();
            text.push_str(&pairs.join(", "));
        }
        None => {}
    }
    text.push('}');
    truncate(text, max_len)
}

fn truncate(text: String, max_len: usize) -> String {
    const MARKER: &str = " [TRUNCATED]";
    if max_len == 0 || text.len() <= max_len || max_len <= MARKER.len() {
        return text;
    }
    let mut end = max_len - MARKER.len();
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &text[..end], MARKER)
}

/// Log form of a statement: both halves are cut to `max_len`.
fn truncated_query(sql: &str, bind_vars: Option<&BindVars>, sanitize: bool, max_len: usize) -> String {
    format!(
        "Sql: {:?}, {}",
        truncate(sql.to_string(), max_len),
        bind_vars_text(bind_vars, sanitize, max_len)
    )
}

/// Session setting that points a pooled connection at the target keyspace.
/// Empty when the keyspace is the tablet's own database or `skip_use` is set.
pub fn build_conn_setting(keyspace: &str, db_name: &str, options: &ExecuteOptions) -> Option<Setting> {
    if keyspace.is_empty() {
        return Some(Setting::default().without_db_name());
    }
    if options.skip_use || keyspace == db_name {
        return None;
    }
    Some(Setting::new(
        format!("use {}", quote_identifier(keyspace)),
        format!("use {}", quote_identifier(db_name)),
    ))
}

/// Zero means no limit, so it never wins.
pub(crate) fn smaller_timeout(a: Duration, b: Duration) -> Duration {
    match (a.is_zero(), b.is_zero()) {
        (true, _) => b,
        (_, true) => a,
        _ => a.min(b),
    }
}

/// Ends the request even when the closure panics.
pub(crate) struct EndRequest<'a, C: DbConnection>(pub(crate) &'a TabletServer<C>);

impl<C: DbConnection> Drop for EndRequest<'_, C> {
    fn drop(&mut self) {
        self.0.sm.end_request();
    }
}

/// Describes one envelope invocation.
pub(crate) struct Request<'a> {
    pub name: &'static str,
    pub sql: &'a str,
    pub bind_vars: Option<&'a BindVars>,
    pub target: Option<&'a Target>,
    pub options: Option<&'a ExecuteOptions>,
    pub timeout: Duration,
    pub allow_on_shutdown: bool,
}

impl<C: DbConnection> TabletServer<C> {
    pub(crate) fn query_timeout(&self, options: Option<&ExecuteOptions>) -> Duration {
        match options.map(|o| o.workload) {
            Some(Workload::Olap) => self.config.olap.query_timeout,
            _ => self.config.oltp.query_timeout,
        }
    }

    /// Query timeout, capped by the transaction timeout when running inside one.
    pub(crate) fn query_timeout_in_tx(&self, tx_id: i64, options: Option<&ExecuteOptions>) -> Duration {
        let query = self.query_timeout(options);
        if tx_id == 0 {
            return query;
        }
        let workload = options.map(|o| o.workload).unwrap_or_default();
        smaller_timeout(query, self.config.tx_timeout_for(workload))
    }

    fn with_timeout(ctx: &RequestContext, timeout: Duration, options: Option<&ExecuteOptions>) -> RequestContext {
        let dba = options.is_some_and(|o| o.workload == Workload::Dba);
        if timeout.is_zero() || dba || ctx.is_local() {
            return ctx.clone();
        }
        ctx.with_timeout(timeout)
    }

    /// Runs `exec` inside the envelope. Admission errors come back unchanged;
    /// everything else is converted, counted and logged.
    pub(crate) async fn exec_request<'a, T, F, Fut>(
        &'a self,
        ctx: &RequestContext,
        req: Request<'a>,
        exec: F,
    ) -> Result<T, TabletError>
    where
        F: FnOnce(RequestContext, Arc<LogStats>) -> Fut,
        Fut: Future<Output = Result<T, TabletError>>,
    {
        install_panic_hook();
        let target = req.target.cloned().unwrap_or_default();
        let span = tracing::info_span!(
            "TabletServer",
            method = req.name,
            keyspace = %target.keyspace,
            shard = %target.shard,
            cell = %target.cell,
            sql = statement_verb(req.sql),
        );
        let log_stats = Arc::new(LogStats::new(req.name, req.sql, req.bind_vars, ctx.caller()));

        self.sm.start_request(ctx, req.target, req.allow_on_shutdown)?;
        let _end = EndRequest(self);

        let ctx = Self::with_timeout(ctx, req.timeout, req.options);
        let outcome = AssertUnwindSafe(exec(ctx.clone(), log_stats.clone()))
            .catch_unwind()
            .instrument(span)
            .await;
        let result = match outcome {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(err)) => Err(self.convert_and_log_error(&ctx, req.sql, req.bind_vars, err, &log_stats)),
            Err(payload) => Err(self.handle_panic(payload.as_ref(), req.sql, req.bind_vars, &log_stats)),
        };
        self.stats.record_timing(req.name, log_stats.elapsed());
        log_stats.send(self.config.sanitize_log_messages);
        result
    }

    fn handle_panic(
        &self,
        payload: &(dyn Any + Send),
        sql: &str,
        bind_vars: Option<&BindVars>,
        log_stats: &LogStats,
    ) -> TabletError {
        let trace = LAST_PANIC_TRACE
            .with(|t| t.borrow_mut().take())
            .unwrap_or_default();
        let message = panic_message(payload);
        let format_for = |sanitize: bool| {
            format!(
                "Uncaught panic for {}:\n{}\n{}",
                query_as_string(sql, bind_vars, sanitize),
                message,
                trace
            )
        };
        let err = TabletError::new(Code::Internal, format_for(self.config.terse_errors));
        if self.config.terse_errors == self.config.sanitize_log_messages {
            tracing::error!("{}", err);
        } else {
            tracing::error!("{}", format_for(self.config.sanitize_log_messages));
        }
        self.stats.count_internal("Panic");
        log_stats.set_error(&err);
        err
    }

    /// Maps `err` to its status code, strips MySQL text in terse mode and logs
    /// at a level chosen by the code.
    pub(crate) fn convert_and_log_error(
        &self,
        ctx: &RequestContext,
        sql: &str,
        bind_vars: Option<&BindVars>,
        err: TabletError,
        log_stats: &LogStats,
    ) -> TabletError {
        let code = err.code();
        self.stats.count_error(code);

        if err.as_sql().is_some_and(|e| e.suggests_mysql_down()) {
            self.sm.check_mysql();
        }

        let caller = ctx
            .caller()
            .map(|c| format!(" (CallerID: {})", c))
            .unwrap_or_default();
        let sanitize = self.config.sanitize_log_messages;
        let max_len = self.config.truncate_error_len;
        let (converted, log_message) = match err.as_sql() {
            Some(sql_err) if self.config.terse_errors && code != Code::FailedPrecondition => (
                TabletError::new(
                    code,
                    format!(
                        "(errno {}) (sqlstate {}){}: {}",
                        sql_err.number,
                        sql_err.state,
                        caller,
                        query_as_string(sql, bind_vars, true)
                    ),
                ),
                format!(
                    "(errno {}) (sqlstate {}){}: {}",
                    sql_err.number,
                    sql_err.state,
                    caller,
                    truncated_query(sql, bind_vars, sanitize, max_len)
                ),
            ),
            Some(sql_err) => (
                TabletError::new(
                    code,
                    format!(
                        "{} (errno {}) (sqlstate {}){}: {}",
                        sql_err.message,
                        sql_err.number,
                        sql_err.state,
                        caller,
                        query_as_string(sql, bind_vars, false)
                    ),
                ),
                format!(
                    "{} (errno {}) (sqlstate {}){}: {}",
                    sql_err.message,
                    sql_err.number,
                    sql_err.state,
                    caller,
                    truncated_query(sql, bind_vars, sanitize, max_len)
                ),
            ),
            None => {
                let converted = TabletError::new(code, format!("{}{}", err, caller));
                let log_message = format!(
                    "{}: {}",
                    converted,
                    truncated_query(sql, bind_vars, sanitize, max_len)
                );
                (converted, log_message)
            }
        };

        match code {
            Code::FailedPrecondition | Code::AlreadyExists => {}
            Code::ResourceExhausted => {
                self.pool_full_log.warn(&log_message);
            }
            Code::Aborted => tracing::warn!("{}", log_message),
            Code::InvalidArgument | Code::DeadlineExceeded => tracing::info!("{}", log_message),
            _ => tracing::error!("{}", log_message),
        }
        log_stats.set_error(&converted);
        converted
    }
}
