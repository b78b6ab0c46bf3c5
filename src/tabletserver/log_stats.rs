//! One structured query-log record per request.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::TabletError;
use crate::sql::BindVars;

struct Record {
    method: String,
    transaction_id: i64,
    reserved_id: i64,
    rows_affected: u64,
    rows_returned: usize,
    error: Option<String>,
}

pub struct LogStats {
    sql: String,
    bind_vars: BindVars,
    caller: String,
    start: Instant,
    record: Mutex<Record>,
}

impl LogStats {
    pub fn new(method: &str, sql: &str, bind_vars: Option<&BindVars>, caller: Option<&str>) -> Self {
        LogStats {
            sql: sql.to_string(),
            bind_vars: bind_vars.cloned().unwrap_or_default(),
            caller: caller.unwrap_or_default().to_string(),
            start: Instant::now(),
            record: Mutex::new(Record {
                method: method.to_string(),
                transaction_id: 0,
                reserved_id: 0,
                rows_affected: 0,
                rows_returned: 0,
                error: None,
            }),
        }
    }

    fn record(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn method(&self) -> String {
        self.record().method.clone()
    }

    /// An empty method marks a no-op request whose record is not emitted.
    pub fn set_method(&self, method: &str) {
        self.record().method = method.to_string();
    }

    pub fn set_ids(&self, transaction_id: i64, reserved_id: i64) {
        let mut r = self.record();
        r.transaction_id = transaction_id;
        r.reserved_id = reserved_id;
    }

    pub fn set_rows(&self, rows_affected: u64, rows_returned: usize) {
        let mut r = self.record();
        r.rows_affected = rows_affected;
        r.rows_returned = rows_returned;
    }

    pub fn set_error(&self, err: &TabletError) {
        self.record().error = Some(err.to_string());
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Emits the record on the `querylog` target. Bind variables are redacted when `sanitize` is set.
    pub fn send(&self, sanitize: bool) {
        let r = self.record();
        if r.method.is_empty() {
            return;
        }
        let bind_vars = if sanitize && !self.bind_vars.is_empty() {
            "[REDACTED]".to_string()
        } else {
            serde_json::to_string(&self.bind_vars).unwrap_or_default()
        };
        tracing::info!(
            target: "querylog",
            method = %r.method,
            caller = %self.caller,
            sql = %self.sql,
            bind_vars = %bind_vars,
            transaction_id = r.transaction_id,
            reserved_id = r.reserved_id,
            rows_affected = r.rows_affected,
            rows_returned = r.rows_returned,
            elapsed = ?self.elapsed(),
            error = r.error.as_deref().unwrap_or(""),
        );
    }
}
