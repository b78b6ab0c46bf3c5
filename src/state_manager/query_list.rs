//! In-flight queries of one request class, so a drain can kill them.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::TabletError;

/// A connection that can be asked to abort its current statement.
#[async_trait]
pub trait Killable: Send + Sync {
    fn id(&self) -> i64;
    /// Statement currently running, if any.
    fn current(&self) -> String;
    async fn kill(&self, reason: &str, elapsed: Duration) -> Result<(), TabletError>;
}

#[derive(Clone)]
pub struct QueryDetail {
    conn: Arc<dyn Killable>,
    conn_id: i64,
    start: Instant,
}

impl QueryDetail {
    pub fn new(conn: Arc<dyn Killable>) -> Self {
        let conn_id = conn.id();
        QueryDetail {
            conn,
            conn_id,
            start: Instant::now(),
        }
    }

    pub fn conn_id(&self) -> i64 {
        self.conn_id
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct QueryDetailView {
    pub conn_id: i64,
    pub query: String,
    pub duration_ms: u64,
}

pub struct QueryList {
    name: &'static str,
    details: Mutex<HashMap<i64, QueryDetail>>,
}

impl QueryList {
    pub fn new(name: &'static str) -> Self {
        QueryList {
            name,
            details: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, QueryDetail>> {
        self.details.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn add(&self, detail: QueryDetail) {
        self.lock().insert(detail.conn_id, detail);
    }

    pub fn remove(&self, conn_id: i64) {
        self.lock().remove(&conn_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kills the connection with `conn_id`. Returns false if it is not in the list.
    pub async fn terminate(&self, conn_id: i64) -> bool {
        let detail = self.lock().get(&conn_id).cloned();
        let Some(detail) = detail else {
            return false;
        };
        if let Err(err) = detail
            .conn
            .kill("QueryList.Terminate()", detail.start.elapsed())
            .await
        {
            tracing::warn!(list = self.name, conn_id, error = %err, "error killing query");
        }
        true
    }

    /// Kills every connection in the list.
    pub async fn terminate_all(&self) {
        let details: Vec<QueryDetail> = self.lock().values().cloned().collect();
        for detail in details {
            if let Err(err) = detail
                .conn
                .kill("QueryList.TerminateAll()", detail.start.elapsed())
                .await
            {
                tracing::warn!(
                    list = self.name,
                    conn_id = detail.conn_id,
                    error = %err,
                    "error killing query"
                );
            }
        }
    }

    /// Views sorted longest-running first.
    pub fn snapshot(&self) -> Vec<QueryDetailView> {
        let mut views: Vec<(Duration, QueryDetailView)> = self
            .lock()
            .values()
            .map(|d| {
                let elapsed = d.start.elapsed();
                (
                    elapsed,
                    QueryDetailView {
                        conn_id: d.conn_id,
                        query: d.conn.current(),
                        duration_ms: elapsed.as_millis() as u64,
                    },
                )
            })
            .collect();
        views.sort_by(|a, b| b.0.cmp(&a.0));
        views.into_iter().map(|(_, v)| v).collect()
    }
}
