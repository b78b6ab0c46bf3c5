//! Replication tracker. Reads lag from `SHOW REPLICA STATUS`; a primary has none.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlRow};
use sqlx::{ConnectOptions, Connection, Row};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::dbconn::connect_options;
use crate::config::DbConfig;
use crate::error::{Code, TabletError};
use crate::lifecycle::{ReplControl, RoleAware};

pub struct ReplTracker {
    opts: MySqlConnectOptions,
    is_primary: AtomicBool,
}

impl ReplTracker {
    pub fn new(db: &DbConfig) -> Self {
        ReplTracker {
            opts: connect_options(db),
            is_primary: AtomicBool::new(false),
        }
    }
}

fn not_replicating() -> TabletError {
    TabletError::new(Code::Unavailable, "replication is not running")
}

/// `Seconds_Behind_Source` on MySQL 8.0.22+, `Seconds_Behind_Master` before.
fn lag_from_row(row: &MySqlRow) -> Result<Duration, TabletError> {
    let seconds: Option<u64> = row
        .try_get("Seconds_Behind_Source")
        .or_else(|_| row.try_get("Seconds_Behind_Master"))?;
    lag_from_seconds(seconds)
}

fn lag_from_seconds(seconds: Option<u64>) -> Result<Duration, TabletError> {
    seconds.map(Duration::from_secs).ok_or_else(not_replicating)
}

#[async_trait]
impl RoleAware for ReplTracker {
    async fn make_primary(&self) {
        self.is_primary.store(true, Ordering::SeqCst);
    }

    async fn make_non_primary(&self) {
        self.is_primary.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReplControl for ReplTracker {
    async fn close(&self) {}

    async fn status(&self) -> Result<Duration, TabletError> {
        if self.is_primary.load(Ordering::SeqCst) {
            return Ok(Duration::ZERO);
        }
        let mut conn = self.opts.connect().await?;
        let row = sqlx::query("show replica status")
            .fetch_optional(&mut conn)
            .await;
        let _ = conn.close().await;
        match row? {
            Some(row) => lag_from_row(&row),
            None => Err(not_replicating()),
        }
    }
}
