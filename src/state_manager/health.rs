//! Health streaming: every broadcast is fanned out to subscribed streams.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::context::RequestContext;
use crate::error::{Code, TabletError};
use crate::target::{TabletType, Target};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RealtimeStats {
    pub health_error: String,
    pub replication_lag_seconds: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StreamHealthResponse {
    pub target: Target,
    pub serving: bool,
    /// Unix seconds of the current primary term, zero when not primary.
    pub primary_term_start_timestamp: i64,
    pub realtime_stats: RealtimeStats,
}

struct Inner {
    sender: Option<broadcast::Sender<StreamHealthResponse>>,
    current: StreamHealthResponse,
}

pub struct HealthStreamer {
    inner: Mutex<Inner>,
}

impl HealthStreamer {
    pub fn new(target: Target) -> Self {
        HealthStreamer {
            inner: Mutex::new(Inner {
                sender: None,
                current: StreamHealthResponse {
                    target,
                    ..StreamHealthResponse::default()
                },
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open(&self) {
        let mut inner = self.lock();
        if inner.sender.is_none() {
            let (tx, _) = broadcast::channel(16);
            inner.sender = Some(tx);
        }
    }

    /// Ends every open stream with "tabletserver is shutdown".
    pub fn close(&self) {
        self.lock().sender = None;
    }

    pub fn init_target(&self, target: Target) {
        self.lock().current.target = target;
    }

    pub fn current(&self) -> StreamHealthResponse {
        self.lock().current.clone()
    }

    pub fn change_state(
        &self,
        target: &Target,
        ter_timestamp: Option<DateTime<Utc>>,
        lag: Duration,
        err: Option<&TabletError>,
        serving: bool,
    ) {
        let mut inner = self.lock();
        let current = &mut inner.current;
        current.target = target.clone();
        current.primary_term_start_timestamp = match (target.tablet_type, ter_timestamp) {
            (TabletType::Primary, Some(ts)) => ts.timestamp(),
            _ => 0,
        };
        current.serving = serving;
        current.realtime_stats.replication_lag_seconds = lag.as_secs();
        current.realtime_stats.health_error = err.map(|e| e.to_string()).unwrap_or_default();
        let snapshot = current.clone();
        if let Some(tx) = &inner.sender {
            // No subscribers is fine.
            let _ = tx.send(snapshot);
        }
    }

    /// Sends the current state, then every change, until `ctx` ends, the
    /// callback fails, or the streamer closes.
    pub async fn stream<F>(&self, ctx: &RequestContext, mut callback: F) -> Result<(), TabletError>
    where
        F: FnMut(StreamHealthResponse) -> Result<(), TabletError>,
    {
        let (mut rx, first) = {
            let inner = self.lock();
            match &inner.sender {
                Some(tx) => (tx.subscribe(), inner.current.clone()),
                None => return Err(shutdown_error()),
            }
        };
        callback(first)?;
        loop {
            tokio::select! {
                _ = ctx.done() => return Ok(()),
                msg = rx.recv() => match msg {
                    Ok(shr) => callback(shr)?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "health stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(shutdown_error()),
                },
            }
        }
    }
}

fn shutdown_error() -> TabletError {
    TabletError::new(Code::Unavailable, "tabletserver is shutdown")
}
