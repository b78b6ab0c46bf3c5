//! Serving state machine: sequences subcomponents through primary/replica
//! and serving/not-serving transitions and gates request admission.

mod health;
mod query_list;

pub use health::{HealthStreamer, RealtimeStats, StreamHealthResponse};
pub use query_list::{Killable, QueryDetail, QueryDetailView, QueryList};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::TabletConfig;
use crate::context::RequestContext;
use crate::error::{Code, TabletError};
use crate::lifecycle::Components;
use crate::target::{TabletType, Target};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingState {
    NotConnected,
    NotServing,
    Serving,
}

impl ServingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServingState::NotConnected => "NOT_CONNECTED",
            ServingState::NotServing => "NOT_SERVING",
            ServingState::Serving => "SERVING",
        }
    }
}

impl fmt::Display for ServingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durations that drive transitions and background checks.
#[derive(Clone, Debug)]
pub struct Timings {
    pub transition_grace_period: Duration,
    pub shutdown_grace_period: Duration,
    pub timebomb: Duration,
    pub transition_retry_interval: Duration,
    pub check_mysql_delay: Duration,
    pub health_check_interval: Duration,
    pub replication_unhealthy_threshold: Duration,
}

impl Timings {
    pub fn from_config(config: &TabletConfig) -> Self {
        Timings {
            transition_grace_period: config.transition_grace_period,
            shutdown_grace_period: config.shutdown_grace_period,
            timebomb: config.timebomb,
            transition_retry_interval: config.transition_retry_interval,
            check_mysql_delay: config.check_mysql_delay,
            health_check_interval: config.health_check_interval,
            replication_unhealthy_threshold: config.replication_unhealthy_threshold,
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Timings::from_config(&TabletConfig::default())
    }
}

struct Status {
    want_state: ServingState,
    want_tablet_type: TabletType,
    state: ServingState,
    target: Target,
    ter_timestamp: Option<DateTime<Utc>>,
    retrying: bool,
    repl_healthy: bool,
    lameduck: bool,
    also_allow: Vec<TabletType>,
    also_allow_epoch: u64,
    reason: String,
    transition_err: Option<TabletError>,
}

impl Status {
    fn is_serving(&self) -> bool {
        self.state == ServingState::Serving
            && self.want_state == ServingState::Serving
            && self.repl_healthy
            && !self.lameduck
    }
}

/// Counts admitted requests so a transition can wait for them to finish.
#[derive(Default)]
struct RequestGate {
    count: AtomicUsize,
    idle: Notify,
}

impl RequestGate {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        let prev = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if prev == Ok(1) {
            self.idle.notify_waiters();
        }
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.len() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Serializable view of the state manager for debug endpoints.
#[derive(Clone, Debug, Serialize)]
pub struct StateSnapshot {
    pub state: ServingState,
    pub want_state: ServingState,
    pub target: Target,
    pub want_tablet_type: TabletType,
    pub serving: bool,
    pub lameduck: bool,
    pub repl_healthy: bool,
    pub reason: String,
    pub transition_err: Option<String>,
    pub in_flight: usize,
}

struct Shared {
    status: Mutex<Status>,
    transitioning: tokio::sync::Mutex<()>,
    requests: RequestGate,
    check_mysql_running: AtomicBool,
    components: RwLock<Components>,
    timings: RwLock<Timings>,
    statelessql: Arc<QueryList>,
    statefulql: Arc<QueryList>,
    olapql: Arc<QueryList>,
    hs: HealthStreamer,
    hc_ticks: Mutex<Option<CancellationToken>>,
}

/// Owns the serving state and the transition token. Cheap to clone.
#[derive(Clone)]
pub struct StateManager {
    shared: Arc<Shared>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StateManager {
    pub fn new(components: Components, timings: Timings) -> Self {
        StateManager {
            shared: Arc::new(Shared {
                status: Mutex::new(Status {
                    want_state: ServingState::NotConnected,
                    want_tablet_type: TabletType::Unknown,
                    state: ServingState::NotConnected,
                    target: Target::default(),
                    ter_timestamp: None,
                    retrying: false,
                    repl_healthy: false,
                    lameduck: false,
                    also_allow: Vec::new(),
                    also_allow_epoch: 0,
                    reason: String::new(),
                    transition_err: None,
                }),
                transitioning: tokio::sync::Mutex::new(()),
                requests: RequestGate::default(),
                check_mysql_running: AtomicBool::new(false),
                components: RwLock::new(components),
                timings: RwLock::new(timings),
                statelessql: Arc::new(QueryList::new("stateless")),
                statefulql: Arc::new(QueryList::new("stateful")),
                olapql: Arc::new(QueryList::new("olap")),
                hs: HealthStreamer::new(Target::default()),
                hc_ticks: Mutex::new(None),
            }),
        }
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        lock(&self.shared.status)
    }

    fn components(&self) -> Components {
        self.shared
            .components
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn timings(&self) -> Timings {
        self.shared
            .timings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swaps subcomponents, e.g. to install fakes.
    pub fn update_components(&self, f: impl FnOnce(&mut Components)) {
        f(&mut self
            .shared
            .components
            .write()
            .unwrap_or_else(PoisonError::into_inner));
    }

    pub fn update_timings(&self, f: impl FnOnce(&mut Timings)) {
        f(&mut self
            .shared
            .timings
            .write()
            .unwrap_or_else(PoisonError::into_inner));
    }

    /// Records the tablet's target and opens the table ACL. The state stays NotConnected.
    pub async fn init(&self, target: Target) -> Result<(), TabletError> {
        {
            let mut st = self.status();
            st.target = target.clone();
            st.want_tablet_type = target.tablet_type;
        }
        self.shared.hs.init_target(target);
        self.components().table_acl.open().await
    }

    /// Moves the tablet to (`tablet_type`, `state`). A transition that fails is
    /// retried in the background; the error is still returned.
    pub async fn set_serving_type(
        &self,
        tablet_type: TabletType,
        ter_timestamp: Option<DateTime<Utc>>,
        state: ServingState,
        reason: &str,
    ) -> Result<(), TabletError> {
        self.shared.hs.open();
        self.start_health_ticks();
        let state = match tablet_type {
            TabletType::Restore | TabletType::Backup => ServingState::NotConnected,
            _ => state,
        };
        tracing::info!(
            tablet_type = %tablet_type,
            state = %state,
            reason,
            "starting transition"
        );
        let result = match self
            .must_transition(tablet_type, ter_timestamp, state, reason)
            .await
        {
            Some(_token) => self.exec_transition(tablet_type, state).await,
            None => Ok(()),
        };
        self.exit_lameduck();
        result
    }

    /// Takes the transition token and records the desired state. `None` when
    /// the tablet is already there.
    async fn must_transition(
        &self,
        tablet_type: TabletType,
        ter_timestamp: Option<DateTime<Utc>>,
        state: ServingState,
        reason: &str,
    ) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        let token = self.shared.transitioning.lock().await;
        let mut st = self.status();
        st.want_tablet_type = tablet_type;
        st.want_state = state;
        st.ter_timestamp = ter_timestamp;
        st.reason = reason.to_string();
        if st.target.tablet_type == tablet_type && st.state == state {
            return None;
        }
        Some(token)
    }

    /// Runs one transition. The caller holds the transition token.
    async fn exec_transition(
        &self,
        tablet_type: TabletType,
        state: ServingState,
    ) -> Result<(), TabletError> {
        self.components().task_pool.open().await;
        let result = match (state, tablet_type) {
            (ServingState::Serving, TabletType::Primary) => self.serve_primary().await,
            (ServingState::Serving, _) => self.serve_non_primary(tablet_type).await,
            (ServingState::NotServing, TabletType::Primary) => self.unserve_primary().await,
            (ServingState::NotServing, _) => self.unserve_non_primary(tablet_type).await,
            (ServingState::NotConnected, _) => {
                self.close_all().await;
                Ok(())
            }
        };
        if let Err(err) = &result {
            self.retry_transition(format!(
                "Error transitioning to the desired state: {}, {}, will keep retrying: {}",
                tablet_type, state, err
            ));
        }
        result
    }

    async fn serve_primary(&self) -> Result<(), TabletError> {
        let c = self.components();
        c.watcher.close().await;
        if self.target().tablet_type != TabletType::Primary {
            // Reserved connections from the previous role must not survive promotion.
            self.shared.statefulql.terminate_all().await;
        }
        c.se.make_primary().await;
        self.connect(TabletType::Primary).await?;
        c.rt.make_primary().await;
        c.tracker.open().await;
        c.te.accept_read_write().await;
        c.messager.open().await;
        if let Err(err) = c.throttler.open().await {
            tracing::warn!(error = %err, "could not open throttler");
        }
        if let Err(err) = c.table_gc.open().await {
            tracing::warn!(error = %err, "could not open table GC");
        }
        if let Err(err) = c.ddle.open().await {
            tracing::warn!(error = %err, "could not open online DDL executor");
        }
        if let Err(err) = c.dml_job_controller.open().await {
            tracing::warn!(error = %err, "could not open DML job controller");
        }
        c.branch_watch.open().await;
        self.set_state(TabletType::Primary, ServingState::Serving).await;
        Ok(())
    }

    async fn serve_non_primary(&self, tablet_type: TabletType) -> Result<(), TabletError> {
        let _grace = self.handle_shutdown_grace_period();
        let c = self.components();
        c.ddle.close().await;
        c.dml_job_controller.close().await;
        c.table_gc.close().await;
        c.messager.close().await;
        c.tracker.close().await;
        c.branch_watch.close().await;
        c.se.make_non_primary().await;
        self.connect(tablet_type).await?;
        c.te.accept_read_only().await;
        c.rt.make_non_primary().await;
        c.watcher.open().await;
        if let Err(err) = c.throttler.open().await {
            tracing::warn!(error = %err, "could not open throttler");
        }
        self.set_state(tablet_type, ServingState::Serving).await;
        Ok(())
    }

    async fn unserve_primary(&self) -> Result<(), TabletError> {
        self.unserve_common().await;
        let c = self.components();
        c.watcher.close().await;
        c.se.make_primary().await;
        self.connect(TabletType::Primary).await?;
        c.rt.make_primary().await;
        self.set_state(TabletType::Primary, ServingState::NotServing)
            .await;
        Ok(())
    }

    async fn unserve_non_primary(&self, tablet_type: TabletType) -> Result<(), TabletError> {
        self.unserve_common().await;
        let c = self.components();
        c.se.make_non_primary().await;
        self.connect(tablet_type).await?;
        c.rt.make_non_primary().await;
        c.watcher.open().await;
        self.set_state(tablet_type, ServingState::NotServing).await;
        Ok(())
    }

    async fn connect(&self, tablet_type: TabletType) -> Result<(), TabletError> {
        let c = self.components();
        c.se.ensure_connection_and_db(tablet_type).await?;
        c.se.open().await?;
        c.vstreamer.open().await;
        c.qe.open().await?;
        c.pool_size_controller.open().await;
        c.tx_throttler.open().await
    }

    /// Closes the write path and waits for admitted requests to finish.
    async fn unserve_common(&self) {
        let _grace = self.handle_shutdown_grace_period();
        let c = self.components();
        c.ddle.close().await;
        c.dml_job_controller.close().await;
        c.table_gc.close().await;
        c.throttler.close().await;
        c.messager.close().await;
        c.te.close().await;
        c.tracker.close().await;
        self.wait_for_requests().await;
    }

    async fn close_all(&self) {
        self.unserve_common().await;
        let c = self.components();
        c.tx_throttler.close().await;
        c.qe.close().await;
        c.pool_size_controller.close().await;
        c.watcher.close().await;
        c.vstreamer.close().await;
        c.rt.close().await;
        c.se.close().await;
        let want = self.status().want_tablet_type;
        self.set_state(want, ServingState::NotConnected).await;
    }

    /// Waits for in-flight requests; past the timebomb, kills them and moves on.
    async fn wait_for_requests(&self) {
        let timebomb = self.timings().timebomb;
        if timebomb.is_zero() {
            self.shared.requests.wait().await;
            return;
        }
        if tokio::time::timeout(timebomb, self.shared.requests.wait())
            .await
            .is_err()
        {
            tracing::error!(
                timebomb = ?timebomb,
                in_flight = self.shared.requests.len(),
                "requests did not drain in time, killing remaining queries"
            );
            self.terminate_all_queries().await;
        }
    }

    async fn terminate_all_queries(&self) {
        self.shared.statelessql.terminate_all().await;
        self.shared.statefulql.terminate_all().await;
        self.shared.olapql.terminate_all().await;
    }

    /// Kills in-flight queries once the shutdown grace period passes, unless
    /// the returned guard is dropped first.
    fn handle_shutdown_grace_period(&self) -> Option<DropGuard> {
        let grace = self.timings().shutdown_grace_period;
        if grace.is_zero() {
            return None;
        }
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let sm = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    tracing::info!(grace = ?grace, "grace period exceeded, killing all transactions and queries");
                    sm.terminate_all_queries().await;
                }
            }
        });
        Some(token.drop_guard())
    }

    async fn set_state(&self, tablet_type: TabletType, state: ServingState) {
        let grace = self.timings().transition_grace_period;
        let leaving_not_connected = {
            let mut st = self.status();
            let tablet_type = if tablet_type == TabletType::Unknown {
                st.want_tablet_type
            } else {
                tablet_type
            };
            tracing::info!(
                from_type = %st.target.tablet_type,
                from_state = %st.state,
                to_type = %tablet_type,
                to_state = %state,
                keyspace = %st.target.keyspace,
                shard = %st.target.shard,
                "tablet server transition"
            );
            if !grace.is_zero()
                && st.state == ServingState::Serving
                && st.target.tablet_type != tablet_type
            {
                let previous = st.target.tablet_type;
                st.also_allow = vec![previous];
                st.also_allow_epoch += 1;
                self.clear_also_allow_after(grace, st.also_allow_epoch);
            }
            st.target.tablet_type = tablet_type;
            let leaving = st.state == ServingState::NotConnected;
            st.state = state;
            leaving
        };
        if leaving_not_connected {
            let _ = self.refresh_repl_health().await;
        }
        self.broadcast().await;
    }

    fn clear_also_allow_after(&self, grace: Duration, epoch: u64) {
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(shared) = weak.upgrade() {
                let mut st = lock(&shared.status);
                if st.also_allow_epoch == epoch {
                    st.also_allow.clear();
                }
            }
        });
    }

    /// Updates replication health and returns the measured lag.
    async fn refresh_repl_health(&self) -> (Duration, Option<TabletError>) {
        let threshold = self.timings().replication_unhealthy_threshold;
        if self.target().tablet_type == TabletType::Primary || threshold.is_zero() {
            self.status().repl_healthy = true;
            return (Duration::ZERO, None);
        }
        let status = self.components().rt.status().await;
        let mut st = self.status();
        match status {
            Err(err) => {
                if st.repl_healthy {
                    tracing::info!(error = %err, "going unhealthy due to replication error");
                }
                st.repl_healthy = false;
                (Duration::ZERO, Some(err))
            }
            Ok(lag) if lag > threshold => {
                if st.repl_healthy {
                    tracing::info!(lag = ?lag, threshold = ?threshold, "going unhealthy due to high replication lag");
                }
                st.repl_healthy = false;
                (lag, None)
            }
            Ok(lag) => {
                if !st.repl_healthy {
                    tracing::info!(lag = ?lag, "replication is healthy");
                }
                st.repl_healthy = true;
                (lag, None)
            }
        }
    }

    /// Refreshes replication health and publishes the state to health streams.
    pub async fn broadcast(&self) {
        let (lag, err) = self.refresh_repl_health().await;
        let (target, ter_timestamp, serving) = {
            let st = self.status();
            (st.target.clone(), st.ter_timestamp, st.is_serving())
        };
        self.shared
            .hs
            .change_state(&target, ter_timestamp, lag, err.as_ref(), serving);
    }

    fn start_health_ticks(&self) {
        let mut ticks = lock(&self.shared.hc_ticks);
        if ticks.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *ticks = Some(token.clone());
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let interval = self.timings().health_check_interval;
        if interval.is_zero() {
            return;
        }
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                StateManager { shared }.broadcast().await;
            }
        });
    }

    fn stop_health_ticks(&self) {
        if let Some(token) = lock(&self.shared.hc_ticks).take() {
            token.cancel();
        }
    }

    /// Starts the retry loop unless one is already running. The loop executes
    /// whatever is the most recently requested state each time it gets the token.
    fn retry_transition(&self, message: String) {
        {
            let mut st = self.status();
            st.transition_err = Some(TabletError::new(Code::Unavailable, message.clone()));
            if st.retrying {
                return;
            }
            st.retrying = true;
        }
        tracing::error!("{}", message);
        let sm = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = sm.timings().transition_retry_interval;
                tokio::time::sleep(interval).await;
                if sm.recheck_state().await {
                    return;
                }
            }
        });
    }

    /// Returns true once the current state matches the wanted one.
    async fn recheck_state(&self) -> bool {
        let _token = self.shared.transitioning.lock().await;
        let (want_type, want_state) = {
            let mut st = self.status();
            if st.want_state == st.state && st.want_tablet_type == st.target.tablet_type {
                st.retrying = false;
                st.transition_err = None;
                return true;
            }
            (st.want_tablet_type, st.want_state)
        };
        if self.exec_transition(want_type, want_state).await.is_ok() {
            let mut st = self.status();
            st.retrying = false;
            st.transition_err = None;
            tracing::info!(tablet_type = %want_type, state = %want_state, "transition retry succeeded");
            return true;
        }
        false
    }

    /// Admits a request or explains why it cannot run. Every `Ok` must be
    /// paired with [`end_request`](Self::end_request).
    pub fn start_request(
        &self,
        ctx: &RequestContext,
        target: Option<&Target>,
        allow_on_shutdown: bool,
    ) -> Result<(), TabletError> {
        let st = self.status();
        if st.state != ServingState::Serving || !st.repl_healthy {
            return Err(TabletError::new(
                Code::FailedPrecondition,
                "operation not allowed in state NOT_SERVING",
            ));
        }
        if st.want_state != ServingState::Serving && !allow_on_shutdown {
            return Err(TabletError::new(
                Code::FailedPrecondition,
                "operation not allowed in state SHUTTING_DOWN",
            ));
        }
        verify_target_locked(&st, ctx, target)?;
        self.shared.requests.add();
        Ok(())
    }

    pub fn end_request(&self) {
        self.shared.requests.done();
    }

    pub fn verify_target(
        &self,
        ctx: &RequestContext,
        target: Option<&Target>,
    ) -> Result<(), TabletError> {
        let st = self.status();
        verify_target_locked(&st, ctx, target)
    }

    /// Probes MySQL in the background after a connection-level error. At most
    /// one probe runs at a time, and it backs off while a transition is in flight.
    pub fn check_mysql(&self) {
        if self.shared.check_mysql_running.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("check mysql started");
        let sm = self.clone();
        tokio::spawn(async move {
            sm.check_mysql_once().await;
            tokio::time::sleep(sm.timings().check_mysql_delay).await;
            sm.shared.check_mysql_running.store(false, Ordering::SeqCst);
            tracing::info!("check mysql finished");
        });
    }

    async fn check_mysql_once(&self) {
        let Ok(_token) = self.shared.transitioning.try_lock() else {
            return;
        };
        let (prev_want, tablet_type, state) = {
            let mut st = self.status();
            let prev = st.want_state;
            // Only transactional work may continue while MySQL is probed.
            st.want_state = ServingState::NotConnected;
            (prev, st.target.tablet_type, st.state)
        };
        let c = self.components();
        c.te.close().await;
        match c.qe.is_mysql_reachable().await {
            Ok(()) => {
                self.status().want_state = prev_want;
                if state == ServingState::Serving {
                    if tablet_type == TabletType::Primary {
                        c.te.accept_read_write().await;
                    } else {
                        c.te.accept_read_only().await;
                    }
                }
            }
            Err(err) => {
                self.close_all().await;
                self.status().want_state = prev_want;
                self.retry_transition(format!(
                    "Cannot connect to MySQL, shutting down query service: {}",
                    err
                ));
            }
        }
    }

    /// Shuts everything down. Returns once in-flight requests drained or were killed.
    pub async fn stop_service(&self) {
        tracing::info!("stopping tablet server");
        let tablet_type = self.target().tablet_type;
        if let Err(err) = self
            .set_serving_type(tablet_type, None, ServingState::NotConnected, "service stopped")
            .await
        {
            tracing::error!(error = %err, "error stopping service");
        }
        self.stop_health_ticks();
        self.shared.hs.close();
        let c = self.components();
        c.task_pool.close().await;
        c.table_acl.close().await;
    }

    pub fn enter_lameduck(&self) {
        self.status().lameduck = true;
    }

    pub fn exit_lameduck(&self) {
        self.status().lameduck = false;
    }

    pub fn is_serving(&self) -> bool {
        self.status().is_serving()
    }

    pub fn is_serving_string(&self) -> &'static str {
        if self.is_serving() {
            "SERVING"
        } else {
            "NOT_SERVING"
        }
    }

    pub fn state(&self) -> ServingState {
        self.status().state
    }

    pub fn want_state(&self) -> ServingState {
        self.status().want_state
    }

    pub fn target(&self) -> Target {
        self.status().target.clone()
    }

    pub fn reason(&self) -> String {
        self.status().reason.clone()
    }

    pub fn transition_err(&self) -> Option<TabletError> {
        self.status().transition_err.clone()
    }

    pub fn also_allow(&self) -> Vec<TabletType> {
        self.status().also_allow.clone()
    }

    pub fn is_retrying(&self) -> bool {
        self.status().retrying
    }

    pub fn is_check_mysql_running(&self) -> bool {
        self.shared.check_mysql_running.load(Ordering::SeqCst)
    }

    /// True while a transition holds the token.
    pub fn is_transitioning(&self) -> bool {
        self.shared.transitioning.try_lock().is_err()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.requests.len()
    }

    pub fn health_streamer(&self) -> &HealthStreamer {
        &self.shared.hs
    }

    pub fn stateless_queries(&self) -> &Arc<QueryList> {
        &self.shared.statelessql
    }

    pub fn stateful_queries(&self) -> &Arc<QueryList> {
        &self.shared.statefulql
    }

    pub fn olap_queries(&self) -> &Arc<QueryList> {
        &self.shared.olapql
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let in_flight = self.in_flight();
        let st = self.status();
        StateSnapshot {
            state: st.state,
            want_state: st.want_state,
            target: st.target.clone(),
            want_tablet_type: st.want_tablet_type,
            serving: st.is_serving(),
            lameduck: st.lameduck,
            repl_healthy: st.repl_healthy,
            reason: st.reason.clone(),
            transition_err: st.transition_err.as_ref().map(|e| e.to_string()),
            in_flight,
        }
    }
}

fn verify_target_locked(
    st: &Status,
    ctx: &RequestContext,
    target: Option<&Target>,
) -> Result<(), TabletError> {
    if ctx.is_local() {
        return Ok(());
    }
    let Some(target) = target else {
        return Err(TabletError::new(Code::InvalidArgument, "No target"));
    };
    if !st.target.keyspace.is_empty() && target.keyspace != st.target.keyspace {
        return Err(TabletError::new(
            Code::NotFound,
            format!(
                "invalid keyspace {} does not match expected {}",
                target.keyspace, st.target.keyspace
            ),
        ));
    }
    if !st.target.shard.is_empty() && target.shard != st.target.shard {
        return Err(TabletError::new(
            Code::NotFound,
            format!(
                "invalid shard {} does not match expected {}",
                target.shard, st.target.shard
            ),
        ));
    }
    if target.tablet_type != st.target.tablet_type && !st.also_allow.contains(&target.tablet_type) {
        let also: Vec<&str> = st.also_allow.iter().map(|t| t.as_str()).collect();
        return Err(TabletError::new(
            Code::FailedPrecondition,
            format!(
                "wrong tablet type: {}, want: {} or [{}]",
                target.tablet_type,
                st.target.tablet_type,
                also.join(" ")
            ),
        ));
    }
    Ok(())
}
