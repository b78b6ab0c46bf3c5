//! Transaction engine: owns the connections that outlive a single request,
//! either because a transaction is open on them or because they are reserved.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{DbConnection, SizedPool};
use crate::config::TabletConfig;
use crate::context::RequestContext;
use crate::error::{Code, TabletError};
use crate::lifecycle::TxControl;
use crate::pools::{PoolStats, Pooled, ResourceFactory, Setting};
use crate::sql::BindVars;
use crate::state_manager::Killable;
use crate::target::{ExecuteOptions, Workload};

const BEGIN: &str = "begin";
const BEGIN_READ_ONLY: &str = "start transaction read only";
const COMMIT: &str = "commit";
const ROLLBACK: &str = "rollback";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TxEngineState {
    NotServing,
    AcceptingReadWrite,
    AcceptingReadOnly,
}

impl fmt::Display for TxEngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TxEngineState::NotServing => "NotServing",
            TxEngineState::AcceptingReadWrite => "AcceptingReadWrite",
            TxEngineState::AcceptingReadOnly => "AcceptingReadOnly",
        })
    }
}

struct TxSlot<C: DbConnection> {
    /// `None` while the connection is lent to a request.
    conn: Option<Pooled<C>>,
    in_transaction: bool,
    reserved: bool,
    deadline: Option<Instant>,
    killer: Arc<dyn Killable>,
}

struct Registry<C: DbConnection> {
    slots: Mutex<HashMap<i64, TxSlot<C>>>,
    returned: Notify,
}

impl<C: DbConnection> Registry<C> {
    fn lock(&self) -> MutexGuard<'_, HashMap<i64, TxSlot<C>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A transaction or reserved connection checked out for one request.
/// Give it back with [`TxEngine::unlock`]; dropping it abandons the connection.
pub struct LentConn<C: DbConnection> {
    id: i64,
    conn: Option<Pooled<C>>,
    in_transaction: bool,
    reserved: bool,
    registry: Arc<Registry<C>>,
}

impl<C: DbConnection> LentConn<C> {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved
    }
}

impl<C: DbConnection> Deref for LentConn<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_deref().expect("lent connection accessed after unlock")
    }
}

impl<C: DbConnection> DerefMut for LentConn<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn
            .as_deref_mut()
            .expect("lent connection accessed after unlock")
    }
}

impl<C: DbConnection> Drop for LentConn<C> {
    fn drop(&mut self) {
        if self.conn.is_none() {
            return;
        }
        tracing::warn!(id = self.id, "lent connection dropped without unlock; abandoning it");
        self.registry.lock().remove(&self.id);
        self.registry.returned.notify_waiters();
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TxEngineStats {
    pub state: TxEngineState,
    pub open: usize,
    pub timeouts: i64,
    pub pool: PoolStats,
}

/// Begins, commits and rolls back transactions and manages reserved connections.
pub struct TxEngine<C: DbConnection> {
    me: Weak<Self>,
    pool: SizedPool<C>,
    registry: Arc<Registry<C>>,
    state: Mutex<TxEngineState>,
    transition: tokio::sync::Mutex<()>,
    next_id: AtomicI64,
    timeouts: AtomicI64,
    oltp_timeout: Duration,
    olap_timeout: Duration,
    killer: Mutex<Option<CancellationToken>>,
}

impl<C: DbConnection> TxEngine<C> {
    pub async fn new(
        factory: Arc<dyn ResourceFactory<C>>,
        config: &TabletConfig,
    ) -> Result<Arc<Self>, TabletError> {
        let pool = SizedPool::new(factory, &config.tx_pool).await?;
        let seed = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Ok(Arc::new_cyclic(|me| TxEngine {
            me: me.clone(),
            pool,
            registry: Arc::new(Registry {
                slots: Mutex::new(HashMap::new()),
                returned: Notify::new(),
            }),
            state: Mutex::new(TxEngineState::NotServing),
            transition: tokio::sync::Mutex::new(()),
            next_id: AtomicI64::new(seed),
            timeouts: AtomicI64::new(0),
            oltp_timeout: config.oltp.tx_timeout,
            olap_timeout: config.olap.tx_timeout,
            killer: Mutex::new(None),
        }))
    }

    pub fn state(&self) -> TxEngineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TxEngineState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn check_serving(&self) -> Result<TxEngineState, TabletError> {
        let state = self.state();
        if state == TxEngineState::NotServing {
            return Err(TabletError::new(
                Code::Unavailable,
                format!("tx engine can't accept new connections in state {}", state),
            ));
        }
        Ok(state)
    }

    fn deadline_for(&self, options: &ExecuteOptions) -> Option<Instant> {
        let timeout = match options.workload {
            Workload::Dba => Duration::ZERO,
            Workload::Olap => self.olap_timeout,
            _ => self.oltp_timeout,
        };
        (!timeout.is_zero()).then(|| Instant::now() + timeout)
    }

    fn new_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn checkout(
        &self,
        ctx: &RequestContext,
        setting: Option<&Setting>,
        pre_queries: &[String],
    ) -> Result<Pooled<C>, TabletError> {
        let mut conn = self.pool.pool.get_pooled(ctx, setting).await?;
        for query in pre_queries {
            if let Err(err) = conn.exec(ctx, query, &BindVars::new()).await {
                conn.discard().await;
                return Err(err);
            }
        }
        Ok(conn)
    }

    fn register(&self, conn: Pooled<C>, in_transaction: bool, options: &ExecuteOptions) -> i64 {
        let id = self.new_id();
        let killer = conn.killer();
        self.registry.lock().insert(
            id,
            TxSlot {
                conn: Some(conn),
                in_transaction,
                reserved: !in_transaction,
                deadline: self.deadline_for(options),
                killer,
            },
        );
        id
    }

    /// Starts a transaction, on a fresh connection or on the reserved connection
    /// `reserved_id`. `savepoint_queries` run right after the begin statement.
    /// Returns the transaction id and the begin statement used.
    pub async fn begin(
        &self,
        ctx: &RequestContext,
        reserved_id: i64,
        setting: Option<&Setting>,
        savepoint_queries: &[String],
        options: &ExecuteOptions,
    ) -> Result<(i64, String), TabletError> {
        let state = self.check_serving()?;
        let begin_sql = if options.read_only || state == TxEngineState::AcceptingReadOnly {
            BEGIN_READ_ONLY
        } else {
            BEGIN
        };
        if reserved_id != 0 {
            let mut lent = self.lend(reserved_id)?;
            if lent.in_transaction {
                self.unlock(lent).await;
                return Err(TabletError::new(
                    Code::FailedPrecondition,
                    format!("connection {}: already in a transaction", reserved_id),
                ));
            }
            let mut result = lent.exec(ctx, begin_sql, &BindVars::new()).await;
            if result.is_ok() {
                lent.in_transaction = true;
                for q in savepoint_queries {
                    result = lent.exec(ctx, q, &BindVars::new()).await;
                    if result.is_err() {
                        break;
                    }
                }
            }
            self.unlock(lent).await;
            result?;
            return Ok((reserved_id, begin_sql.to_string()));
        }

        let mut conn = self.checkout(ctx, setting, &[]).await?;
        if let Err(err) = conn.exec(ctx, begin_sql, &BindVars::new()).await {
            conn.discard().await;
            return Err(err);
        }
        for q in savepoint_queries {
            if let Err(err) = conn.exec(ctx, q, &BindVars::new()).await {
                conn.discard().await;
                return Err(err);
            }
        }
        let id = self.register(conn, true, options);
        tracing::debug!(transaction_id = id, "transaction started");
        Ok((id, begin_sql.to_string()))
    }

    /// Commits transaction `id`. Returns the id that stays reserved (zero when the
    /// connection went back to the pool) and the statement sent, empty for a no-op.
    pub async fn commit(&self, ctx: &RequestContext, id: i64) -> Result<(i64, String), TabletError> {
        self.finish(ctx, id, COMMIT).await
    }

    pub async fn rollback(&self, ctx: &RequestContext, id: i64) -> Result<(i64, String), TabletError> {
        self.finish(ctx, id, ROLLBACK).await
    }

    async fn finish(
        &self,
        ctx: &RequestContext,
        id: i64,
        stmt: &'static str,
    ) -> Result<(i64, String), TabletError> {
        let mut lent = self.lend(id)?;
        if !lent.in_transaction {
            let reserved = if lent.reserved { id } else { 0 };
            self.unlock(lent).await;
            return Ok((reserved, String::new()));
        }
        let result = lent.exec(ctx, stmt, &BindVars::new()).await;
        lent.in_transaction = false;
        if let Err(err) = result {
            self.discard_lent(lent).await;
            return Err(err);
        }
        if lent.reserved {
            self.unlock(lent).await;
            return Ok((id, stmt.to_string()));
        }
        self.recycle_lent(lent).await;
        Ok((0, stmt.to_string()))
    }

    /// Reserves a connection, or marks transaction `tx_id` as reserved so it
    /// survives its commit. Returns the reserved id.
    pub async fn reserve(
        &self,
        ctx: &RequestContext,
        options: &ExecuteOptions,
        tx_id: i64,
        pre_queries: &[String],
        setting: Option<&Setting>,
    ) -> Result<i64, TabletError> {
        if tx_id != 0 {
            let mut lent = self.lend(tx_id)?;
            lent.reserved = true;
            let mut outcome = Ok(());
            for query in pre_queries {
                if let Err(err) = lent.exec(ctx, query, &BindVars::new()).await {
                    outcome = Err(err);
                    break;
                }
            }
            self.unlock(lent).await;
            outcome?;
            return Ok(tx_id);
        }
        self.check_serving()?;
        let conn = self.checkout(ctx, setting, pre_queries).await?;
        Ok(self.register(conn, false, options))
    }

    /// Reserves a fresh connection and opens a transaction on it.
    pub async fn reserve_begin(
        &self,
        ctx: &RequestContext,
        options: &ExecuteOptions,
        pre_queries: &[String],
        post_begin_queries: &[String],
        setting: Option<&Setting>,
    ) -> Result<(i64, String), TabletError> {
        let id = self.reserve(ctx, options, 0, pre_queries, setting).await?;
        let (id, begin_sql) = match self.begin(ctx, id, None, &[], options).await {
            Ok(v) => v,
            Err(err) => {
                if let Err(release_err) = self.release(ctx, id).await {
                    tracing::warn!(id, error = %release_err, "release after failed reserve-begin failed");
                }
                return Err(err);
            }
        };
        let mut lent = self.lend(id)?;
        for query in post_begin_queries {
            if let Err(err) = lent.exec(ctx, query, &BindVars::new()).await {
                self.unlock(lent).await;
                if let Err(release_err) = self.release(ctx, id).await {
                    tracing::warn!(id, error = %release_err, "release after failed reserve-begin failed");
                }
                return Err(err);
            }
        }
        self.unlock(lent).await;
        Ok((id, begin_sql))
    }

    /// Rolls back any open transaction on `id` and closes the connection.
    pub async fn release(&self, ctx: &RequestContext, id: i64) -> Result<(), TabletError> {
        let mut lent = self.lend(id)?;
        if lent.in_transaction {
            if let Err(err) = lent.exec(ctx, ROLLBACK, &BindVars::new()).await {
                tracing::warn!(id, error = %err, "rollback on release failed");
            }
            lent.in_transaction = false;
        }
        self.release_lent(lent).await;
        Ok(())
    }

    /// Checks out the connection behind `id` for exclusive use by one request.
    pub fn lend(&self, id: i64) -> Result<LentConn<C>, TabletError> {
        let mut slots = self.registry.lock();
        let Some(slot) = slots.get_mut(&id) else {
            return Err(TabletError::new(
                Code::Aborted,
                format!("transaction {}: not found", id),
            ));
        };
        if slot.deadline.is_some_and(|d| Instant::now() >= d) {
            if let Some(slot) = slots.remove(&id) {
                drop(slots);
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                drop(slot.conn);
            }
            return Err(TabletError::new(
                Code::Aborted,
                format!("transaction {}: exceeded timeout", id),
            ));
        }
        let Some(conn) = slot.conn.take() else {
            return Err(TabletError::new(
                Code::Aborted,
                format!("transaction {}: in use", id),
            ));
        };
        Ok(LentConn {
            id,
            conn: Some(conn),
            in_transaction: slot.in_transaction,
            reserved: slot.reserved,
            registry: self.registry.clone(),
        })
    }

    /// Returns a lent connection. A broken connection ends its transaction.
    pub async fn unlock(&self, mut lent: LentConn<C>) {
        let Some(conn) = lent.conn.take() else {
            return;
        };
        if conn.is_closed() {
            tracing::warn!(id = lent.id, "connection broke; ending transaction");
            self.registry.lock().remove(&lent.id);
            self.registry.returned.notify_waiters();
            conn.discard().await;
            return;
        }
        {
            let mut slots = self.registry.lock();
            if let Some(slot) = slots.get_mut(&lent.id) {
                slot.conn = Some(conn);
                slot.in_transaction = lent.in_transaction;
                slot.reserved = lent.reserved;
            }
        }
        self.registry.returned.notify_waiters();
    }

    async fn recycle_lent(&self, mut lent: LentConn<C>) {
        self.registry.lock().remove(&lent.id);
        self.registry.returned.notify_waiters();
        if let Some(conn) = lent.conn.take() {
            if conn.is_closed() {
                conn.discard().await;
            } else {
                conn.recycle().await;
            }
        }
    }

    async fn discard_lent(&self, mut lent: LentConn<C>) {
        self.registry.lock().remove(&lent.id);
        self.registry.returned.notify_waiters();
        if let Some(conn) = lent.conn.take() {
            conn.discard().await;
        }
    }

    /// Reserved connections carry session state, so they are never reused.
    async fn release_lent(&self, mut lent: LentConn<C>) {
        self.registry.lock().remove(&lent.id);
        self.registry.returned.notify_waiters();
        if let Some(conn) = lent.conn.take() {
            if lent.reserved || conn.is_closed() {
                conn.discard().await;
            } else {
                conn.recycle().await;
            }
        }
    }

    /// Ids of every open transaction and reserved connection.
    pub fn open_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.registry.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn set_pool_size(&self, size: usize) -> Result<(), TabletError> {
        self.pool.resize(size).await
    }

    pub fn pool_size(&self) -> usize {
        self.pool.capacity()
    }

    pub fn stats(&self) -> TxEngineStats {
        TxEngineStats {
            state: self.state(),
            open: self.registry.lock().len(),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            pool: self.pool.pool.stats(),
        }
    }

    async fn transition(&self, state: TxEngineState) {
        let _guard = self.transition.lock().await;
        let current = self.state();
        if current == state {
            return;
        }
        tracing::info!(from = %current, to = %state, "tx engine transition");
        if current != TxEngineState::NotServing {
            self.shutdown().await;
        }
        if let Err(err) = self.pool.open().await {
            tracing::error!(error = %err, "could not open transaction pool");
            return;
        }
        self.set_state(state);
        self.start_killer();
    }

    /// Rolls back idle transactions, waits for lent ones to come back and
    /// rolls those back too, then closes the pool.
    async fn shutdown(&self) {
        self.set_state(TxEngineState::NotServing);
        if let Some(token) = self
            .killer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
        let ctx = RequestContext::local();
        loop {
            let notified = self.registry.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let idle: Vec<(i64, TxSlot<C>)> = {
                let mut slots = self.registry.lock();
                let ids: Vec<i64> = slots
                    .iter()
                    .filter(|(_, s)| s.conn.is_some())
                    .map(|(id, _)| *id)
                    .collect();
                ids.into_iter()
                    .filter_map(|id| slots.remove(&id).map(|s| (id, s)))
                    .collect()
            };
            for (id, slot) in idle {
                if let Some(mut conn) = slot.conn {
                    if slot.in_transaction {
                        tracing::info!(transaction_id = id, "rolling back transaction on shutdown");
                        let _ = conn.exec(&ctx, ROLLBACK, &BindVars::new()).await;
                    }
                    conn.discard().await;
                }
            }
            if self.registry.lock().is_empty() {
                break;
            }
            notified.await;
        }
        self.pool.pool.close().await;
    }

    fn start_killer(&self) {
        let timeout = [self.oltp_timeout, self.olap_timeout]
            .into_iter()
            .filter(|t| !t.is_zero())
            .min();
        let Some(timeout) = timeout else {
            return;
        };
        let interval = (timeout / 10).max(Duration::from_millis(10));
        let token = CancellationToken::new();
        *self.killer.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        let weak = self.me.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(te) = weak.upgrade() else {
                    return;
                };
                te.kill_expired().await;
            }
        });
    }

    /// Rolls back idle transactions past their deadline and kills the
    /// statement of lent ones so they come back.
    async fn kill_expired(&self) {
        let now = Instant::now();
        let mut idle = Vec::new();
        let mut busy: Vec<(i64, Arc<dyn Killable>)> = Vec::new();
        {
            let mut slots = self.registry.lock();
            let expired: Vec<i64> = slots
                .iter()
                .filter(|(_, s)| s.deadline.is_some_and(|d| now >= d))
                .map(|(id, _)| *id)
                .collect();
            for id in expired {
                match slots.get(&id) {
                    Some(s) if s.conn.is_none() => busy.push((id, s.killer.clone())),
                    Some(_) => {
                        if let Some(slot) = slots.remove(&id) {
                            idle.push((id, slot));
                        }
                    }
                    None => {}
                }
            }
        }
        let ctx = RequestContext::local();
        for (id, slot) in idle {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(transaction_id = id, "transaction exceeded timeout; rolling back");
            if let Some(mut conn) = slot.conn {
                if slot.in_transaction {
                    let _ = conn.exec(&ctx, ROLLBACK, &BindVars::new()).await;
                }
                conn.discard().await;
            }
        }
        for (id, killer) in busy {
            tracing::warn!(transaction_id = id, "transaction exceeded timeout while executing; killing");
            if let Err(err) = killer.kill("transaction timeout", Duration::ZERO).await {
                tracing::warn!(transaction_id = id, error = %err, "could not kill transaction");
            }
        }
    }
}

#[async_trait]
impl<C: DbConnection> TxControl for TxEngine<C> {
    async fn accept_read_write(&self) {
        self.transition(TxEngineState::AcceptingReadWrite).await;
    }

    async fn accept_read_only(&self) {
        self.transition(TxEngineState::AcceptingReadOnly).await;
    }

    async fn close(&self) {
        let _guard = self.transition.lock().await;
        if self.state() == TxEngineState::NotServing && self.registry.lock().is_empty() {
            self.pool.pool.close().await;
            return;
        }
        tracing::info!("tx engine closing");
        self.shutdown().await;
    }

    fn in_use(&self) -> i64 {
        self.pool.pool.in_use()
    }
}
