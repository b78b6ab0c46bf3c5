//! Bounded pool of reusable resources with a settings-aware fast path.
//!
//! Slots live in two queues: `plain` holds slots whose resource has no
//! session setting applied (or no resource yet), `settings` holds resources
//! that still carry one. A slot is in exactly one queue or checked out.

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::Setting;
use crate::context::RequestContext;
use crate::error::{Code, TabletError};

/// Something the pool can hand out, e.g. a MySQL connection.
#[async_trait]
pub trait Resource: Send + Sync + Sized + 'static {
    async fn close(self);
    /// True when the resource has outlived `lifetime`. A zero lifetime never expires.
    fn expired(&self, lifetime: Duration) -> bool;
    async fn apply_setting(
        &mut self,
        ctx: &RequestContext,
        setting: &Setting,
    ) -> Result<(), TabletError>;
    fn is_setting_applied(&self) -> bool;
    fn is_same_setting(&self, setting: &Setting) -> bool;
    async fn reset_setting(&mut self, ctx: &RequestContext) -> Result<(), TabletError>;
}

#[async_trait]
pub trait ResourceFactory<R>: Send + Sync + 'static {
    async fn create(&self, ctx: &RequestContext) -> Result<R, TabletError>;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("resource pool is closed")]
    Closed,
    #[error("resource pool timed out")]
    Timeout,
    #[error("resource pool context already expired")]
    ContextExpired,
    #[error("capacity {0} is out of range")]
    CapacityOutOfRange(usize),
    #[error(transparent)]
    Resource(#[from] TabletError),
}

impl From<PoolError> for TabletError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Resource(e) => e,
            PoolError::Timeout => TabletError::new(Code::ResourceExhausted, err.to_string()),
            PoolError::ContextExpired => TabletError::new(Code::DeadlineExceeded, err.to_string()),
            PoolError::Closed => TabletError::new(Code::Unavailable, err.to_string()),
            PoolError::CapacityOutOfRange(_) => {
                TabletError::new(Code::InvalidArgument, err.to_string())
            }
        }
    }
}

struct Wrapper<R> {
    resource: Option<R>,
    time_used: Instant,
}

impl<R> Wrapper<R> {
    fn empty() -> Self {
        Wrapper {
            resource: None,
            time_used: Instant::now(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Queue {
    Plain,
    Settings,
}

struct Slots<R> {
    plain: VecDeque<Wrapper<R>>,
    settings: VecDeque<Wrapper<R>>,
    closed: bool,
}

impl<R> Slots<R> {
    fn len(&self) -> usize {
        self.plain.len() + self.settings.len()
    }

    fn pop(&mut self, prefer: Queue) -> Option<Wrapper<R>> {
        match prefer {
            Queue::Plain => self.plain.pop_front().or_else(|| self.settings.pop_front()),
            Queue::Settings => self.settings.pop_front().or_else(|| self.plain.pop_front()),
        }
    }

    fn pop_from(&mut self, queue: Queue) -> Option<Wrapper<R>> {
        match queue {
            Queue::Plain => self.plain.pop_front(),
            Queue::Settings => self.settings.pop_front(),
        }
    }

    fn push(&mut self, wrapper: Wrapper<R>, queue: Queue) {
        match queue {
            Queue::Plain => self.plain.push_back(wrapper),
            Queue::Settings => self.settings.push_back(wrapper),
        }
    }
}

impl<R: Resource> Slots<R> {
    /// Takes a settings slot whose resource already carries `setting`, if any.
    fn pop_matching(&mut self, setting: &Setting) -> Option<Wrapper<R>> {
        let at = self.settings.iter().position(|w| {
            w.resource
                .as_ref()
                .is_some_and(|r| r.is_same_setting(setting))
        })?;
        self.settings.remove(at)
    }
}

/// Point-in-time view of pool gauges and counters. Durations are nanoseconds.
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct PoolStats {
    pub capacity: i64,
    pub available: i64,
    pub active: i64,
    pub in_use: i64,
    pub max_capacity: i64,
    pub wait_count: i64,
    pub wait_time: u64,
    pub idle_timeout: u64,
    pub idle_closed: i64,
    pub max_lifetime_closed: i64,
    pub exhausted: i64,
    pub get_count: i64,
    pub get_setting_count: i64,
    pub diff_setting_count: i64,
    pub reset_setting_count: i64,
}

pub struct ResourcePool<R: Resource> {
    factory: Arc<dyn ResourceFactory<R>>,
    slots: Mutex<Slots<R>>,
    notify: Notify,
    resize: tokio::sync::Mutex<()>,
    max_cap: usize,
    max_lifetime: Duration,
    capacity: AtomicUsize,
    idle_timeout_nanos: AtomicU64,
    available: AtomicI64,
    active: AtomicI64,
    in_use: AtomicI64,
    wait_count: AtomicI64,
    wait_time_nanos: AtomicU64,
    idle_closed: AtomicI64,
    max_lifetime_closed: AtomicI64,
    exhausted: AtomicI64,
    get_count: AtomicI64,
    get_setting_count: AtomicI64,
    diff_setting_count: AtomicI64,
    reset_setting_count: AtomicI64,
    sweeper: Mutex<Option<CancellationToken>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Restores an empty slot if a checkout is abandoned before it completes.
struct SlotGuard<'a, R: Resource> {
    pool: &'a ResourcePool<R>,
    live: bool,
    armed: bool,
}

impl<R: Resource> Drop for SlotGuard<'_, R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.live {
            self.pool.active.fetch_sub(1, Ordering::SeqCst);
        }
        self.pool.push_slot(Wrapper::empty(), Queue::Plain);
    }
}

impl<R: Resource> ResourcePool<R> {
    /// Builds a pool of `capacity` empty slots that can later grow to `max_cap`.
    /// A zero `idle_timeout` disables the idle sweep; a zero `max_lifetime` disables expiry.
    pub fn new(
        factory: Arc<dyn ResourceFactory<R>>,
        capacity: usize,
        max_cap: usize,
        idle_timeout: Duration,
        max_lifetime: Duration,
    ) -> Result<Arc<Self>, PoolError> {
        if capacity == 0 || max_cap == 0 || capacity > max_cap {
            return Err(PoolError::CapacityOutOfRange(capacity));
        }
        let mut plain = VecDeque::with_capacity(max_cap);
        for _ in 0..capacity {
            plain.push_back(Wrapper::empty());
        }
        let pool = Arc::new(ResourcePool {
            factory,
            slots: Mutex::new(Slots {
                plain,
                settings: VecDeque::with_capacity(max_cap),
                closed: false,
            }),
            notify: Notify::new(),
            resize: tokio::sync::Mutex::new(()),
            max_cap,
            max_lifetime,
            capacity: AtomicUsize::new(capacity),
            idle_timeout_nanos: AtomicU64::new(idle_timeout.as_nanos() as u64),
            available: AtomicI64::new(capacity as i64),
            active: AtomicI64::new(0),
            in_use: AtomicI64::new(0),
            wait_count: AtomicI64::new(0),
            wait_time_nanos: AtomicU64::new(0),
            idle_closed: AtomicI64::new(0),
            max_lifetime_closed: AtomicI64::new(0),
            exhausted: AtomicI64::new(0),
            get_count: AtomicI64::new(0),
            get_setting_count: AtomicI64::new(0),
            diff_setting_count: AtomicI64::new(0),
            reset_setting_count: AtomicI64::new(0),
            sweeper: Mutex::new(None),
        });
        if !idle_timeout.is_zero() {
            pool.start_idle_sweeper();
        }
        Ok(pool)
    }

    /// Checks out a resource. An empty or absent setting takes the plain path.
    pub async fn get(
        &self,
        ctx: &RequestContext,
        setting: Option<&Setting>,
    ) -> Result<R, PoolError> {
        if ctx.is_done() {
            return Err(PoolError::ContextExpired);
        }
        match setting {
            Some(s) if !s.is_empty() => self.get_with_setting(ctx, s).await,
            _ => self.get_plain(ctx).await,
        }
    }

    /// Like [`get`](Self::get) but wraps the resource in a guard that is
    /// discarded back into the pool if it is dropped without being returned.
    pub async fn get_pooled(
        self: &Arc<Self>,
        ctx: &RequestContext,
        setting: Option<&Setting>,
    ) -> Result<Pooled<R>, PoolError> {
        let resource = self.get(ctx, setting).await?;
        Ok(Pooled {
            pool: Arc::clone(self),
            resource: Some(resource),
        })
    }

    async fn get_plain(&self, ctx: &RequestContext) -> Result<R, PoolError> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        let mut wrapper = self.fetch(ctx, Queue::Plain, None).await?;
        let mut guard = SlotGuard {
            pool: self,
            live: wrapper.resource.is_some(),
            armed: true,
        };

        if wrapper
            .resource
            .as_ref()
            .is_some_and(|r| r.is_setting_applied())
        {
            self.reset_setting_count.fetch_add(1, Ordering::Relaxed);
            self.reset_or_close(ctx, &mut wrapper, &mut guard).await;
        }

        let resource = match wrapper.resource.take() {
            Some(r) => r,
            None => self.create(ctx, &mut guard).await?,
        };
        guard.armed = false;
        self.checked_out();
        Ok(resource)
    }

    async fn get_with_setting(
        &self,
        ctx: &RequestContext,
        setting: &Setting,
    ) -> Result<R, PoolError> {
        self.get_setting_count.fetch_add(1, Ordering::Relaxed);
        let mut wrapper = self.fetch(ctx, Queue::Settings, Some(setting)).await?;
        let mut guard = SlotGuard {
            pool: self,
            live: wrapper.resource.is_some(),
            armed: true,
        };

        if wrapper
            .resource
            .as_ref()
            .is_some_and(|r| r.is_setting_applied() && !r.is_same_setting(setting))
        {
            self.diff_setting_count.fetch_add(1, Ordering::Relaxed);
            self.reset_or_close(ctx, &mut wrapper, &mut guard).await;
        }

        let mut resource = match wrapper.resource.take() {
            Some(r) => r,
            None => self.create(ctx, &mut guard).await?,
        };

        if !resource.is_setting_applied() {
            if let Err(err) = resource.apply_setting(ctx, setting).await {
                guard.armed = false;
                self.push_slot(
                    Wrapper {
                        resource: Some(resource),
                        time_used: wrapper.time_used,
                    },
                    Queue::Plain,
                );
                return Err(err.into());
            }
        }
        guard.armed = false;
        self.checked_out();
        Ok(resource)
    }

    /// Resets the wrapper's setting; on failure the resource is closed and the slot left empty.
    async fn reset_or_close(
        &self,
        ctx: &RequestContext,
        wrapper: &mut Wrapper<R>,
        guard: &mut SlotGuard<'_, R>,
    ) {
        let Some(resource) = wrapper.resource.as_mut() else {
            return;
        };
        if let Err(err) = resource.reset_setting(ctx).await {
            tracing::debug!(error = %err, "reset setting failed, closing resource");
            if let Some(r) = wrapper.resource.take() {
                guard.live = false;
                self.active.fetch_sub(1, Ordering::SeqCst);
                r.close().await;
            }
        }
    }

    async fn create(
        &self,
        ctx: &RequestContext,
        guard: &mut SlotGuard<'_, R>,
    ) -> Result<R, PoolError> {
        let resource = self.factory.create(ctx).await?;
        self.active.fetch_add(1, Ordering::SeqCst);
        guard.live = true;
        Ok(resource)
    }

    fn checked_out(&self) {
        if self.available.fetch_sub(1, Ordering::SeqCst) - 1 <= 0 {
            self.exhausted.fetch_add(1, Ordering::Relaxed);
        }
        self.in_use.fetch_add(1, Ordering::SeqCst);
    }

    /// Takes a slot, preferring one already carrying `setting`, then `prefer`,
    /// waiting until one is pushed or `ctx` is done.
    async fn fetch(
        &self,
        ctx: &RequestContext,
        prefer: Queue,
        setting: Option<&Setting>,
    ) -> Result<Wrapper<R>, PoolError> {
        let (wrapper, waited) = self.take_slot(Some(ctx), prefer, setting).await?;
        if let Some(start) = waited {
            self.wait_count.fetch_add(1, Ordering::Relaxed);
            self.wait_time_nanos
                .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        }
        Ok(wrapper)
    }

    async fn take_slot(
        &self,
        ctx: Option<&RequestContext>,
        prefer: Queue,
        setting: Option<&Setting>,
    ) -> Result<(Wrapper<R>, Option<Instant>), PoolError> {
        let mut wait_start = None;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut slots = lock(&self.slots);
                if slots.closed {
                    return Err(PoolError::Closed);
                }
                let matched = setting.and_then(|s| slots.pop_matching(s));
                if let Some(w) = matched.or_else(|| slots.pop(prefer)) {
                    return Ok((w, wait_start));
                }
            }
            if wait_start.is_none() {
                wait_start = Some(Instant::now());
            }
            match ctx {
                Some(ctx) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = ctx.done() => return Err(PoolError::Timeout),
                    }
                }
                None => notified.await,
            }
        }
    }

    fn push_slot(&self, wrapper: Wrapper<R>, queue: Queue) {
        lock(&self.slots).push(wrapper, queue);
        self.notify.notify_waiters();
    }

    /// Returns a checked-out resource. `None` discards it and creates a replacement.
    ///
    /// # Panics
    ///
    /// Panics if there is no outstanding checkout to return.
    pub async fn put(&self, resource: Option<R>) {
        let mut wrapper = Wrapper::empty();
        let mut has_settings = false;
        if let Some(r) = resource {
            has_settings = r.is_setting_applied();
            if r.expired(self.extended_max_lifetime()) {
                self.max_lifetime_closed.fetch_add(1, Ordering::Relaxed);
                r.close().await;
            } else {
                wrapper.resource = Some(r);
            }
        }
        let recreated = wrapper.resource.is_none();
        if recreated {
            self.reopen_resource(&mut wrapper).await;
        }
        let queue = if !has_settings || recreated {
            Queue::Plain
        } else {
            Queue::Settings
        };
        {
            let mut slots = lock(&self.slots);
            if self.in_use.load(Ordering::SeqCst) <= 0 || slots.len() >= self.max_cap {
                drop(slots);
                panic!("attempt to Put into a full ResourcePool");
            }
            slots.push(wrapper, queue);
            self.in_use.fetch_sub(1, Ordering::SeqCst);
            self.available.fetch_add(1, Ordering::SeqCst);
        }
        self.notify.notify_waiters();
    }

    async fn reopen_resource(&self, wrapper: &mut Wrapper<R>) {
        match self.factory.create(&RequestContext::background()).await {
            Ok(r) => {
                wrapper.resource = Some(r);
                wrapper.time_used = Instant::now();
            }
            Err(err) => {
                tracing::debug!(error = %err, "could not reopen pooled resource");
                wrapper.resource = None;
                self.active.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Resizes the pool. Shrinking waits for enough resources to be returned;
    /// a capacity of zero closes the pool and a later non-zero capacity reopens it.
    pub async fn set_capacity(&self, capacity: usize) -> Result<(), PoolError> {
        if capacity > self.max_cap {
            return Err(PoolError::CapacityOutOfRange(capacity));
        }
        let _resize = self.resize.lock().await;
        let old = self.capacity.load(Ordering::SeqCst);
        if old == capacity {
            return Ok(());
        }
        if old == 0 {
            lock(&self.slots).closed = false;
        }
        self.capacity.store(capacity, Ordering::SeqCst);

        if capacity < old {
            for _ in 0..old - capacity {
                let (wrapper, _) = self.take_slot(None, Queue::Plain, None).await?;
                if let Some(r) = wrapper.resource {
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    r.close().await;
                }
                self.available.fetch_sub(1, Ordering::SeqCst);
            }
        } else {
            {
                let mut slots = lock(&self.slots);
                for _ in 0..capacity - old {
                    slots.push(Wrapper::empty(), Queue::Plain);
                }
            }
            self.available
                .fetch_add((capacity - old) as i64, Ordering::SeqCst);
            self.notify.notify_waiters();
        }

        if capacity == 0 {
            lock(&self.slots).closed = true;
            self.notify.notify_waiters();
        }
        Ok(())
    }

    /// Stops the idle sweep and closes every resource, waiting for outstanding ones.
    pub async fn close(&self) {
        if let Some(token) = lock(&self.sweeper).take() {
            token.cancel();
        }
        let _ = self.set_capacity(0).await;
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.slots).closed
    }

    /// Replaces resources that sat unused for longer than the idle timeout.
    /// Each queue is walked once, over the slots it held when the sweep began.
    pub async fn close_idle_resources(&self) {
        let (plain, settings) = {
            let slots = lock(&self.slots);
            (slots.plain.len(), slots.settings.len())
        };
        self.sweep_queue(Queue::Settings, settings).await;
        self.sweep_queue(Queue::Plain, plain).await;
    }

    async fn sweep_queue(&self, origin: Queue, count: usize) {
        let idle_timeout = self.idle_timeout();
        for _ in 0..count {
            let next = lock(&self.slots).pop_from(origin);
            let Some(mut wrapper) = next else {
                return;
            };
            let mut reopened = false;
            if wrapper.resource.is_some()
                && !idle_timeout.is_zero()
                && wrapper.time_used.elapsed() > idle_timeout
            {
                if let Some(r) = wrapper.resource.take() {
                    r.close().await;
                }
                self.idle_closed.fetch_add(1, Ordering::Relaxed);
                self.reopen_resource(&mut wrapper).await;
                reopened = true;
            }
            let queue = if origin == Queue::Plain || reopened {
                Queue::Plain
            } else {
                Queue::Settings
            };
            self.push_slot(wrapper, queue);
        }
    }

    fn start_idle_sweeper(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no async runtime, idle resources will not be swept");
            return;
        };
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.sweeper).replace(token.clone()) {
            previous.cancel();
        }
        let weak = Arc::downgrade(self);
        handle.spawn(async move {
            loop {
                let interval = match weak.upgrade() {
                    Some(pool) => pool.idle_timeout() / 10,
                    None => return,
                };
                if interval.is_zero() {
                    return;
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(pool) = weak.upgrade() else {
                    return;
                };
                pool.close_idle_resources().await;
            }
        });
    }

    /// Changes the idle timeout; the sweep interval follows it. Zero stops the sweep.
    pub fn set_idle_timeout(self: &Arc<Self>, idle_timeout: Duration) {
        let was = self.idle_timeout();
        self.idle_timeout_nanos
            .store(idle_timeout.as_nanos() as u64, Ordering::SeqCst);
        if idle_timeout.is_zero() {
            if let Some(token) = lock(&self.sweeper).take() {
                token.cancel();
            }
        } else if was.is_zero() || lock(&self.sweeper).is_none() {
            self.start_idle_sweeper();
        }
    }

    /// Random lifetime in `[max_lifetime, 2 * max_lifetime)` so connections do not all expire together.
    fn extended_max_lifetime(&self) -> Duration {
        let nanos = self.max_lifetime.as_nanos() as u64;
        if nanos == 0 {
            return Duration::ZERO;
        }
        self.max_lifetime + Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
    }

    pub fn capacity(&self) -> i64 {
        self.capacity.load(Ordering::SeqCst) as i64
    }

    pub fn available(&self) -> i64 {
        self.available.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn in_use(&self) -> i64 {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn max_cap(&self) -> i64 {
        self.max_cap as i64
    }

    pub fn wait_count(&self) -> i64 {
        self.wait_count.load(Ordering::Relaxed)
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_nanos(self.wait_time_nanos.load(Ordering::Relaxed))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_nanos(self.idle_timeout_nanos.load(Ordering::SeqCst))
    }

    pub fn idle_closed(&self) -> i64 {
        self.idle_closed.load(Ordering::Relaxed)
    }

    pub fn max_lifetime_closed(&self) -> i64 {
        self.max_lifetime_closed.load(Ordering::Relaxed)
    }

    pub fn exhausted(&self) -> i64 {
        self.exhausted.load(Ordering::Relaxed)
    }

    pub fn get_count(&self) -> i64 {
        self.get_count.load(Ordering::Relaxed)
    }

    pub fn get_setting_count(&self) -> i64 {
        self.get_setting_count.load(Ordering::Relaxed)
    }

    pub fn diff_setting_count(&self) -> i64 {
        self.diff_setting_count.load(Ordering::Relaxed)
    }

    pub fn reset_setting_count(&self) -> i64 {
        self.reset_setting_count.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity(),
            available: self.available(),
            active: self.active(),
            in_use: self.in_use(),
            max_capacity: self.max_cap(),
            wait_count: self.wait_count(),
            wait_time: self.wait_time().as_nanos() as u64,
            idle_timeout: self.idle_timeout().as_nanos() as u64,
            idle_closed: self.idle_closed(),
            max_lifetime_closed: self.max_lifetime_closed(),
            exhausted: self.exhausted(),
            get_count: self.get_count(),
            get_setting_count: self.get_setting_count(),
            diff_setting_count: self.diff_setting_count(),
            reset_setting_count: self.reset_setting_count(),
        }
    }
}

/// A checked-out resource that finds its way back to the pool.
pub struct Pooled<R: Resource> {
    pool: Arc<ResourcePool<R>>,
    resource: Option<R>,
}

impl<R: Resource> Pooled<R> {
    /// Returns the resource for reuse.
    pub async fn recycle(mut self) {
        let resource = self.resource.take();
        self.pool.put(resource).await;
    }

    /// Closes the resource and lets the pool create a replacement.
    pub async fn discard(mut self) {
        if let Some(r) = self.resource.take() {
            r.close().await;
        }
        self.pool.put(None).await;
    }
}

impl<R: Resource> Deref for Pooled<R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.resource
            .as_ref()
            .expect("pooled resource accessed after return")
    }
}

impl<R: Resource> DerefMut for Pooled<R> {
    fn deref_mut(&mut self) -> &mut R {
        self.resource
            .as_mut()
            .expect("pooled resource accessed after return")
    }
}

impl<R: Resource> Drop for Pooled<R> {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    resource.close().await;
                    pool.put(None).await;
                });
            }
            Err(_) => tracing::warn!("pooled resource dropped outside a runtime; slot lost"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Counters {
        created: AtomicI64,
        closed: AtomicI64,
        applied: AtomicI64,
        resets: AtomicI64,
        fail_create: AtomicBool,
        fail_reset: AtomicBool,
        fail_apply: AtomicBool,
        expire: AtomicBool,
    }

    struct TestResource {
        id: i64,
        setting: Option<String>,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Resource for TestResource {
        async fn close(self) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn expired(&self, lifetime: Duration) -> bool {
            !lifetime.is_zero() && self.counters.expire.load(Ordering::SeqCst)
        }

        async fn apply_setting(
            &mut self,
            _ctx: &RequestContext,
            setting: &Setting,
        ) -> Result<(), TabletError> {
            if self.counters.fail_apply.load(Ordering::SeqCst) {
                return Err(TabletError::new(Code::Internal, "apply failed"));
            }
            self.counters.applied.fetch_add(1, Ordering::SeqCst);
            self.setting = Some(setting.query().to_string());
            Ok(())
        }

        fn is_setting_applied(&self) -> bool {
            self.setting.is_some()
        }

        fn is_same_setting(&self, setting: &Setting) -> bool {
            self.setting.as_deref() == Some(setting.query())
        }

        async fn reset_setting(&mut self, _ctx: &RequestContext) -> Result<(), TabletError> {
            self.counters.resets.fetch_add(1, Ordering::SeqCst);
            if self.counters.fail_reset.load(Ordering::SeqCst) {
                return Err(TabletError::new(Code::Internal, "reset failed"));
            }
            self.setting = None;
            Ok(())
        }
    }

    struct TestFactory(Arc<Counters>);

    #[async_trait]
    impl ResourceFactory<TestResource> for TestFactory {
        async fn create(&self, _ctx: &RequestContext) -> Result<TestResource, TabletError> {
            if self.0.fail_create.load(Ordering::SeqCst) {
                return Err(TabletError::new(Code::Unavailable, "create failed"));
            }
            let id = self.0.created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TestResource {
                id,
                setting: None,
                counters: Arc::clone(&self.0),
            })
        }
    }

    fn pool(capacity: usize, max_cap: usize) -> (Arc<ResourcePool<TestResource>>, Arc<Counters>) {
        pool_with(capacity, max_cap, Duration::ZERO, Duration::ZERO)
    }

    fn pool_with(
        capacity: usize,
        max_cap: usize,
        idle: Duration,
        lifetime: Duration,
    ) -> (Arc<ResourcePool<TestResource>>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let p = ResourcePool::new(
            Arc::new(TestFactory(Arc::clone(&counters))),
            capacity,
            max_cap,
            idle,
            lifetime,
        )
        .expect("pool");
        (p, counters)
    }

    fn ctx() -> RequestContext {
        RequestContext::background()
    }

    #[tokio::test]
    async fn get_put_keeps_capacity_invariant() {
        let (p, counters) = pool(5, 5);
        let mut held = Vec::new();
        for i in 0..5 {
            held.push(p.get(&ctx(), None).await.expect("get"));
            assert_eq!(p.available() + p.in_use(), 5);
            assert_eq!(p.active(), i + 1);
        }
        assert_eq!(p.available(), 0);
        assert_eq!(p.exhausted(), 1);
        for r in held.drain(..) {
            p.put(Some(r)).await;
            assert_eq!(p.available() + p.in_use(), 5);
        }
        assert_eq!(p.available(), 5);
        assert_eq!(p.in_use(), 0);

        for _ in 0..5 {
            held.push(p.get(&ctx(), None).await.expect("get"));
        }
        assert_eq!(counters.created.load(Ordering::SeqCst), 5);
        for r in held {
            p.put(Some(r)).await;
        }
        assert_eq!(p.active(), 5);
        assert_eq!(p.get_count(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocked_get_is_served_by_put() {
        let (p, _) = pool(2, 2);
        let a = p.get(&ctx(), None).await.expect("a");
        let _b = p.get(&ctx(), None).await.expect("b");
        let a_id = a.id;

        let waiter = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.get(&RequestContext::background(), None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        p.put(Some(a)).await;
        let got = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter finished")
            .expect("join")
            .expect("get");
        assert_eq!(got.id, a_id);
        assert_eq!(p.wait_count(), 1);
        assert!(p.wait_time() > Duration::ZERO);
        p.put(Some(got)).await;
    }

    #[tokio::test]
    async fn cancelled_wait_times_out() {
        let (p, _) = pool(1, 1);
        let r = p.get(&ctx(), None).await.expect("get");
        let short = ctx().with_timeout(Duration::from_millis(20));
        let err = p.get(&short, None).await.map(|_| ()).unwrap_err();
        assert_eq!(err, PoolError::Timeout);
        assert_eq!(TabletError::from(err).code(), Code::ResourceExhausted);
        p.put(Some(r)).await;
    }

    #[tokio::test]
    async fn expired_context_fails_fast() {
        let (p, _) = pool(1, 1);
        let done = ctx();
        done.cancel();
        let err = p.get(&done, None).await.map(|_| ()).unwrap_err();
        assert_eq!(err, PoolError::ContextExpired);
        assert_eq!(TabletError::from(err).code(), Code::DeadlineExceeded);
        assert_eq!(p.get_count(), 0);
        assert_eq!(p.available(), 1);
    }

    #[tokio::test]
    async fn factory_failure_restores_empty_slot() {
        let (p, counters) = pool(1, 1);
        counters.fail_create.store(true, Ordering::SeqCst);
        let err = p.get(&ctx(), None).await.map(|_| ()).unwrap_err();
        assert!(matches!(err, PoolError::Resource(_)));
        assert_eq!(p.available(), 1);
        assert_eq!(p.active(), 0);

        counters.fail_create.store(false, Ordering::SeqCst);
        let r = p.get(&ctx(), None).await.expect("get after recovery");
        assert_eq!(p.active(), 1);
        p.put(Some(r)).await;
    }

    #[tokio::test]
    async fn matching_setting_is_not_reapplied() {
        let (p, counters) = pool(1, 1);
        let s1 = Setting::new("set @@session.sql_mode = ''", "set @@session.sql_mode = default");
        let s2 = Setting::new("set @@session.time_zone = '+00:00'", "set @@session.time_zone = default");

        let r = p.get(&ctx(), Some(&s1)).await.expect("get s1");
        assert!(r.is_same_setting(&s1));
        p.put(Some(r)).await;
        assert_eq!(counters.applied.load(Ordering::SeqCst), 1);

        let r = p.get(&ctx(), Some(&s1)).await.expect("get s1 again");
        assert_eq!(counters.applied.load(Ordering::SeqCst), 1);
        assert_eq!(p.diff_setting_count(), 0);
        p.put(Some(r)).await;

        let r = p.get(&ctx(), Some(&s2)).await.expect("get s2");
        assert!(r.is_same_setting(&s2));
        assert_eq!(p.diff_setting_count(), 1);
        assert_eq!(counters.resets.load(Ordering::SeqCst), 1);
        assert_eq!(counters.applied.load(Ordering::SeqCst), 2);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(p.get_setting_count(), 3);
        p.put(Some(r)).await;
    }

    #[tokio::test]
    async fn idle_slot_with_matching_setting_is_preferred() {
        let (p, counters) = pool(2, 2);
        let s1 = Setting::new("set @@session.sql_mode = ''", "set @@session.sql_mode = default");
        let s2 = Setting::new("set @@session.time_zone = '+00:00'", "set @@session.time_zone = default");

        let a = p.get(&ctx(), Some(&s1)).await.expect("get s1");
        let b = p.get(&ctx(), Some(&s2)).await.expect("get s2");
        let (a_id, b_id) = (a.id, b.id);
        p.put(Some(a)).await;
        p.put(Some(b)).await;

        let r = p.get(&ctx(), Some(&s2)).await.expect("get s2 again");
        assert_eq!(r.id, b_id);
        assert_eq!(p.diff_setting_count(), 0);
        assert_eq!(counters.resets.load(Ordering::SeqCst), 0);
        assert_eq!(counters.applied.load(Ordering::SeqCst), 2);
        p.put(Some(r)).await;

        let r = p.get(&ctx(), Some(&s1)).await.expect("get s1 again");
        assert_eq!(r.id, a_id);
        assert_eq!(counters.applied.load(Ordering::SeqCst), 2);
        p.put(Some(r)).await;
    }

    #[tokio::test]
    async fn plain_get_resets_settings_resource() {
        let (p, counters) = pool(1, 1);
        let s = Setting::new("set @@session.sql_mode = ''", "set @@session.sql_mode = default");
        let r = p.get(&ctx(), Some(&s)).await.expect("get");
        p.put(Some(r)).await;

        let r = p.get(&ctx(), None).await.expect("plain get");
        assert!(!r.is_setting_applied());
        assert_eq!(p.reset_setting_count(), 1);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        p.put(Some(r)).await;
    }

    #[tokio::test]
    async fn failed_reset_closes_and_recreates() {
        let (p, counters) = pool(1, 1);
        let s = Setting::new("set @@session.sql_mode = ''", "set @@session.sql_mode = default");
        let r = p.get(&ctx(), Some(&s)).await.expect("get");
        p.put(Some(r)).await;

        counters.fail_reset.store(true, Ordering::SeqCst);
        let r = p.get(&ctx(), None).await.expect("plain get");
        assert_eq!(r.id, 2);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(p.active(), 1);
        p.put(Some(r)).await;
    }

    #[tokio::test]
    async fn failed_apply_returns_resource_to_plain_queue() {
        let (p, counters) = pool(1, 1);
        let warm = p.get(&ctx(), None).await.expect("warm");
        p.put(Some(warm)).await;

        counters.fail_apply.store(true, Ordering::SeqCst);
        let s = Setting::new("set @@session.sql_mode = ''", "set @@session.sql_mode = default");
        assert!(p.get(&ctx(), Some(&s)).await.is_err());
        assert_eq!(p.available(), 1);
        assert_eq!(p.active(), 1);

        let r = p.get(&ctx(), None).await.expect("plain get");
        assert_eq!(r.id, 1);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        p.put(Some(r)).await;
    }

    #[tokio::test]
    async fn put_none_and_expired_resources_are_replaced() {
        let (p, counters) = pool_with(1, 1, Duration::ZERO, Duration::from_secs(3600));
        let r = p.get(&ctx(), None).await.expect("get");
        drop(r);
        p.put(None).await;
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
        assert_eq!(p.active(), 1);

        counters.expire.store(true, Ordering::SeqCst);
        let r = p.get(&ctx(), None).await.expect("get");
        p.put(Some(r)).await;
        assert_eq!(p.max_lifetime_closed(), 1);
        assert_eq!(counters.created.load(Ordering::SeqCst), 3);
        assert_eq!(p.available(), 1);
    }

    #[tokio::test]
    async fn set_capacity_grows_shrinks_and_closes() {
        let (p, counters) = pool(2, 4);
        assert_eq!(
            p.set_capacity(5).await,
            Err(PoolError::CapacityOutOfRange(5))
        );
        assert_eq!(p.capacity(), 2);

        p.set_capacity(4).await.expect("grow");
        assert_eq!(p.available(), 4);
        let a = p.get(&ctx(), None).await.expect("a");
        p.put(Some(a)).await;

        p.set_capacity(1).await.expect("shrink");
        assert_eq!(p.capacity(), 1);
        assert_eq!(p.available(), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(p.active(), 0);

        p.set_capacity(0).await.expect("close");
        assert!(p.is_closed());
        let err = p.get(&ctx(), None).await.map(|_| ()).unwrap_err();
        assert_eq!(err, PoolError::Closed);

        p.set_capacity(2).await.expect("reopen");
        assert!(!p.is_closed());
        let r = p.get(&ctx(), None).await.expect("get after reopen");
        p.put(Some(r)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shrink_waits_for_outstanding_resources() {
        let (p, counters) = pool(1, 1);
        let r = p.get(&ctx(), None).await.expect("get");
        let closer = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.close().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!closer.is_finished());

        p.put(Some(r)).await;
        tokio::time::timeout(Duration::from_secs(2), closer)
            .await
            .expect("close finished")
            .expect("join");
        assert!(p.is_closed());
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(p.active(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_resources_are_replaced() {
        let (p, counters) = pool_with(2, 2, Duration::from_millis(40), Duration::ZERO);
        let r = p.get(&ctx(), None).await.expect("get");
        p.put(Some(r)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(p.idle_closed() >= 1);
        assert!(counters.created.load(Ordering::SeqCst) >= 2);
        assert_eq!(p.active(), 1);
        assert_eq!(p.available(), 2);
        p.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_sweep_reaches_settings_slots() {
        let (p, counters) = pool_with(2, 2, Duration::from_millis(40), Duration::ZERO);
        let s = Setting::new("set @@session.sql_mode = ''", "set @@session.sql_mode = default");
        let plain = p.get(&ctx(), None).await.expect("plain");
        let tagged = p.get(&ctx(), Some(&s)).await.expect("tagged");
        let tagged_id = tagged.id;
        p.put(Some(plain)).await;
        p.put(Some(tagged)).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(p.idle_closed() >= 2);
        assert!(counters.closed.load(Ordering::SeqCst) >= 2);

        let r = p.get(&ctx(), Some(&s)).await.expect("get after sweep");
        assert!(r.id > tagged_id);
        assert_eq!(counters.applied.load(Ordering::SeqCst), 2);
        p.put(Some(r)).await;
        p.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn only_one_of_two_stray_puts_is_accepted() {
        let (p, counters) = pool(1, 2);
        let _held = p.get(&ctx(), None).await.expect("get");

        let puts: Vec<_> = (0..2)
            .map(|i| {
                let p = Arc::clone(&p);
                let stray = TestResource {
                    id: 100 + i,
                    setting: None,
                    counters: Arc::clone(&counters),
                };
                tokio::spawn(async move { p.put(Some(stray)).await })
            })
            .collect();
        let mut panicked = 0;
        for put in puts {
            if put.await.is_err_and(|e| e.is_panic()) {
                panicked += 1;
            }
        }
        assert_eq!(panicked, 1);
        assert_eq!(p.in_use(), 0);
        assert_eq!(p.available(), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "attempt to Put into a full ResourcePool")]
    async fn put_without_get_panics() {
        let (p, counters) = pool(1, 1);
        let stray = TestResource {
            id: 99,
            setting: None,
            counters,
        };
        p.put(Some(stray)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_pooled_guard_frees_its_slot() {
        let (p, counters) = pool(1, 1);
        let guard = p.get_pooled(&ctx(), None).await.expect("get");
        assert_eq!(guard.id, 1);
        drop(guard);
        let r = tokio::time::timeout(Duration::from_secs(2), p.get(&ctx(), None))
            .await
            .expect("slot returned")
            .expect("get");
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        p.put(Some(r)).await;

        let guard = p.get_pooled(&ctx(), None).await.expect("get");
        guard.recycle().await;
        assert_eq!(p.in_use(), 0);
        assert_eq!(p.stats().available, 1);
    }

    #[test]
    fn stats_serialize_pascal_case() {
        let json = serde_json::to_value(PoolStats::default()).expect("json");
        assert!(json.get("InUse").is_some());
        assert!(json.get("MaxLifetimeClosed").is_some());
    }
}
