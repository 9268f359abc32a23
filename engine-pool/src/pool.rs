//! Engine Pool - Public Façade
//!
//! [`EnginePool`] is what the rest of an application talks to. It wires the
//! confinement dispatcher, the store, the lifecycle controller and the idle
//! evictor together and exposes acquire / release / clear on top of them.
//!
//! # Threading:
//! - Every store mutation and every lifecycle call on a pooled engine runs on
//!   the dispatcher's owning thread
//! - `acquire` blocks the caller for at most `acquire_timeout_ms`; on timeout
//!   or when the owning thread is gone it follows the configured
//!   [`FallbackPolicy`]
//! - `release` never blocks
//!
//! The pool is an explicitly constructed value. Clones share one set of
//! engines; the last clone to drop shuts the pool down.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{FallbackPolicy, PoolConfig};
use crate::dispatch::{Confined, Dispatcher};
use crate::engine::{
    CallerContext, EngineFactory, EngineLifecycle, HandleId, PoolStats, PoolStore, RenderEngine,
    ReleaseOutcome,
};
use crate::error::{DispatchError, EngineError, PoolError, PoolResult};
use crate::eviction::{IdleEvictor, IdleSweep};
use crate::perf::{PoolMetrics, PoolMetricsSnapshot, ScopedTimer};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// A pooled engine lent to a caller.
///
/// Handles are plain values: copying one does not duplicate the engine, and
/// releasing a handle twice is harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle {
    pool: u64,
    id: HandleId,
}

impl EngineHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }
}

/// Where a handle currently sits inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Available,
    InUse,
    /// Destroyed, or never belonged to this pool.
    Absent,
}

/// An engine built outside the pool by the emergency fallback.
///
/// The pool never tracks it. Dropping it destroys the engine, so it should be
/// dropped on the thread that acquired it.
pub struct StandaloneEngine<E: RenderEngine> {
    id: HandleId,
    context: CallerContext,
    engine: Option<E>,
}

impl<E: RenderEngine> StandaloneEngine<E> {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn context(&self) -> &CallerContext {
        &self.context
    }

    pub fn engine(&self) -> Option<&E> {
        self.engine.as_ref()
    }

    pub fn engine_mut(&mut self) -> Option<&mut E> {
        self.engine.as_mut()
    }

    /// Detach and destroy the engine now.
    pub fn destroy(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let Some(mut engine) = self.engine.take() else {
            return;
        };
        if let Err(err) = engine.detach_from_parent() {
            debug!(handle = %self.id, error = %err, "Detach of standalone engine failed");
        }
        match engine.destroy() {
            Ok(()) | Err(EngineError::Destroyed) => {
                debug!(handle = %self.id, "Standalone engine destroyed");
            }
            Err(err) => warn!(handle = %self.id, error = %err, "Standalone engine destroy failed"),
        }
    }
}

impl<E: RenderEngine> Drop for StandaloneEngine<E> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<E: RenderEngine> std::fmt::Debug for StandaloneEngine<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandaloneEngine")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("destroyed", &self.engine.is_none())
            .finish()
    }
}

/// What `acquire` hands back.
#[derive(Debug)]
pub enum Lease<E: RenderEngine> {
    /// Tracked by the pool; give it back with [`EnginePool::release`].
    Pooled(EngineHandle),
    /// Built by the emergency fallback; never returns to the pool.
    Standalone(StandaloneEngine<E>),
}

impl<E: RenderEngine> Lease<E> {
    pub fn is_pooled(&self) -> bool {
        matches!(self, Lease::Pooled(_))
    }

    pub fn handle(&self) -> Option<EngineHandle> {
        match self {
            Lease::Pooled(handle) => Some(*handle),
            Lease::Standalone(_) => None,
        }
    }

    pub fn into_standalone(self) -> Option<StandaloneEngine<E>> {
        match self {
            Lease::Pooled(_) => None,
            Lease::Standalone(engine) => Some(engine),
        }
    }
}

/// Platform memory and lifecycle signals the pool reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySignal {
    LowMemory,
    /// The application moved to the background.
    Background,
    /// The application is visible again.
    Foreground,
}

/// State reachable from confined tasks. Holds no dispatcher, so a task that
/// outlives the pool never keeps the owning thread alive.
struct PoolCore<F: EngineFactory> {
    id: u64,
    config: PoolConfig,
    lifecycle: EngineLifecycle<F>,
    store: Confined<PoolStore<F::Engine>>,
    metrics: Arc<PoolMetrics>,
    evictor: IdleEvictor,
    warm_context: CallerContext,
    closed: AtomicBool,
}

impl<F: EngineFactory> PoolCore<F> {
    fn acquire_confined(&self, context: &CallerContext) -> PoolResult<HandleId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::Unavailable.into());
        }
        let acquired = self
            .store
            .with(|store| store.acquire(context, &self.lifecycle))??;
        if acquired.reused {
            self.metrics.record_reuse();
        }
        Ok(acquired.id)
    }

    fn release_confined(&self, id: HandleId) {
        let outcome = self
            .store
            .with(|store| store.release(id, Instant::now(), &self.lifecycle));
        match outcome {
            Ok(ReleaseOutcome::Pooled) | Ok(ReleaseOutcome::Discarded) => {
                self.metrics.record_release()
            }
            Ok(ReleaseOutcome::Overflowed) => {
                self.metrics.record_release();
                self.metrics.record_overflow();
            }
            Ok(ReleaseOutcome::Unknown) => self.metrics.record_unknown_release(),
            Err(err) => warn!(handle = %id, error = %err, "Release could not reach the store"),
        }
    }

    fn clear_confined(&self) -> Result<usize, DispatchError> {
        let cleared = self.store.with(|store| store.clear(&self.lifecycle))?;
        self.metrics.record_cleared(cleared);
        info!(cleared, "Pool cleared");
        Ok(cleared)
    }

    /// Top the Available set up to `init_pool_size`.
    fn warm_confined(&self) -> Result<usize, DispatchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(0);
        }
        self.store.with(|store| {
            let mut created = 0;
            while store.stats().available < self.config.init_pool_size {
                let entry = match self.lifecycle.create(&self.warm_context) {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!(error = %err, "Warm-up stopped early");
                        break;
                    }
                };
                if let Err(mut rejected) = store.insert_available(entry, Instant::now()) {
                    self.lifecycle.destroy(&mut rejected);
                    break;
                }
                created += 1;
            }
            created
        })
    }

    fn sweep_confined(&self) -> usize {
        let swept = self.store.with(|store| {
            self.evictor
                .sweep(store, &self.lifecycle, &self.metrics, Instant::now())
        });
        swept.unwrap_or_else(|err| {
            debug!(error = %err, "Idle sweep skipped");
            0
        })
    }

    fn drain_confined(&self) -> Result<usize, DispatchError> {
        self.store.with(|store| store.drain_all(&self.lifecycle))
    }
}

struct PoolShared<F: EngineFactory> {
    core: Arc<PoolCore<F>>,
    dispatcher: Dispatcher,
}

impl<F: EngineFactory> PoolShared<F> {
    fn shutdown(&self) {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let core = Arc::clone(&self.core);
        match self.dispatcher.run_confined(move || core.drain_confined()) {
            Ok(Ok(drained)) => info!(pool = self.core.id, drained, "Engine pool shut down"),
            Ok(Err(err)) | Err(err) => {
                warn!(pool = self.core.id, error = %err, "Engines not drained before shutdown")
            }
        }
        self.dispatcher.shutdown();
    }
}

impl<F: EngineFactory> IdleSweep for PoolShared<F> {
    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn sweep_idle(&self) -> usize {
        self.core.sweep_confined()
    }
}

impl<F: EngineFactory> Drop for PoolShared<F> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A pool of thread-confined rendering engines.
pub struct EnginePool<F: EngineFactory> {
    shared: Arc<PoolShared<F>>,
}

impl<F: EngineFactory> Clone for EnginePool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: EngineFactory> EnginePool<F> {
    /// Start a pool: spawn the owning thread, warm `init_pool_size` engines
    /// for `warm_context` and schedule idle sweeps.
    pub fn new(factory: F, config: PoolConfig, warm_context: CallerContext) -> PoolResult<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::spawn(config.thread_name.clone(), config.acquire_timeout())
            .map_err(|err| {
                warn!(error = %err, "Failed to spawn confinement thread");
                DispatchError::Unavailable
            })?;

        let metrics = PoolMetrics::new();
        let core = Arc::new(PoolCore {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            lifecycle: EngineLifecycle::new(factory, config.settings.clone(), Arc::clone(&metrics)),
            store: Confined::new(dispatcher.owner(), PoolStore::new(config.max_pool_size)),
            metrics,
            evictor: IdleEvictor::new(config.idle_timeout(), config.sweep_interval()),
            warm_context,
            closed: AtomicBool::new(false),
            config,
        });
        let pool = Self {
            shared: Arc::new(PoolShared { core, dispatcher }),
        };

        let warmed = pool.warm_up();
        pool.shared.core.evictor.schedule(&pool.shared)?;
        info!(
            pool = pool.shared.core.id,
            warmed,
            max_pool_size = pool.shared.core.config.max_pool_size,
            idle_timeout = ?pool.shared.core.config.idle_timeout(),
            "Engine pool started"
        );
        Ok(pool)
    }

    fn core(&self) -> &Arc<PoolCore<F>> {
        &self.shared.core
    }

    pub fn config(&self) -> &PoolConfig {
        &self.core().config
    }

    /// The owning thread, for collaborators that schedule their own engine work.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    pub fn is_shut_down(&self) -> bool {
        self.core().closed.load(Ordering::SeqCst)
    }

    /// Borrow an engine for `context`, blocking until the owning thread answers.
    ///
    /// Called on the owning thread itself this runs inline.
    pub fn acquire(&self, context: &CallerContext) -> PoolResult<Lease<F::Engine>> {
        let _timer = ScopedTimer::new(&self.core().metrics);
        let core = Arc::clone(self.core());
        let task_context = context.clone();
        let outcome = self.shared.dispatcher.run_confined_or_else(
            move || core.acquire_confined(&task_context),
            self.undelivered_hook(),
        );
        self.finish_acquire(context, outcome)
    }

    /// Async counterpart of [`acquire`](Self::acquire).
    pub async fn acquire_async(&self, context: &CallerContext) -> PoolResult<Lease<F::Engine>> {
        let _timer = ScopedTimer::new(&self.core().metrics);
        let core = Arc::clone(self.core());
        let task_context = context.clone();
        let outcome = self
            .shared
            .dispatcher
            .run_confined_async_or_else(
                move || core.acquire_confined(&task_context),
                self.undelivered_hook(),
            )
            .await;
        self.finish_acquire(context, outcome)
    }

    /// Puts back an engine whose caller stopped waiting for it.
    fn undelivered_hook(&self) -> impl FnOnce(PoolResult<HandleId>) + Send + 'static {
        let core = Arc::clone(self.core());
        move |result| {
            if let Ok(id) = result {
                debug!(handle = %id, "Returning engine from abandoned acquire");
                core.release_confined(id);
            }
        }
    }

    fn finish_acquire(
        &self,
        context: &CallerContext,
        outcome: Result<PoolResult<HandleId>, DispatchError>,
    ) -> PoolResult<Lease<F::Engine>> {
        let cause = match outcome {
            Ok(Ok(id)) => {
                return Ok(Lease::Pooled(EngineHandle {
                    pool: self.core().id,
                    id,
                }))
            }
            // Busy: a reentrant acquire while the store is borrowed up the stack.
            Ok(Err(PoolError::Dispatch(
                cause @ (DispatchError::Unavailable | DispatchError::Busy),
            ))) => cause,
            Ok(Err(err)) => return Err(err),
            Err(err @ (DispatchError::Unavailable | DispatchError::Timeout(_))) => err,
            Err(err) => return Err(err.into()),
        };
        if matches!(cause, DispatchError::Timeout(_)) {
            self.core().metrics.record_timeout();
        }
        self.fallback(context, cause)
    }

    fn fallback(
        &self,
        context: &CallerContext,
        cause: DispatchError,
    ) -> PoolResult<Lease<F::Engine>> {
        let core = self.core();
        if core.config.fallback == FallbackPolicy::Fail {
            warn!(context = %context, cause = %cause, "Acquire failed; fallback disabled");
            return Err(cause.into());
        }
        let entry = core.lifecycle.create(context)?;
        core.metrics.record_fallback();
        warn!(
            handle = %entry.id(),
            context = %context,
            cause = %cause,
            "Pool unreachable; handing out standalone engine"
        );
        Ok(Lease::Standalone(StandaloneEngine {
            id: entry.id(),
            context: context.clone(),
            engine: Some(entry.into_engine()),
        }))
    }

    /// Give an engine back. Never blocks; unknown or repeated handles are ignored.
    pub fn release(&self, handle: EngineHandle) {
        if handle.pool != self.core().id {
            debug!(handle = %handle.id, "Release of foreign handle ignored");
            self.core().metrics.record_unknown_release();
            return;
        }
        let core = Arc::clone(self.core());
        if let Err(err) = self
            .shared
            .dispatcher
            .post_confined(move || core.release_confined(handle.id))
        {
            debug!(handle = %handle.id, error = %err, "Release after shutdown ignored");
        }
    }

    /// Release a pooled lease, or destroy a standalone one here and now.
    pub fn release_lease(&self, lease: Lease<F::Engine>) {
        match lease {
            Lease::Pooled(handle) => self.release(handle),
            Lease::Standalone(engine) => engine.destroy(),
        }
    }

    /// Run `f` against a lent engine on the owning thread.
    pub fn with_engine<T, G>(&self, handle: EngineHandle, f: G) -> PoolResult<T>
    where
        G: FnOnce(&mut F::Engine) -> T + Send + 'static,
        T: Send + 'static,
    {
        if handle.pool != self.core().id {
            return Err(PoolError::UnknownHandle(handle.id));
        }
        let core = Arc::clone(self.core());
        let id = handle.id;
        let result = self.shared.dispatcher.run_confined(move || {
            core.store
                .with(|store| store.in_use_mut(id).map(|entry| f(entry.engine_mut())))
        })??;
        result.ok_or(PoolError::UnknownHandle(id))
    }

    /// Destroy every idle engine now. Lent engines are untouched.
    pub fn clear(&self) -> usize {
        let core = Arc::clone(self.core());
        match self.shared.dispatcher.run_confined(move || core.clear_confined()) {
            Ok(Ok(cleared)) => cleared,
            Ok(Err(err)) | Err(err) => {
                warn!(error = %err, "Clear did not run");
                0
            }
        }
    }

    /// Create engines until the Available set holds `init_pool_size`.
    pub fn warm_up(&self) -> usize {
        let core = Arc::clone(self.core());
        match self.shared.dispatcher.run_confined(move || core.warm_confined()) {
            Ok(Ok(created)) => created,
            Ok(Err(err)) | Err(err) => {
                warn!(error = %err, "Warm-up did not run");
                0
            }
        }
    }

    pub fn on_memory_signal(&self, signal: MemorySignal) {
        debug!(signal = ?signal, "Memory signal received");
        match signal {
            MemorySignal::LowMemory | MemorySignal::Background => {
                self.clear();
            }
            MemorySignal::Foreground => {
                self.warm_up();
            }
        }
    }

    pub fn stats(&self) -> PoolResult<PoolStats> {
        let core = Arc::clone(self.core());
        let stats = self
            .shared
            .dispatcher
            .run_confined(move || core.store.with(|store| store.stats()))??;
        Ok(stats)
    }

    pub fn handle_state(&self, handle: EngineHandle) -> PoolResult<HandleState> {
        if handle.pool != self.core().id {
            return Ok(HandleState::Absent);
        }
        let core = Arc::clone(self.core());
        let id = handle.id;
        let state = self.shared.dispatcher.run_confined(move || {
            core.store.with(|store| {
                if store.is_in_use(id) {
                    HandleState::InUse
                } else if store.is_available(id) {
                    HandleState::Available
                } else {
                    HandleState::Absent
                }
            })
        })??;
        Ok(state)
    }

    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.core().metrics.snapshot()
    }

    /// Destroy every engine, lent ones included, and stop the owning thread.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl<F: EngineFactory> std::fmt::Debug for EnginePool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePool")
            .field("id", &self.core().id)
            .field("dispatcher", &self.shared.dispatcher)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{HeadlessEngine, HeadlessFactory};
    use std::thread;
    use std::time::Duration;

    fn pool_with(config: PoolConfig) -> EnginePool<HeadlessFactory> {
        EnginePool::new(HeadlessFactory::new(), config, CallerContext::new("browser")).unwrap()
    }

    fn pool() -> EnginePool<HeadlessFactory> {
        pool_with(PoolConfig::default())
    }

    #[test]
    fn test_new_warms_init_pool_size() {
        let pool = pool_with(PoolConfig {
            init_pool_size: 3,
            ..PoolConfig::default()
        });
        let stats = pool.stats().unwrap();
        assert_eq!(stats.available, 3);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.max_available, 5);
        assert_eq!(pool.metrics().created, 3);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let err = EnginePool::new(
            HeadlessFactory::new(),
            PoolConfig {
                init_pool_size: 9,
                ..PoolConfig::default()
            },
            CallerContext::new("browser"),
        )
        .unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
    }

    #[test]
    fn test_acquire_reuses_warm_engine() {
        let pool = pool();
        let lease = pool.acquire(&CallerContext::new("browser")).unwrap();
        assert!(lease.is_pooled());
        let snapshot = pool.metrics();
        assert_eq!(snapshot.reused, 1);
        assert_eq!(snapshot.created, 1);
        assert_eq!(pool.stats().unwrap().in_use, 1);
    }

    #[test]
    fn test_engine_used_only_on_owner_thread() {
        let pool = pool();
        let handle = pool
            .acquire(&CallerContext::new("browser"))
            .unwrap()
            .handle()
            .unwrap();
        let owner = pool.dispatcher().owner();
        let engine_owner = pool.with_engine(handle, |engine| engine.owner()).unwrap();
        assert_eq!(engine_owner, owner);
        assert_ne!(engine_owner, thread::current().id());
    }

    #[test]
    fn test_with_engine_rejects_released_handle() {
        let pool = pool();
        let handle = pool
            .acquire(&CallerContext::new("browser"))
            .unwrap()
            .handle()
            .unwrap();
        pool.release(handle);
        assert_eq!(
            pool.with_engine(handle, |_| ()),
            Err(PoolError::UnknownHandle(handle.id()))
        );
    }

    #[test]
    fn test_foreign_handle_is_ignored() {
        let a = pool();
        let b = pool();
        let ctx = CallerContext::new("browser");
        let handle = a.acquire(&ctx).unwrap().handle().unwrap();
        let other = b.acquire(&ctx).unwrap().handle().unwrap();

        b.release(handle);
        assert_eq!(b.handle_state(other).unwrap(), HandleState::InUse);
        assert_eq!(b.handle_state(handle).unwrap(), HandleState::Absent);
        assert_eq!(b.metrics().unknown_releases, 1);
    }

    #[test]
    fn test_memory_signals() {
        let pool = pool_with(PoolConfig {
            init_pool_size: 2,
            ..PoolConfig::default()
        });
        pool.on_memory_signal(MemorySignal::Background);
        assert_eq!(pool.stats().unwrap().available, 0);
        pool.on_memory_signal(MemorySignal::Foreground);
        assert_eq!(pool.stats().unwrap().available, 2);
        pool.on_memory_signal(MemorySignal::LowMemory);
        assert_eq!(pool.stats().unwrap().available, 0);
        assert_eq!(pool.metrics().cleared, 4);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_destroys_everything() {
        let pool = pool();
        let ctx = CallerContext::new("browser");
        let _a = pool.acquire(&ctx).unwrap();
        let _b = pool.acquire(&ctx).unwrap();
        pool.shutdown();
        pool.shutdown();

        assert!(pool.is_shut_down());
        assert!(!pool.dispatcher().is_running());
        assert_eq!(pool.metrics().destroyed, 2);
    }

    #[test]
    fn test_acquire_after_shutdown_falls_back() {
        let pool = pool();
        pool.shutdown();
        let lease = pool.acquire(&CallerContext::new("browser")).unwrap();
        let standalone = lease.into_standalone().unwrap();
        assert_eq!(
            standalone.engine().map(HeadlessEngine::owner),
            Some(thread::current().id())
        );
        assert_eq!(pool.metrics().fallbacks, 1);
        standalone.destroy();
    }

    #[test]
    fn test_acquire_after_shutdown_fails_when_fallback_disabled() {
        let pool = pool_with(PoolConfig {
            fallback: FallbackPolicy::Fail,
            ..PoolConfig::default()
        });
        pool.shutdown();
        let err = pool.acquire(&CallerContext::new("browser")).unwrap_err();
        assert_eq!(err, PoolError::Dispatch(DispatchError::Unavailable));
    }

    #[test]
    fn test_last_clone_drop_shuts_down() {
        let pool = pool();
        let clone = pool.clone();
        drop(pool);
        assert!(!clone.is_shut_down());
        assert_eq!(clone.stats().unwrap().available, 1);
        drop(clone);
    }

    #[tokio::test]
    async fn test_acquire_async() {
        let pool = pool();
        let lease = pool
            .acquire_async(&CallerContext::new("browser"))
            .await
            .unwrap();
        assert!(lease.is_pooled());
        pool.release_lease(lease);
        let stats = pool.stats().unwrap();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.available, 1);
    }

    #[test]
    fn test_timed_out_acquire_returns_engine_to_pool() {
        let pool = pool_with(PoolConfig {
            acquire_timeout_ms: 50,
            ..PoolConfig::default()
        });
        pool.dispatcher()
            .post_confined(|| thread::sleep(Duration::from_millis(200)))
            .unwrap();

        // Under the default policy the caller gets a standalone engine instead.
        let lease = pool.acquire(&CallerContext::new("browser")).unwrap();
        assert!(!lease.is_pooled());
        assert_eq!(pool.metrics().timeouts, 1);
        drop(lease);

        // The abandoned pooled engine went back to Available rather than InUse.
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut stats = pool.stats();
        while stats.is_err() && Instant::now() < deadline {
            stats = pool.stats();
        }
        let stats = stats.unwrap();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.available, 1);
    }

    #[tokio::test]
    async fn test_acquire_async_timeout_returns_engine_to_pool() {
        let pool = pool_with(PoolConfig {
            acquire_timeout_ms: 50,
            ..PoolConfig::default()
        });
        pool.dispatcher()
            .post_confined(|| thread::sleep(Duration::from_millis(200)))
            .unwrap();

        let lease = pool
            .acquire_async(&CallerContext::new("browser"))
            .await
            .unwrap();
        assert!(!lease.is_pooled());
        assert_eq!(pool.metrics().timeouts, 1);
        drop(lease);

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut stats = pool.stats();
        while stats.is_err() && Instant::now() < deadline {
            stats = pool.stats();
        }
        let stats = stats.unwrap();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.available, 1);
    }

    #[test]
    fn test_nested_acquire_inside_with_engine_falls_back() {
        let pool = pool();
        let handle = pool
            .acquire(&CallerContext::new("browser"))
            .unwrap()
            .handle()
            .unwrap();
        let inner = pool.clone();
        let pooled = pool
            .with_engine(handle, move |_| {
                inner
                    .acquire(&CallerContext::new("browser"))
                    .map(|lease| lease.is_pooled())
            })
            .unwrap();
        assert_eq!(pooled, Ok(false));
        assert_eq!(pool.metrics().fallbacks, 1);
        assert_eq!(pool.handle_state(handle).unwrap(), HandleState::InUse);
    }

    #[test]
    fn test_nested_acquire_fails_when_fallback_disabled() {
        let pool = pool_with(PoolConfig {
            fallback: FallbackPolicy::Fail,
            ..PoolConfig::default()
        });
        let handle = pool
            .acquire(&CallerContext::new("browser"))
            .unwrap()
            .handle()
            .unwrap();
        let inner = pool.clone();
        let nested = pool
            .with_engine(handle, move |_| {
                inner
                    .acquire(&CallerContext::new("browser"))
                    .map(|lease| lease.is_pooled())
            })
            .unwrap();
        assert_eq!(nested, Err(PoolError::Dispatch(DispatchError::Busy)));
    }

    #[test]
    fn test_shutdown_with_busy_owner_is_bounded() {
        let pool = pool_with(PoolConfig {
            acquire_timeout_ms: 50,
            ..PoolConfig::default()
        });
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        pool.dispatcher()
            .post_confined(move || {
                let _ = started_tx.send(());
                thread::sleep(Duration::from_secs(2));
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let start = Instant::now();
        pool.shutdown();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(pool.is_shut_down());
    }

    #[test]
    fn test_drop_with_busy_owner_is_bounded() {
        let pool = pool_with(PoolConfig {
            acquire_timeout_ms: 50,
            ..PoolConfig::default()
        });
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        pool.dispatcher()
            .post_confined(move || {
                let _ = started_tx.send(());
                thread::sleep(Duration::from_secs(2));
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let start = Instant::now();
        drop(pool);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
