//! Instance Lifecycle Controller
//!
//! [`EngineLifecycle`] is the only code that constructs, validates, resets or
//! tears down an engine. Everything else in the pool moves [`PooledEngine`]
//! entries around and asks this controller what to do with them.
//!
//! Apart from the emergency fallback path, every method here runs on the
//! pool's owning thread.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{CallerContext, EngineFactory, EngineSettings, RenderEngine, BLANK_URL};
use crate::error::EngineError;
use crate::perf::PoolMetrics;

/// Stable identity of one engine instance for its whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

/// One engine plus the bookkeeping the pool needs about it.
#[derive(Debug)]
pub struct PooledEngine<E> {
    id: HandleId,
    engine: E,
    context: CallerContext,
    created_at: Instant,
    /// Only meaningful while the entry sits in the Available set.
    last_released_at: Instant,
    destroyed: bool,
}

impl<E> PooledEngine<E> {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// The context this engine was created against.
    pub fn context(&self) -> &CallerContext {
        &self.context
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_released_at(&self) -> Instant {
        self.last_released_at
    }

    /// Time spent idle as of `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_released_at)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub(crate) fn mark_released(&mut self, now: Instant) {
        self.last_released_at = now;
    }

    pub(crate) fn into_engine(self) -> E {
        self.engine
    }
}

/// Creates, validates, resets and destroys engines.
pub struct EngineLifecycle<F: EngineFactory> {
    factory: F,
    settings: EngineSettings,
    metrics: Arc<PoolMetrics>,
    next_id: AtomicU64,
}

impl<F: EngineFactory> EngineLifecycle<F> {
    pub fn new(factory: F, settings: EngineSettings, metrics: Arc<PoolMetrics>) -> Self {
        Self {
            factory,
            settings,
            metrics,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Build a fresh engine for `context` with the baseline settings.
    pub fn create(&self, context: &CallerContext) -> Result<PooledEngine<F::Engine>, EngineError> {
        let engine = self.factory.create(context, &self.settings)?;
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = Instant::now();
        self.metrics.record_created();
        debug!(handle = %id, context = %context, "Engine created");
        Ok(PooledEngine {
            id,
            engine,
            context: context.clone(),
            created_at: now,
            last_released_at: now,
            destroyed: false,
        })
    }

    /// Whether `entry` may be handed to a caller in `context`.
    ///
    /// Fails closed: an engine that errors or panics while being checked is
    /// reported invalid.
    pub fn is_valid(&self, entry: &PooledEngine<F::Engine>, context: &CallerContext) -> bool {
        if entry.destroyed {
            return false;
        }
        let alive = panic::catch_unwind(AssertUnwindSafe(|| entry.engine.is_alive()));
        let valid = match alive {
            Ok(Ok(true)) => entry.context == *context,
            Ok(Ok(false)) => false,
            Ok(Err(err)) => {
                debug!(handle = %entry.id, error = %err, "Validity check failed");
                false
            }
            Err(_) => {
                warn!(handle = %entry.id, "Validity check panicked");
                false
            }
        };
        if !valid {
            self.metrics.record_invalidated();
            debug!(
                handle = %entry.id,
                created_for = %entry.context,
                requested_for = %context,
                "Engine rejected as invalid"
            );
        }
        valid
    }

    /// Return `entry` to a blank, history-free state.
    pub fn reset(&self, entry: &mut PooledEngine<F::Engine>) -> Result<(), EngineError> {
        if entry.destroyed {
            return Err(EngineError::Destroyed);
        }
        let outcome = Self::wipe(&mut entry.engine);
        if let Err(err) = &outcome {
            self.metrics.record_reset_failure();
            warn!(handle = %entry.id, error = %err, "Engine reset failed");
        }
        outcome
    }

    fn wipe(engine: &mut F::Engine) -> Result<(), EngineError> {
        engine.stop_loading()?;
        engine.clear_history()?;
        engine.load_url(BLANK_URL)
    }

    /// Tear `entry` down for good. Repeated calls are no-ops.
    pub fn destroy(&self, entry: &mut PooledEngine<F::Engine>) {
        if entry.destroyed {
            return;
        }
        entry.destroyed = true;
        if let Err(err) = entry.engine.detach_from_parent() {
            debug!(handle = %entry.id, error = %err, "Detach before destroy failed");
        }
        match entry.engine.destroy() {
            Ok(()) | Err(EngineError::Destroyed) => {}
            Err(err) => warn!(handle = %entry.id, error = %err, "Engine destroy failed"),
        }
        self.metrics.record_destroyed();
        debug!(handle = %entry.id, "Engine destroyed");
    }
}
