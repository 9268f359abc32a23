//! Idle Evictor
//!
//! Reclaims engines that have sat in the Available set longer than the idle
//! timeout. Sweeps run on the owning thread and reschedule themselves after
//! each pass finishes, so a slow pass delays the next one instead of
//! overlapping it.
//!
//! The evictor keeps only a weak reference to what it sweeps: once the pool
//! is gone the chain of passes ends on its own.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::dispatch::Dispatcher;
use crate::engine::{EngineFactory, EngineLifecycle, PoolStore};
use crate::error::DispatchError;
use crate::perf::PoolMetrics;

/// Something the evictor can sweep from the owning thread.
pub trait IdleSweep: Send + Sync + 'static {
    fn dispatcher(&self) -> &Dispatcher;

    /// One eviction pass. Called on the owning thread; returns engines evicted.
    fn sweep_idle(&self) -> usize;
}

/// Idle-timeout policy and sweep cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleEvictor {
    idle_timeout: Duration,
    interval: Duration,
}

impl IdleEvictor {
    pub fn new(idle_timeout: Duration, interval: Duration) -> Self {
        Self {
            idle_timeout,
            interval,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Destroy every Available engine idle for longer than the timeout as of `now`.
    pub fn sweep<F: EngineFactory>(
        &self,
        store: &mut PoolStore<F::Engine>,
        lifecycle: &EngineLifecycle<F>,
        metrics: &PoolMetrics,
        now: Instant,
    ) -> usize {
        let evicted = store.evict_idle(now, self.idle_timeout, lifecycle);
        metrics.record_idle_evictions(evicted);
        if evicted > 0 {
            info!(
                evicted,
                available = store.stats().available,
                "Idle engines evicted"
            );
        }
        evicted
    }

    /// Start the recurring sweep for `target`.
    pub fn schedule<S: IdleSweep>(&self, target: &Arc<S>) -> Result<(), DispatchError> {
        let weak = Arc::downgrade(target);
        let interval = self.interval;
        debug!(interval = ?interval, "Scheduling idle sweeps");
        target
            .dispatcher()
            .post_delayed(interval, move || run_pass(weak, interval))
    }
}

fn run_pass<S: IdleSweep>(weak: Weak<S>, interval: Duration) {
    let Some(target) = weak.upgrade() else {
        return;
    };
    target.sweep_idle();
    if let Err(err) = target
        .dispatcher()
        .post_delayed(interval, move || run_pass(weak, interval))
    {
        debug!(error = %err, "Idle sweeps stopped");
    }
}
