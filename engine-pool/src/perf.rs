//! Pool Metrics
//!
//! Lightweight counters describing how the pool is behaving: how often it
//! reuses instead of creating, how many engines eviction and overflow
//! reclaim, and how long callers wait in `acquire`.
//!
//! # Design Goals:
//! - Lock-free atomic counters, readable from any thread
//! - No allocation on the recording path

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counters shared by every component of one pool.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    // Instance lifecycle
    pub created: AtomicU64,
    pub destroyed: AtomicU64,
    pub invalidated: AtomicU64,
    pub reset_failures: AtomicU64,

    // Acquire path
    pub acquires: AtomicU64,
    pub acquire_time_ns: AtomicU64,
    pub reused: AtomicU64,
    pub fallbacks: AtomicU64,
    pub timeouts: AtomicU64,

    // Release path
    pub released: AtomicU64,
    pub unknown_releases: AtomicU64,
    pub overflow_destroyed: AtomicU64,

    // Reclamation
    pub idle_evicted: AtomicU64,
    pub cleared: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroyed(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidated(&self) {
        self.invalidated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset_failure(&self) {
        self.reset_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed acquire and how long the caller waited.
    pub fn record_acquire(&self, duration: Duration) {
        self.acquires.fetch_add(1, Ordering::Relaxed);
        self.acquire_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_reuse(&self) {
        self.reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_release(&self) {
        self.unknown_releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow(&self) {
        self.overflow_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_idle_evictions(&self, count: usize) {
        self.idle_evicted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_cleared(&self, count: usize) {
        self.cleared.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        let acquires = self.acquires.load(Ordering::Relaxed);
        let reused = self.reused.load(Ordering::Relaxed);
        let created = self.created.load(Ordering::Relaxed);
        PoolMetricsSnapshot {
            created,
            destroyed: self.destroyed.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
            reset_failures: self.reset_failures.load(Ordering::Relaxed),
            acquires,
            avg_acquire_ms: avg_ms(acquires, self.acquire_time_ns.load(Ordering::Relaxed)),
            reused,
            reuse_rate: reuse_rate(reused, acquires),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            unknown_releases: self.unknown_releases.load(Ordering::Relaxed),
            overflow_destroyed: self.overflow_destroyed.load(Ordering::Relaxed),
            idle_evicted: self.idle_evicted.load(Ordering::Relaxed),
            cleared: self.cleared.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        for counter in [
            &self.created,
            &self.destroyed,
            &self.invalidated,
            &self.reset_failures,
            &self.acquires,
            &self.acquire_time_ns,
            &self.reused,
            &self.fallbacks,
            &self.timeouts,
            &self.released,
            &self.unknown_releases,
            &self.overflow_destroyed,
            &self.idle_evicted,
            &self.cleared,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn avg_ms(count: u64, total_ns: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    (total_ns as f64) / (count as f64) / 1_000_000.0
}

/// Percentage of acquires served from the Available set.
fn reuse_rate(reused: u64, acquires: u64) -> f64 {
    if acquires == 0 {
        return 0.0;
    }
    (reused as f64) / (acquires as f64) * 100.0
}

/// A point-in-time snapshot of [`PoolMetrics`]
#[derive(Debug, Clone, PartialEq)]
pub struct PoolMetricsSnapshot {
    pub created: u64,
    pub destroyed: u64,
    pub invalidated: u64,
    pub reset_failures: u64,
    pub acquires: u64,
    pub avg_acquire_ms: f64,
    pub reused: u64,
    pub reuse_rate: f64,
    pub fallbacks: u64,
    pub timeouts: u64,
    pub released: u64,
    pub unknown_releases: u64,
    pub overflow_destroyed: u64,
    pub idle_evicted: u64,
    pub cleared: u64,
}

impl PoolMetricsSnapshot {
    /// Print a human-readable metrics report
    pub fn print_report(&self) {
        println!("╔═══════════════════════════════════════════════════════════╗");
        println!("║           Engine Pool Metrics Report                      ║");
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Acquire                                                   ║");
        println!("║   Acquires:    {:>8} (avg: {:>8.3} ms)              ║",
                 self.acquires, self.avg_acquire_ms);
        println!("║   Reused:      {:>8} (rate: {:>6.2}%)               ║",
                 self.reused, self.reuse_rate);
        println!("║   Fallbacks:   {:>8}   Timeouts: {:>8}            ║",
                 self.fallbacks, self.timeouts);
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Release                                                   ║");
        println!("║   Released:    {:>8}   Unknown:  {:>8}            ║",
                 self.released, self.unknown_releases);
        println!("║   Overflowed:  {:>8}                                   ║",
                 self.overflow_destroyed);
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Lifecycle                                                 ║");
        println!("║   Created:     {:>8}   Destroyed: {:>8}           ║",
                 self.created, self.destroyed);
        println!("║   Invalidated: {:>8}   Reset failures: {:>8}      ║",
                 self.invalidated, self.reset_failures);
        println!("║   Idle evicted:{:>8}   Cleared:  {:>8}            ║",
                 self.idle_evicted, self.cleared);
        println!("╚═══════════════════════════════════════════════════════════╝");
    }
}

/// Records the lifetime of an acquire into [`PoolMetrics`] on drop.
pub struct ScopedTimer<'a> {
    start: Instant,
    metrics: &'a PoolMetrics,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(metrics: &'a PoolMetrics) -> Self {
        Self {
            start: Instant::now(),
            metrics,
        }
    }
}

impl<'a> Drop for ScopedTimer<'a> {
    fn drop(&mut self) {
        self.metrics.record_acquire(self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = PoolMetrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.acquires, 0);
        assert_eq!(snapshot.created, 0);
        assert_eq!(snapshot.reuse_rate, 0.0);
    }

    #[test]
    fn test_record_acquire_average() {
        let metrics = PoolMetrics::new();
        metrics.record_acquire(Duration::from_millis(10));
        metrics.record_acquire(Duration::from_millis(30));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.acquires, 2);
        assert_eq!(snapshot.avg_acquire_ms, 20.0);
    }

    #[test]
    fn test_reuse_rate() {
        let metrics = PoolMetrics::new();
        for _ in 0..4 {
            metrics.record_acquire(Duration::ZERO);
        }
        metrics.record_reuse();
        metrics.record_reuse();
        metrics.record_reuse();

        assert_eq!(metrics.snapshot().reuse_rate, 75.0);
    }

    #[test]
    fn test_bulk_counters() {
        let metrics = PoolMetrics::new();
        metrics.record_idle_evictions(3);
        metrics.record_cleared(2);
        metrics.record_overflow();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.idle_evicted, 3);
        assert_eq!(snapshot.cleared, 2);
        assert_eq!(snapshot.overflow_destroyed, 1);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = PoolMetrics::new();
        metrics.record_created();
        metrics.record_acquire(Duration::from_millis(5));
        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.created, 0);
        assert_eq!(snapshot.acquires, 0);
        assert_eq!(snapshot.avg_acquire_ms, 0.0);
    }

    #[test]
    fn test_scoped_timer() {
        let metrics = PoolMetrics::new();
        {
            let _timer = ScopedTimer::new(&metrics);
            std::thread::sleep(Duration::from_millis(10));
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.acquires, 1);
        assert!(snapshot.avg_acquire_ms >= 10.0);
    }
}
