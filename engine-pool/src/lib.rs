//! Engine Pool - Thread-Confined Pooling for Heavyweight Rendering Engines
//!
//! Content-rendering engines are expensive to build and may only be touched
//! on the thread that created them. This crate keeps a small pool of them
//! warm on one dedicated owning thread and lends them to callers on any
//! thread.
//!
//! # Components:
//! - [`dispatch`]: the owning thread and its confined job queue
//! - [`engine`]: the engine contract, lifecycle controller and pool store
//! - [`eviction`]: periodic reclamation of idle engines
//! - [`pool`]: the public [`EnginePool`] façade
//! - [`perf`]: lock-free pool metrics

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod eviction;
pub mod perf;
pub mod pool;

pub use config::{FallbackPolicy, PoolConfig};
pub use dispatch::Dispatcher;
pub use engine::{
    CallerContext, EngineFactory, EngineSettings, HandleId, HeadlessEngine, HeadlessFactory,
    PoolStats, RenderEngine, BLANK_URL,
};
pub use error::{ConfigError, DispatchError, EngineError, PoolError, PoolResult};
pub use perf::{PoolMetrics, PoolMetricsSnapshot};
pub use pool::{EngineHandle, EnginePool, HandleState, Lease, MemorySignal, StandaloneEngine};

use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
