//! Error taxonomy for the engine pool.
//!
//! Most failures in this crate are resolved internally by discarding the
//! offending engine instance. The types here cover what is left: engine
//! operations that fail, dispatch to the owning thread that cannot complete,
//! and configuration that cannot be honoured.

use std::time::Duration;
use thiserror::Error;

use crate::engine::lifecycle::HandleId;

/// Failure reported by a [`RenderEngine`](crate::engine::RenderEngine) or its factory.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The underlying engine has already been torn down.
    #[error("engine has been destroyed")]
    Destroyed,

    /// The engine was touched from a thread other than the one that created it.
    #[error("engine accessed off its owning thread")]
    WrongThread,

    /// The factory could not construct a new engine.
    #[error("engine creation failed: {0}")]
    Creation(String),

    /// Any other engine-level operation failure.
    #[error("engine operation failed: {0}")]
    Operation(String),
}

/// Failure to run work on the owning thread.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The owning thread is gone or its queue no longer accepts work.
    #[error("confinement thread is unavailable")]
    Unavailable,

    /// The owning thread did not answer within the handshake bound.
    #[error("confined task did not complete within {0:?}")]
    Timeout(Duration),

    /// The confined task panicked; the payload message is preserved.
    #[error("confined task panicked: {0}")]
    TaskPanicked(String),

    /// Confined state was accessed from a foreign thread.
    #[error("confined state accessed from a foreign thread")]
    WrongThread,

    /// Confined state is already borrowed further up the owning thread's stack.
    #[error("confined state is already borrowed on the owning thread")]
    Busy,
}

/// Invalid [`PoolConfig`](crate::config::PoolConfig) combination.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("init_pool_size ({init}) exceeds max_pool_size ({max})")]
    InitExceedsMax { init: usize, max: usize },

    #[error("idle_timeout_ms must be greater than zero")]
    ZeroIdleTimeout,

    #[error("acquire_timeout_ms must be greater than zero")]
    ZeroAcquireTimeout,
}

/// Errors surfaced by [`EnginePool`](crate::pool::EnginePool).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The handle is not currently lent out by this pool.
    #[error("handle {0} is not in use")]
    UnknownHandle(HandleId),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Convenience alias used throughout the pool.
pub type PoolResult<T> = std::result::Result<T, PoolError>;
