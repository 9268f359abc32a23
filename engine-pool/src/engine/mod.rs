//! Engine module - the pooled resource and everything that touches it
//!
//! This module defines the contract a content-rendering engine must satisfy
//! to be pooled, plus the components that own its lifecycle:
//! - [`lifecycle`]: create, validate, reset and destroy instances
//! - [`store`]: the Available / InUse partition
//! - [`headless`]: an in-memory engine used by the demo binary and tests

pub mod headless;
pub mod lifecycle;
pub mod store;

pub use headless::{HeadlessEngine, HeadlessFactory};
pub use lifecycle::{EngineLifecycle, HandleId, PooledEngine};
pub use store::{Acquired, PoolStats, PoolStore, ReleaseOutcome};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EngineError;

/// Inert navigation target used when resetting an instance.
pub const BLANK_URL: &str = "about:blank";

/// Baseline capability set every engine is created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Allow page scripts to run
    pub javascript_enabled: bool,
    /// Enable DOM local storage
    pub dom_storage_enabled: bool,
    /// Render through the GPU compositor
    pub hardware_accelerated: bool,
    /// Permit `file://` access to local content
    pub allow_file_access: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            javascript_enabled: true,
            dom_storage_enabled: true,
            hardware_accelerated: true,
            allow_file_access: true,
        }
    }
}

/// The environment an engine is created against.
///
/// An instance is only reusable by the exact context it was created for.
/// When a screen is torn down and rebuilt it should call
/// [`next_generation`](Self::next_generation), which makes every instance
/// created for the previous incarnation invalid for the new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerContext {
    name: String,
    generation: u64,
}

impl CallerContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generation: 0,
        }
    }

    /// The same named context, one generation later.
    pub fn next_generation(&self) -> Self {
        Self {
            name: self.name.clone(),
            generation: self.generation + 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for CallerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.generation)
    }
}

/// A heavyweight, thread-affine rendering engine.
///
/// Implementations may assume every method is invoked on the thread that
/// created them; the pool guarantees this for pooled instances. `Send` is
/// required only so the pool can move instances onto its owning thread.
///
/// # Reset contract
/// [`stop_loading`](Self::stop_loading), [`clear_history`](Self::clear_history)
/// and `load_url(BLANK_URL)` together must leave no trace of earlier content
/// or back-stack.
pub trait RenderEngine: Send + 'static {
    /// `Ok(false)` once the engine has been torn down.
    fn is_alive(&self) -> Result<bool, EngineError>;

    fn load_url(&mut self, url: &str) -> Result<(), EngineError>;

    /// Abort any in-flight load.
    fn stop_loading(&mut self) -> Result<(), EngineError>;

    /// Drop the navigation back-stack.
    fn clear_history(&mut self) -> Result<(), EngineError>;

    /// Detach from whatever view hierarchy currently hosts the engine.
    fn detach_from_parent(&mut self) -> Result<(), EngineError>;

    /// Release the engine permanently. Must tolerate repeated calls.
    fn destroy(&mut self) -> Result<(), EngineError>;
}

/// Constructs engines on behalf of the pool.
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: RenderEngine;

    fn create(
        &self,
        context: &CallerContext,
        settings: &EngineSettings,
    ) -> Result<Self::Engine, EngineError>;
}
