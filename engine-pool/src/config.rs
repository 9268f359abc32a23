//! Pool configuration.
//!
//! Every knob is fixed when the pool is built. Defaults match the values
//! the pool was tuned with on device: one warm engine, at most five idle,
//! five minutes before an idle engine is reclaimed.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::engine::EngineSettings;
use crate::error::ConfigError;

/// What `acquire` does when the owning thread cannot serve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Build an untracked engine on the calling thread and hand that out.
    #[default]
    Standalone,
    /// Return the dispatch error to the caller.
    Fail,
}

/// Configuration for an [`EnginePool`](crate::pool::EnginePool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Engines created up front
    pub init_pool_size: usize,
    /// Upper bound on idle engines kept for reuse
    pub max_pool_size: usize,
    /// How long an engine may sit idle before eviction
    pub idle_timeout_ms: u64,
    /// Period between eviction sweeps; `None` means `idle_timeout_ms`
    pub sweep_interval_ms: Option<u64>,
    /// Bound on the acquire handshake with the owning thread
    pub acquire_timeout_ms: u64,
    pub fallback: FallbackPolicy,
    pub settings: EngineSettings,
    /// Name given to the owning thread
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            init_pool_size: 1,
            max_pool_size: 5,
            idle_timeout_ms: 5 * 60 * 1000,
            sweep_interval_ms: None,
            acquire_timeout_ms: 5_000,
            fallback: FallbackPolicy::Standalone,
            settings: EngineSettings::default(),
            thread_name: "engine-confinement".to_string(),
        }
    }
}

impl PoolConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pool config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse pool config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid pool config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.init_pool_size > self.max_pool_size {
            return Err(ConfigError::InitExceedsMax {
                init: self.init_pool_size,
                max: self.max_pool_size,
            });
        }
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::ZeroIdleTimeout);
        }
        if self.acquire_timeout_ms == 0 {
            return Err(ConfigError::ZeroAcquireTimeout);
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.unwrap_or(self.idle_timeout_ms).max(1))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}
