//! Pool Store - Available / InUse Partition
//!
//! [`PoolStore`] holds every live engine the pool tracks, each in exactly one
//! of two places:
//! - **Available**: a `VecDeque` free list of reset, validated engines,
//!   oldest-released first, never longer than `max_available`
//! - **InUse**: a map of engines currently lent to callers, unbounded
//!
//! The store is plain single-threaded state. It lives inside a
//! [`Confined`](crate::dispatch::Confined) cell so that only the owning
//! thread ever reaches it, which is why nothing here locks.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

use super::lifecycle::{EngineLifecycle, HandleId, PooledEngine};
use super::{CallerContext, EngineFactory};
use crate::error::EngineError;

/// Point-in-time sizes of the two sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Engines idle in the Available set.
    pub available: usize,
    /// Engines currently lent to callers.
    pub in_use: usize,
    /// Upper bound on `available`.
    pub max_available: usize,
}

/// An engine lent out by [`PoolStore::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired {
    pub id: HandleId,
    /// `true` when served from the Available set rather than created.
    pub reused: bool,
}

/// What happened to an engine handed to [`PoolStore::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Reset and placed back in the Available set.
    Pooled,
    /// Destroyed because the Available set was full.
    Overflowed,
    /// Destroyed because it could not be reset.
    Discarded,
    /// The handle was not in use; nothing changed.
    Unknown,
}

/// The Available / InUse partition of pooled engines.
pub struct PoolStore<E> {
    available: VecDeque<PooledEngine<E>>,
    in_use: HashMap<HandleId, PooledEngine<E>>,
    max_available: usize,
}

impl<E> PoolStore<E> {
    /// Create an empty store whose Available set holds at most `max_available`.
    pub fn new(max_available: usize) -> Self {
        Self {
            available: VecDeque::with_capacity(max_available),
            in_use: HashMap::new(),
            max_available,
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            available: self.available.len(),
            in_use: self.in_use.len(),
            max_available: self.max_available,
        }
    }

    pub fn is_available(&self, id: HandleId) -> bool {
        self.available.iter().any(|entry| entry.id() == id)
    }

    pub fn is_in_use(&self, id: HandleId) -> bool {
        self.in_use.contains_key(&id)
    }

    /// Ids of the Available set, oldest-released first.
    pub fn available_ids(&self) -> Vec<HandleId> {
        self.available.iter().map(PooledEngine::id).collect()
    }

    /// Mutable access to an engine that is currently lent out.
    pub fn in_use_mut(&mut self, id: HandleId) -> Option<&mut PooledEngine<E>> {
        self.in_use.get_mut(&id)
    }

    /// Lend a valid engine for `context`, creating one on a miss.
    ///
    /// Invalid candidates met during the scan are destroyed, never kept.
    pub fn acquire<F>(
        &mut self,
        context: &CallerContext,
        lifecycle: &EngineLifecycle<F>,
    ) -> Result<Acquired, EngineError>
    where
        F: EngineFactory<Engine = E>,
    {
        while let Some(mut candidate) = self.available.pop_front() {
            if lifecycle.is_valid(&candidate, context) {
                let id = candidate.id();
                self.in_use.insert(id, candidate);
                debug!(
                    handle = %id,
                    available = self.available.len(),
                    in_use = self.in_use.len(),
                    "Engine reused from pool"
                );
                return Ok(Acquired { id, reused: true });
            }
            lifecycle.destroy(&mut candidate);
        }

        debug!(context = %context, "Pool miss, creating engine");
        let entry = lifecycle.create(context)?;
        let id = entry.id();
        self.in_use.insert(id, entry);
        Ok(Acquired { id, reused: false })
    }

    /// Take `id` back from its borrower.
    ///
    /// The engine is reset and re-validated first; if the Available set is
    /// already full, or the engine fails either step, it is destroyed
    /// instead of queued.
    pub fn release<F>(
        &mut self,
        id: HandleId,
        now: Instant,
        lifecycle: &EngineLifecycle<F>,
    ) -> ReleaseOutcome
    where
        F: EngineFactory<Engine = E>,
    {
        let Some(mut entry) = self.in_use.remove(&id) else {
            debug!(handle = %id, "Release of unknown handle ignored");
            return ReleaseOutcome::Unknown;
        };

        if lifecycle.reset(&mut entry).is_err() || !lifecycle.is_valid(&entry, entry.context()) {
            lifecycle.destroy(&mut entry);
            return ReleaseOutcome::Discarded;
        }

        if self.available.len() >= self.max_available {
            debug!(handle = %id, "Pool full, destroying released engine");
            lifecycle.destroy(&mut entry);
            return ReleaseOutcome::Overflowed;
        }

        entry.mark_released(now);
        self.available.push_back(entry);
        debug!(
            handle = %id,
            available = self.available.len(),
            in_use = self.in_use.len(),
            "Engine returned to pool"
        );
        ReleaseOutcome::Pooled
    }

    /// Add a freshly created engine straight to the Available set.
    ///
    /// Returns the entry back when the set is already full.
    pub fn insert_available(
        &mut self,
        mut entry: PooledEngine<E>,
        now: Instant,
    ) -> Result<(), PooledEngine<E>> {
        if self.available.len() >= self.max_available {
            return Err(entry);
        }
        entry.mark_released(now);
        self.available.push_back(entry);
        Ok(())
    }

    /// Destroy every Available engine. InUse is left alone.
    pub fn clear<F>(&mut self, lifecycle: &EngineLifecycle<F>) -> usize
    where
        F: EngineFactory<Engine = E>,
    {
        let cleared = self.available.len();
        for mut entry in self.available.drain(..) {
            lifecycle.destroy(&mut entry);
        }
        cleared
    }

    /// Destroy Available engines idle for longer than `idle_timeout`.
    pub fn evict_idle<F>(
        &mut self,
        now: Instant,
        idle_timeout: Duration,
        lifecycle: &EngineLifecycle<F>,
    ) -> usize
    where
        F: EngineFactory<Engine = E>,
    {
        let before = self.available.len();
        let mut kept = VecDeque::with_capacity(before);
        for mut entry in self.available.drain(..) {
            if entry.idle_for(now) > idle_timeout {
                debug!(handle = %entry.id(), idle = ?entry.idle_for(now), "Evicting idle engine");
                lifecycle.destroy(&mut entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.available = kept;
        before - self.available.len()
    }

    /// Destroy everything, lent engines included. Used at shutdown.
    pub fn drain_all<F>(&mut self, lifecycle: &EngineLifecycle<F>) -> usize
    where
        F: EngineFactory<Engine = E>,
    {
        let mut drained = self.clear(lifecycle);
        for (_, mut entry) in self.in_use.drain() {
            lifecycle.destroy(&mut entry);
            drained += 1;
        }
        drained
    }
}
