//! Headless Engine - In-Memory Rendering Engine
//!
//! A complete [`RenderEngine`] that keeps its state in memory instead of
//! driving a platform view. It behaves like a thread-affine engine: every
//! operation checks it is running on the thread that created it and fails
//! with [`EngineError::WrongThread`] otherwise. That makes it suitable for
//! exercising the pool's confinement guarantees without a real renderer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use super::{CallerContext, EngineFactory, EngineSettings, RenderEngine, BLANK_URL};
use crate::error::EngineError;

/// In-memory engine with a navigation back-stack.
#[derive(Debug)]
pub struct HeadlessEngine {
    owner: ThreadId,
    settings: EngineSettings,
    current_url: Option<String>,
    /// Pages navigated to, oldest first. The blank target never enters it.
    history: Vec<String>,
    loading: bool,
    attached: bool,
    destroyed: bool,
    destroy_calls: usize,
    liveness_failure: bool,
}

impl HeadlessEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            owner: thread::current().id(),
            settings,
            current_url: None,
            history: Vec::new(),
            loading: false,
            attached: false,
            destroyed: false,
            destroy_calls: 0,
            liveness_failure: false,
        }
    }

    fn check(&self) -> Result<(), EngineError> {
        if thread::current().id() != self.owner {
            return Err(EngineError::WrongThread);
        }
        if self.destroyed {
            return Err(EngineError::Destroyed);
        }
        Ok(())
    }

    /// Thread the engine was created on.
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn current_url(&self) -> Option<&str> {
        self.current_url.as_deref()
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn can_go_back(&self) -> bool {
        self.history.len() > 1
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Mark the current load as complete.
    pub fn finish_loading(&mut self) -> Result<(), EngineError> {
        self.check()?;
        self.loading = false;
        Ok(())
    }

    /// Pop the back-stack and return the page now shown.
    pub fn go_back(&mut self) -> Result<Option<&str>, EngineError> {
        self.check()?;
        if self.can_go_back() {
            self.history.pop();
            self.current_url = self.history.last().cloned();
            self.loading = true;
        }
        Ok(self.current_url.as_deref())
    }

    /// Place the engine into a host view.
    pub fn attach(&mut self) {
        self.attached = true;
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls
    }

    /// Make subsequent liveness checks fail.
    pub fn fail_liveness_checks(&mut self) {
        self.liveness_failure = true;
    }
}

impl RenderEngine for HeadlessEngine {
    fn is_alive(&self) -> Result<bool, EngineError> {
        if self.liveness_failure {
            return Err(EngineError::Operation("liveness check failed".into()));
        }
        if thread::current().id() != self.owner {
            return Err(EngineError::WrongThread);
        }
        Ok(!self.destroyed)
    }

    fn load_url(&mut self, url: &str) -> Result<(), EngineError> {
        self.check()?;
        if url == BLANK_URL {
            self.loading = false;
        } else {
            self.history.push(url.to_owned());
            self.loading = true;
        }
        self.current_url = Some(url.to_owned());
        Ok(())
    }

    fn stop_loading(&mut self) -> Result<(), EngineError> {
        self.check()?;
        self.loading = false;
        Ok(())
    }

    fn clear_history(&mut self) -> Result<(), EngineError> {
        self.check()?;
        self.history.clear();
        Ok(())
    }

    fn detach_from_parent(&mut self) -> Result<(), EngineError> {
        if thread::current().id() != self.owner {
            return Err(EngineError::WrongThread);
        }
        self.attached = false;
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), EngineError> {
        if thread::current().id() != self.owner {
            return Err(EngineError::WrongThread);
        }
        if !self.destroyed {
            self.destroyed = true;
            self.destroy_calls += 1;
            self.loading = false;
            self.current_url = None;
            self.history.clear();
        }
        Ok(())
    }
}

/// Factory for [`HeadlessEngine`]s; counts what it builds.
#[derive(Debug, Clone, Default)]
pub struct HeadlessFactory {
    created: Arc<AtomicUsize>,
}

impl HeadlessFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of engines created so far, across clones of this factory.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl EngineFactory for HeadlessFactory {
    type Engine = HeadlessEngine;

    fn create(
        &self,
        _context: &CallerContext,
        settings: &EngineSettings,
    ) -> Result<HeadlessEngine, EngineError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(HeadlessEngine::new(settings.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_navigation_builds_back_stack() {
        let mut engine = HeadlessEngine::new(EngineSettings::default());
        engine.load_url("https://a.test").unwrap();
        engine.load_url("https://b.test").unwrap();
        assert!(engine.can_go_back());
        assert_eq!(engine.go_back().unwrap(), Some("https://a.test"));
        assert!(!engine.can_go_back());
    }

    #[test]
    fn test_blank_target_stays_out_of_history() {
        let mut engine = HeadlessEngine::new(EngineSettings::default());
        engine.load_url(BLANK_URL).unwrap();
        assert!(engine.history().is_empty());
        assert_eq!(engine.current_url(), Some(BLANK_URL));
        assert!(!engine.is_loading());
    }

    #[test]
    fn test_operations_fail_off_owner_thread() {
        let engine = HeadlessEngine::new(EngineSettings::default());
        let result = std::thread::spawn(move || {
            let mut engine = engine;
            engine.load_url("https://a.test")
        })
        .join()
        .expect("thread panicked");
        assert_eq!(result, Err(EngineError::WrongThread));
    }

    #[test]
    fn test_destroyed_engine_rejects_navigation() {
        let mut engine = HeadlessEngine::new(EngineSettings::default());
        engine.destroy().unwrap();
        engine.destroy().unwrap();
        assert_eq!(engine.destroy_calls(), 1);
        assert_eq!(engine.is_alive(), Ok(false));
        assert_eq!(engine.load_url("https://a.test"), Err(EngineError::Destroyed));
    }

    #[test]
    fn test_factory_counts_across_clones() {
        let factory = HeadlessFactory::new();
        let clone = factory.clone();
        let ctx = CallerContext::new("test");
        factory.create(&ctx, &EngineSettings::default()).unwrap();
        clone.create(&ctx, &EngineSettings::default()).unwrap();
        assert_eq!(factory.created(), 2);
    }
}
