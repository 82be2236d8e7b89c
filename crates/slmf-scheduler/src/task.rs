// SPDX-License-Identifier: MIT OR Apache-2.0
//! Task classes, execution context, and the explicit class registry.
//!
//! Task classes are registered once during startup by the composition
//! root; a task definition names its class by string. There is no runtime
//! discovery.

use crate::cancel::CancelToken;
use async_trait::async_trait;
use slmf_core::{Coded, FabricCode};
use slmf_store::EventStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// How a task execution failed.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// Worth retrying under the retry policy.
    #[error("transient task failure: {0}")]
    Transient(String),
    /// Retrying can never help (bad configuration, invalid input).
    #[error("permanent task failure: {0}")]
    Permanent(String),
}

impl Coded for TaskError {
    fn code(&self) -> FabricCode {
        match self {
            Self::Transient(_) => FabricCode::TaskTransientError,
            Self::Permanent(_) => FabricCode::TaskPermanentError,
        }
    }
}

/// Best-effort status publishing, implemented over the client runtime by
/// the composition root. Failures are the implementor's to swallow; task
/// execution never depends on a status publish landing.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    /// Publish `payload` on `topic`.
    async fn publish_status(&self, topic: &str, payload_type_url: &str, payload: Vec<u8>);
}

/// A publisher that discards everything. For tests and headless use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPublisher;

#[async_trait]
impl StatusPublisher for NullPublisher {
    async fn publish_status(&self, _topic: &str, _payload_type_url: &str, _payload: Vec<u8>) {}
}

/// Everything a task execution may touch.
pub struct TaskContext {
    /// The task being executed.
    pub task_id: String,
    /// Task-specific configuration from the definition.
    pub config: serde_json::Value,
    /// Cooperative cancellation; checked at await points.
    pub cancel: CancelToken,
    /// The shared encrypted store (maintenance tasks prune it).
    pub store: EventStore,
    /// Status publishing into the fabric.
    pub publisher: Arc<dyn StatusPublisher>,
}

/// A registered kind of work.
///
/// Implementations must yield at every bounded unit of work: await the
/// store, await a sleep, or check [`TaskContext::cancel`] between chunks.
#[async_trait]
pub trait TaskClass: Send + Sync {
    /// Stable class name referenced by task definitions.
    fn name(&self) -> &'static str;

    /// Whether executions should run under the bounded CPU offload gate.
    fn cpu_bound(&self) -> bool {
        false
    }

    /// Execute once.
    async fn run(&self, ctx: TaskContext) -> Result<(), TaskError>;
}

/// Explicit name-to-class map built during startup.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    classes: BTreeMap<&'static str, Arc<dyn TaskClass>>,
}

impl TaskRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class, replacing any previous one of the same name.
    pub fn register(&mut self, class: Arc<dyn TaskClass>) {
        self.classes.insert(class.name(), class);
    }

    /// Look a class up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskClass>> {
        self.classes.get(name).cloned()
    }

    /// Registered class names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.classes.keys().copied().collect()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry").field("classes", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl TaskClass for Noop {
        fn name(&self) -> &'static str {
            "test.noop"
        }

        async fn run(&self, _ctx: TaskContext) -> Result<(), TaskError> {
            Ok(())
        }
    }

    #[test]
    fn registry_register_and_get() {
        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(Noop));
        assert!(registry.get("test.noop").is_some());
        assert!(registry.get("test.missing").is_none());
        assert_eq!(registry.names(), vec!["test.noop"]);
    }

    #[test]
    fn task_error_codes() {
        assert_eq!(
            TaskError::Transient("x".into()).code(),
            FabricCode::TaskTransientError
        );
        assert_eq!(
            TaskError::Permanent("x".into()).code(),
            FabricCode::TaskPermanentError
        );
    }
}
