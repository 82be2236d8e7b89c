// SPDX-License-Identifier: MIT OR Apache-2.0
//! Built-in maintenance task classes registered by the composition root.

use crate::task::{TaskClass, TaskContext, TaskError, TaskRegistry};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

/// Prunes aged log events from the store.
///
/// Config: `retention_days` (default 30), `prefix` (default `logs/`).
/// Security and audit prefixes are never passed to this task; they are
/// kept until an explicit user action.
#[derive(Debug, Default)]
pub struct LogRetentionTask;

#[async_trait]
impl TaskClass for LogRetentionTask {
    fn name(&self) -> &'static str {
        "maintenance.log_retention"
    }

    async fn run(&self, ctx: TaskContext) -> Result<(), TaskError> {
        let days = ctx.config.get("retention_days").and_then(|v| v.as_i64()).unwrap_or(30);
        let prefix = ctx
            .config
            .get("prefix")
            .and_then(|v| v.as_str())
            .unwrap_or("logs/")
            .to_owned();
        let cutoff = Utc::now().timestamp_millis() - days * 24 * 60 * 60 * 1000;
        let removed = ctx
            .store
            .prune_before(&prefix, cutoff)
            .await
            .map_err(|e| TaskError::Transient(e.to_string()))?;
        info!(task = %ctx.task_id, prefix, removed, "log retention pass complete");
        Ok(())
    }
}

/// Publishes a heartbeat on `system/health`.
#[derive(Debug, Default)]
pub struct HealthCheckTask;

#[async_trait]
impl TaskClass for HealthCheckTask {
    fn name(&self) -> &'static str {
        "system.health_check"
    }

    async fn run(&self, ctx: TaskContext) -> Result<(), TaskError> {
        let payload = serde_json::json!({
            "event": "heartbeat",
            "at_utc_ms": Utc::now().timestamp_millis(),
        });
        ctx.publisher
            .publish_status("system/health", "aico.system.Event", payload.to_string().into_bytes())
            .await;
        Ok(())
    }
}

/// Weekly database compaction.
#[derive(Debug, Default)]
pub struct VacuumTask;

#[async_trait]
impl TaskClass for VacuumTask {
    fn name(&self) -> &'static str {
        "maintenance.vacuum"
    }

    fn cpu_bound(&self) -> bool {
        true
    }

    async fn run(&self, ctx: TaskContext) -> Result<(), TaskError> {
        ctx.store
            .vacuum()
            .await
            .map_err(|e| TaskError::Transient(e.to_string()))?;
        info!(task = %ctx.task_id, "database vacuum complete");
        Ok(())
    }
}

impl TaskRegistry {
    /// A registry pre-loaded with the built-in maintenance classes.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LogRetentionTask));
        registry.register(Arc::new(HealthCheckTask));
        registry.register(Arc::new(VacuumTask));
        registry
    }
}
