// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cooperative task scheduler sharing the fabric's event loop.
//!
//! Every second the scan loop collects ready tasks (`next_run` due,
//! enabled, not already running), checks resource admission, and
//! dispatches each as a cooperative execution with a hard timeout. At
//! most one execution per task id is ever in flight. Transient failures
//! retry with exponential backoff; permanent failures do not. A loop-lag
//! watchdog suspends new dispatches while the event loop is wedged, so
//! in-flight network work can drain.
//!
//! Task definitions and execution records persist in the same encrypted
//! store as the event log, in their own table group.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
mod builtin;
pub mod cancel;
pub mod retry;
pub mod schedule;
pub mod task;

pub use admission::{AdmissionConfig, LoopLagWatchdog, ResourceMonitor, WatchdogConfig};
pub use builtin::{HealthCheckTask, LogRetentionTask, VacuumTask};
pub use cancel::CancelToken;
pub use retry::RetryPolicy;
pub use schedule::{Schedule, ScheduleError};
pub use task::{NullPublisher, StatusPublisher, TaskClass, TaskContext, TaskError, TaskRegistry};

use chrono::Utc;
use slmf_core::{Coded, FabricCode};
use slmf_store::{EventStore, ExecutionRecord, StoreError, TaskRecord, TaskStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

/// Scheduler failures surfaced to callers (the control plane, mostly).
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The task or execution store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The schedule string was malformed.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// The named task class is not registered.
    #[error("unknown task class: {class}")]
    UnknownClass {
        /// The class that was requested.
        class: String,
    },

    /// No task with this id exists.
    #[error("unknown task: {task_id}")]
    UnknownTask {
        /// The id that was requested.
        task_id: String,
    },

    /// A one-shot schedule whose fire time is already in the past.
    #[error("schedule has no future fire time")]
    ScheduleExhausted,
}

impl Coded for SchedulerError {
    fn code(&self) -> FabricCode {
        match self {
            Self::Store(e) => e.code(),
            Self::Schedule(_) | Self::UnknownClass { .. } | Self::ScheduleExhausted => {
                FabricCode::SchemaError
            }
            Self::UnknownTask { .. } => FabricCode::SchemaError,
        }
    }
}

/// Scheduler tunables. Defaults follow the deployed fabric.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Scan cadence.
    pub tick: Duration,
    /// Executions in flight at once, across all tasks.
    pub max_concurrent: usize,
    /// Hard per-execution timeout.
    pub task_timeout: Duration,
    /// How far to push `next_run` when admission denies a ready task.
    pub admission_defer: Duration,
    /// Retry policy applied to transient failures.
    pub retry: RetryPolicy,
    /// Utilization thresholds.
    pub admission: AdmissionConfig,
    /// Concurrent executions of CPU-bound task classes.
    pub cpu_offload_slots: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            max_concurrent: 10,
            task_timeout: Duration::from_secs(300),
            admission_defer: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            admission: AdmissionConfig::default(),
            cpu_offload_slots: 2,
        }
    }
}

/// Coarse task lifecycle state, derived for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Enabled, waiting for its next fire time.
    Idle,
    /// Due now; will dispatch on the next scan.
    Ready,
    /// An execution is in flight.
    Running,
    /// Disabled, or a one-shot that completed.
    Terminal,
}

/// A task definition with its derived state and recent history.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskStatus {
    /// The persisted definition.
    pub record: TaskRecord,
    /// Derived lifecycle state.
    pub state: TaskState,
    /// Most recent executions, newest first.
    pub recent: Vec<ExecutionRecord>,
}

/// Request to create (or replace) a task definition.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Unique task id.
    pub task_id: String,
    /// Registered class name.
    pub task_class: String,
    /// Schedule string (`cron:`/`interval:`/`at:`).
    pub schedule: String,
    /// Task-specific configuration.
    pub config: serde_json::Value,
    /// Whether the task starts enabled.
    pub enabled: bool,
}

struct Completion {
    task_id: String,
    execution_id: String,
    started_at_ms: i64,
    error: Option<TaskError>,
}

/// The scheduler. Share via `Arc`: the control plane calls the management
/// methods while [`Scheduler::run`] drives the scan loop.
pub struct Scheduler {
    config: SchedulerConfig,
    registry: TaskRegistry,
    events: EventStore,
    tasks: TaskStore,
    publisher: Arc<dyn StatusPublisher>,
    monitor: ResourceMonitor,
    watchdog: LoopLagWatchdog,
    cpu_gate: Arc<Semaphore>,
    running: Mutex<HashMap<String, CancelToken>>,
    failures: Mutex<HashMap<String, u32>>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: Mutex<Option<mpsc::UnboundedReceiver<Completion>>>,
}

impl Scheduler {
    /// Build a scheduler over `events` with the given class registry.
    #[must_use]
    pub fn new(
        config: SchedulerConfig,
        registry: TaskRegistry,
        events: EventStore,
        publisher: Arc<dyn StatusPublisher>,
        watchdog: LoopLagWatchdog,
    ) -> Arc<Self> {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let cpu_gate = Arc::new(Semaphore::new(config.cpu_offload_slots.max(1)));
        Arc::new(Self {
            tasks: events.task_store(),
            events,
            registry,
            publisher,
            monitor: ResourceMonitor::new(),
            watchdog,
            cpu_gate,
            running: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            completion_tx,
            completion_rx: Mutex::new(Some(completion_rx)),
            config,
        })
    }

    /// Create or replace a task definition. The initial `next_run` is the
    /// first fire after now.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownClass`] for an unregistered class,
    /// schedule parse errors, [`SchedulerError::ScheduleExhausted`] for a
    /// one-shot in the past, store failures.
    pub async fn create_task(&self, spec: TaskSpec) -> Result<TaskRecord, SchedulerError> {
        if self.registry.get(&spec.task_class).is_none() {
            return Err(SchedulerError::UnknownClass { class: spec.task_class });
        }
        let schedule = Schedule::parse(&spec.schedule)?;
        let now = Utc::now();
        let next = schedule
            .next_after(now)
            .ok_or(SchedulerError::ScheduleExhausted)?;
        let record = TaskRecord {
            task_id: spec.task_id,
            task_class: spec.task_class,
            schedule: spec.schedule,
            config: spec.config,
            enabled: spec.enabled,
            created_at_utc_ms: now.timestamp_millis(),
            last_run_utc_ms: None,
            next_run_utc_ms: next.timestamp_millis(),
        };
        self.tasks.upsert_task(&record).await?;
        Ok(record)
    }

    /// Delete a task, cancelling any in-flight execution.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn delete_task(&self, task_id: &str) -> Result<bool, SchedulerError> {
        self.cancel_running(task_id);
        self.failures.lock().expect("failures lock poisoned").remove(task_id);
        Ok(self.tasks.delete_task(task_id).await?)
    }

    /// Enable or disable a task.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownTask`] when no such task exists; store
    /// failures.
    pub async fn set_enabled(&self, task_id: &str, enabled: bool) -> Result<(), SchedulerError> {
        if !enabled {
            self.cancel_running(task_id);
        }
        if self.tasks.set_enabled(task_id, enabled).await? {
            Ok(())
        } else {
            Err(SchedulerError::UnknownTask { task_id: task_id.to_owned() })
        }
    }

    /// Cooperatively cancel the in-flight execution of `task_id`, if any.
    pub fn cancel_running(&self, task_id: &str) -> bool {
        let running = self.running.lock().expect("running lock poisoned");
        match running.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Status of every task.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn list(&self) -> Result<Vec<TaskStatus>, SchedulerError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut out = Vec::new();
        for record in self.tasks.list_tasks().await? {
            let state = self.state_of(&record, now_ms);
            out.push(TaskStatus { record, state, recent: Vec::new() });
        }
        Ok(out)
    }

    /// Status of one task with its recent execution history.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownTask`]; store failures.
    pub async fn status(&self, task_id: &str) -> Result<TaskStatus, SchedulerError> {
        let record = self
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| SchedulerError::UnknownTask { task_id: task_id.to_owned() })?;
        let recent = self.tasks.executions_for(task_id, 10).await?;
        let state = self.state_of(&record, Utc::now().timestamp_millis());
        Ok(TaskStatus { record, state, recent })
    }

    fn state_of(&self, record: &TaskRecord, now_ms: i64) -> TaskState {
        let running = self.running.lock().expect("running lock poisoned");
        if running.contains_key(&record.task_id) {
            TaskState::Running
        } else if !record.enabled {
            TaskState::Terminal
        } else if record.next_run_utc_ms <= now_ms {
            TaskState::Ready
        } else {
            TaskState::Idle
        }
    }

    /// Drive the scan loop until `shutdown` is cancelled.
    ///
    /// In-flight executions receive a cooperative cancel on shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancelToken) {
        let mut completion_rx = self
            .completion_rx
            .lock()
            .expect("completion receiver lock poisoned")
            .take()
            .expect("run may only be called once");

        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(completion) = completion_rx.recv() => {
                    self.handle_completion(completion).await;
                }
                _ = ticker.tick() => {
                    if self.watchdog.is_suspended() {
                        debug!("dispatch suspended by loop-lag watchdog");
                        continue;
                    }
                    self.scan_once().await;
                }
            }
        }

        let running = self.running.lock().expect("running lock poisoned");
        for token in running.values() {
            token.cancel();
        }
    }

    /// One scan pass: dispatch every ready task that admission allows.
    async fn scan_once(&self) {
        let now_ms = Utc::now().timestamp_millis();
        let tasks = match self.tasks.list_tasks().await {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(%err, "task scan failed; will retry next tick");
                return;
            }
        };

        for task in tasks {
            if !task.enabled || task.next_run_utc_ms > now_ms {
                continue;
            }
            {
                let running = self.running.lock().expect("running lock poisoned");
                if running.contains_key(&task.task_id) {
                    continue;
                }
                if running.len() >= self.config.max_concurrent {
                    break;
                }
            }
            if !self.monitor.admit(&self.config.admission) {
                let next = now_ms + self.config.admission_defer.as_millis() as i64;
                if let Err(err) = self.tasks.set_next_run(&task.task_id, next).await {
                    warn!(%err, task = %task.task_id, "failed to defer task");
                }
                continue;
            }
            self.dispatch(task, now_ms).await;
        }
    }

    async fn dispatch(&self, task: TaskRecord, now_ms: i64) {
        let Some(class) = self.registry.get(&task.task_class) else {
            warn!(task = %task.task_id, class = %task.task_class, "unknown task class; disabling");
            if let Err(err) = self.tasks.set_enabled(&task.task_id, false).await {
                warn!(%err, task = %task.task_id, "failed to disable task");
            }
            return;
        };

        let retry_count = self
            .failures
            .lock()
            .expect("failures lock poisoned")
            .get(&task.task_id)
            .copied()
            .unwrap_or(0);
        let execution_id = Uuid::new_v4().to_string();
        let record = ExecutionRecord {
            execution_id: execution_id.clone(),
            task_id: task.task_id.clone(),
            started_at_utc_ms: now_ms,
            completed_at_utc_ms: None,
            success: None,
            duration_ms: None,
            error: None,
            retry_count: i64::from(retry_count),
        };
        if let Err(err) = self.tasks.begin_execution(&record).await {
            warn!(%err, task = %task.task_id, "failed to record execution start");
        }

        let cancel = CancelToken::new();
        self.running
            .lock()
            .expect("running lock poisoned")
            .insert(task.task_id.clone(), cancel.clone());

        let ctx = TaskContext {
            task_id: task.task_id.clone(),
            config: task.config.clone(),
            cancel: cancel.clone(),
            store: self.events.clone(),
            publisher: self.publisher.clone(),
        };
        let gate = class.cpu_bound().then(|| self.cpu_gate.clone());
        let timeout = self.config.task_timeout;
        let completion_tx = self.completion_tx.clone();
        let task_id = task.task_id.clone();

        tokio::spawn(async move {
            let _permit = match gate {
                Some(gate) => Some(
                    gate.acquire_owned()
                        .await
                        .expect("cpu gate is never closed"),
                ),
                None => None,
            };
            let error = tokio::select! {
                _ = cancel.cancelled() => {
                    Some(TaskError::Permanent("execution cancelled".into()))
                }
                result = tokio::time::timeout(timeout, class.run(ctx)) => match result {
                    Err(_) => Some(TaskError::Transient("execution timed out".into())),
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err),
                },
            };
            let _ = completion_tx.send(Completion {
                task_id,
                execution_id,
                started_at_ms: now_ms,
                error,
            });
        });
    }

    async fn handle_completion(&self, completion: Completion) {
        let now_ms = Utc::now().timestamp_millis();
        self.running
            .lock()
            .expect("running lock poisoned")
            .remove(&completion.task_id);

        let success = completion.error.is_none();
        let error_text = completion.error.as_ref().map(ToString::to_string);
        if let Err(err) = self
            .tasks
            .finish_execution(
                &completion.execution_id,
                now_ms,
                success,
                now_ms - completion.started_at_ms,
                error_text.as_deref(),
            )
            .await
        {
            warn!(%err, execution = %completion.execution_id, "failed to record execution finish");
        }

        let Ok(Some(task)) = self.tasks.get_task(&completion.task_id).await else {
            // Deleted while running; nothing left to reschedule.
            self.failures
                .lock()
                .expect("failures lock poisoned")
                .remove(&completion.task_id);
            return;
        };

        let schedule = match Schedule::parse(&task.schedule) {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, task = %task.task_id, "stored schedule unparseable; disabling");
                let _ = self.tasks.set_enabled(&task.task_id, false).await;
                return;
            }
        };

        match completion.error {
            None => {
                self.failures
                    .lock()
                    .expect("failures lock poisoned")
                    .remove(&task.task_id);
                self.reschedule(&task, &schedule, now_ms).await;
            }
            Some(err) => {
                let attempts = {
                    let mut failures = self.failures.lock().expect("failures lock poisoned");
                    let counter = failures.entry(task.task_id.clone()).or_insert(0);
                    *counter += 1;
                    *counter
                };
                if self.config.retry.should_retry(attempts, &err) {
                    let delay = self.config.retry.delay_for(attempts - 1);
                    let next = now_ms + delay.as_millis() as i64;
                    debug!(task = %task.task_id, attempts, ?delay, "scheduling retry");
                    if let Err(store_err) = self.tasks.mark_run(&task.task_id, now_ms, next).await {
                        warn!(%store_err, task = %task.task_id, "failed to schedule retry");
                    }
                } else {
                    self.failures
                        .lock()
                        .expect("failures lock poisoned")
                        .remove(&task.task_id);
                    warn!(task = %task.task_id, %err, "giving up on failed execution");
                    self.reschedule(&task, &schedule, now_ms).await;
                }
            }
        }

        let payload = serde_json::json!({
            "task_id": completion.task_id,
            "execution_id": completion.execution_id,
            "success": success,
            "duration_ms": now_ms - completion.started_at_ms,
            "error": error_text,
        });
        self.publisher
            .publish_status(
                "system/scheduler/execution",
                "aico.system.Event",
                payload.to_string().into_bytes(),
            )
            .await;
    }

    /// Record the run and either advance `next_run` or retire the task.
    async fn reschedule(&self, task: &TaskRecord, schedule: &Schedule, now_ms: i64) {
        let next = if schedule.is_one_shot() {
            None
        } else {
            schedule.next_after(Utc::now()).map(|t| t.timestamp_millis())
        };
        let result = match next {
            Some(next_ms) => self.tasks.mark_run(&task.task_id, now_ms, next_ms).await,
            None => {
                // Terminal: keep the record, stop scheduling it.
                match self.tasks.set_enabled(&task.task_id, false).await {
                    Ok(_) => self.tasks.mark_run(&task.task_id, now_ms, task.next_run_utc_ms).await,
                    Err(err) => Err(err),
                }
            }
        };
        if let Err(err) = result {
            warn!(%err, task = %task.task_id, "failed to reschedule task");
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("classes", &self.registry.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use slmf_store::{StoreCipher, StoreConfig};
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn events() -> EventStore {
        EventStore::open(&StoreConfig::in_memory(), StoreCipher::derive(&[11u8; 32]))
            .await
            .unwrap()
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            tick: Duration::from_millis(50),
            admission: AdmissionConfig { cpu_threshold: 101.0, mem_threshold: 101.0 },
            retry: RetryPolicy {
                base: Duration::from_millis(100),
                cap: Duration::from_secs(1),
                max_attempts: 3,
            },
            ..SchedulerConfig::default()
        }
    }

    /// Counts runs; fails the first `fail_first` attempts transiently.
    struct Flaky {
        runs: Arc<AtomicU32>,
        fail_first: u32,
    }

    #[async_trait]
    impl TaskClass for Flaky {
        fn name(&self) -> &'static str {
            "test.flaky"
        }

        async fn run(&self, _ctx: TaskContext) -> Result<(), TaskError> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                Err(TaskError::Transient(format!("attempt {n} fails")))
            } else {
                Ok(())
            }
        }
    }

    /// Holds until cancelled, counting overlap.
    struct Slow {
        concurrent: Arc<AtomicU32>,
        peak: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TaskClass for Slow {
        fn name(&self) -> &'static str {
            "test.slow"
        }

        async fn run(&self, ctx: TaskContext) -> Result<(), TaskError> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::select! {
                _ = ctx.cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(400)) => {}
            }
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scheduler_with(
        config: SchedulerConfig,
        registry: TaskRegistry,
        events: EventStore,
    ) -> Arc<Scheduler> {
        Scheduler::new(
            config,
            registry,
            events,
            Arc::new(NullPublisher),
            LoopLagWatchdog::disabled(),
        )
    }

    #[tokio::test]
    async fn create_task_computes_next_run() {
        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(Flaky { runs: Arc::new(AtomicU32::new(0)), fail_first: 0 }));
        let sched = scheduler_with(fast_config(), registry, events().await);

        let record = sched
            .create_task(TaskSpec {
                task_id: "demo.simple".into(),
                task_class: "test.flaky".into(),
                schedule: "interval:60".into(),
                config: serde_json::json!({}),
                enabled: true,
            })
            .await
            .unwrap();
        assert!(record.next_run_utc_ms > record.created_at_utc_ms);

        let status = sched.status("demo.simple").await.unwrap();
        assert_eq!(status.state, TaskState::Idle);
    }

    #[tokio::test]
    async fn unknown_class_is_rejected() {
        let sched = scheduler_with(fast_config(), TaskRegistry::new(), events().await);
        let err = sched
            .create_task(TaskSpec {
                task_id: "x".into(),
                task_class: "nope".into(),
                schedule: "interval:5".into(),
                config: serde_json::json!({}),
                enabled: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownClass { .. }));
    }

    #[tokio::test]
    async fn past_one_shot_is_exhausted() {
        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(Flaky { runs: Arc::new(AtomicU32::new(0)), fail_first: 0 }));
        let sched = scheduler_with(fast_config(), registry, events().await);
        let err = sched
            .create_task(TaskSpec {
                task_id: "x".into(),
                task_class: "test.flaky".into(),
                schedule: "at:2001-01-01T00:00:00Z".into(),
                config: serde_json::json!({}),
                enabled: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ScheduleExhausted));
    }

    #[tokio::test]
    async fn ready_task_runs_and_reschedules() {
        let runs = Arc::new(AtomicU32::new(0));
        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(Flaky { runs: runs.clone(), fail_first: 0 }));
        let store = events().await;
        let sched = scheduler_with(fast_config(), registry, store);

        sched
            .create_task(TaskSpec {
                task_id: "demo.runs".into(),
                task_class: "test.flaky".into(),
                schedule: "interval:3600".into(),
                config: serde_json::json!({}),
                enabled: true,
            })
            .await
            .unwrap();
        // Pull the fire time into the past so the first scan picks it up.
        sched.tasks.set_next_run("demo.runs", 0).await.unwrap();

        let shutdown = CancelToken::new();
        let loop_task = tokio::spawn(sched.clone().run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown.cancel();
        let _ = loop_task.await;

        assert_eq!(runs.load(Ordering::SeqCst), 1, "one execution, then rescheduled far out");
        let status = sched.status("demo.runs").await.unwrap();
        assert_eq!(status.recent.len(), 1);
        assert_eq!(status.recent[0].success, Some(true));
        assert!(status.record.next_run_utc_ms > Utc::now().timestamp_millis());
        assert!(status.record.last_run_utc_ms.is_some());
    }

    #[tokio::test]
    async fn transient_failures_retry_with_backoff_then_succeed() {
        let runs = Arc::new(AtomicU32::new(0));
        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(Flaky { runs: runs.clone(), fail_first: 2 }));
        let sched = scheduler_with(fast_config(), registry, events().await);

        sched
            .create_task(TaskSpec {
                task_id: "demo.flaky".into(),
                task_class: "test.flaky".into(),
                schedule: "interval:3600".into(),
                config: serde_json::json!({}),
                enabled: true,
            })
            .await
            .unwrap();
        sched.tasks.set_next_run("demo.flaky", 0).await.unwrap();

        let shutdown = CancelToken::new();
        let loop_task = tokio::spawn(sched.clone().run(shutdown.clone()));
        // Retry delays are 100 ms then 200 ms under the test policy.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        shutdown.cancel();
        let _ = loop_task.await;

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        let status = sched.status("demo.flaky").await.unwrap();
        assert_eq!(status.recent.len(), 3);
        // Newest first.
        assert_eq!(status.recent[0].success, Some(true));
        assert_eq!(status.recent[1].success, Some(false));
        assert_eq!(status.recent[2].success, Some(false));
        assert_eq!(status.recent[0].retry_count, 2);
        assert_eq!(status.recent[2].retry_count, 0);
    }

    #[tokio::test]
    async fn at_most_one_execution_per_task() {
        let concurrent = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(Slow { concurrent, peak: peak.clone() }));
        let sched = scheduler_with(fast_config(), registry, events().await);

        sched
            .create_task(TaskSpec {
                task_id: "demo.slow".into(),
                task_class: "test.slow".into(),
                schedule: "interval:1".into(),
                config: serde_json::json!({}),
                enabled: true,
            })
            .await
            .unwrap();
        sched.tasks.set_next_run("demo.slow", 0).await.unwrap();

        let shutdown = CancelToken::new();
        let loop_task = tokio::spawn(sched.clone().run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(600)).await;
        shutdown.cancel();
        let _ = loop_task.await;

        assert_eq!(peak.load(Ordering::SeqCst), 1, "executions of one task must never overlap");
    }

    #[tokio::test]
    async fn one_shot_goes_terminal_after_success() {
        let runs = Arc::new(AtomicU32::new(0));
        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(Flaky { runs: runs.clone(), fail_first: 0 }));
        let sched = scheduler_with(fast_config(), registry, events().await);

        let soon = Utc::now() + chrono::Duration::milliseconds(100);
        sched
            .create_task(TaskSpec {
                task_id: "demo.once".into(),
                task_class: "test.flaky".into(),
                schedule: format!("at:{}", soon.to_rfc3339()),
                config: serde_json::json!({}),
                enabled: true,
            })
            .await
            .unwrap();

        let shutdown = CancelToken::new();
        let loop_task = tokio::spawn(sched.clone().run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(700)).await;
        shutdown.cancel();
        let _ = loop_task.await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let status = sched.status("demo.once").await.unwrap();
        assert_eq!(status.state, TaskState::Terminal);
        assert!(!status.record.enabled);
    }

    #[tokio::test]
    async fn disable_prevents_dispatch() {
        let runs = Arc::new(AtomicU32::new(0));
        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(Flaky { runs: runs.clone(), fail_first: 0 }));
        let sched = scheduler_with(fast_config(), registry, events().await);

        sched
            .create_task(TaskSpec {
                task_id: "demo.off".into(),
                task_class: "test.flaky".into(),
                schedule: "interval:1".into(),
                config: serde_json::json!({}),
                enabled: true,
            })
            .await
            .unwrap();
        sched.tasks.set_next_run("demo.off", 0).await.unwrap();
        sched.set_enabled("demo.off", false).await.unwrap();

        let shutdown = CancelToken::new();
        let loop_task = tokio::spawn(sched.clone().run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
        let _ = loop_task.await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(sched.status("demo.off").await.unwrap().state, TaskState::Terminal);
    }
}
