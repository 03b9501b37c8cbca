//! Agent facade: wires the store, registry, executor, and governor together
//! and exposes the public engine surface (`enqueue`, `register_handler*`,
//! `run`, `shutdown`, `inspect`, `stats`).
//!
//! Process-wide concerns (signal handling, logger setup) stay in the binary;
//! the facade owns only engine state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::types::Json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::kernel::escalation::EscalationNotifier;
use crate::kernel::event_log::{AgentEvent, EventLog};
use crate::kernel::governor::{GovernanceController, GovernorSettings};
use crate::kernel::tasks::counter::OperationsCounter;
use crate::kernel::tasks::executor::{ExecutorConfig, ExecutorControls, TaskExecutor};
use crate::kernel::tasks::registry::HandlerRegistry;
use crate::kernel::tasks::retry::RetryPolicy;
use crate::kernel::tasks::store::{EnqueueOutcome, TaskStore};
use crate::kernel::tasks::task::{QueueStats, RunStatus, Task};

/// What a client submits. Everything beyond type and payload has an
/// engine-chosen default.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct TaskSpec {
    pub task_type: String,
    pub payload: serde_json::Value,
    #[builder(default = 0)]
    pub priority: i64,
    #[builder(default, setter(strip_option))]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Defaults to `bulk.retry_attempts` from configuration.
    #[builder(default, setter(strip_option))]
    pub max_attempts: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub idempotency_key: Option<String>,
}

/// The engine. One instance per process; `run` drives the executor and
/// governor until `shutdown` is signalled.
pub struct Agent {
    config: AgentConfig,
    store: TaskStore,
    registry: Arc<HandlerRegistry>,
    counter: Arc<OperationsCounter>,
    controls: Arc<ExecutorControls>,
    agent_log: Arc<EventLog>,
    metrics_log: Arc<EventLog>,
    shutdown: CancellationToken,
}

impl Agent {
    /// Open the store (running migrations) and prepare the event logs.
    pub async fn new(config: AgentConfig) -> Result<Self> {
        let store = TaskStore::open(&config.persistence.db_path).await?;
        let agent_log = Arc::new(EventLog::open(&config.agent_log_path())?);
        let metrics_log = Arc::new(EventLog::open(&config.metrics_log_path())?);
        let controls = ExecutorControls::new(config.bulk.max_concurrent);

        Ok(Self {
            config,
            store,
            registry: Arc::new(HandlerRegistry::new()),
            counter: Arc::new(OperationsCounter::new()),
            controls,
            agent_log,
            metrics_log,
            shutdown: CancellationToken::new(),
        })
    }

    /// Register an async-cooperative handler for a type tag.
    pub fn register_handler<F, Fut>(&self, task_type: &str, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let replaced = self.registry.register(task_type, handler);
        self.log_registration(task_type, replaced);
    }

    /// Register a blocking handler, run on a generic worker thread.
    pub fn register_blocking_handler<F>(&self, task_type: &str, handler: F)
    where
        F: Fn(serde_json::Value) -> Result<serde_json::Value> + Send + Sync + 'static,
    {
        let replaced = self.registry.register_blocking(task_type, handler);
        self.log_registration(task_type, replaced);
    }

    /// Register a CPU-bound handler, bounded by the worker pool.
    pub fn register_cpu_bound_handler<F>(&self, task_type: &str, handler: F)
    where
        F: Fn(serde_json::Value) -> Result<serde_json::Value> + Send + Sync + 'static,
    {
        let replaced = self.registry.register_cpu_bound(task_type, handler);
        self.log_registration(task_type, replaced);
    }

    fn log_registration(&self, task_type: &str, replaced: bool) {
        info!(task_type = %task_type, replaced, "handler registered");
        self.agent_log.append(&AgentEvent::HandlerRegistered {
            task_type: task_type.to_string(),
            replaced,
        });
    }

    /// Persist a new task, assigning its id. Returns the prior task's id
    /// without inserting when the idempotency key already succeeded.
    pub async fn enqueue(&self, spec: TaskSpec) -> Result<EnqueueOutcome> {
        let now = Utc::now();
        let idempotency_key = spec.idempotency_key.clone();
        let mut task = Task::builder()
            .task_type(spec.task_type.clone())
            .payload(Json(spec.payload))
            .priority(spec.priority)
            .scheduled_for(spec.scheduled_for.unwrap_or(now))
            .max_attempts(spec.max_attempts.unwrap_or(self.config.bulk.retry_attempts))
            .build();
        task.idempotency_key = spec.idempotency_key;

        let outcome = self.store.enqueue(task).await?;
        match &outcome {
            EnqueueOutcome::Created(id) => {
                info!(task_id = %id, task_type = %spec.task_type, "task enqueued");
                self.agent_log.append(&AgentEvent::TaskEnqueued {
                    task_id: *id,
                    task_type: spec.task_type,
                    priority: spec.priority,
                });
            }
            EnqueueOutcome::Deduplicated(id) => {
                info!(task_id = %id, task_type = %spec.task_type, "task deduplicated");
                self.agent_log.append(&AgentEvent::TaskDeduplicated {
                    task_id: *id,
                    task_type: spec.task_type,
                    idempotency_key: idempotency_key.unwrap_or_default(),
                });
            }
        }
        Ok(outcome)
    }

    /// Drive the queue until shutdown: recover stale work, GC old rows,
    /// then run the executor and governor concurrently.
    pub async fn run(&self) -> Result<()> {
        let run_id = Uuid::new_v4();
        info!(run_id = %run_id, "agent run starting");
        self.store.start_run(run_id).await?;

        let recovered = self
            .store
            .requeue_stale(self.config.heartbeat_ttl())
            .await
            .context("stale-task recovery failed")?;
        if recovered > 0 {
            info!(count = recovered, "recovered tasks from a prior run");
        }
        if let Err(e) = self.store.cleanup_completed(self.config.gc_cutoff()).await {
            // GC is housekeeping; a failure must not block the run.
            error!(error = %e, "startup cleanup failed");
        }

        let heartbeat_interval =
            Duration::from_secs((self.config.heartbeat_ttl().as_secs() / 3).max(1));
        let executor = TaskExecutor::new(
            self.store.clone(),
            self.registry.clone(),
            RetryPolicy::new(
                Duration::from_secs(self.config.bulk.retry_delay_seconds),
                self.config.bulk.retry_attempts,
            ),
            self.counter.clone(),
            self.controls.clone(),
            self.agent_log.clone(),
            ExecutorConfig {
                heartbeat_interval,
                ..ExecutorConfig::default()
            },
        );

        let governor = GovernanceController::new(
            GovernorSettings {
                cpu_high_pct: self.config.governance.cpu_high_pct,
                mem_high_pct: self.config.governance.mem_high_pct,
                window: Duration::from_secs(self.config.governance.window_s),
                pause_error_threshold: self.config.governance.pause_after_error_burst.threshold,
                pause_duration: Duration::from_secs(
                    self.config.governance.pause_after_error_burst.duration_s,
                ),
                human_review_after_pause_bursts: self
                    .config
                    .governance
                    .human_review_after_pause_bursts,
                sample_interval: Duration::from_secs(self.config.telemetry.sample_interval_s),
                log_interval: Duration::from_secs(self.config.telemetry.log_interval_s),
                escalation_enabled: self.config.escalation.enabled,
                escalation_email_to: self.config.escalation.email_to.clone(),
            },
            self.store.clone(),
            self.controls.clone(),
            self.counter.clone(),
            self.metrics_log.clone(),
            EscalationNotifier::new(self.config.escalation.webhook_url.clone()),
        );

        let (executor_result, governor_result) = tokio::join!(
            executor.run(self.shutdown.clone()),
            governor.run(self.shutdown.clone()),
        );

        let run_status = if executor_result.is_ok() && governor_result.is_ok() {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        let stats = self.run_stats().await;
        if let Err(e) = self.store.finish_run(run_id, run_status, stats).await {
            error!(run_id = %run_id, error = %e, "failed to close run record");
        }
        info!(run_id = %run_id, status = ?run_status, "agent run finished");

        executor_result.and(governor_result)
    }

    /// Run until SIGINT, then shut down cooperatively.
    pub async fn run_until_interrupted(&self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received interrupt; shutting down");
                shutdown.cancel();
            }
        });
        self.run().await
    }

    /// Signal cooperative shutdown; inflight handlers finish first.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn inspect(&self, task_id: Uuid) -> Result<Option<Task>> {
        self.store.fetch(task_id).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.store.queue_stats().await
    }

    /// Direct store access, used by tests and the CLI's read-only commands.
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Live executor controls (concurrency target, pause state).
    pub fn controls(&self) -> Arc<ExecutorControls> {
        self.controls.clone()
    }

    async fn run_stats(&self) -> serde_json::Value {
        let queue = self.stats().await.unwrap_or_default();
        let (ops, errors) = self
            .counter
            .snapshot(Duration::from_secs(self.config.governance.window_s));
        json!({
            "queue": queue,
            "window_operations": ops,
            "window_errors": errors,
        })
    }
}
