//! Task executor: drives the queue forward under a live concurrency budget.
//!
//! A single cooperative dispatcher reserves eligible tasks in batches and
//! spawns one invocation per task; invocations run in parallel. The
//! governance controller adjusts `effective_max` and the pause window
//! through [`ExecutorControls`] while the loop is running.
//!
//! ```text
//! TaskExecutor::run
//!     │
//!     ├─► reserve_batch(effective_max − inflight)
//!     ├─► per task: resolve handler → mark_in_progress → invoke
//!     │       ├─ success → complete + record
//!     │       └─ error   → schedule_retry | fail + record
//!     └─► on shutdown: drain inflight invocations
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::kernel::event_log::{AgentEvent, EventLog};
use crate::kernel::tasks::counter::OperationsCounter;
use crate::kernel::tasks::registry::{HandlerRegistry, HandlerSpec, Invocation};
use crate::kernel::tasks::retry::RetryPolicy;
use crate::kernel::tasks::store::TaskStore;
use crate::kernel::tasks::task::{Task, TaskStatus};

/// Timing knobs for the dispatch loop.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Sleep between reservation cycles when nothing is available.
    pub idle_poll: Duration,
    /// Sleep granularity while the pause window is active.
    pub pause_poll: Duration,
    /// Heartbeat cadence for running tasks.
    pub heartbeat_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_millis(100),
            pause_poll: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Live-control surface shared between the dispatcher and the governance
/// controller. The dispatcher reads these each tick; only the governor
/// writes them.
pub struct ExecutorControls {
    configured_max: usize,
    effective_max: AtomicUsize,
    inflight: AtomicUsize,
    pause_until: Mutex<Option<Instant>>,
}

impl ExecutorControls {
    pub fn new(configured_max: usize) -> Arc<Self> {
        let configured_max = configured_max.max(1);
        Arc::new(Self {
            configured_max,
            effective_max: AtomicUsize::new(configured_max),
            inflight: AtomicUsize::new(0),
            pause_until: Mutex::new(None),
        })
    }

    /// Immutable hard ceiling.
    pub fn configured_max(&self) -> usize {
        self.configured_max
    }

    /// Current concurrency target, `1..=configured_max`.
    pub fn effective_max(&self) -> usize {
        self.effective_max.load(Ordering::Relaxed)
    }

    /// Clamp and apply a new concurrency target; returns the applied value.
    pub fn set_effective_max(&self, value: usize) -> usize {
        let clamped = value.clamp(1, self.configured_max);
        let previous = self.effective_max.swap(clamped, Ordering::Relaxed);
        if previous != clamped {
            info!(previous, effective_max = clamped, "adjusted effective concurrency");
        }
        clamped
    }

    /// Number of currently running invocations.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    fn set_inflight(&self, count: usize) {
        self.inflight.store(count, Ordering::Relaxed);
    }

    /// Suspend reservations for `duration` from now.
    pub fn pause_for(&self, duration: Duration) {
        let mut pause_until = self.pause_until.lock().expect("controls lock poisoned");
        *pause_until = Some(Instant::now() + duration);
        warn!(duration_s = duration.as_secs(), "paused task reservations");
    }

    /// Clear any pause window.
    pub fn resume(&self) {
        let mut pause_until = self.pause_until.lock().expect("controls lock poisoned");
        if pause_until.take().is_some() {
            info!("resumed task reservations");
        }
    }

    /// Whether the pause window is still active.
    pub fn is_paused(&self) -> bool {
        let pause_until = self.pause_until.lock().expect("controls lock poisoned");
        matches!(*pause_until, Some(until) if Instant::now() < until)
    }

    /// Whether a pause window is set, active or expired.
    pub fn pause_pending(&self) -> bool {
        self.pause_until
            .lock()
            .expect("controls lock poisoned")
            .is_some()
    }
}

struct ExecutorShared {
    store: TaskStore,
    registry: Arc<HandlerRegistry>,
    policy: RetryPolicy,
    counter: Arc<OperationsCounter>,
    controls: Arc<ExecutorControls>,
    /// Bounded worker pool for CPU-bound handlers, sized `configured_max`.
    /// Sized once; throttling shrinks `effective_max` instead of the pool.
    cpu_pool: Semaphore,
    agent_log: Arc<EventLog>,
    heartbeat_interval: Duration,
}

/// The dispatch engine. Cheap to clone handles are shared through an inner
/// Arc so invocation futures can outlive a loop iteration.
pub struct TaskExecutor {
    shared: Arc<ExecutorShared>,
    config: ExecutorConfig,
}

impl TaskExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: TaskStore,
        registry: Arc<HandlerRegistry>,
        policy: RetryPolicy,
        counter: Arc<OperationsCounter>,
        controls: Arc<ExecutorControls>,
        agent_log: Arc<EventLog>,
        config: ExecutorConfig,
    ) -> Self {
        let cpu_pool = Semaphore::new(controls.configured_max());
        Self {
            shared: Arc::new(ExecutorShared {
                store,
                registry,
                policy,
                counter,
                controls,
                cpu_pool,
                agent_log,
                heartbeat_interval: config.heartbeat_interval,
            }),
            config,
        }
    }

    pub fn controls(&self) -> Arc<ExecutorControls> {
        self.shared.controls.clone()
    }

    /// Run the dispatch loop until `shutdown` fires, then drain in-flight
    /// invocations. Reservation errors are logged and retried next tick;
    /// nothing terminates the loop except shutdown.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let controls = &self.shared.controls;
        info!(
            configured_max = controls.configured_max(),
            "task executor starting"
        );

        let mut inflight: JoinSet<()> = JoinSet::new();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            // Reap finished invocations before computing capacity.
            while let Some(joined) = inflight.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "task invocation aborted");
                }
            }
            controls.set_inflight(inflight.len());

            if controls.is_paused() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.pause_poll) => {}
                }
                continue;
            }

            let available = controls.effective_max().saturating_sub(inflight.len());
            if available == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.idle_poll) => {}
                }
                continue;
            }

            match self.shared.store.reserve_batch(available as i64).await {
                Ok(tasks) if !tasks.is_empty() => {
                    for task in tasks {
                        let shared = self.shared.clone();
                        inflight.spawn(async move {
                            execute_task(shared, task).await;
                        });
                    }
                    controls.set_inflight(inflight.len());
                }
                Ok(_) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.idle_poll) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to reserve tasks");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        if !inflight.is_empty() {
            info!(count = inflight.len(), "draining in-flight tasks");
        }
        while let Some(joined) = inflight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "task invocation aborted during drain");
            }
        }
        controls.set_inflight(0);

        info!("task executor stopped");
        Ok(())
    }
}

/// One reserved task: resolve its handler, run a single attempt, and record
/// the outcome. Retries surface through later reservation cycles, not by
/// looping here.
async fn execute_task(shared: Arc<ExecutorShared>, task: Task) {
    let task_id = task.id;
    let task_type = task.task_type.clone();

    let Some(spec) = shared.registry.resolve(&task_type) else {
        warn!(task_id = %task_id, task_type = %task_type, "no handler registered");
        record_failure(&shared, &task, task.attempts, "handler_not_found", false).await;
        return;
    };

    let cap = shared.policy.effective_cap(task.max_attempts);
    if task.attempts >= cap {
        record_failure(&shared, &task, task.attempts, "max_attempts_exceeded", false).await;
        return;
    }

    if let Err(e) = shared.store.mark_in_progress(task_id).await {
        // Leave the row reserved; stale recovery returns it to the queue.
        error!(task_id = %task_id, error = %e, "failed to mark task in progress");
        return;
    }
    let attempts = task.attempts + 1;
    let started = Instant::now();

    // Keep the heartbeat fresh so a concurrent run's stale sweep cannot
    // reclaim a task that is merely slow.
    let heartbeat_cancel = CancellationToken::new();
    let heartbeat_handle = {
        let store = shared.store.clone();
        let cancel = heartbeat_cancel.clone();
        let interval = shared.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.heartbeat(task_id).await {
                            warn!(task_id = %task_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        })
    };

    let payload = task.payload.0.clone();
    let result = invoke(&shared, spec, payload).await;

    heartbeat_cancel.cancel();
    let _ = heartbeat_handle.await;

    let duration_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(value) => {
            if let Err(e) = shared.store.complete(task_id, value).await {
                error!(task_id = %task_id, error = %e, "failed to record task success");
                return;
            }
            shared.counter.record(true, &task_type);
            shared.agent_log.append(&AgentEvent::TaskCompleted {
                task_id,
                task_type: task_type.clone(),
                status: TaskStatus::Succeeded,
                attempts,
                duration_ms,
            });
            info!(task_id = %task_id, task_type = %task_type, attempts, duration_ms, "task completed");
        }
        Err(e) => {
            let reason = e.to_string();
            if attempts >= cap {
                record_failure(&shared, &task, attempts, &reason, false).await;
                warn!(task_id = %task_id, task_type = %task_type, attempts, error = %reason, "task failed permanently");
            } else {
                let delay = shared.policy.next_delay(attempts);
                let scheduled_for = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                if let Err(e) = shared
                    .store
                    .schedule_retry(task_id, scheduled_for, &reason)
                    .await
                {
                    error!(task_id = %task_id, error = %e, "failed to schedule retry");
                    return;
                }
                shared.counter.record(false, &task_type);
                shared.agent_log.append(&AgentEvent::TaskFailed {
                    task_id,
                    task_type: task_type.clone(),
                    attempts,
                    error: reason.clone(),
                    will_retry: true,
                });
                debug!(task_id = %task_id, attempts, delay_ms = delay.as_millis() as u64, "retry scheduled");
            }
        }
    }
}

/// Mark the task failed and record the observation, in that order.
async fn record_failure(
    shared: &ExecutorShared,
    task: &Task,
    attempts: i64,
    reason: &str,
    will_retry: bool,
) {
    if let Err(e) = shared.store.fail(task.id, reason).await {
        error!(task_id = %task.id, error = %e, "failed to record task failure");
        return;
    }
    shared.counter.record(false, &task.task_type);
    shared.agent_log.append(&AgentEvent::TaskFailed {
        task_id: task.id,
        task_type: task.task_type.clone(),
        attempts,
        error: reason.to_string(),
        will_retry,
    });
}

/// Invoke a handler according to its mode. Blocking handlers run on worker
/// threads; CPU-bound ones additionally hold a worker-pool permit. A panic
/// in an offloaded handler surfaces as an ordinary handler error.
async fn invoke(
    shared: &ExecutorShared,
    spec: HandlerSpec,
    payload: serde_json::Value,
) -> Result<serde_json::Value> {
    match spec.invocation {
        Invocation::Async(func) => func(payload).await,
        Invocation::Blocking { func, cpu_bound } => {
            let _permit = if cpu_bound {
                Some(shared.cpu_pool.acquire().await?)
            } else {
                None
            };
            tokio::task::spawn_blocking(move || func(payload))
                .await
                .map_err(|e| anyhow!("blocking handler panicked: {e}"))?
        }
    }
}
