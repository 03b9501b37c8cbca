//! SQLite-backed task store.
//!
//! Single source of truth for all queue state. Every state transition goes
//! through one of the transactional operations below; the executor and
//! governor only ever hold row snapshots.
//!
//! Reservation uses a single `UPDATE … WHERE id IN (SELECT … LIMIT n)
//! RETURNING …` statement, so two concurrent `reserve_batch` calls can never
//! hand out the same task.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::types::Json;
use tracing::{debug, info};
use uuid::Uuid;

use super::task::{QueueStats, RunStatus, Task, TaskStatus};

const TASK_COLUMNS: &str = "id, task_type, payload, status, attempts, max_attempts, priority, \
     scheduled_for, created_at, updated_at, idempotency_key, last_error, result";

/// Result of an enqueue that accounts for idempotency.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    /// A new task was inserted.
    Created(Uuid),
    /// The idempotency key matched a previously succeeded task; nothing was
    /// inserted and the prior id is returned.
    Deduplicated(Uuid),
}

impl EnqueueOutcome {
    /// The task id regardless of outcome.
    pub fn task_id(&self) -> Uuid {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Deduplicated(id) => *id,
        }
    }

    /// True if a new row was inserted.
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueOutcome::Created(_))
    }
}

/// Durable queue over a single SQLite file.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Open (creating if necessary) the database at `db_path` and run
    /// migrations. WAL journaling with full synchronous commits gives the
    /// write-ahead durability the queue depends on.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open task store at {}", db_path.display()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run task store migrations")?;

        info!(db_path = %db_path.display(), "task store opened");
        Ok(Self { pool })
    }

    /// Insert a new task, enforcing idempotency.
    ///
    /// If the task carries an idempotency key that already has a `succeeded`
    /// task, the prior id is returned and nothing is inserted. A key that
    /// collides with a non-succeeded task hits the unique index and surfaces
    /// as an error.
    pub async fn enqueue(&self, task: Task) -> Result<EnqueueOutcome> {
        if let Some(key) = &task.idempotency_key {
            let prior: Option<Uuid> = sqlx::query_scalar(
                "SELECT id FROM tasks WHERE idempotency_key = ?1 AND status = 'succeeded'",
            )
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(prior_id) = prior {
                return Ok(EnqueueOutcome::Deduplicated(prior_id));
            }
        }

        // A key that raced past the check above still lands on the unique
        // index, so the insert is the authority.
        sqlx::query(
            r#"
            INSERT INTO tasks (id, task_type, payload, status, attempts, max_attempts, priority,
                               scheduled_for, created_at, updated_at, idempotency_key)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(task.id)
        .bind(&task.task_type)
        .bind(&task.payload)
        .bind(task.status)
        .bind(task.attempts)
        .bind(task.max_attempts)
        .bind(task.priority)
        .bind(task.scheduled_for)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(&task.idempotency_key)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to enqueue task {}", task.id))?;

        Ok(EnqueueOutcome::Created(task.id))
    }

    /// Atomically reserve up to `limit` eligible tasks, ordered by
    /// `(priority DESC, scheduled_for ASC)`, and return their snapshots.
    pub async fn reserve_batch(&self, limit: i64) -> Result<Vec<Task>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();

        let mut tasks = sqlx::query_as::<_, Task>(&format!(
            r#"
            UPDATE tasks
            SET status = 'reserved', updated_at = ?1
            WHERE id IN (
                SELECT id FROM tasks
                WHERE status IN ('queued', 'retry_scheduled') AND scheduled_for <= ?1
                ORDER BY priority DESC, scheduled_for ASC
                LIMIT ?2
            )
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to reserve tasks")?;

        // RETURNING emits rows in storage order; restore the reservation
        // order the subquery selected by.
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_for.cmp(&b.scheduled_for))
        });

        if !tasks.is_empty() {
            debug!(count = tasks.len(), "reserved tasks");
        }
        Ok(tasks)
    }

    /// Begin an execution attempt: `in_progress`, attempts incremented.
    pub async fn mark_in_progress(&self, task_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = 'in_progress', attempts = attempts + 1, updated_at = ?1 \
             WHERE id = ?2",
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Prove the worker still owns the task by bumping `updated_at`.
    pub async fn heartbeat(&self, task_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE tasks SET updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Terminal success.
    pub async fn complete(&self, task_id: Uuid, result: serde_json::Value) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = 'succeeded', result = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(Json(result))
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal failure.
    pub async fn fail(&self, task_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = 'failed', last_error = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Park the task until `scheduled_for`; a later reservation cycle picks
    /// it back up.
    pub async fn schedule_retry(
        &self,
        task_id: Uuid,
        scheduled_for: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = 'retry_scheduled', scheduled_for = ?1, last_error = ?2, \
             updated_at = ?3 WHERE id = ?4",
        )
        .bind(scheduled_for)
        .bind(error)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Return any `reserved`/`in_progress` task whose heartbeat is older than
    /// `ttl` to the queue. Called once at executor startup to recover from a
    /// prior crash.
    pub async fn requeue_stale(&self, ttl: Duration) -> Result<u64> {
        let now = Utc::now();
        let deadline = now - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());

        let recovered = sqlx::query(
            "UPDATE tasks SET status = 'queued', updated_at = ?1 \
             WHERE status IN ('reserved', 'in_progress') AND updated_at < ?2",
        )
        .bind(now)
        .bind(deadline)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if recovered > 0 {
            info!(count = recovered, "requeued stale in-flight tasks");
        }
        Ok(recovered)
    }

    /// Delete succeeded tasks older than the cutoff. Returns the count.
    pub async fn cleanup_completed(&self, older_than: Duration) -> Result<u64> {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());

        let deleted = sqlx::query("DELETE FROM tasks WHERE status = 'succeeded' AND updated_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if deleted > 0 {
            info!(count = deleted, "garbage-collected succeeded tasks");
        }
        Ok(deleted)
    }

    /// Fetch a single task snapshot.
    pub async fn fetch(&self, task_id: Uuid) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    /// Per-status counts for the whole queue.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let rows: Vec<(TaskStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status {
                TaskStatus::Queued => stats.queued = count,
                TaskStatus::Reserved => stats.reserved = count,
                TaskStatus::InProgress => stats.in_progress = count,
                TaskStatus::RetryScheduled => stats.retry_scheduled = count,
                TaskStatus::Succeeded => stats.succeeded = count,
                TaskStatus::Failed => stats.failed = count,
            }
            stats.total += count;
        }
        Ok(stats)
    }

    /// Total number of task rows.
    pub async fn count_tasks(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Append a telemetry sample. `ts` is the key; a colliding sample
    /// overwrites the previous one.
    pub async fn insert_metrics(
        &self,
        ts: DateTime<Utc>,
        cpu_pct: f64,
        mem_pct: f64,
        errors: i64,
        operations: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metrics (ts, cpu_pct, mem_pct, errors_count, operations_count)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(ts) DO UPDATE SET
                cpu_pct = excluded.cpu_pct,
                mem_pct = excluded.mem_pct,
                errors_count = excluded.errors_count,
                operations_count = excluded.operations_count
            "#,
        )
        .bind(ts)
        .bind(cpu_pct)
        .bind(mem_pct)
        .bind(errors)
        .bind(operations)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record the start of an executor run.
    pub async fn start_run(&self, run_id: Uuid) -> Result<()> {
        sqlx::query("INSERT INTO runs (id, started_at, status) VALUES (?1, ?2, 'running')")
            .bind(run_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Close out an executor run with its final status and stats.
    pub async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        stats: serde_json::Value,
    ) -> Result<()> {
        sqlx::query("UPDATE runs SET ended_at = ?1, status = ?2, stats = ?3 WHERE id = ?4")
            .bind(Utc::now())
            .bind(status)
            .bind(Json(stats))
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
