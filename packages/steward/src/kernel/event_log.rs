//! Append-only JSONL event logs.
//!
//! Two files, one JSON object per line, each stamped with an RFC 3339 `ts`
//! and an `event` discriminator:
//! - `agent.jsonl` — lifecycle and per-task events
//! - `metrics.jsonl` — telemetry samples and governance decisions
//!
//! Writing is best-effort: a failed append is logged through `tracing` and
//! never propagates into an engine loop.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use super::tasks::task::TaskStatus;

/// Lifecycle events written to `agent.jsonl`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    HandlerRegistered {
        task_type: String,
        replaced: bool,
    },
    TaskEnqueued {
        task_id: Uuid,
        task_type: String,
        priority: i64,
    },
    TaskDeduplicated {
        task_id: Uuid,
        task_type: String,
        idempotency_key: String,
    },
    TaskCompleted {
        task_id: Uuid,
        task_type: String,
        status: TaskStatus,
        attempts: i64,
        duration_ms: u64,
    },
    TaskFailed {
        task_id: Uuid,
        task_type: String,
        attempts: i64,
        error: String,
        will_retry: bool,
    },
}

/// Telemetry and governance events written to `metrics.jsonl`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MetricsEvent {
    MetricsSample {
        cpu_pct: f64,
        mem_pct: f64,
        errors: usize,
        operations: usize,
    },
    GovernanceSummary {
        cpu_avg: f64,
        mem_avg: f64,
        active_samples: usize,
        effective_max: usize,
        pause_events: usize,
        errors_window: usize,
    },
    Pause {
        duration_s: u64,
        reason: String,
    },
    Throttle {
        reason: String,
        effective_max: usize,
    },
    Recover {
        effective_max: usize,
    },
    Resume,
    Escalate {
        reason: String,
    },
}

/// One append-only JSONL file behind a mutex.
pub struct EventLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl EventLog {
    /// Open (creating parents and the file as needed) for appending.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event, stamped with the current time. Best-effort.
    pub fn append<E: Serialize>(&self, event: &E) {
        let mut value = match serde_json::to_value(event) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(other) => {
                warn!(?other, "event log entry was not an object; dropping");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to serialize event log entry");
                return;
            }
        };
        value.insert(
            "ts".to_string(),
            serde_json::Value::String(Utc::now().to_rfc3339()),
        );

        let line = serde_json::Value::Object(value).to_string();
        let mut file = self.file.lock().expect("event log lock poisoned");
        if let Err(e) = writeln!(file, "{line}") {
            warn!(path = %self.path.display(), error = %e, "failed to append event log line");
        }
    }

    /// Last `n` lines of the log, oldest first. Used by escalation payloads.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let lines: Vec<&str> = contents.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].iter().map(|l| l.to_string()).collect()
    }
}
