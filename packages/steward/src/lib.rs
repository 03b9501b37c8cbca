//! Steward: a durable, governed task-execution engine.
//!
//! Clients enqueue typed tasks; the engine persists them in a single-file
//! SQLite queue, executes them under a live concurrency budget with
//! exponential-backoff retries, and continuously measures system health to
//! throttle, pause, or escalate under stress. Work survives process restart:
//! the store is authoritative, and stale reservations from a crashed run are
//! returned to the queue at the next startup.

pub mod agent;
pub mod config;
pub mod kernel;

pub use agent::{Agent, TaskSpec};
pub use config::{AgentConfig, ConfigError};
pub use kernel::tasks::{EnqueueOutcome, QueueStats, Task, TaskStatus};
