//! Durable task queue and its execution engine.
//!
//! ```text
//! Agent.enqueue(spec)
//!     │
//!     └─► TaskStore (SQLite, WAL)
//!             │
//! TaskExecutor.run ─► reserve_batch ─► HandlerRegistry.resolve
//!             │               │
//!             │               └─► invoke (async | blocking | cpu-bound)
//!             │                       ├─ Ok  → complete
//!             │                       └─ Err → schedule_retry | fail
//!             └─► OperationsCounter ─► GovernanceController
//! ```

pub mod counter;
pub mod executor;
pub mod registry;
pub mod retry;
pub mod store;
pub mod task;

pub use counter::OperationsCounter;
pub use executor::{ExecutorConfig, ExecutorControls, TaskExecutor};
pub use registry::{HandlerRegistry, HandlerSpec, Invocation};
pub use retry::RetryPolicy;
pub use store::{EnqueueOutcome, TaskStore};
pub use task::{QueueStats, RunStatus, Task, TaskStatus};
