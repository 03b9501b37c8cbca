//! Rolling window of task outcomes feeding the governance loop.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One recorded outcome.
#[derive(Debug, Clone)]
struct Observation {
    at: Instant,
    success: bool,
    task_type: String,
}

/// Concurrency-safe counter of recent operations.
///
/// Observations are kept only as long as the longest window anyone asks
/// about; `snapshot` trims on the way out, so the buffer stays bounded as
/// long as the engine keeps sampling. A synchronous mutex keeps record and
/// snapshot free of lock-ordering problems across the async boundary.
#[derive(Debug, Default)]
pub struct OperationsCounter {
    observations: Mutex<VecDeque<Observation>>,
}

impl OperationsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one task outcome.
    pub fn record(&self, success: bool, task_type: &str) {
        let mut observations = self.observations.lock().expect("counter lock poisoned");
        observations.push_back(Observation {
            at: Instant::now(),
            success,
            task_type: task_type.to_string(),
        });
    }

    /// Trim entries older than `window` and return `(total, errors)` for
    /// what remains.
    pub fn snapshot(&self, window: Duration) -> (usize, usize) {
        let mut observations = self.observations.lock().expect("counter lock poisoned");
        let now = Instant::now();
        while let Some(front) = observations.front() {
            if now.duration_since(front.at) > window {
                observations.pop_front();
            } else {
                break;
            }
        }

        let total = observations.len();
        let errors = observations.iter().filter(|o| !o.success).count();
        (total, errors)
    }

    /// Histogram of task type → failure count within the retained window.
    pub fn failing_types(&self) -> HashMap<String, usize> {
        let observations = self.observations.lock().expect("counter lock poisoned");
        let mut failures: HashMap<String, usize> = HashMap::new();
        for obs in observations.iter().filter(|o| !o.success) {
            *failures.entry(obs.task_type.clone()).or_default() += 1;
        }
        failures
    }
}
