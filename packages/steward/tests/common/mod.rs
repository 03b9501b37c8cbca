//! Shared helpers for engine integration tests.
//!
//! Each test gets its own temp directory with a fresh SQLite file; the
//! governance thresholds are parked far away so queue scenarios are not
//! perturbed unless a test asks for it.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use steward_core::config::{
    AgentConfig, BulkConfig, EscalationConfig, GovernanceConfig, PauseAfterErrorBurst,
    PersistenceConfig, TelemetryConfig,
};

/// Engine configuration pointed at `dir`, with governance effectively inert.
pub fn test_config(dir: &Path, max_concurrent: usize, retry_attempts: i64) -> AgentConfig {
    AgentConfig {
        bulk: BulkConfig {
            max_concurrent,
            retry_attempts,
            retry_delay_seconds: 0,
        },
        governance: GovernanceConfig {
            cpu_high_pct: 99.9,
            mem_high_pct: 99.9,
            window_s: 60,
            pause_after_error_burst: PauseAfterErrorBurst {
                threshold: 10_000,
                duration_s: 1,
            },
            human_review_after_pause_bursts: 10_000,
        },
        telemetry: TelemetryConfig {
            sample_interval_s: 1,
            log_interval_s: 60,
            log_dir: dir.join("logs"),
        },
        persistence: PersistenceConfig {
            db_path: dir.join("steward.db"),
            gc_completed_after_days: 7,
            heartbeat_ttl_s: Some(60),
        },
        escalation: EscalationConfig::default(),
    }
}

/// Poll until `check` returns true or the timeout elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
