//! End-to-end engine scenarios: success, retries, permanent failure,
//! idempotency, crash recovery, and the reservation pause window.

mod common;

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::types::Json;
use steward_core::kernel::tasks::store::TaskStore;
use steward_core::kernel::tasks::task::{Task, TaskStatus};
use steward_core::{Agent, TaskSpec};

use common::{test_config, wait_for};

const WAIT: Duration = Duration::from_secs(10);

fn spec(task_type: &str) -> TaskSpec {
    TaskSpec::builder()
        .task_type(task_type)
        .payload(json!({}))
        .build()
}

async fn all_with_status(agent: &Agent, status: TaskStatus, expected: i64) -> bool {
    let stats = agent.stats().await.unwrap();
    match status {
        TaskStatus::Succeeded => stats.succeeded == expected,
        TaskStatus::Failed => stats.failed == expected,
        TaskStatus::Queued => stats.queued == expected,
        _ => false,
    }
}

#[tokio::test]
async fn four_tasks_succeed_within_the_concurrency_budget() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(Agent::new(test_config(dir.path(), 2, 3)).await.unwrap());

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    {
        let current = current.clone();
        let peak = peak.clone();
        agent.register_handler("noop", move |_payload| {
            let current = current.clone();
            let peak = peak.clone();
            async move {
                let running = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(running, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(json!({"ok": true}))
            }
        });
    }

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(agent.enqueue(spec("noop")).await.unwrap().task_id());
    }

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };

    assert!(
        wait_for(WAIT, || {
            let agent = agent.clone();
            async move { all_with_status(&agent, TaskStatus::Succeeded, 4).await }
        })
        .await,
        "tasks did not all succeed in time"
    );

    agent.shutdown();
    runner.await.unwrap().unwrap();

    for id in ids {
        let task = agent.inspect(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.result.as_ref().unwrap().0, json!({"ok": true}));
    }
    assert!(peak.load(Ordering::SeqCst) <= 2, "inflight exceeded effective_max");
}

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(Agent::new(test_config(dir.path(), 2, 3)).await.unwrap());

    let calls = Arc::new(AtomicI64::new(0));
    {
        let calls = calls.clone();
        agent.register_handler("flaky", move |_payload| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("transient outage");
                }
                Ok(json!({"recovered": true}))
            }
        });
    }

    let id = agent.enqueue(spec("flaky")).await.unwrap().task_id();

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };
    assert!(
        wait_for(WAIT, || {
            let agent = agent.clone();
            async move { all_with_status(&agent, TaskStatus::Succeeded, 1).await }
        })
        .await
    );
    agent.shutdown();
    runner.await.unwrap().unwrap();

    let task = agent.inspect(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.attempts, 3);
}

#[tokio::test]
async fn exhausted_retries_fail_permanently() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(Agent::new(test_config(dir.path(), 2, 2)).await.unwrap());

    agent.register_handler("doomed", |_payload| async move {
        anyhow::bail!("boom")
    });

    let id = agent.enqueue(spec("doomed")).await.unwrap().task_id();

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };
    assert!(
        wait_for(WAIT, || {
            let agent = agent.clone();
            async move { all_with_status(&agent, TaskStatus::Failed, 1).await }
        })
        .await
    );
    agent.shutdown();
    runner.await.unwrap().unwrap();

    let task = agent.inspect(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 2);
    assert_eq!(task.last_error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn missing_handler_fails_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(Agent::new(test_config(dir.path(), 2, 3)).await.unwrap());

    let id = agent.enqueue(spec("unregistered")).await.unwrap().task_id();

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };
    assert!(
        wait_for(WAIT, || {
            let agent = agent.clone();
            async move { all_with_status(&agent, TaskStatus::Failed, 1).await }
        })
        .await
    );
    agent.shutdown();
    runner.await.unwrap().unwrap();

    let task = agent.inspect(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 0);
    assert_eq!(task.last_error.as_deref(), Some("handler_not_found"));
}

#[tokio::test]
async fn idempotent_enqueue_returns_the_prior_task() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(Agent::new(test_config(dir.path(), 2, 3)).await.unwrap());

    agent.register_handler("once", |_payload| async move { Ok(json!({"ok": true})) });

    let mut first = spec("once");
    first.idempotency_key = Some("k1".to_string());
    let first_id = agent.enqueue(first).await.unwrap().task_id();

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };
    assert!(
        wait_for(WAIT, || {
            let agent = agent.clone();
            async move { all_with_status(&agent, TaskStatus::Succeeded, 1).await }
        })
        .await
    );

    let mut again = spec("once");
    again.idempotency_key = Some("k1".to_string());
    let outcome = agent.enqueue(again).await.unwrap();

    agent.shutdown();
    runner.await.unwrap().unwrap();

    assert!(!outcome.is_created());
    assert_eq!(outcome.task_id(), first_id);
    assert_eq!(agent.store().count_tasks().await.unwrap(), 1);
}

#[tokio::test]
async fn interrupted_run_is_recovered_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), 2, 3);
    config.persistence.heartbeat_ttl_s = Some(0);

    // A previous process reserved work and died without a heartbeat.
    {
        let store = TaskStore::open(&config.persistence.db_path).await.unwrap();
        for _ in 0..5 {
            let task = Task::builder()
                .task_type("noop")
                .payload(Json(json!({})))
                .build();
            store.enqueue(task).await.unwrap();
        }
        let claimed = store.reserve_batch(5).await.unwrap();
        assert_eq!(claimed.len(), 5);
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let agent = Arc::new(Agent::new(config).await.unwrap());
    agent.register_handler("noop", |_payload| async move { Ok(json!({"ok": true})) });

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };
    assert!(
        wait_for(WAIT, || {
            let agent = agent.clone();
            async move { all_with_status(&agent, TaskStatus::Succeeded, 5).await }
        })
        .await,
        "recovered tasks did not complete"
    );
    agent.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn pause_window_blocks_reservations_until_resume() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(Agent::new(test_config(dir.path(), 2, 3)).await.unwrap());

    agent.register_handler("noop", |_payload| async move { Ok(json!({"ok": true})) });
    agent.enqueue(spec("noop")).await.unwrap();

    let controls = agent.controls();
    controls.pause_for(Duration::from_secs(60));

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };

    // Give the dispatcher several ticks; nothing may be reserved.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let stats = agent.stats().await.unwrap();
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.succeeded, 0);

    controls.resume();
    assert!(
        wait_for(WAIT, || {
            let agent = agent.clone();
            async move { all_with_status(&agent, TaskStatus::Succeeded, 1).await }
        })
        .await
    );
    agent.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn blocking_and_cpu_bound_handlers_complete() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(Agent::new(test_config(dir.path(), 2, 3)).await.unwrap());

    agent.register_blocking_handler("io", |payload| {
        std::thread::sleep(Duration::from_millis(10));
        Ok(payload)
    });
    agent.register_cpu_bound_handler("crunch", |_payload| {
        let sum: u64 = (0..10_000).sum();
        Ok(json!({"sum": sum}))
    });

    agent.enqueue(spec("io")).await.unwrap();
    agent.enqueue(spec("crunch")).await.unwrap();

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };
    assert!(
        wait_for(WAIT, || {
            let agent = agent.clone();
            async move { all_with_status(&agent, TaskStatus::Succeeded, 2).await }
        })
        .await
    );
    agent.shutdown();
    runner.await.unwrap().unwrap();
}
