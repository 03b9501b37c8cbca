// Steward CLI entry point.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use steward_core::{Agent, AgentConfig, TaskSpec};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "steward", version, about = "Durable, governed task-execution engine")]
struct Cli {
    /// Path to the TOML configuration file (default: steward.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue a task and print its id
    Enqueue {
        /// Registered task type tag
        task_type: String,
        /// JSON payload handed to the handler
        payload: String,
        /// Higher priority runs first
        #[arg(long, default_value_t = 0)]
        priority: i64,
        /// Deduplicate against previously succeeded work
        #[arg(long)]
        idempotency_key: Option<String>,
        /// Override the configured retry cap for this task
        #[arg(long)]
        max_attempts: Option<i64>,
        /// Delay eligibility by this many seconds
        #[arg(long)]
        delay_seconds: Option<i64>,
    },
    /// Run the engine until interrupted
    Resume,
    /// Print queue statistics as JSON
    Stats,
    /// Print a task record as JSON
    Inspect {
        task_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,steward_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AgentConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let agent = Agent::new(config).await.context("failed to start engine")?;

    match cli.command {
        Command::Enqueue {
            task_type,
            payload,
            priority,
            idempotency_key,
            max_attempts,
            delay_seconds,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload must be valid JSON")?;

            let mut spec = TaskSpec::builder()
                .task_type(task_type)
                .payload(payload)
                .priority(priority)
                .build();
            spec.idempotency_key = idempotency_key;
            spec.max_attempts = max_attempts;
            spec.scheduled_for = delay_seconds.map(|s| Utc::now() + Duration::seconds(s));

            let outcome = agent.enqueue(spec).await?;
            println!("{}", outcome.task_id());
        }
        Command::Resume => {
            // The built-in no-op handler keeps the bare binary useful for
            // smoke tests; real deployments register their own handlers
            // through the library surface.
            agent.register_handler("noop", |_payload| async move { Ok(json!({"ok": true})) });
            agent.run_until_interrupted().await?;
        }
        Command::Stats => {
            let stats = agent.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Inspect { task_id } => match agent.inspect(task_id).await? {
            Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
            None => {
                println!("{}", json!({"error": "not_found"}));
                std::process::exit(1);
            }
        },
    }

    Ok(())
}
