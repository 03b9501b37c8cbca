//! Closed-loop governance controller.
//!
//! Samples CPU/memory and task outcomes on a fixed cadence, persists every
//! sample, and applies the policy rules in order (first match wins):
//!
//! 1. **Pause** — error burst at or above the threshold pauses reservations.
//! 2. **Throttle** — sustained resource pressure decrements `effective_max`
//!    (floor 1), then cools down for one window.
//! 3. **Recover** — a full window of health increments `effective_max`
//!    (ceiling `configured_max`) and lifts an expired pause.
//!
//! Repeated pause events within a rolling 30-minute window escalate to the
//! configured webhook, once per run.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::kernel::escalation::{EscalationNotifier, EscalationPayload, WindowStats};
use crate::kernel::event_log::{EventLog, MetricsEvent};
use crate::kernel::tasks::counter::OperationsCounter;
use crate::kernel::tasks::executor::ExecutorControls;
use crate::kernel::tasks::store::TaskStore;
use crate::kernel::telemetry::{ResourceSample, SystemSampler};

/// Pause events older than this no longer count toward escalation.
const PAUSE_EVENT_WINDOW: Duration = Duration::from_secs(30 * 60);

/// Governance thresholds and cadences, resolved from configuration.
#[derive(Debug, Clone)]
pub struct GovernorSettings {
    pub cpu_high_pct: f64,
    pub mem_high_pct: f64,
    /// Rolling window for averages; also the throttle cooldown and the
    /// healthy duration required before recovery.
    pub window: Duration,
    pub pause_error_threshold: usize,
    pub pause_duration: Duration,
    pub human_review_after_pause_bursts: usize,
    pub sample_interval: Duration,
    pub log_interval: Duration,
    pub escalation_enabled: bool,
    pub escalation_email_to: Option<String>,
}

/// One governance observation.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub at: Instant,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub errors: usize,
    pub ops: usize,
}

/// Continuously observes system health and adjusts executor state.
pub struct GovernanceController {
    settings: GovernorSettings,
    store: TaskStore,
    controls: Arc<ExecutorControls>,
    counter: Arc<OperationsCounter>,
    metrics_log: Arc<EventLog>,
    notifier: EscalationNotifier,
    sampler: SystemSampler,

    samples: VecDeque<Sample>,
    pause_events: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
    healthy_since: Option<Instant>,
    last_summary: Option<Instant>,
    /// Per-run escalation arm; never written back to configuration.
    escalation_armed: bool,
}

impl GovernanceController {
    pub fn new(
        settings: GovernorSettings,
        store: TaskStore,
        controls: Arc<ExecutorControls>,
        counter: Arc<OperationsCounter>,
        metrics_log: Arc<EventLog>,
        notifier: EscalationNotifier,
    ) -> Self {
        let escalation_armed = settings.escalation_enabled;
        Self {
            settings,
            store,
            controls,
            counter,
            metrics_log,
            notifier,
            sampler: SystemSampler::new(),
            samples: VecDeque::new(),
            pause_events: VecDeque::new(),
            cooldown_until: None,
            healthy_since: None,
            last_summary: None,
            escalation_armed,
        }
    }

    /// Sample on the configured cadence until shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            sample_interval_s = self.settings.sample_interval.as_secs(),
            window_s = self.settings.window.as_secs(),
            "governance controller starting"
        );

        let mut ticker = tokio::time::interval(self.settings.sample_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.sample_once().await,
            }
        }

        info!("governance controller stopped");
        Ok(())
    }

    /// One full cycle: sample, persist, log, evaluate, summarize.
    async fn sample_once(&mut self) {
        let resource = self.sampler.sample();
        let (ops, errors) = self.counter.snapshot(self.settings.window);

        // A telemetry persistence failure skips the row, never the loop.
        if let Err(e) = self
            .store
            .insert_metrics(
                Utc::now(),
                resource.cpu_pct,
                resource.mem_pct,
                errors as i64,
                ops as i64,
            )
            .await
        {
            warn!(error = %e, "failed to persist metrics sample");
        }

        self.ingest_sample(resource, ops, errors).await;
    }

    /// Record one observation and apply the governance rules. Split from
    /// the sampling loop so health scenarios can be driven directly.
    pub async fn ingest_sample(&mut self, resource: ResourceSample, ops: usize, errors: usize) {
        let now = Instant::now();
        let sample = Sample {
            at: now,
            cpu_pct: resource.cpu_pct,
            mem_pct: resource.mem_pct,
            errors,
            ops,
        };
        self.samples.push_back(sample);
        self.trim(now);

        self.metrics_log.append(&MetricsEvent::MetricsSample {
            cpu_pct: resource.cpu_pct,
            mem_pct: resource.mem_pct,
            errors,
            operations: ops,
        });

        self.evaluate(sample).await;

        let summary_due = self
            .last_summary
            .map_or(true, |at| now.duration_since(at) >= self.settings.log_interval);
        if summary_due {
            self.log_summary();
            self.last_summary = Some(now);
        }
    }

    fn trim(&mut self, now: Instant) {
        while let Some(front) = self.samples.front() {
            if now.duration_since(front.at) > self.settings.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while let Some(front) = self.pause_events.front() {
            if now.duration_since(*front) > PAUSE_EVENT_WINDOW {
                self.pause_events.pop_front();
            } else {
                break;
            }
        }
    }

    fn cpu_avg(&self) -> f64 {
        let len = self.samples.len().max(1) as f64;
        self.samples.iter().map(|s| s.cpu_pct).sum::<f64>() / len
    }

    fn mem_avg(&self) -> f64 {
        let len = self.samples.len().max(1) as f64;
        self.samples.iter().map(|s| s.mem_pct).sum::<f64>() / len
    }

    async fn evaluate(&mut self, sample: Sample) {
        let now = sample.at;

        if sample.errors >= self.settings.pause_error_threshold {
            self.trigger_pause(now);
        } else if self.cpu_avg() >= self.settings.cpu_high_pct
            || self.mem_avg() >= self.settings.mem_high_pct
        {
            self.trigger_throttle(now);
        } else {
            self.attempt_recover(now);
        }

        if self.escalation_armed
            && self.pause_events.len() >= self.settings.human_review_after_pause_bursts
        {
            self.escalate().await;
        }
    }

    fn trigger_pause(&mut self, now: Instant) {
        if self.controls.is_paused() {
            return;
        }
        self.controls.pause_for(self.settings.pause_duration);
        self.pause_events.push_back(now);
        self.healthy_since = None;
        self.metrics_log.append(&MetricsEvent::Pause {
            duration_s: self.settings.pause_duration.as_secs(),
            reason: "error_burst".to_string(),
        });
        warn!(
            duration_s = self.settings.pause_duration.as_secs(),
            "governance pause: error burst"
        );
    }

    fn trigger_throttle(&mut self, now: Instant) {
        self.healthy_since = None;
        if matches!(self.cooldown_until, Some(until) if now < until) {
            return;
        }
        let effective = self
            .controls
            .set_effective_max(self.controls.effective_max().saturating_sub(1));
        self.cooldown_until = Some(now + self.settings.window);
        self.metrics_log.append(&MetricsEvent::Throttle {
            reason: "resource_pressure".to_string(),
            effective_max: effective,
        });
        warn!(effective_max = effective, "governance throttle: resource pressure");
    }

    fn attempt_recover(&mut self, now: Instant) {
        let healthy = self.cpu_avg() < self.settings.cpu_high_pct
            && self.mem_avg() < self.settings.mem_high_pct
            && !self.controls.is_paused();
        if !healthy {
            self.healthy_since = None;
            return;
        }

        let Some(healthy_since) = self.healthy_since else {
            self.healthy_since = Some(now);
            return;
        };
        if now.duration_since(healthy_since) < self.settings.window {
            return;
        }

        if self.controls.effective_max() < self.controls.configured_max() {
            let effective = self
                .controls
                .set_effective_max(self.controls.effective_max() + 1);
            self.metrics_log
                .append(&MetricsEvent::Recover { effective_max: effective });
            info!(effective_max = effective, "governance recover");
        }
        if self.controls.pause_pending() && !self.controls.is_paused() {
            self.controls.resume();
            self.metrics_log.append(&MetricsEvent::Resume);
            info!("governance resume");
        }
    }

    fn log_summary(&self) {
        if self.samples.is_empty() {
            return;
        }
        self.metrics_log.append(&MetricsEvent::GovernanceSummary {
            cpu_avg: self.cpu_avg(),
            mem_avg: self.mem_avg(),
            active_samples: self.samples.len(),
            effective_max: self.controls.effective_max(),
            pause_events: self.pause_events.len(),
            errors_window: self.samples.iter().map(|s| s.errors).sum(),
        });
    }

    /// Fire the escalation webhook and disarm for the rest of the run, no
    /// matter how delivery goes.
    async fn escalate(&mut self) {
        self.escalation_armed = false;

        let payload = EscalationPayload {
            ts: Utc::now(),
            reason: "repeated_pause".to_string(),
            current_max_concurrent: self.controls.effective_max(),
            window_stats: WindowStats {
                cpu_avg: self.cpu_avg(),
                mem_avg: self.mem_avg(),
                errors: self.samples.iter().map(|s| s.errors).sum(),
                ops: self.samples.iter().map(|s| s.ops).sum(),
            },
            top_error_types: self.counter.failing_types(),
            last_log_lines: self.metrics_log.tail(50),
            email_to: self.settings.escalation_email_to.clone(),
        };

        self.metrics_log.append(&MetricsEvent::Escalate {
            reason: payload.reason.clone(),
        });
        error!(
            pause_events = self.pause_events.len(),
            "governance escalation: repeated pause events, requesting human review"
        );

        if let Err(e) = self.notifier.deliver(&payload).await {
            error!(error = %e, "escalation delivery failed; escalation stays disabled for this run");
        }
    }

    /// Number of pause events inside the rolling escalation window.
    pub fn pause_event_count(&self) -> usize {
        self.pause_events.len()
    }
}
