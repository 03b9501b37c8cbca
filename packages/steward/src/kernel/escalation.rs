//! One-shot escalation delivery to an external webhook.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

/// Aggregates over the governance window, embedded in the payload.
#[derive(Debug, Clone, Serialize)]
pub struct WindowStats {
    pub cpu_avg: f64,
    pub mem_avg: f64,
    pub errors: usize,
    pub ops: usize,
}

/// Payload POSTed to the configured webhook when repeated pause events
/// indicate sustained unhealthy operation.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationPayload {
    pub ts: DateTime<Utc>,
    pub reason: String,
    pub current_max_concurrent: usize,
    pub window_stats: WindowStats,
    pub top_error_types: HashMap<String, usize>,
    #[serde(rename = "last_50_log_lines")]
    pub last_log_lines: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_to: Option<String>,
}

/// Webhook client. Delivery is attempted at most once per run; the caller
/// disarms escalation regardless of the outcome to avoid repeat storms.
pub struct EscalationNotifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl EscalationNotifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            webhook_url,
        }
    }

    /// POST the payload to the webhook, if one is configured. Errors are
    /// reported to the caller for logging only; they never re-arm delivery.
    pub async fn deliver(&self, payload: &EscalationPayload) -> Result<()> {
        let Some(url) = &self.webhook_url else {
            info!("escalation raised without a webhook configured; logged only");
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .context("escalation webhook request failed")?;

        if !response.status().is_success() {
            error!(status = %response.status(), "escalation webhook rejected payload");
            anyhow::bail!("escalation webhook returned {}", response.status());
        }

        info!("escalation delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serializes_with_renamed_log_lines() {
        let payload = EscalationPayload {
            ts: Utc::now(),
            reason: "repeated_pause".to_string(),
            current_max_concurrent: 2,
            window_stats: WindowStats {
                cpu_avg: 91.0,
                mem_avg: 40.0,
                errors: 12,
                ops: 20,
            },
            top_error_types: HashMap::from([("scrape".to_string(), 12)]),
            last_log_lines: vec!["{}".to_string()],
            email_to: None,
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["reason"], "repeated_pause");
        assert!(json["last_50_log_lines"].is_array());
        assert!(json.get("email_to").is_none());
        assert_eq!(json["window_stats"]["errors"], 12);
    }

    #[tokio::test]
    async fn delivery_without_webhook_is_a_noop() {
        let notifier = EscalationNotifier::new(None);
        let payload = EscalationPayload {
            ts: Utc::now(),
            reason: "repeated_pause".to_string(),
            current_max_concurrent: 1,
            window_stats: WindowStats {
                cpu_avg: 0.0,
                mem_avg: 0.0,
                errors: 0,
                ops: 0,
            },
            top_error_types: HashMap::new(),
            last_log_lines: Vec::new(),
            email_to: None,
        };
        assert!(notifier.deliver(&payload).await.is_ok());
    }
}
