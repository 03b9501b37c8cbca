//! Configuration: TOML file plus `STEWARD_*` environment overrides.
//!
//! Invalid configuration is a startup error; the process exits non-zero
//! before any work begins.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Explicit failure modes for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid override for {var}: {value:?}")]
    InvalidOverride { var: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkConfig {
    /// Hard concurrency ceiling (`configured_max`).
    pub max_concurrent: usize,
    /// Policy-wide retry cap.
    pub retry_attempts: i64,
    /// Base delay for exponential backoff.
    pub retry_delay_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PauseAfterErrorBurst {
    pub threshold: usize,
    pub duration_s: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GovernanceConfig {
    pub cpu_high_pct: f64,
    pub mem_high_pct: f64,
    /// Rolling window, throttle cooldown, and required healthy duration.
    pub window_s: u64,
    pub pause_after_error_burst: PauseAfterErrorBurst,
    pub human_review_after_pause_bursts: usize,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    pub sample_interval_s: u64,
    pub log_interval_s: u64,
    /// Directory for `agent.jsonl` and `metrics.jsonl`.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    pub db_path: PathBuf,
    pub gc_completed_after_days: u64,
    /// Stale-reservation TTL. Defaults to four sample intervals when unset.
    pub heartbeat_ttl_s: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EscalationConfig {
    #[serde(default)]
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub email_to: Option<String>,
}

/// Full engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub bulk: BulkConfig,
    pub governance: GovernanceConfig,
    pub telemetry: TelemetryConfig,
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
}

impl AgentConfig {
    /// Load from a TOML file (default `steward.toml`), apply environment
    /// overrides, and validate. Reads a `.env` file first if one exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let path = path.unwrap_or_else(|| Path::new("steward.toml"));
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: AgentConfig =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        override_parsed("STEWARD_BULK_MAX_CONCURRENT", &mut self.bulk.max_concurrent)?;
        override_parsed("STEWARD_BULK_RETRY_ATTEMPTS", &mut self.bulk.retry_attempts)?;
        override_parsed(
            "STEWARD_BULK_RETRY_DELAY_SECONDS",
            &mut self.bulk.retry_delay_seconds,
        )?;
        override_parsed("STEWARD_GOV_CPU_HIGH_PCT", &mut self.governance.cpu_high_pct)?;
        override_parsed("STEWARD_GOV_MEM_HIGH_PCT", &mut self.governance.mem_high_pct)?;
        override_parsed("STEWARD_GOV_WINDOW_S", &mut self.governance.window_s)?;
        override_parsed(
            "STEWARD_GOV_PAUSE_THRESHOLD",
            &mut self.governance.pause_after_error_burst.threshold,
        )?;
        override_parsed(
            "STEWARD_GOV_PAUSE_DURATION",
            &mut self.governance.pause_after_error_burst.duration_s,
        )?;
        override_parsed(
            "STEWARD_GOV_HUMAN_REVIEW_AFTER",
            &mut self.governance.human_review_after_pause_bursts,
        )?;
        override_parsed(
            "STEWARD_TELEMETRY_SAMPLE_INTERVAL",
            &mut self.telemetry.sample_interval_s,
        )?;
        override_parsed(
            "STEWARD_TELEMETRY_LOG_INTERVAL",
            &mut self.telemetry.log_interval_s,
        )?;
        if let Ok(value) = std::env::var("STEWARD_TELEMETRY_LOG_DIR") {
            self.telemetry.log_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("STEWARD_DB_PATH") {
            self.persistence.db_path = PathBuf::from(value);
        }
        override_parsed(
            "STEWARD_DB_GC_DAYS",
            &mut self.persistence.gc_completed_after_days,
        )?;
        if let Ok(value) = std::env::var("STEWARD_HEARTBEAT_TTL_S") {
            let parsed = value
                .parse()
                .map_err(|_| ConfigError::InvalidOverride {
                    var: "STEWARD_HEARTBEAT_TTL_S".to_string(),
                    value,
                })?;
            self.persistence.heartbeat_ttl_s = Some(parsed);
        }
        if let Ok(value) = std::env::var("STEWARD_ESCALATION_ENABLED") {
            self.escalation.enabled = parse_bool("STEWARD_ESCALATION_ENABLED", &value)?;
        }
        if let Ok(value) = std::env::var("STEWARD_ESCALATION_WEBHOOK") {
            self.escalation.webhook_url = Some(value);
        }
        if let Ok(value) = std::env::var("STEWARD_ESCALATION_EMAIL") {
            self.escalation.email_to = Some(value);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bulk.max_concurrent < 1 {
            return Err(ConfigError::Invalid(
                "bulk.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.bulk.retry_attempts < 1 {
            return Err(ConfigError::Invalid(
                "bulk.retry_attempts must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("governance.cpu_high_pct", self.governance.cpu_high_pct),
            ("governance.mem_high_pct", self.governance.mem_high_pct),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be between 0 and 100"
                )));
            }
        }
        if self.governance.window_s < 1 {
            return Err(ConfigError::Invalid(
                "governance.window_s must be at least 1".to_string(),
            ));
        }
        if self.governance.human_review_after_pause_bursts < 1 {
            return Err(ConfigError::Invalid(
                "governance.human_review_after_pause_bursts must be at least 1".to_string(),
            ));
        }
        if self.telemetry.sample_interval_s < 1 || self.telemetry.log_interval_s < 1 {
            return Err(ConfigError::Invalid(
                "telemetry intervals must be at least 1 second".to_string(),
            ));
        }
        if self.escalation.enabled
            && self.escalation.webhook_url.is_none()
            && self.escalation.email_to.is_none()
        {
            return Err(ConfigError::Invalid(
                "escalation.enabled requires a webhook_url or email_to".to_string(),
            ));
        }
        Ok(())
    }

    /// TTL after which reserved/in-progress tasks are considered abandoned.
    pub fn heartbeat_ttl(&self) -> Duration {
        match self.persistence.heartbeat_ttl_s {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_secs(self.telemetry.sample_interval_s * 4),
        }
    }

    pub fn gc_cutoff(&self) -> Duration {
        Duration::from_secs(self.persistence.gc_completed_after_days * 24 * 60 * 60)
    }

    pub fn agent_log_path(&self) -> PathBuf {
        self.telemetry.log_dir.join("agent.jsonl")
    }

    pub fn metrics_log_path(&self) -> PathBuf {
        self.telemetry.log_dir.join("metrics.jsonl")
    }
}

fn override_parsed<T: std::str::FromStr>(var: &str, target: &mut T) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(var) {
        *target = value.parse().map_err(|_| ConfigError::InvalidOverride {
            var: var.to_string(),
            value,
        })?;
    }
    Ok(())
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidOverride {
            var: var.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[bulk]
max_concurrent = 4
retry_attempts = 3
retry_delay_seconds = 5

[governance]
cpu_high_pct = 85.0
mem_high_pct = 80.0
window_s = 60
human_review_after_pause_bursts = 3

[governance.pause_after_error_burst]
threshold = 5
duration_s = 120

[telemetry]
sample_interval_s = 5
log_interval_s = 60

[persistence]
db_path = "steward.db"
gc_completed_after_days = 7
"#;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steward.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn sample_config_parses_with_defaults() {
        let (_dir, path) = write_config(SAMPLE);
        let config = AgentConfig::load(Some(&path)).unwrap();

        assert_eq!(config.bulk.max_concurrent, 4);
        assert_eq!(config.governance.pause_after_error_burst.threshold, 5);
        assert!(!config.escalation.enabled);
        assert_eq!(config.telemetry.log_dir, PathBuf::from("logs"));
    }

    #[test]
    fn heartbeat_ttl_defaults_to_four_sample_intervals() {
        let (_dir, path) = write_config(SAMPLE);
        let config = AgentConfig::load(Some(&path)).unwrap();
        assert_eq!(config.heartbeat_ttl(), Duration::from_secs(20));
    }

    #[test]
    fn explicit_heartbeat_ttl_wins() {
        let with_ttl = SAMPLE.replace(
            "gc_completed_after_days = 7",
            "gc_completed_after_days = 7\nheartbeat_ttl_s = 90",
        );
        let (_dir, path) = write_config(&with_ttl);
        let config = AgentConfig::load(Some(&path)).unwrap();
        assert_eq!(config.heartbeat_ttl(), Duration::from_secs(90));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = AgentConfig::load(Some(Path::new("/nonexistent/steward.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let bad = SAMPLE.replace("max_concurrent = 4", "max_concurrent = 0");
        let (_dir, path) = write_config(&bad);
        let err = AgentConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let bad = SAMPLE.replace("cpu_high_pct = 85.0", "cpu_high_pct = 185.0");
        let (_dir, path) = write_config(&bad);
        let err = AgentConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn enabled_escalation_needs_a_destination() {
        let bad = format!("{SAMPLE}\n[escalation]\nenabled = true\n");
        let (_dir, path) = write_config(&bad);
        let err = AgentConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert!(parse_bool("X", "yes").unwrap());
        assert!(parse_bool("X", "TRUE").unwrap());
        assert!(!parse_bool("X", "off").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }
}
