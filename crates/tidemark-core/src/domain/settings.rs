use std::time::Duration;

use serde::{
    Deserialize,
    Serialize,
};
use tidemark_source_api::RetryPolicy;

use super::anomaly::AnomalySettings;
use super::schema::RecordSchema;
use super::validation::ValidationThresholds;

/// Extraction and orchestration knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Width of an extraction window
    #[serde(default = "default_window_minutes")]
    pub window_minutes: i64,
    /// Rows fetched per source page
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Concurrent window extractions/writes
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Distance kept from "now" to avoid reading in-flight transactions
    #[serde(default = "default_safety_lag_secs")]
    pub safety_lag_secs: i64,
    #[serde(default = "default_window_timeout_secs")]
    pub window_timeout_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_retry")]
    pub retry: RetryPolicy,
}

pub(crate) const DEFAULT_MAX_WORKERS: usize = 4;

fn default_window_minutes() -> i64 {
    60
}

fn default_batch_size() -> usize {
    5_000
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

fn default_safety_lag_secs() -> i64 {
    300
}

fn default_window_timeout_secs() -> u64 {
    60
}

fn default_write_timeout_secs() -> u64 {
    60
}

fn default_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(30),
        exponential_backoff: true,
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            window_minutes: default_window_minutes(),
            batch_size: default_batch_size(),
            max_workers: default_max_workers(),
            safety_lag_secs: default_safety_lag_secs(),
            window_timeout_secs: default_window_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            retry: default_retry(),
        }
    }
}

impl PipelineSettings {
    pub fn window_width(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.window_minutes.max(1))
    }

    pub fn safety_lag(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.safety_lag_secs.max(0))
    }

    pub fn window_timeout(&self) -> Duration {
        Duration::from_secs(self.window_timeout_secs.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs.max(1))
    }
}

/// Effective per-source settings: global thresholds merged with the
/// source's overrides
#[derive(Debug, Clone, PartialEq)]
pub struct SourceProfile {
    pub source_id: String,
    pub schema: RecordSchema,
    pub thresholds: ValidationThresholds,
    pub anomaly: AnomalySettings,
}

impl SourceProfile {
    pub fn new(source_id: impl Into<String>, schema: RecordSchema) -> Self {
        Self {
            source_id: source_id.into(),
            schema,
            thresholds: ValidationThresholds::default(),
            anomaly: AnomalySettings::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: ValidationThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_anomaly(mut self, anomaly: AnomalySettings) -> Self {
        self.anomaly = anomaly;
        self
    }
}
