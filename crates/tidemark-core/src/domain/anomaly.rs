use chrono::{
    DateTime,
    NaiveDate,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Volume,
    Distribution,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::Volume => "volume",
            AnomalyKind::Distribution => "distribution",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AnomalySeverity {
    Medium,
    High,
}

impl AnomalySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalySeverity::Medium => "MEDIUM",
            AnomalySeverity::High => "HIGH",
        }
    }
}

impl std::str::FromStr for AnomalySeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MEDIUM" => Ok(AnomalySeverity::Medium),
            "HIGH" => Ok(AnomalySeverity::High),
            _ => Err(format!("Unknown anomaly severity: {}", s)),
        }
    }
}

/// Immutable record of a detected anomaly
///
/// For volume anomalies the baseline is the trailing daily row counts; for
/// distribution anomalies it is the previous day's metric sample and
/// `distance` holds the two-sample KS statistic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub source_id: String,
    pub date: NaiveDate,
    pub kind: AnomalyKind,
    pub metric_name: String,
    pub observed_value: f64,
    pub baseline_mean: f64,
    pub baseline_stddev: f64,
    pub z_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    pub severity: AnomalySeverity,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalySettings {
    /// Number of prior daily aggregates in the baseline
    #[serde(default = "default_baseline_days")]
    pub baseline_days: usize,
    /// Volume detection is skipped with fewer baseline days than this
    #[serde(default = "default_min_baseline_days")]
    pub min_baseline_days: usize,
    #[serde(default = "default_z_threshold")]
    pub z_threshold: f64,
    #[serde(default = "default_z_high_threshold")]
    pub z_high_threshold: f64,
    /// Minimum acceptable similarity (`1 - KS statistic`)
    #[serde(default = "default_similarity_floor")]
    pub similarity_floor: f64,
    /// KS statistic at or above which a distribution anomaly is HIGH
    #[serde(default = "default_distance_high_threshold")]
    pub distance_high_threshold: f64,
    /// Metrics compared day over day; empty means every numeric metric
    #[serde(default)]
    pub metrics: Vec<String>,
}

pub(crate) const DEFAULT_BASELINE_DAYS: usize = 30;

fn default_baseline_days() -> usize {
    DEFAULT_BASELINE_DAYS
}

fn default_min_baseline_days() -> usize {
    7
}

fn default_z_threshold() -> f64 {
    2.0
}

fn default_z_high_threshold() -> f64 {
    3.0
}

fn default_similarity_floor() -> f64 {
    0.8
}

fn default_distance_high_threshold() -> f64 {
    0.5
}

impl Default for AnomalySettings {
    fn default() -> Self {
        Self {
            baseline_days: default_baseline_days(),
            min_baseline_days: default_min_baseline_days(),
            z_threshold: default_z_threshold(),
            z_high_threshold: default_z_high_threshold(),
            similarity_floor: default_similarity_floor(),
            distance_high_threshold: default_distance_high_threshold(),
            metrics: Vec::new(),
        }
    }
}

/// Per-source overrides; unset fields inherit the global settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyOverrides {
    pub baseline_days: Option<usize>,
    pub z_threshold: Option<f64>,
    pub z_high_threshold: Option<f64>,
    pub similarity_floor: Option<f64>,
    pub metrics: Option<Vec<String>>,
}

impl AnomalySettings {
    pub fn merged(&self, overrides: &AnomalyOverrides) -> Self {
        Self {
            baseline_days: overrides.baseline_days.unwrap_or(self.baseline_days),
            z_threshold: overrides.z_threshold.unwrap_or(self.z_threshold),
            z_high_threshold: overrides.z_high_threshold.unwrap_or(self.z_high_threshold),
            similarity_floor: overrides.similarity_floor.unwrap_or(self.similarity_floor),
            metrics: overrides
                .metrics
                .clone()
                .unwrap_or_else(|| self.metrics.clone()),
            ..self.clone()
        }
    }
}
