use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

/// Per-run quality score; every component is in `[0, 100]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub completeness: f64,
    pub accuracy: f64,
    pub consistency: f64,
    pub overall: f64,
    /// Number of failed WARNING rules that were penalized
    pub warning_count: u32,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityWeights {
    #[serde(default = "default_completeness_weight")]
    pub completeness: f64,
    #[serde(default = "default_accuracy_weight")]
    pub accuracy: f64,
    #[serde(default = "default_consistency_weight")]
    pub consistency: f64,
    /// Points deducted from the overall score per failed WARNING rule
    #[serde(default = "default_warning_penalty")]
    pub warning_penalty: f64,
}

fn default_completeness_weight() -> f64 {
    0.4
}

fn default_accuracy_weight() -> f64 {
    0.35
}

fn default_consistency_weight() -> f64 {
    0.25
}

fn default_warning_penalty() -> f64 {
    5.0
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            completeness: default_completeness_weight(),
            accuracy: default_accuracy_weight(),
            consistency: default_consistency_weight(),
            warning_penalty: default_warning_penalty(),
        }
    }
}

impl QualityWeights {
    pub fn total(&self) -> f64 {
        self.completeness + self.accuracy + self.consistency
    }
}
