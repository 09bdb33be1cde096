use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

use super::anomaly::AnomalyRecord;
use super::quality::QualityScore;
use super::validation::{
    ValidationReport,
    ValidationResult,
};
use super::watermark::Watermark;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    /// Nothing new to extract; the watermark is unchanged
    UpToDate,
    Blocked,
    Conflict,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::UpToDate => "up_to_date",
            RunStatus::Blocked => "blocked",
            RunStatus::Conflict => "conflict",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::UpToDate)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured outcome of one run, produced whatever the outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub source_id: String,
    pub status: RunStatus,
    pub window_from: Option<DateTime<Utc>>,
    pub window_to: Option<DateTime<Utc>>,
    pub windows: usize,
    pub rows_extracted: u64,
    pub rows_processed: u64,
    pub duplicates_removed: u64,
    pub gates: Vec<ValidationReport>,
    pub blocking_results: Vec<ValidationResult>,
    pub quality_score: Option<QualityScore>,
    pub anomalies: Vec<AnomalyRecord>,
    pub watermark_before: Option<Watermark>,
    pub watermark_after: Option<Watermark>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn new(run_id: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            source_id: source_id.into(),
            status: RunStatus::Failed,
            window_from: None,
            window_to: None,
            windows: 0,
            rows_extracted: 0,
            rows_processed: 0,
            duplicates_removed: 0,
            gates: Vec::new(),
            blocking_results: Vec::new(),
            quality_score: None,
            anomalies: Vec::new(),
            watermark_before: None,
            watermark_after: None,
            error: None,
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    /// Process exit status for the operational surface
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Succeeded | RunStatus::UpToDate => 0,
            RunStatus::Blocked => 2,
            RunStatus::Conflict => 3,
            RunStatus::Failed | RunStatus::Cancelled => 1,
        }
    }

    pub fn watermark_advanced(&self) -> bool {
        match (&self.watermark_before, &self.watermark_after) {
            (Some(before), Some(after)) => after.version > before.version,
            _ => false,
        }
    }
}
