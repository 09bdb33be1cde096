use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

use super::quality::QualityScore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatermarkStatus {
    /// Initialized but no run has committed yet
    Pending,
    Committed,
}

impl WatermarkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatermarkStatus::Pending => "PENDING",
            WatermarkStatus::Committed => "COMMITTED",
        }
    }
}

impl std::str::FromStr for WatermarkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(WatermarkStatus::Pending),
            "COMMITTED" => Ok(WatermarkStatus::Committed),
            _ => Err(format!("Unknown watermark status: {}", s)),
        }
    }
}

/// Last fully extracted and validated point of a source
///
/// `version` increases by one on every commit and is the compare-and-set
/// token: a commit only succeeds against the version the caller read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub source_id: String,
    pub last_extracted_at: DateTime<Utc>,
    pub last_commit_at: DateTime<Utc>,
    pub status: WatermarkStatus,
    pub version: i64,
}

impl Watermark {
    pub fn initial(source_id: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.into(),
            last_extracted_at: start,
            last_commit_at: Utc::now(),
            status: WatermarkStatus::Pending,
            version: 0,
        }
    }

    /// The watermark that results from committing `new_extracted_at` on top
    /// of this one
    pub fn advanced(&self, new_extracted_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            source_id: self.source_id.clone(),
            last_extracted_at: new_extracted_at,
            last_commit_at: now,
            status: WatermarkStatus::Committed,
            version: self.version + 1,
        }
    }
}

/// Audit row persisted in the same transaction as a watermark commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAudit {
    pub run_id: String,
    pub source_id: String,
    pub window_from: DateTime<Utc>,
    pub window_to: DateTime<Utc>,
    /// Rows in the cleaned partitions the run rebuilt, after deduplication
    pub rows_processed: u64,
    pub quality: Option<QualityScore>,
    pub committed_at: DateTime<Utc>,
}
