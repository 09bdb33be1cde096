use thiserror::Error;
use tidemark_source_api::SourceError;

use super::validation::Tier;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Validation blocked at {tier} tier by rule(s): {}", .rules.join(", "))]
    ValidationBlocked { tier: Tier, rules: Vec<String> },

    #[error(
        "Watermark conflict for source {source_id}: expected version {expected}, found {found}"
    )]
    WatermarkConflict {
        source_id: String,
        expected: i64,
        found: i64,
    },

    #[error("Watermark not found: {0}")]
    WatermarkNotFound(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl DomainError {
    /// Failures worth retrying locally before escalating to the run
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DomainError::WriteFailed(_) | DomainError::StorageError(_) | DomainError::Timeout(_)
        )
    }

    /// Short machine-readable name used in run summaries and notifications
    pub fn kind(&self) -> &'static str {
        match self {
            DomainError::ExtractionFailed(_) => "extraction_failed",
            DomainError::ValidationBlocked { .. } => "validation_blocked",
            DomainError::WatermarkConflict { .. } => "watermark_conflict",
            DomainError::WatermarkNotFound(_) => "watermark_not_found",
            DomainError::WriteFailed(_) => "write_failed",
            DomainError::SourceNotFound(_) => "source_not_found",
            DomainError::InvalidConfig(_) => "invalid_config",
            DomainError::DatabaseError(_) => "database_error",
            DomainError::StorageError(_) => "storage_error",
            DomainError::Serialization(_) => "serialization",
            DomainError::Timeout(_) => "timeout",
            DomainError::Cancelled(_) => "cancelled",
            DomainError::InternalError(_) => "internal_error",
        }
    }
}

impl From<SourceError> for DomainError {
    fn from(err: SourceError) -> Self {
        DomainError::ExtractionFailed(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}

pub type DomainResult<T> = Result<T, DomainError>;
