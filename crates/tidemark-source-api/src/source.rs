use async_trait::async_trait;
use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::error::SourceResult;
use crate::types::{
    ChangeQuery,
    Record,
};

/// Source metadata - describes a change-capture source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Source identifier (e.g., "orders")
    pub source_id: String,
    /// Adapter kind (e.g., "sqlite", "memory")
    pub kind: String,
    /// Human readable description
    pub description: Option<String>,
}

impl SourceMetadata {
    pub fn new(source_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            kind: kind.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Queryable store exposing changed rows - every adapter implements this
///
/// Both operations use the same bounds: `since` is exclusive and `until` is
/// inclusive, so a count and a full page walk over the same bounds agree.
#[async_trait]
pub trait Source: Send + Sync {
    /// Get source metadata
    fn metadata(&self) -> &SourceMetadata;

    /// Fetch one page of rows changed inside the query bounds, ordered by
    /// `(event_time, id)` and starting strictly after `query.after`
    async fn fetch_changes(&self, query: &ChangeQuery) -> SourceResult<Vec<Record>>;

    /// Count rows changed after `since` and at or before `until`
    async fn count_changes(&self, since: DateTime<Utc>, until: DateTime<Utc>)
        -> SourceResult<u64>;

    /// Check that the source can be reached
    async fn health_check(&self) -> SourceResult<()> {
        Ok(())
    }

    /// Get the source identifier
    fn source_id(&self) -> &str {
        &self.metadata().source_id
    }
}
