use async_trait::async_trait;
use chrono::{
    DateTime,
    Utc,
};
use dashmap::DashMap;

use crate::domain::{
    DomainError,
    DomainResult,
    RunAudit,
    Watermark,
};

/// Durable "last fully extracted point" per source
///
/// `commit` is a compare-and-set on the watermark's version: it succeeds only
/// while the stored watermark is still the one the caller read.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Creates a PENDING watermark at `start`; returns the existing one if
    /// the source was already initialized
    async fn initialize(&self, source_id: &str, start: DateTime<Utc>) -> DomainResult<Watermark>;

    async fn get(&self, source_id: &str) -> DomainResult<Watermark>;

    async fn commit(
        &self, expected: &Watermark, new_extracted_at: DateTime<Utc>, audit: &RunAudit,
    ) -> DomainResult<Watermark>;

    /// Most recent audited commits first
    async fn history(&self, source_id: &str, limit: usize) -> DomainResult<Vec<RunAudit>>;
}

pub(crate) fn ensure_forward(
    current: &Watermark, new_extracted_at: DateTime<Utc>,
) -> DomainResult<()> {
    if new_extracted_at < current.last_extracted_at {
        return Err(DomainError::InternalError(format!(
            "Refusing to move watermark for {} backwards from {} to {}",
            current.source_id,
            current.last_extracted_at.to_rfc3339(),
            new_extracted_at.to_rfc3339()
        )));
    }
    Ok(())
}

#[derive(Default)]
pub struct MemoryWatermarkStore {
    watermarks: DashMap<String, Watermark>,
    audits: DashMap<String, Vec<RunAudit>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn initialize(&self, source_id: &str, start: DateTime<Utc>) -> DomainResult<Watermark> {
        let entry = self
            .watermarks
            .entry(source_id.to_string())
            .or_insert_with(|| Watermark::initial(source_id, start));
        Ok(entry.value().clone())
    }

    async fn get(&self, source_id: &str) -> DomainResult<Watermark> {
        self.watermarks
            .get(source_id)
            .map(|w| w.value().clone())
            .ok_or_else(|| DomainError::WatermarkNotFound(source_id.to_string()))
    }

    async fn commit(
        &self, expected: &Watermark, new_extracted_at: DateTime<Utc>, audit: &RunAudit,
    ) -> DomainResult<Watermark> {
        let next = {
            // Shard lock held across compare and set
            let mut stored = self
                .watermarks
                .get_mut(&expected.source_id)
                .ok_or_else(|| DomainError::WatermarkNotFound(expected.source_id.clone()))?;

            if stored.version != expected.version {
                return Err(DomainError::WatermarkConflict {
                    source_id: expected.source_id.clone(),
                    expected: expected.version,
                    found: stored.version,
                });
            }
            ensure_forward(&stored, new_extracted_at)?;

            let next = stored.advanced(new_extracted_at, audit.committed_at);
            *stored = next.clone();
            next
        };

        self.audits
            .entry(expected.source_id.clone())
            .or_default()
            .push(audit.clone());

        Ok(next)
    }

    async fn history(&self, source_id: &str, limit: usize) -> DomainResult<Vec<RunAudit>> {
        Ok(self
            .audits
            .get(source_id)
            .map(|audits| audits.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::domain::WatermarkStatus;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn audit(run_id: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> RunAudit {
        RunAudit {
            run_id: run_id.to_string(),
            source_id: "orders".to_string(),
            window_from: from,
            window_to: to,
            rows_processed: 10,
            quality: None,
            committed_at: to,
        }
    }

    #[tokio::test]
    async fn test_get_uninitialized_is_not_found() {
        let store = MemoryWatermarkStore::new();
        assert!(matches!(
            store.get("orders").await,
            Err(DomainError::WatermarkNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let store = MemoryWatermarkStore::new();
        let first = store.initialize("orders", ts(0)).await.unwrap();
        let second = store.initialize("orders", ts(5)).await.unwrap();

        assert_eq!(first.last_extracted_at, ts(0));
        assert_eq!(second.last_extracted_at, ts(0));
        assert_eq!(second.status, WatermarkStatus::Pending);
    }

    #[tokio::test]
    async fn test_commit_compare_and_set() {
        let store = MemoryWatermarkStore::new();
        let read_a = store.initialize("orders", ts(0)).await.unwrap();
        let read_b = store.get("orders").await.unwrap();

        let committed = store
            .commit(&read_a, ts(1), &audit("a", ts(0), ts(1)))
            .await
            .unwrap();
        assert_eq!(committed.version, 1);
        assert_eq!(committed.status, WatermarkStatus::Committed);

        let err = store
            .commit(&read_b, ts(2), &audit("b", ts(0), ts(2)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DomainError::WatermarkConflict {
                expected: 0,
                found: 1,
                ..
            }
        ));

        let current = store.get("orders").await.unwrap();
        assert_eq!(current.last_extracted_at, ts(1));
        assert_eq!(store.history("orders", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_rejects_backwards_move() {
        let store = MemoryWatermarkStore::new();
        let current = store.initialize("orders", ts(5)).await.unwrap();

        assert!(store
            .commit(&current, ts(4), &audit("a", ts(5), ts(4)))
            .await
            .is_err());
    }
}
