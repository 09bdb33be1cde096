use std::sync::atomic::{
    AtomicI64,
    AtomicU32,
    AtomicU64,
    Ordering,
};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{
    DateTime,
    Utc,
};
use tidemark_source_api::{
    ChangeQuery,
    Record,
    Source,
    SourceError,
    SourceMetadata,
    SourceResult,
};
use tokio::sync::RwLock;

/// Deterministic in-memory table of changed rows
///
/// Supports injecting transient outages, slow pages and a skewed count
/// query, which is how count-tolerance, timeout and retry behavior are
/// exercised.
pub struct MemorySource {
    metadata: SourceMetadata,
    records: RwLock<Vec<Record>>,
    failing_calls: AtomicU32,
    count_offset: AtomicI64,
    slow_fetches: AtomicU32,
    latency_ms: AtomicU64,
    fetch_calls: AtomicU32,
}

impl MemorySource {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            metadata: SourceMetadata::new(source_id, "memory")
                .with_description("In-memory change table"),
            records: RwLock::new(Vec::new()),
            failing_calls: AtomicU32::new(0),
            count_offset: AtomicI64::new(0),
            slow_fetches: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            fetch_calls: AtomicU32::new(0),
        }
    }

    pub fn with_records(self, records: Vec<Record>) -> Self {
        Self {
            records: RwLock::new(records),
            ..self
        }
    }

    pub async fn insert(&self, records: impl IntoIterator<Item = Record>) {
        self.records.write().await.extend(records);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Makes the next `count` source calls fail as unreachable
    pub fn fail_next_calls(&self, count: u32) {
        self.failing_calls.store(count, Ordering::SeqCst);
    }

    /// Adds `offset` to every count query result
    pub fn set_count_offset(&self, offset: i64) {
        self.count_offset.store(offset, Ordering::SeqCst);
    }

    /// Delays the next `count` page fetches by `latency`
    pub fn slow_next_fetches(&self, count: u32, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
        self.slow_fetches.store(count, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> SourceResult<()> {
        let remaining = self.failing_calls.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_calls.store(remaining - 1, Ordering::SeqCst);
            return Err(SourceError::Unreachable(format!(
                "source {} is not reachable",
                self.metadata.source_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Source for MemorySource {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    async fn fetch_changes(&self, query: &ChangeQuery) -> SourceResult<Vec<Record>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let slow = self
            .slow_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if slow {
            let latency = Duration::from_millis(self.latency_ms.load(Ordering::SeqCst));
            tokio::time::sleep(latency).await;
        }

        let records = self.records.read().await;
        let mut matching: Vec<Record> = records
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        matching.sort_by_key(Record::cursor);
        matching.truncate(query.limit);

        Ok(matching)
    }

    async fn count_changes(
        &self, since: DateTime<Utc>, until: DateTime<Utc>,
    ) -> SourceResult<u64> {
        self.check_available()?;

        let count = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.event_time > since && r.event_time <= until)
            .count() as i64;

        Ok((count + self.count_offset.load(Ordering::SeqCst)).max(0) as u64)
    }
}
