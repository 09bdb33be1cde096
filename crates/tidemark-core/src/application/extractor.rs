use std::sync::Arc;
use std::time::Duration;

use chrono::{
    DateTime,
    Utc,
};
use tidemark_source_api::{
    ChangeQuery,
    Record,
    RetryPolicy,
    Source,
    SourceError,
    SourceResult,
};
use tokio::time::timeout;

use crate::domain::{
    Batch,
    DomainError,
    DomainResult,
    PipelineSettings,
    TimeWindow,
    WindowPlan,
};

/// Pulls changed rows from a source one window at a time
///
/// A window is the unit of retry: a failed or timed-out window is re-read in
/// full, leaving windows that already succeeded untouched.
pub struct ChangeExtractor {
    source: Arc<dyn Source>,
    window_width: chrono::Duration,
    batch_size: usize,
    window_timeout: Duration,
    retry: RetryPolicy,
}

impl ChangeExtractor {
    pub fn new(source: Arc<dyn Source>, settings: &PipelineSettings) -> Self {
        Self {
            source,
            window_width: settings.window_width(),
            batch_size: settings.batch_size.max(1),
            window_timeout: settings.window_timeout(),
            retry: settings.retry.clone(),
        }
    }

    pub fn source_id(&self) -> &str {
        self.source.source_id()
    }

    /// Windows covering `(from, to]`
    pub fn plan(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> WindowPlan {
        WindowPlan::new(from, to, self.window_width)
    }

    /// Extracts one window, retrying transient failures and timeouts
    pub async fn extract_window(&self, window: TimeWindow) -> DomainResult<Batch> {
        let attempt = move || async move {
            match timeout(self.window_timeout, self.read_window(window)).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout(format!(
                    "window {} exceeded {:?}",
                    window, self.window_timeout
                ))),
            }
        };

        self.retry
            .retry_if(attempt, |e: &SourceError| {
                let transient = e.is_transient();
                if transient {
                    tracing::warn!(
                        source_id = %self.source_id(),
                        window = %window,
                        error = %e,
                        "Window extraction failed, retrying"
                    );
                }
                transient
            })
            .await
            .map_err(|e| {
                DomainError::ExtractionFailed(format!(
                    "{} window {}: {}",
                    self.source_id(),
                    window,
                    e
                ))
            })
    }

    /// Extracts every window of `(from, to]` sequentially
    pub async fn extract_all(
        &self, from: DateTime<Utc>, to: DateTime<Utc>,
    ) -> DomainResult<Vec<Batch>> {
        let mut batches = Vec::new();
        for window in self.plan(from, to) {
            batches.push(self.extract_window(window).await?);
        }
        Ok(batches)
    }

    async fn read_window(&self, window: TimeWindow) -> SourceResult<Batch> {
        let expected_count = self.source.count_changes(window.start, window.end).await?;

        let mut rows: Vec<Record> = Vec::new();
        let mut query = ChangeQuery::new(window.start, window.end, self.batch_size);
        loop {
            let page = self.source.fetch_changes(&query).await?;
            let page_len = page.len();
            let next_cursor = page.last().map(Record::cursor);
            rows.extend(page);

            match next_cursor {
                Some(cursor) if page_len >= self.batch_size => {
                    if query.after.as_ref() == Some(&cursor) {
                        return Err(SourceError::QueryFailed(format!(
                            "source {} returned the same page twice",
                            self.source_id()
                        )));
                    }
                    query.after = Some(cursor);
                }
                _ => break,
            }
        }

        for row in &mut rows {
            row.extracted_at = Some(window.end);
        }
        rows.sort_by(|a, b| (a.event_time, &a.id).cmp(&(b.event_time, &b.id)));

        tracing::debug!(
            source_id = %self.source_id(),
            window = %window,
            rows = rows.len(),
            expected = expected_count,
            "Extracted window"
        );

        Ok(Batch {
            source_id: self.source_id().to_string(),
            window_start: window.start,
            window_end: window.end,
            rows,
            extracted_at: window.end,
            expected_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::infrastructure::MemorySource;

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, 0).unwrap()
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            batch_size: 7,
            retry: RetryPolicy::new(3, Duration::from_millis(1), true),
            ..Default::default()
        }
    }

    fn source_with_rows(count: u32) -> Arc<MemorySource> {
        let records = (0..count)
            .map(|i| {
                Record::new(
                    format!("r{:03}", i),
                    ts(0, 0) + chrono::Duration::minutes(i as i64 + 1),
                )
            })
            .collect();
        Arc::new(MemorySource::new("orders").with_records(records))
    }

    #[tokio::test]
    async fn test_extract_pages_through_window() {
        let source = source_with_rows(50);
        let extractor = ChangeExtractor::new(source.clone(), &settings());

        let batch = extractor
            .extract_window(TimeWindow::new(ts(0, 0), ts(1, 0)))
            .await
            .unwrap();

        assert_eq!(batch.row_count(), 50);
        assert_eq!(batch.expected_count, 50);
        assert_eq!(batch.extracted_at, ts(1, 0));
        assert!(batch.rows.iter().all(|r| r.extracted_at == Some(ts(1, 0))));
        assert!(source.fetch_calls() >= 8);
    }

    #[tokio::test]
    async fn test_windows_do_not_overlap() {
        let source = source_with_rows(120);
        let extractor = ChangeExtractor::new(source, &settings());

        let batches = extractor.extract_all(ts(0, 0), ts(2, 0)).await.unwrap();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].row_count(), 60);
        assert_eq!(batches[1].row_count(), 60);
        assert_eq!(batches[0].rows.last().unwrap().event_time, ts(1, 0));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let source = source_with_rows(10);
        source.fail_next_calls(2);
        let extractor = ChangeExtractor::new(source, &settings());

        let batch = extractor
            .extract_window(TimeWindow::new(ts(0, 0), ts(1, 0)))
            .await
            .unwrap();

        assert_eq!(batch.row_count(), 10);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_as_extraction_failed() {
        let source = source_with_rows(10);
        source.fail_next_calls(10);
        let extractor = ChangeExtractor::new(source, &settings());

        let err = extractor
            .extract_window(TimeWindow::new(ts(0, 0), ts(1, 0)))
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::ExtractionFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_window_is_retried_after_timeout() {
        let source = source_with_rows(10);
        source.slow_next_fetches(2, Duration::from_secs(30));
        let settings = PipelineSettings {
            window_timeout_secs: 1,
            ..settings()
        };
        let extractor = ChangeExtractor::new(source.clone(), &settings);

        let batch = extractor
            .extract_window(TimeWindow::new(ts(0, 0), ts(1, 0)))
            .await
            .unwrap();

        assert_eq!(batch.row_count(), 10);
        assert_eq!(source.fetch_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_that_keeps_timing_out_fails() {
        let source = source_with_rows(10);
        source.slow_next_fetches(u32::MAX, Duration::from_secs(30));
        let settings = PipelineSettings {
            window_timeout_secs: 1,
            ..settings()
        };
        let extractor = ChangeExtractor::new(source.clone(), &settings);

        let err = extractor
            .extract_window(TimeWindow::new(ts(0, 0), ts(1, 0)))
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::ExtractionFailed(_)));
        assert!(err.to_string().contains("exceeded"));
        assert_eq!(source.fetch_calls(), 3);
    }
}
