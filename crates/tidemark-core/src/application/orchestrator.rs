use std::collections::{
    BTreeSet,
    HashMap,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{
    DateTime,
    NaiveDate,
    Utc,
};
use futures::{
    StreamExt,
    TryStreamExt,
};
use tidemark_source_api::{
    Source,
    SourceRegistry,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::anomaly::AnomalyDetector;
use super::extractor::ChangeExtractor;
use super::quality::{
    QualityInputs,
    QualityScorer,
};
use super::validation::ValidationEngine;
use super::writer::TieredWriter;
use crate::domain::{
    validate_source_id,
    AnomalyRecord,
    DailyAggregate,
    DomainError,
    DomainResult,
    ManifestEntry,
    PipelineSettings,
    QualityWeights,
    RunAudit,
    RunStatus,
    RunSummary,
    SourceProfile,
    Tier,
    TimeWindow,
    ValidationReport,
    Watermark,
};
use crate::event::{
    EventBus,
    NoOpEventBus,
    Notification,
    NotificationSeverity,
    NotificationSink,
    PipelineEvent,
    TracingNotificationSink,
};
use crate::infrastructure::{
    MetricsSink,
    NoOpMetricsSink,
    ObjectSink,
    WatermarkStore,
};

/// Raw-tier outcome of one extracted window
struct ExtractedWindow {
    window: TimeWindow,
    rows: u64,
    expected: u64,
    manifest: ManifestEntry,
}

/// Drives one source from its watermark to `as_of` through every tier
///
/// Tiers are barriers: all partitions of a tier are written and validated
/// before the next tier starts. The watermark commit is the only step that
/// cannot be cancelled.
pub struct PipelineOrchestrator {
    watermarks: Arc<dyn WatermarkStore>,
    writer: Arc<TieredWriter>,
    validator: ValidationEngine,
    detector: AnomalyDetector,
    scorer: QualityScorer,
    metrics: Arc<dyn MetricsSink>,
    notifications: Arc<dyn NotificationSink>,
    event_bus: Arc<dyn EventBus>,
    settings: PipelineSettings,
    sources: SourceRegistry,
    profiles: HashMap<String, SourceProfile>,
}

impl PipelineOrchestrator {
    pub fn new(
        watermarks: Arc<dyn WatermarkStore>, sink: Arc<dyn ObjectSink>, settings: PipelineSettings,
    ) -> Self {
        let writer = Arc::new(TieredWriter::new(Arc::clone(&sink), &settings));

        Self {
            watermarks,
            validator: ValidationEngine::new(sink),
            detector: AnomalyDetector::new(Arc::clone(&writer)),
            writer,
            scorer: QualityScorer::new(QualityWeights::default()),
            metrics: Arc::new(NoOpMetricsSink),
            notifications: Arc::new(TracingNotificationSink),
            event_bus: Arc::new(NoOpEventBus),
            settings,
            sources: SourceRegistry::new(),
            profiles: HashMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_notifications(mut self, notifications: Arc<dyn NotificationSink>) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn with_quality_weights(mut self, weights: QualityWeights) -> Self {
        self.scorer = QualityScorer::new(weights);
        self
    }

    pub fn register_source(
        &mut self, source: Arc<dyn Source>, profile: SourceProfile,
    ) -> DomainResult<()> {
        validate_source_id(source.source_id())?;
        if profile.source_id != source.source_id() {
            return Err(DomainError::InvalidConfig(format!(
                "Profile for {} registered with source {}",
                profile.source_id,
                source.source_id()
            )));
        }

        tracing::debug!(source_id = %profile.source_id, "Registered source");
        self.profiles.insert(profile.source_id.clone(), profile);
        self.sources.register(source);
        Ok(())
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources.source_ids()
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn writer(&self) -> &Arc<TieredWriter> {
        &self.writer
    }

    pub fn watermarks(&self) -> &Arc<dyn WatermarkStore> {
        &self.watermarks
    }

    pub async fn run(&self, source_id: &str, as_of: Option<DateTime<Utc>>) -> RunSummary {
        self.run_with_cancel(source_id, as_of, CancellationToken::new())
            .await
    }

    /// Runs the source and always returns a summary, whatever the outcome
    pub async fn run_with_cancel(
        &self, source_id: &str, as_of: Option<DateTime<Utc>>, cancel: CancellationToken,
    ) -> RunSummary {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let mut summary = RunSummary::new(&run_id, source_id);

        match self.execute(&mut summary, as_of, &cancel).await {
            Ok(status) => summary.status = status,
            Err(e) => self.record_failure(&mut summary, e).await,
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            run_id = %summary.run_id,
            source_id = %summary.source_id,
            status = %summary.status,
            rows = summary.rows_extracted,
            duration_ms = summary.duration_ms,
            "Run finished"
        );
        summary
    }

    async fn execute(
        &self, summary: &mut RunSummary, as_of: Option<DateTime<Utc>>, cancel: &CancellationToken,
    ) -> DomainResult<RunStatus> {
        let run_id = summary.run_id.clone();
        let source_id = summary.source_id.clone();

        let source = self
            .sources
            .get(&source_id)
            .ok_or_else(|| DomainError::SourceNotFound(source_id.clone()))?;
        let profile = self
            .profiles
            .get(&source_id)
            .ok_or_else(|| DomainError::SourceNotFound(source_id.clone()))?;

        let before = self.watermarks.get(&source_id).await?;
        summary.watermark_before = Some(before.clone());

        let from = before.last_extracted_at;
        let to = extraction_bound(as_of, Utc::now(), self.settings.safety_lag());
        summary.window_from = Some(from);
        summary.window_to = Some(to);

        if to <= from {
            tracing::info!(
                source_id = %source_id,
                watermark = %from.to_rfc3339(),
                "Source is up to date"
            );
            summary.watermark_after = Some(before);
            return Ok(RunStatus::UpToDate);
        }

        tracing::info!(
            run_id = %run_id,
            source_id = %source_id,
            from = %from.to_rfc3339(),
            to = %to.to_rfc3339(),
            "Starting run"
        );
        self.event_bus
            .emit(PipelineEvent::RunStarted {
                run_id: run_id.clone(),
                source_id: source_id.clone(),
                from,
                to,
            })
            .await;

        // raw
        let extractor = ChangeExtractor::new(source, &self.settings);
        let windows: Vec<TimeWindow> = extractor.plan(from, to).collect();
        summary.windows = windows.len();

        let extracted = guarded(cancel, self.extract_windows(&run_id, &extractor, windows)).await?;
        summary.rows_extracted = extracted.iter().map(|w| w.rows).sum();
        let expected_rows: u64 = extracted.iter().map(|w| w.expected).sum();

        let raw_keys: Vec<String> = extracted
            .iter()
            .map(|w| w.manifest.partition_key.clone())
            .collect();
        guarded(cancel, self.run_gate(summary, Tier::Raw, &raw_keys, profile)).await?;

        // cleaned
        let dates: BTreeSet<NaiveDate> = extracted
            .iter()
            .map(|w| w.window.partition_date())
            .collect();
        let cleaned = guarded(cancel, self.write_cleaned(&run_id, &dates, to, profile)).await?;
        summary.rows_processed = cleaned.iter().map(|(_, rows, _)| rows).sum();
        summary.duplicates_removed = cleaned.iter().map(|(_, _, dups)| dups).sum();

        let cleaned_keys: Vec<String> = cleaned.into_iter().map(|(key, _, _)| key).collect();
        let cleaned_report =
            guarded(cancel, self.run_gate(summary, Tier::Cleaned, &cleaned_keys, profile))
                .await?;

        // aggregated
        let aggregates = guarded(cancel, self.write_aggregated(&run_id, &dates, profile)).await?;
        let aggregated_keys: Vec<String> = aggregates
            .iter()
            .map(|(key, _)| key.clone())
            .collect();
        guarded(cancel, self.run_gate(summary, Tier::Aggregated, &aggregated_keys, profile))
            .await?;

        // anomalies
        let complete_days: Vec<DailyAggregate> = aggregates
            .into_iter()
            .map(|(_, aggregate)| aggregate)
            .filter(|a| day_complete(a.date, to))
            .collect();
        summary.anomalies =
            guarded(cancel, self.detect_anomalies(&run_id, &complete_days, profile)).await?;

        let inputs = QualityInputs::from_reports(
            expected_rows,
            summary.rows_extracted,
            &cleaned_report,
            &summary.gates,
        );
        let quality = self.scorer.score(&inputs);
        summary.quality_score = Some(quality.clone());

        checkpoint(cancel)?;

        let audit = RunAudit {
            run_id: run_id.clone(),
            source_id: source_id.clone(),
            window_from: from,
            window_to: to,
            rows_processed: summary.rows_processed,
            quality: Some(quality.clone()),
            committed_at: Utc::now(),
        };
        let after = self.watermarks.commit(&before, to, &audit).await?;
        summary.watermark_after = Some(after.clone());

        self.after_commit(summary, &after).await;
        Ok(RunStatus::Succeeded)
    }

    async fn extract_windows(
        &self, run_id: &str, extractor: &ChangeExtractor, windows: Vec<TimeWindow>,
    ) -> DomainResult<Vec<ExtractedWindow>> {
        let semaphore = Semaphore::new(self.settings.max_workers.max(1));
        let semaphore = &semaphore;

        let futures: Vec<_> = windows
            .into_iter()
            .map(|window| async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| DomainError::InternalError(e.to_string()))?;

                let batch = extractor.extract_window(window).await?;
                let manifest = self.writer.write_raw(&batch).await?;

                tracing::debug!(
                    source_id = %batch.source_id,
                    window = %window,
                    rows = batch.row_count(),
                    expected = batch.expected_count,
                    "Extracted window"
                );
                self.event_bus
                    .emit(PipelineEvent::WindowExtracted {
                        run_id: run_id.to_string(),
                        window_start: window.start,
                        window_end: window.end,
                        rows: batch.row_count(),
                        expected: batch.expected_count,
                    })
                    .await;
                self.emit_written(run_id, &manifest).await;

                Ok::<_, DomainError>(ExtractedWindow {
                    window,
                    rows: batch.row_count(),
                    expected: batch.expected_count,
                    manifest,
                })
            })
            .collect();

        futures::future::join_all(futures)
            .await
            .into_iter()
            .collect()
    }

    async fn write_cleaned(
        &self, run_id: &str, dates: &BTreeSet<NaiveDate>, until: DateTime<Utc>,
        profile: &SourceProfile,
    ) -> DomainResult<Vec<(String, u64, u64)>> {
        let partitions: Vec<_> = futures::stream::iter(dates.iter().copied())
            .map(|date| {
                self.writer
                    .write_cleaned(&profile.source_id, date, &profile.schema, until)
            })
            .buffered(self.settings.max_workers.max(1))
            .try_collect()
            .await?;

        let mut written = Vec::with_capacity(partitions.len());
        for partition in partitions {
            self.emit_written(run_id, &partition.manifest).await;
            written.push((
                partition.manifest.partition_key,
                partition.manifest.row_count,
                partition.duplicates_removed,
            ));
        }
        Ok(written)
    }

    async fn write_aggregated(
        &self, run_id: &str, dates: &BTreeSet<NaiveDate>, profile: &SourceProfile,
    ) -> DomainResult<Vec<(String, DailyAggregate)>> {
        let partitions: Vec<_> = futures::stream::iter(dates.iter().copied())
            .map(|date| {
                self.writer
                    .write_aggregated(&profile.source_id, date, &profile.schema)
            })
            .buffered(self.settings.max_workers.max(1))
            .try_collect()
            .await?;

        let mut written = Vec::with_capacity(partitions.len());
        for partition in partitions {
            self.emit_written(run_id, &partition.manifest).await;
            written.push((partition.manifest.partition_key, partition.aggregate));
        }
        Ok(written)
    }

    /// Validates one tier and records the report; a failed gate stops the run
    async fn run_gate(
        &self, summary: &mut RunSummary, tier: Tier, keys: &[String], profile: &SourceProfile,
    ) -> DomainResult<ValidationReport> {
        let report = self.validator.validate(tier, keys, profile).await?;
        let blocking_rules = report.blocking_rule_names();

        self.event_bus
            .emit(PipelineEvent::GateCompleted {
                run_id: summary.run_id.clone(),
                tier,
                state: report.state,
                blocking_rules: blocking_rules.clone(),
            })
            .await;

        summary.gates.push(report.clone());
        if report.passed() {
            return Ok(report);
        }

        summary
            .blocking_results
            .extend(report.blocking_failures().into_iter().cloned());
        Err(DomainError::ValidationBlocked {
            tier,
            rules: blocking_rules,
        })
    }

    /// Never fails the run: detection errors are logged and skipped
    async fn detect_anomalies(
        &self, run_id: &str, aggregates: &[DailyAggregate], profile: &SourceProfile,
    ) -> DomainResult<Vec<AnomalyRecord>> {
        let mut found = Vec::new();
        for aggregate in aggregates {
            match self.detector.detect(aggregate, &profile.anomaly).await {
                Ok(anomalies) => found.extend(anomalies),
                Err(e) => tracing::warn!(
                    source_id = %aggregate.source_id,
                    date = %aggregate.date,
                    error = %e,
                    "Anomaly detection failed"
                ),
            }
        }

        for anomaly in &found {
            tracing::warn!(
                source_id = %anomaly.source_id,
                date = %anomaly.date,
                kind = anomaly.kind.as_str(),
                metric = %anomaly.metric_name,
                severity = anomaly.severity.as_str(),
                z_score = anomaly.z_score,
                "Anomaly detected"
            );
            self.event_bus
                .emit(PipelineEvent::AnomalyDetected {
                    run_id: run_id.to_string(),
                    anomaly: anomaly.clone(),
                })
                .await;
            self.notifications
                .notify(Notification::new(
                    NotificationSeverity::Warning,
                    format!(
                        "{} {} anomaly on {} for {} ({})",
                        anomaly.severity.as_str(),
                        anomaly.kind.as_str(),
                        anomaly.metric_name,
                        anomaly.source_id,
                        anomaly.date
                    ),
                    serde_json::to_value(anomaly).unwrap_or_default(),
                ))
                .await;
        }
        Ok(found)
    }

    async fn after_commit(&self, summary: &RunSummary, after: &Watermark) {
        tracing::info!(
            run_id = %summary.run_id,
            source_id = %after.source_id,
            watermark = %after.last_extracted_at.to_rfc3339(),
            version = after.version,
            "Watermark committed"
        );
        self.event_bus
            .emit(PipelineEvent::WatermarkCommitted {
                run_id: summary.run_id.clone(),
                source_id: after.source_id.clone(),
                last_extracted_at: after.last_extracted_at,
                version: after.version,
            })
            .await;

        if let Some(quality) = &summary.quality_score {
            if let Err(e) = self
                .metrics
                .record_quality(&summary.source_id, &summary.run_id, quality)
                .await
            {
                tracing::warn!(error = %e, "Failed to record quality score");
            }
        }
        if !summary.anomalies.is_empty() {
            if let Err(e) = self
                .metrics
                .record_anomalies(&summary.run_id, &summary.anomalies)
                .await
            {
                tracing::warn!(error = %e, "Failed to record anomalies");
            }
        }

        self.notifications
            .notify(Notification::new(
                NotificationSeverity::Info,
                format!(
                    "Run {} for {} committed {} rows",
                    summary.run_id, summary.source_id, summary.rows_extracted
                ),
                serde_json::json!({
                    "run_id": summary.run_id,
                    "source_id": summary.source_id,
                    "watermark": after.last_extracted_at,
                    "quality": summary.quality_score.as_ref().map(|q| q.overall),
                    "anomalies": summary.anomalies.len(),
                }),
            ))
            .await;
    }

    async fn record_failure(&self, summary: &mut RunSummary, error: DomainError) {
        let (status, severity) = match &error {
            DomainError::ValidationBlocked { .. } => {
                (RunStatus::Blocked, NotificationSeverity::Critical)
            }
            DomainError::WatermarkConflict { .. } => {
                (RunStatus::Conflict, NotificationSeverity::Critical)
            }
            DomainError::Cancelled(_) => (RunStatus::Cancelled, NotificationSeverity::Warning),
            _ => (RunStatus::Failed, NotificationSeverity::Critical),
        };

        summary.status = status;
        summary.error = Some(error.to_string());

        tracing::error!(
            run_id = %summary.run_id,
            source_id = %summary.source_id,
            kind = error.kind(),
            error = %error,
            "Run did not commit"
        );
        self.event_bus
            .emit(PipelineEvent::RunFailed {
                run_id: summary.run_id.clone(),
                source_id: summary.source_id.clone(),
                error: error.to_string(),
            })
            .await;
        self.notifications
            .notify(Notification::new(
                severity,
                format!("Run {} for {} {}: {}", summary.run_id, summary.source_id, status, error),
                serde_json::json!({
                    "run_id": summary.run_id,
                    "source_id": summary.source_id,
                    "kind": error.kind(),
                    "blocking_rules": summary
                        .blocking_results
                        .iter()
                        .map(|r| r.rule_name.as_str())
                        .collect::<Vec<_>>(),
                }),
            ))
            .await;
    }

    async fn emit_written(&self, run_id: &str, manifest: &ManifestEntry) {
        self.event_bus
            .emit(PipelineEvent::TierWritten {
                run_id: run_id.to_string(),
                tier: manifest.tier,
                partition_key: manifest.partition_key.clone(),
                row_count: manifest.row_count,
            })
            .await;
    }
}

/// `min(as_of, now - lag)`, truncated to whole milliseconds
///
/// The lag only holds back the clock; an explicit `as_of` in the past is
/// honoured exactly.
fn extraction_bound(
    as_of: Option<DateTime<Utc>>, now: DateTime<Utc>, lag: chrono::Duration,
) -> DateTime<Utc> {
    let settled = now - lag;
    let bound = as_of.map_or(settled, |t| t.min(settled));
    DateTime::<Utc>::from_timestamp_millis(bound.timestamp_millis()).unwrap_or(bound)
}

/// True once the whole calendar day lies at or before `to`
fn day_complete(date: NaiveDate, to: DateTime<Utc>) -> bool {
    date.succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc() <= to)
        .unwrap_or(false)
}

fn checkpoint(cancel: &CancellationToken) -> DomainResult<()> {
    if cancel.is_cancelled() {
        return Err(DomainError::Cancelled("run cancelled before commit".to_string()));
    }
    Ok(())
}

async fn guarded<T>(
    cancel: &CancellationToken, stage: impl Future<Output = DomainResult<T>>,
) -> DomainResult<T> {
    checkpoint(cancel)?;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            Err(DomainError::Cancelled("run cancelled before commit".to_string()))
        }
        result = stage => result,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{
        Duration,
        TimeZone,
    };
    use tidemark_source_api::{
        FieldType,
        Record,
    };

    use super::*;
    use crate::domain::{
        FieldSpec,
        RecordSchema,
    };
    use crate::event::{
        MemoryNotificationSink,
        RecordingEventBus,
    };
    use crate::infrastructure::{
        MemoryMetricsSink,
        MemoryObjectSink,
        MemorySource,
        MemoryWatermarkStore,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            safety_lag_secs: 0,
            ..Default::default()
        }
    }

    fn profile() -> SourceProfile {
        SourceProfile::new(
            "orders",
            RecordSchema::new(vec![
                FieldSpec::new("amount", FieldType::Float).required(),
                FieldSpec::new("channel", FieldType::String).allowed(["web", "store"]),
            ]),
        )
    }

    fn records(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| {
                Record::new(format!("o-{}", i), t0() + Duration::minutes(i as i64 + 1))
                    .with_field("amount", 10.0)
                    .with_field("channel", if i % 2 == 0 { "web" } else { "store" })
            })
            .collect()
    }

    struct Harness {
        orchestrator: PipelineOrchestrator,
        watermarks: Arc<MemoryWatermarkStore>,
        source: Arc<MemorySource>,
        notifications: Arc<MemoryNotificationSink>,
        events: Arc<RecordingEventBus>,
        metrics: Arc<MemoryMetricsSink>,
    }

    async fn harness(rows: Vec<Record>) -> Harness {
        let watermarks = Arc::new(MemoryWatermarkStore::new());
        watermarks.initialize("orders", t0()).await.unwrap();
        let source = Arc::new(MemorySource::new("orders").with_records(rows));
        let notifications = Arc::new(MemoryNotificationSink::new());
        let events = Arc::new(RecordingEventBus::new());
        let metrics = Arc::new(MemoryMetricsSink::new());

        let mut orchestrator = PipelineOrchestrator::new(
            watermarks.clone(),
            Arc::new(MemoryObjectSink::new()),
            settings(),
        )
        .with_notifications(notifications.clone())
        .with_event_bus(events.clone())
        .with_metrics(metrics.clone());
        orchestrator
            .register_source(source.clone(), profile())
            .unwrap();

        Harness {
            orchestrator,
            watermarks,
            source,
            notifications,
            events,
            metrics,
        }
    }

    #[tokio::test]
    async fn test_successful_run_commits_and_reports() {
        let h = harness(records(120)).await;
        let as_of = t0() + Duration::hours(3);

        let summary = h.orchestrator.run("orders", Some(as_of)).await;

        assert_eq!(summary.status, RunStatus::Succeeded, "{:?}", summary.error);
        assert_eq!(summary.windows, 3);
        assert_eq!(summary.rows_extracted, 120);
        assert_eq!(summary.gates.len(), 3);
        assert!(summary.watermark_advanced());
        assert_eq!(h.watermarks.get("orders").await.unwrap().last_extracted_at, as_of);

        let quality = summary.quality_score.unwrap();
        assert!((quality.overall - 100.0).abs() < 1e-9);
        assert_eq!(h.metrics.quality_scores("orders").await.len(), 1);

        let names = h.events.names().await;
        assert_eq!(names.first(), Some(&"run-started"));
        assert_eq!(names.last(), Some(&"watermark-committed"));
        assert_eq!(
            h.notifications
                .with_severity(NotificationSeverity::Info)
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_up_to_date_run_is_a_no_op() {
        let h = harness(records(5)).await;

        let summary = h.orchestrator.run("orders", Some(t0())).await;

        assert_eq!(summary.status, RunStatus::UpToDate);
        assert_eq!(summary.exit_code(), 0);
        assert!(!summary.watermark_advanced());
        assert_eq!(h.source.fetch_calls(), 0);
        assert!(h.events.names().await.is_empty());
    }

    #[tokio::test]
    async fn test_blocked_run_keeps_watermark() {
        let mut rows = records(100);
        rows[3].fields.remove("amount");
        let h = harness(rows).await;

        let summary = h
            .orchestrator
            .run("orders", Some(t0() + Duration::hours(2)))
            .await;

        assert_eq!(summary.status, RunStatus::Blocked);
        assert_eq!(summary.exit_code(), 2);
        assert!(!summary.blocking_results.is_empty());
        assert!(summary.quality_score.is_none());
        assert_eq!(h.watermarks.get("orders").await.unwrap().version, 0);
        assert_eq!(
            h.notifications
                .with_severity(NotificationSeverity::Critical)
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_non_finite_value_blocks_raw_tier() {
        let mut rows = records(50);
        rows[10] = rows[10].clone().with_field("amount", f64::NAN);
        let h = harness(rows).await;

        let summary = h
            .orchestrator
            .run("orders", Some(t0() + Duration::hours(1)))
            .await;

        assert_eq!(summary.status, RunStatus::Blocked);
        assert_eq!(summary.gates.len(), 1);
        assert!(summary
            .blocking_results
            .iter()
            .any(|r| r.rule_name == crate::application::validation::rules::SCHEMA_FIELD_TYPES));
        assert_eq!(h.watermarks.get("orders").await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_unknown_source_fails() {
        let h = harness(Vec::new()).await;

        let summary = h.orchestrator.run("missing", None).await;

        assert_eq!(summary.status, RunStatus::Failed);
        assert!(summary.error.unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_cancelled_run_does_not_commit() {
        let h = harness(records(10)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = h
            .orchestrator
            .run_with_cancel("orders", Some(t0() + Duration::hours(1)), cancel)
            .await;

        assert_eq!(summary.status, RunStatus::Cancelled);
        assert_eq!(h.watermarks.get("orders").await.unwrap().version, 0);
        assert_eq!(
            h.notifications
                .with_severity(NotificationSeverity::Warning)
                .await
                .len(),
            1
        );
    }

    #[test]
    fn test_extraction_bound_lags_only_the_clock() {
        let lag = Duration::minutes(5);
        let now = t0() + Duration::days(1);

        let past = t0() + Duration::hours(10);
        assert_eq!(extraction_bound(Some(past), now, lag), past);
        assert_eq!(extraction_bound(None, now, lag), now - lag);
        assert_eq!(extraction_bound(Some(now), now, lag), now - lag);

        let sub_milli = now + Duration::microseconds(1_500);
        assert_eq!(
            extraction_bound(None, sub_milli, Duration::zero()),
            now + Duration::milliseconds(1)
        );
    }

    #[tokio::test]
    async fn test_default_settings_reach_explicit_as_of() {
        let watermarks = Arc::new(MemoryWatermarkStore::new());
        watermarks.initialize("orders", t0()).await.unwrap();
        let source = Arc::new(MemorySource::new("orders").with_records(records(120)));
        let mut orchestrator = PipelineOrchestrator::new(
            watermarks.clone(),
            Arc::new(MemoryObjectSink::new()),
            PipelineSettings::default(),
        )
        .with_notifications(Arc::new(MemoryNotificationSink::new()));
        orchestrator.register_source(source, profile()).unwrap();

        let as_of = t0() + Duration::hours(2);
        let summary = orchestrator.run("orders", Some(as_of)).await;

        assert_eq!(summary.status, RunStatus::Succeeded, "{:?}", summary.error);
        assert_eq!(summary.window_to, Some(as_of));
        assert_eq!(summary.rows_extracted, 120);
        assert_eq!(watermarks.get("orders").await.unwrap().last_extracted_at, as_of);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_window_fails_run() {
        let h = harness(records(30)).await;
        h.source
            .slow_next_fetches(u32::MAX, std::time::Duration::from_secs(600));

        let summary = h
            .orchestrator
            .run("orders", Some(t0() + Duration::hours(1)))
            .await;

        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.exit_code(), 1);
        assert!(summary.error.unwrap().contains("Extraction failed"));
        assert!(summary.gates.is_empty());
        assert_eq!(h.watermarks.get("orders").await.unwrap().version, 0);
        assert_eq!(
            h.notifications
                .with_severity(NotificationSeverity::Critical)
                .await
                .len(),
            1
        );
    }

    #[test]
    fn test_day_complete() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert!(!day_complete(date, t0() + Duration::hours(23)));
        assert!(day_complete(date, t0() + Duration::days(1)));
    }
}
