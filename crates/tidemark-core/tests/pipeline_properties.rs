use std::collections::BTreeMap;
use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{
    DateTime,
    Duration,
    NaiveDate,
    TimeZone,
    Utc,
};
use tidemark_core::application::validation::rules;
use tidemark_core::application::PipelineOrchestrator;
use tidemark_core::domain::{
    AnomalyKind,
    AnomalySeverity,
    DailyAggregate,
    DomainResult,
    FieldSpec,
    GroupSummary,
    ManifestEntry,
    PipelineSettings,
    RecordSchema,
    RunAudit,
    RunStatus,
    SourceProfile,
    Tier,
    Watermark,
};
use tidemark_core::event::{
    MemoryNotificationSink,
    NotificationSeverity,
};
use tidemark_core::infrastructure::{
    checksum,
    MemoryObjectSink,
    MemorySource,
    MemoryWatermarkStore,
    ObjectMetadata,
    ObjectSink,
    WatermarkStore,
};
use tidemark_source_api::{
    FieldType,
    Record,
    RetryPolicy,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap()
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        safety_lag_secs: 0,
        retry: RetryPolicy::new(3, StdDuration::from_millis(5), false),
        ..Default::default()
    }
}

fn profile() -> SourceProfile {
    SourceProfile::new(
        "orders",
        RecordSchema::new(vec![
            FieldSpec::new("amount", FieldType::Float)
                .required()
                .range(Some(0.0), None),
            FieldSpec::new("channel", FieldType::String).allowed(["web", "store"]),
        ]),
    )
}

/// `count` orders spaced `every` apart, the first one `every` after `start`
fn orders(start: DateTime<Utc>, count: usize, every: Duration) -> Vec<Record> {
    (0..count)
        .map(|i| order(&format!("o-{}", i), start + every * (i as i32 + 1), i))
        .collect()
}

fn order(id: &str, at: DateTime<Utc>, i: usize) -> Record {
    Record::new(id, at)
        .with_field("amount", 10.0 + (i % 7) as f64)
        .with_field("channel", if i % 3 == 0 { "store" } else { "web" })
}

struct Pipeline {
    orchestrator: PipelineOrchestrator,
    watermarks: Arc<dyn WatermarkStore>,
    sink: Arc<MemoryObjectSink>,
    source: Arc<MemorySource>,
    notifications: Arc<MemoryNotificationSink>,
}

async fn pipeline_with(
    watermarks: Arc<dyn WatermarkStore>, sink: Arc<MemoryObjectSink>, records: Vec<Record>,
) -> Pipeline {
    build(watermarks, sink, records, settings()).await
}

async fn build(
    watermarks: Arc<dyn WatermarkStore>, sink: Arc<MemoryObjectSink>, records: Vec<Record>,
    settings: PipelineSettings,
) -> Pipeline {
    watermarks.initialize("orders", t0()).await.unwrap();
    let source = Arc::new(MemorySource::new("orders").with_records(records));
    let notifications = Arc::new(MemoryNotificationSink::new());

    let mut orchestrator =
        PipelineOrchestrator::new(Arc::clone(&watermarks), sink.clone(), settings)
            .with_notifications(notifications.clone());
    orchestrator
        .register_source(source.clone(), profile())
        .unwrap();

    Pipeline {
        orchestrator,
        watermarks,
        sink,
        source,
        notifications,
    }
}

async fn pipeline(records: Vec<Record>) -> Pipeline {
    pipeline_with(
        Arc::new(MemoryWatermarkStore::new()),
        Arc::new(MemoryObjectSink::new()),
        records,
    )
    .await
}

async fn payloads(sink: &MemoryObjectSink) -> BTreeMap<String, Vec<u8>> {
    let mut out = BTreeMap::new();
    for key in sink.keys().await {
        if let Some(payload) = sink.read(&key).await.unwrap() {
            out.insert(key, payload);
        }
    }
    out
}

#[tokio::test]
async fn test_rerunning_committed_windows_is_byte_identical() {
    let records = orders(t0(), 300, Duration::minutes(1));
    let sink = Arc::new(MemoryObjectSink::new());
    let as_of = t0() + Duration::hours(6);

    let first = pipeline_with(
        Arc::new(MemoryWatermarkStore::new()),
        sink.clone(),
        records.clone(),
    )
    .await;
    let summary = first.orchestrator.run("orders", Some(as_of)).await;
    assert_eq!(summary.status, RunStatus::Succeeded, "{:?}", summary.error);
    let before = payloads(&sink).await;

    // a fresh watermark store replays the same windows into the same sink
    let second = pipeline_with(Arc::new(MemoryWatermarkStore::new()), sink.clone(), records).await;
    let replay = second.orchestrator.run("orders", Some(as_of)).await;
    assert_eq!(replay.status, RunStatus::Succeeded, "{:?}", replay.error);

    assert_eq!(payloads(&sink).await, before);
    assert_eq!(replay.rows_extracted, summary.rows_extracted);
    assert_eq!(replay.rows_processed, 300);
    assert_eq!(replay.duplicates_removed, 0);
}

#[tokio::test]
async fn test_consecutive_runs_leave_no_gap() {
    let p = pipeline(orders(t0(), 360, Duration::minutes(1))).await;

    let mut previous: Option<Watermark> = None;
    let mut total = 0;
    for hours in [2, 4, 6] {
        let as_of = t0() + Duration::hours(hours);
        let summary = p.orchestrator.run("orders", Some(as_of)).await;
        assert_eq!(summary.status, RunStatus::Succeeded, "{:?}", summary.error);

        let committed = p.watermarks.get("orders").await.unwrap();
        assert_eq!(committed.last_extracted_at, as_of);
        if let Some(previous) = &previous {
            assert_eq!(summary.window_from, Some(previous.last_extracted_at));
        }
        total += summary.rows_extracted;
        previous = Some(committed);
    }

    assert_eq!(total, 360);
    let cleaned = p
        .sink
        .read_manifest("cleaned/orders/2024-03-31.jsonl")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cleaned.row_count, 360);
}

#[tokio::test]
async fn test_count_deviation_at_tolerance_passes() {
    let p = pipeline(orders(t0(), 9_500, Duration::milliseconds(300))).await;
    p.source.set_count_offset(500);

    let summary = p
        .orchestrator
        .run("orders", Some(t0() + Duration::hours(1)))
        .await;

    assert_eq!(summary.status, RunStatus::Succeeded, "{:?}", summary.error);
    let raw = &summary.gates[0];
    let result = raw.result(rules::COMPLETENESS_ROW_COUNT).unwrap();
    assert!(result.passed);
}

#[tokio::test]
async fn test_count_deviation_beyond_tolerance_blocks() {
    let p = pipeline(orders(t0(), 9_499, Duration::milliseconds(300))).await;
    p.source.set_count_offset(501);

    let summary = p
        .orchestrator
        .run("orders", Some(t0() + Duration::hours(1)))
        .await;

    assert_eq!(summary.status, RunStatus::Blocked);
    assert!(summary
        .blocking_results
        .iter()
        .any(|r| r.rule_name == rules::COMPLETENESS_ROW_COUNT));
    assert_eq!(p.watermarks.get("orders").await.unwrap().last_extracted_at, t0());
}

#[tokio::test]
async fn test_scenario_a_complete_delta_advances_watermark() {
    let t1 = t0() + Duration::hours(10);
    let p = pipeline(orders(t0(), 1_000, Duration::seconds(36))).await;

    let summary = p.orchestrator.run("orders", Some(t1)).await;

    assert_eq!(summary.status, RunStatus::Succeeded, "{:?}", summary.error);
    assert_eq!(summary.windows, 10);
    assert_eq!(summary.rows_extracted, 1_000);
    assert!(summary.gates[0]
        .result(rules::COMPLETENESS_ROW_COUNT)
        .map(|r| r.passed)
        .unwrap_or(false));
    assert_eq!(p.watermarks.get("orders").await.unwrap().last_extracted_at, t1);
    assert_eq!(summary.exit_code(), 0);
}

#[tokio::test]
async fn test_scenario_a_with_default_settings_reaches_as_of() {
    let t1 = t0() + Duration::hours(10);
    let p = build(
        Arc::new(MemoryWatermarkStore::new()),
        Arc::new(MemoryObjectSink::new()),
        orders(t0(), 1_000, Duration::seconds(36)),
        PipelineSettings::default(),
    )
    .await;

    let summary = p.orchestrator.run("orders", Some(t1)).await;

    assert_eq!(summary.status, RunStatus::Succeeded, "{:?}", summary.error);
    assert_eq!(summary.window_to, Some(t1));
    assert_eq!(summary.rows_extracted, 1_000);
    assert_eq!(p.watermarks.get("orders").await.unwrap().last_extracted_at, t1);
}

#[tokio::test]
async fn test_scenario_b_dedup_keeps_earliest_extraction() {
    let mut records = orders(t0(), 50, Duration::minutes(1));
    // o-7 changed again in the second hour
    let mut updated = order("o-7", t0() + Duration::minutes(70), 7);
    updated = updated.with_field("amount", 99.0);
    records.push(updated);
    let p = pipeline(records).await;

    let summary = p
        .orchestrator
        .run("orders", Some(t0() + Duration::hours(2)))
        .await;

    assert_eq!(summary.status, RunStatus::Succeeded, "{:?}", summary.error);
    assert_eq!(summary.rows_extracted, 51);
    assert_eq!(summary.duplicates_removed, 1);
    let audit = p.watermarks.history("orders", 1).await.unwrap();
    assert_eq!(audit[0].rows_processed, 50);

    let raw_uniqueness = summary.gates[0].result(rules::UNIQUENESS_IDENTIFIERS).unwrap();
    assert!(!raw_uniqueness.passed);
    let cleaned = summary
        .gates
        .iter()
        .find(|g| g.tier == Tier::Cleaned)
        .unwrap();
    assert!(cleaned.result(rules::UNIQUENESS_IDENTIFIERS).unwrap().passed);

    let payload = p
        .sink
        .read("cleaned/orders/2024-03-31.jsonl")
        .await
        .unwrap()
        .unwrap();
    let kept: Vec<Record> = String::from_utf8(payload)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .filter(|r: &Record| r.id == "o-7")
        .collect();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].event_time, t0() + Duration::minutes(8));
}

fn baseline_day(date: NaiveDate, rows: u64) -> DailyAggregate {
    DailyAggregate {
        source_id: "orders".to_string(),
        date,
        row_count: rows,
        totals: GroupSummary {
            row_count: rows,
            ..Default::default()
        },
        groups: BTreeMap::new(),
        distributions: BTreeMap::new(),
    }
}

#[tokio::test]
async fn test_scenario_c_volume_drop_is_reported_not_blocking() {
    let p = pipeline(orders(t0(), 500, Duration::minutes(2))).await;
    let today = t0().date_naive();
    for days in 1..=30 {
        let rows = if days % 2 == 0 { 1_250 } else { 1_150 };
        p.orchestrator
            .writer()
            .store_aggregate(&baseline_day(today - Duration::days(days), rows), None)
            .await
            .unwrap();
    }

    let summary = p
        .orchestrator
        .run("orders", Some(t0() + Duration::days(1)))
        .await;

    assert_eq!(summary.status, RunStatus::Succeeded, "{:?}", summary.error);
    assert!(summary.watermark_advanced());

    let volume = summary
        .anomalies
        .iter()
        .find(|a| a.kind == AnomalyKind::Volume)
        .unwrap();
    assert_eq!(volume.severity, AnomalySeverity::High);
    assert!((volume.z_score + 14.0).abs() < 1e-9);
    assert_eq!(volume.baseline_mean, 1_200.0);

    let warnings = p
        .notifications
        .with_severity(NotificationSeverity::Warning)
        .await;
    assert_eq!(warnings.len(), summary.anomalies.len());
    assert!(p
        .notifications
        .with_severity(NotificationSeverity::Critical)
        .await
        .is_empty());
}

#[tokio::test]
async fn test_scenario_d_missing_required_field_blocks() {
    let mut records = orders(t0(), 1_000, Duration::seconds(30));
    for record in records.iter_mut().take(20) {
        record.fields.remove("amount");
    }
    let p = pipeline(records).await;

    let summary = p
        .orchestrator
        .run("orders", Some(t0() + Duration::hours(9)))
        .await;

    assert_eq!(summary.status, RunStatus::Blocked);
    assert_eq!(summary.exit_code(), 2);
    let blocked = summary
        .blocking_results
        .iter()
        .find(|r| r.rule_name == rules::SCHEMA_REQUIRED_FIELDS)
        .unwrap();
    assert_eq!(blocked.affected_ratio, Some(0.02));

    let watermark = p.watermarks.get("orders").await.unwrap();
    assert_eq!(watermark.last_extracted_at, t0());
    assert_eq!(watermark.version, 0);

    let keys = p.sink.keys().await;
    assert!(keys.iter().any(|k| k.starts_with("raw/")));
    assert!(!keys.iter().any(|k| k.starts_with("cleaned/")));
}

#[tokio::test]
async fn test_cleaned_shortfall_blocks_before_aggregation() {
    // every order changes in both hours; each window is 5 rows short of the
    // source count, which is within tolerance per window but not once the
    // repeated identifiers collapse
    let mut records = orders(t0(), 100, Duration::seconds(30));
    records.extend(
        (0..100).map(|i| order(&format!("o-{}", i), t0() + Duration::minutes(61 + i as i64 / 2), i)),
    );
    let p = pipeline(records).await;
    p.source.set_count_offset(5);

    let summary = p
        .orchestrator
        .run("orders", Some(t0() + Duration::hours(2)))
        .await;

    assert_eq!(summary.status, RunStatus::Blocked);
    assert_eq!(summary.exit_code(), 2);
    assert!(summary.gates[0].passed());
    assert_eq!(summary.gates.len(), 2);
    assert_eq!(summary.gates[1].tier, Tier::Cleaned);
    assert!(summary
        .blocking_results
        .iter()
        .all(|r| r.tier == Tier::Cleaned && r.rule_name == rules::COMPLETENESS_ROW_COUNT));
    assert!(summary.quality_score.is_none());

    let watermark = p.watermarks.get("orders").await.unwrap();
    assert_eq!(watermark.last_extracted_at, t0());
    assert_eq!(watermark.version, 0);
    let keys = p.sink.keys().await;
    assert!(keys.iter().any(|k| k.starts_with("cleaned/")));
    assert!(!keys.iter().any(|k| k.starts_with("aggregated/")));
}

/// Stores every aggregate with an impossible error rate, as a broken
/// aggregation step would
struct CorruptAggregates {
    inner: MemoryObjectSink,
}

#[async_trait]
impl ObjectSink for CorruptAggregates {
    fn backend_type(&self) -> &str {
        "corrupt-aggregates"
    }

    async fn write(
        &self, key: &str, payload: &[u8], manifest: &ManifestEntry,
    ) -> DomainResult<ObjectMetadata> {
        if !key.starts_with("aggregated/") {
            return self.inner.write(key, payload, manifest).await;
        }

        let mut aggregate: DailyAggregate = serde_json::from_slice(payload).unwrap();
        aggregate.totals.error_rate = 1.5;
        let payload = serde_json::to_vec_pretty(&aggregate).unwrap();
        let manifest = ManifestEntry {
            byte_size: payload.len() as u64,
            checksum: checksum::sha256_hex(&payload),
            ..manifest.clone()
        };
        self.inner.write(key, &payload, &manifest).await
    }

    async fn read(&self, key: &str) -> DomainResult<Option<Vec<u8>>> {
        self.inner.read(key).await
    }

    async fn read_manifest(&self, key: &str) -> DomainResult<Option<ManifestEntry>> {
        self.inner.read_manifest(key).await
    }

    async fn list(&self, prefix: &str) -> DomainResult<Vec<ObjectMetadata>> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> DomainResult<()> {
        self.inner.delete(key).await
    }
}

#[tokio::test]
async fn test_aggregate_range_violation_blocks_commit() {
    let watermarks = Arc::new(MemoryWatermarkStore::new());
    watermarks.initialize("orders", t0()).await.unwrap();
    let source = Arc::new(MemorySource::new("orders").with_records(orders(
        t0(),
        60,
        Duration::minutes(1),
    )));
    let notifications = Arc::new(MemoryNotificationSink::new());
    let mut orchestrator = PipelineOrchestrator::new(
        watermarks.clone(),
        Arc::new(CorruptAggregates {
            inner: MemoryObjectSink::new(),
        }),
        settings(),
    )
    .with_notifications(notifications.clone());
    orchestrator.register_source(source, profile()).unwrap();

    let summary = orchestrator
        .run("orders", Some(t0() + Duration::hours(1)))
        .await;

    assert_eq!(summary.status, RunStatus::Blocked);
    assert_eq!(summary.exit_code(), 2);
    let tiers: Vec<Tier> = summary.gates.iter().map(|g| g.tier).collect();
    assert_eq!(tiers, vec![Tier::Raw, Tier::Cleaned, Tier::Aggregated]);
    assert!(summary.gates[0].passed() && summary.gates[1].passed());
    assert!(summary
        .blocking_results
        .iter()
        .any(|r| r.tier == Tier::Aggregated && r.rule_name == rules::RANGE_AGGREGATE_VALUES));
    assert!(summary.anomalies.is_empty());
    assert!(summary.quality_score.is_none());

    let watermark = watermarks.get("orders").await.unwrap();
    assert_eq!(watermark.last_extracted_at, t0());
    assert_eq!(watermark.version, 0);
    assert!(watermarks.history("orders", 10).await.unwrap().is_empty());
    assert_eq!(
        notifications
            .with_severity(NotificationSeverity::Critical)
            .await
            .len(),
        1
    );
}

/// Lets a competing run commit right after the first read
struct RacingStore {
    inner: MemoryWatermarkStore,
    raced: AtomicBool,
}

#[async_trait]
impl WatermarkStore for RacingStore {
    async fn initialize(&self, source_id: &str, start: DateTime<Utc>) -> DomainResult<Watermark> {
        self.inner.initialize(source_id, start).await
    }

    async fn get(&self, source_id: &str) -> DomainResult<Watermark> {
        let current = self.inner.get(source_id).await?;
        if !self.raced.swap(true, Ordering::SeqCst) {
            let competitor = RunAudit {
                run_id: "competitor".to_string(),
                source_id: source_id.to_string(),
                window_from: current.last_extracted_at,
                window_to: current.last_extracted_at,
                rows_processed: 0,
                quality: None,
                committed_at: Utc::now(),
            };
            self.inner
                .commit(&current, current.last_extracted_at, &competitor)
                .await?;
        }
        Ok(current)
    }

    async fn commit(
        &self, expected: &Watermark, new_extracted_at: DateTime<Utc>, audit: &RunAudit,
    ) -> DomainResult<Watermark> {
        self.inner.commit(expected, new_extracted_at, audit).await
    }

    async fn history(&self, source_id: &str, limit: usize) -> DomainResult<Vec<RunAudit>> {
        self.inner.history(source_id, limit).await
    }
}

#[tokio::test]
async fn test_concurrent_commit_loses_cleanly() {
    let store = Arc::new(RacingStore {
        inner: MemoryWatermarkStore::new(),
        raced: AtomicBool::new(false),
    });
    let p = pipeline_with(
        store,
        Arc::new(MemoryObjectSink::new()),
        orders(t0(), 30, Duration::minutes(1)),
    )
    .await;

    let summary = p
        .orchestrator
        .run("orders", Some(t0() + Duration::hours(1)))
        .await;

    assert_eq!(summary.status, RunStatus::Conflict);
    assert_eq!(summary.exit_code(), 3);
    let watermark = p.watermarks.get("orders").await.unwrap();
    assert_eq!(watermark.last_extracted_at, t0());
    assert_eq!(watermark.version, 1);

    let history = p.watermarks.history("orders", 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].run_id, "competitor");
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let p = pipeline(orders(t0(), 120, Duration::minutes(1))).await;
    p.source.fail_next_calls(2);
    p.sink.fail_next_writes(2);

    let summary = p
        .orchestrator
        .run("orders", Some(t0() + Duration::hours(2)))
        .await;

    assert_eq!(summary.status, RunStatus::Succeeded, "{:?}", summary.error);
    assert_eq!(summary.rows_extracted, 120);
    assert_eq!(
        p.watermarks.get("orders").await.unwrap().last_extracted_at,
        t0() + Duration::hours(2)
    );
}

#[tokio::test]
async fn test_persistent_outage_fails_without_commit() {
    let p = pipeline(orders(t0(), 10, Duration::minutes(1))).await;
    p.source.fail_next_calls(1_000);

    let summary = p
        .orchestrator
        .run("orders", Some(t0() + Duration::hours(1)))
        .await;

    assert_eq!(summary.status, RunStatus::Failed);
    assert!(summary.error.unwrap().contains("Extraction failed"));
    assert_eq!(p.watermarks.get("orders").await.unwrap().version, 0);
    assert_eq!(
        p.notifications
            .with_severity(NotificationSeverity::Critical)
            .await
            .len(),
        1
    );
}
