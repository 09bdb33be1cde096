use std::collections::{
    BTreeMap,
    HashMap,
};
use std::sync::Arc;
use std::time::Duration;

use chrono::{
    DateTime,
    NaiveDate,
    Timelike,
    Utc,
};
use tidemark_source_api::{
    FieldValue,
    Record,
    RetryPolicy,
};
use tokio::time::timeout;

use crate::domain::aggregate::{
    downsample_sorted,
    ERROR_RATE_METRIC,
    MAX_DISTRIBUTION_POINTS,
    UNKNOWN_DIMENSION,
};
use crate::domain::{
    Batch,
    DailyAggregate,
    DomainError,
    DomainResult,
    GroupSummary,
    ManifestEntry,
    MetricSummary,
    PartitionKey,
    PipelineSettings,
    RecordSchema,
    Tier,
};
use crate::infrastructure::checksum;
use crate::infrastructure::ObjectSink;

/// Outcome of rebuilding a date's cleaned partition
#[derive(Debug, Clone)]
pub struct CleanedPartition {
    pub manifest: ManifestEntry,
    /// Rows read from the date's raw windows
    pub rows_in: u64,
    pub duplicates_removed: u64,
    /// Field values that could not be converted to their declared type
    pub unconvertible_values: u64,
}

#[derive(Debug, Clone)]
pub struct AggregatedPartition {
    pub manifest: ManifestEntry,
    pub aggregate: DailyAggregate,
}

/// Writes the three storage tiers
///
/// Every write goes through the sink keyed by partition, so re-writing the
/// same partition replaces it. The writer never validates its own output.
pub struct TieredWriter {
    sink: Arc<dyn ObjectSink>,
    retry: RetryPolicy,
    write_timeout: Duration,
}

impl TieredWriter {
    pub fn new(sink: Arc<dyn ObjectSink>, settings: &PipelineSettings) -> Self {
        Self {
            sink,
            retry: settings.retry.clone(),
            write_timeout: settings.write_timeout(),
        }
    }

    pub fn sink(&self) -> &Arc<dyn ObjectSink> {
        &self.sink
    }

    pub async fn write_raw(&self, batch: &Batch) -> DomainResult<ManifestEntry> {
        let key = PartitionKey::raw(&batch.source_id, batch.partition_date(), batch.window_start)
            .object_key();

        let mut rows: Vec<&Record> = batch.rows.iter().collect();
        rows.sort_by(|a, b| (a.event_time, &a.id).cmp(&(b.event_time, &b.id)));
        let payload = encode_records(rows)?;

        let manifest = ManifestEntry {
            tier: Tier::Raw,
            partition_key: key.clone(),
            source_id: batch.source_id.clone(),
            row_count: batch.row_count(),
            byte_size: payload.len() as u64,
            checksum: checksum::sha256_hex(&payload),
            expected_count: Some(batch.expected_count),
            window_start: Some(batch.window_start),
            window_end: Some(batch.window_end),
            written_at: Utc::now(),
        };

        self.put(&key, &payload, &manifest).await?;
        Ok(manifest)
    }

    /// Rebuilds the cleaned partition of `date` from the raw windows of that
    /// date ending at or before `until`: duplicate identifiers keep their
    /// earliest extraction, declared fields are normalized to their declared
    /// types.
    ///
    /// Raw windows past `until` belong to a run that never committed and are
    /// left out.
    pub async fn write_cleaned(
        &self, source_id: &str, date: NaiveDate, schema: &RecordSchema, until: DateTime<Utc>,
    ) -> DomainResult<CleanedPartition> {
        let prefix = PartitionKey::raw_date_prefix(source_id, date);
        let objects = self.sink.list(&prefix).await?;

        let mut source_count = 0u64;
        let mut raw_windows = 0usize;
        let mut records = Vec::new();
        for object in &objects {
            let Some(manifest) = self.sink.read_manifest(&object.key).await? else {
                tracing::warn!(key = %object.key, "Raw object without manifest, skipping");
                continue;
            };
            match manifest.window_end {
                Some(end) if end <= until => {}
                _ => {
                    tracing::debug!(
                        key = %object.key,
                        until = %until.to_rfc3339(),
                        "Skipping raw window outside the run bound"
                    );
                    continue;
                }
            }

            source_count += manifest.expected_count.unwrap_or(manifest.row_count);
            raw_windows += 1;
            records.extend(self.read_records(&object.key).await?);
        }
        let rows_in = records.len() as u64;

        let mut cleaned = deduplicate(records);
        let duplicates_removed = rows_in - cleaned.len() as u64;

        let mut unconvertible_values = 0u64;
        for record in &mut cleaned {
            unconvertible_values += schema.normalize(record) as u64;
        }
        cleaned.sort_by(|a, b| (a.event_time, &a.id).cmp(&(b.event_time, &b.id)));

        if unconvertible_values > 0 {
            tracing::warn!(
                source_id = %source_id,
                date = %date,
                unconvertible = unconvertible_values,
                "Some field values could not be normalized"
            );
        }

        let key = PartitionKey::cleaned(source_id, date).object_key();
        let payload = encode_records(cleaned.iter())?;
        let manifest = ManifestEntry {
            tier: Tier::Cleaned,
            partition_key: key.clone(),
            source_id: source_id.to_string(),
            row_count: cleaned.len() as u64,
            byte_size: payload.len() as u64,
            checksum: checksum::sha256_hex(&payload),
            expected_count: Some(source_count.saturating_sub(duplicates_removed)),
            window_start: None,
            window_end: None,
            written_at: Utc::now(),
        };

        self.put(&key, &payload, &manifest).await?;

        tracing::info!(
            source_id = %source_id,
            date = %date,
            raw_windows,
            rows = cleaned.len(),
            duplicates_removed,
            "Wrote cleaned partition"
        );

        Ok(CleanedPartition {
            manifest,
            rows_in,
            duplicates_removed,
            unconvertible_values,
        })
    }

    /// Summarizes the cleaned partition of `date` into one aggregate artifact
    pub async fn write_aggregated(
        &self, source_id: &str, date: NaiveDate, schema: &RecordSchema,
    ) -> DomainResult<AggregatedPartition> {
        let cleaned_key = PartitionKey::cleaned(source_id, date).object_key();
        let cleaned_manifest = self
            .sink
            .read_manifest(&cleaned_key)
            .await?
            .ok_or_else(|| {
                DomainError::StorageError(format!("Missing cleaned partition {}", cleaned_key))
            })?;
        let records = self.read_records(&cleaned_key).await?;

        let aggregate = aggregate_records(source_id, date, &records, schema);
        let manifest = self
            .store_aggregate(&aggregate, Some(cleaned_manifest.row_count))
            .await?;

        Ok(AggregatedPartition {
            manifest,
            aggregate,
        })
    }

    /// Persists an aggregate under its date's partition key
    pub async fn store_aggregate(
        &self, aggregate: &DailyAggregate, expected_count: Option<u64>,
    ) -> DomainResult<ManifestEntry> {
        let key = PartitionKey::aggregated(&aggregate.source_id, aggregate.date).object_key();
        let payload = serde_json::to_vec_pretty(aggregate)?;

        let manifest = ManifestEntry {
            tier: Tier::Aggregated,
            partition_key: key.clone(),
            source_id: aggregate.source_id.clone(),
            row_count: aggregate.row_count,
            byte_size: payload.len() as u64,
            checksum: checksum::sha256_hex(&payload),
            expected_count,
            window_start: None,
            window_end: None,
            written_at: Utc::now(),
        };

        self.put(&key, &payload, &manifest).await?;
        Ok(manifest)
    }

    pub async fn read_records(&self, key: &str) -> DomainResult<Vec<Record>> {
        let payload = self
            .sink
            .read(key)
            .await?
            .ok_or_else(|| DomainError::StorageError(format!("Missing object {}", key)))?;

        let (records, malformed) = decode_records(&payload);
        if malformed > 0 {
            tracing::warn!(key = %key, malformed, "Skipped malformed lines");
        }
        Ok(records)
    }

    pub async fn load_aggregate(
        &self, source_id: &str, date: NaiveDate,
    ) -> DomainResult<Option<DailyAggregate>> {
        let key = PartitionKey::aggregated(source_id, date).object_key();
        match self.sink.read(&key).await? {
            Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
            None => Ok(None),
        }
    }

    /// Up to `days` most recent aggregates strictly before `date`, oldest
    /// first
    pub async fn baseline_aggregates(
        &self, source_id: &str, date: NaiveDate, days: usize,
    ) -> DomainResult<Vec<DailyAggregate>> {
        let prefix = PartitionKey::tier_prefix(Tier::Aggregated, source_id);
        let mut dates: Vec<NaiveDate> = self
            .sink
            .list(&prefix)
            .await?
            .iter()
            .filter_map(|object| aggregate_date(&prefix, &object.key))
            .filter(|d| *d < date)
            .collect();
        dates.sort();
        let skip = dates.len().saturating_sub(days);

        let mut aggregates = Vec::with_capacity(dates.len() - skip);
        for day in &dates[skip..] {
            if let Some(aggregate) = self.load_aggregate(source_id, *day).await? {
                aggregates.push(aggregate);
            }
        }
        Ok(aggregates)
    }

    async fn put(&self, key: &str, payload: &[u8], manifest: &ManifestEntry) -> DomainResult<()> {
        let attempt = move || async move {
            match timeout(self.write_timeout, self.sink.write(key, payload, manifest)).await {
                Ok(result) => result,
                Err(_) => Err(DomainError::Timeout(format!(
                    "write of {} exceeded {:?}",
                    key, self.write_timeout
                ))),
            }
        };

        let metadata = self
            .retry
            .retry_if(attempt, |e: &DomainError| {
                let retryable = e.is_retryable();
                if retryable {
                    tracing::warn!(key = %key, error = %e, "Partition write failed, retrying");
                }
                retryable
            })
            .await
            .map_err(|e| match e {
                DomainError::WriteFailed(_) => e,
                other => DomainError::WriteFailed(format!("{}: {}", key, other)),
            })?;

        tracing::debug!(
            key = %metadata.key,
            size = metadata.size,
            backend = self.sink.backend_type(),
            "Wrote partition"
        );
        Ok(())
    }
}

/// Newline-delimited JSON, one record per line
pub fn encode_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> DomainResult<Vec<u8>> {
    let mut payload = Vec::new();
    for record in records {
        serde_json::to_writer(&mut payload, record)?;
        payload.push(b'\n');
    }
    Ok(payload)
}

/// Decodes a newline-delimited payload; returns the records and the number of
/// lines that could not be parsed
pub fn decode_records(payload: &[u8]) -> (Vec<Record>, usize) {
    let mut records = Vec::new();
    let mut malformed = 0;
    for line in payload.split(|b| *b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<Record>(line) {
            Ok(record) => records.push(record),
            Err(_) => malformed += 1,
        }
    }
    (records, malformed)
}

/// Keeps one record per identifier: the earliest extraction, then the
/// earliest event
fn deduplicate(records: Vec<Record>) -> Vec<Record> {
    let mut kept: HashMap<String, Record> = HashMap::with_capacity(records.len());
    for record in records {
        let replace = match kept.get(&record.id) {
            Some(existing) => {
                (record.extraction_time(), record.event_time)
                    < (existing.extraction_time(), existing.event_time)
            }
            None => true,
        };
        if replace {
            kept.insert(record.id.clone(), record);
        }
    }
    kept.into_values().collect()
}

fn aggregate_date(prefix: &str, key: &str) -> Option<NaiveDate> {
    let name = key.strip_prefix(prefix)?.strip_suffix(".json")?;
    NaiveDate::parse_from_str(name, "%Y-%m-%d").ok()
}

fn dimension_label(value: Option<&FieldValue>) -> String {
    match value {
        Some(FieldValue::String(s)) => s.clone(),
        Some(FieldValue::Int(v)) => v.to_string(),
        Some(FieldValue::Float(v)) => v.to_string(),
        Some(FieldValue::Bool(v)) => v.to_string(),
        Some(FieldValue::Null) | None => UNKNOWN_DIMENSION.to_string(),
    }
}

#[derive(Default)]
struct GroupAccumulator {
    rows: u64,
    errors: u64,
    values: BTreeMap<String, Vec<f64>>,
}

impl GroupAccumulator {
    fn add(&mut self, record: &Record, metrics: &[&str], error_flag: Option<&str>) {
        self.rows += 1;
        if let Some(flag) = error_flag {
            if record.get(flag).and_then(FieldValue::as_bool) == Some(true) {
                self.errors += 1;
            }
        }
        for metric in metrics {
            if let Some(value) = record.get(metric).and_then(FieldValue::as_f64) {
                self.values.entry(metric.to_string()).or_default().push(value);
            }
        }
    }

    fn summary(&self) -> GroupSummary {
        GroupSummary {
            row_count: self.rows,
            error_count: self.errors,
            error_rate: if self.rows == 0 {
                0.0
            } else {
                self.errors as f64 / self.rows as f64
            },
            metrics: self
                .values
                .iter()
                .filter_map(|(name, values)| {
                    MetricSummary::from_values(values).map(|s| (name.clone(), s))
                })
                .collect(),
        }
    }
}

/// Grouped summary statistics of a cleaned partition
pub fn aggregate_records(
    source_id: &str, date: NaiveDate, records: &[Record], schema: &RecordSchema,
) -> DailyAggregate {
    let metrics: Vec<&str> = schema.metric_fields().map(|f| f.name.as_str()).collect();
    let error_flag = schema.error_flag.as_deref();

    let mut totals = GroupAccumulator::default();
    let mut groups: BTreeMap<String, GroupAccumulator> = BTreeMap::new();
    let mut hourly: BTreeMap<u32, (u64, u64)> = BTreeMap::new();

    for record in records {
        totals.add(record, &metrics, error_flag);
        if let Some(dimension) = schema.dimension.as_deref() {
            groups
                .entry(dimension_label(record.get(dimension)))
                .or_default()
                .add(record, &metrics, error_flag);
        }
        if let Some(flag) = error_flag {
            let hour = hourly.entry(record.event_time.hour()).or_default();
            hour.0 += 1;
            if record.get(flag).and_then(FieldValue::as_bool) == Some(true) {
                hour.1 += 1;
            }
        }
    }

    let mut distributions: BTreeMap<String, Vec<f64>> = totals
        .values
        .iter()
        .map(|(name, values)| {
            let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
            sorted.sort_by(f64::total_cmp);
            (name.clone(), downsample_sorted(&sorted, MAX_DISTRIBUTION_POINTS))
        })
        .collect();

    if error_flag.is_some() && !hourly.is_empty() {
        let mut rates: Vec<f64> = hourly
            .values()
            .map(|(rows, errors)| *errors as f64 / *rows as f64)
            .collect();
        rates.sort_by(f64::total_cmp);
        distributions.insert(ERROR_RATE_METRIC.to_string(), rates);
    }

    DailyAggregate {
        source_id: source_id.to_string(),
        date,
        row_count: records.len() as u64,
        totals: totals.summary(),
        groups: groups
            .into_iter()
            .map(|(label, acc)| (label, acc.summary()))
            .collect(),
        distributions,
    }
}
