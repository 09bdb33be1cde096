use std::collections::{
    BTreeMap,
    BTreeSet,
    HashSet,
};

use tidemark_source_api::{
    FieldType,
    FieldValue,
    Record,
};

use crate::application::writer::decode_records;
use crate::domain::{
    DailyAggregate,
    ManifestEntry,
    RecordSchema,
    RuleCategory,
    Severity,
    Tier,
    ValidationResult,
    ValidationThresholds,
};
use crate::infrastructure::checksum;

pub const INTEGRITY_CHECKSUM: &str = "integrity.checksum";
pub const INTEGRITY_ROW_COUNT: &str = "integrity.row_count";
pub const SCHEMA_REQUIRED_FIELDS: &str = "schema.required_fields";
pub const SCHEMA_FIELD_TYPES: &str = "schema.field_types";
pub const SCHEMA_UNKNOWN_FIELDS: &str = "schema.unknown_fields";
pub const SCHEMA_AGGREGATE_SHAPE: &str = "schema.aggregate_shape";
pub const COMPLETENESS_ROW_COUNT: &str = "completeness.row_count";
pub const COMPLETENESS_REQUIRED_NULLS: &str = "completeness.required_nulls";
pub const COMPLETENESS_GROUP_TOTALS: &str = "completeness.group_totals";
pub const RANGE_NUMERIC_BOUNDS: &str = "range.numeric_bounds";
pub const RANGE_AGGREGATE_VALUES: &str = "range.aggregate_values";
pub const UNIQUENESS_IDENTIFIERS: &str = "uniqueness.identifiers";
pub const UNIQUENESS_CATEGORIES: &str = "uniqueness.categorical_values";

/// Absorbs float noise so that a deviation of exactly the tolerance passes
const RATIO_EPSILON: f64 = 1e-9;

const MAX_LISTED_ISSUES: usize = 5;

/// One stored partition as the validation engine sees it
#[derive(Debug, Clone)]
pub struct PartitionSnapshot {
    pub key: String,
    pub manifest: Option<ManifestEntry>,
    pub payload: Option<Vec<u8>>,
    pub records: Vec<Record>,
    pub malformed_lines: usize,
    pub aggregate: Option<DailyAggregate>,
    pub decode_error: Option<String>,
}

impl PartitionSnapshot {
    pub fn decode(
        tier: Tier, key: impl Into<String>, manifest: Option<ManifestEntry>,
        payload: Option<Vec<u8>>,
    ) -> Self {
        let mut snapshot = Self {
            key: key.into(),
            manifest,
            payload: None,
            records: Vec::new(),
            malformed_lines: 0,
            aggregate: None,
            decode_error: None,
        };

        if let Some(bytes) = &payload {
            match tier {
                Tier::Raw | Tier::Cleaned => {
                    let (records, malformed) = decode_records(bytes);
                    snapshot.records = records;
                    snapshot.malformed_lines = malformed;
                }
                Tier::Aggregated => match serde_json::from_slice::<DailyAggregate>(bytes) {
                    Ok(aggregate) => snapshot.aggregate = Some(aggregate),
                    Err(e) => snapshot.decode_error = Some(e.to_string()),
                },
            }
        }
        snapshot.payload = payload;
        snapshot
    }

    /// Rows the partition actually holds
    fn actual_rows(&self, tier: Tier) -> Option<u64> {
        match tier {
            Tier::Raw | Tier::Cleaned => self.payload.as_ref().map(|_| self.records.len() as u64),
            Tier::Aggregated => self.aggregate.as_ref().map(|a| a.row_count),
        }
    }
}

/// Everything a rule may look at: the tier's manifests and partition contents
#[derive(Debug, Clone)]
pub struct TierSnapshot {
    pub tier: Tier,
    pub schema: RecordSchema,
    pub thresholds: ValidationThresholds,
    pub partitions: Vec<PartitionSnapshot>,
}

impl TierSnapshot {
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.partitions.iter().flat_map(|p| p.records.iter())
    }

    pub fn rows_checked(&self) -> u64 {
        self.partitions
            .iter()
            .filter_map(|p| p.actual_rows(self.tier))
            .sum()
    }

    fn record_count(&self) -> usize {
        self.partitions.iter().map(|p| p.records.len()).sum()
    }

    fn ratio(&self, affected: usize) -> f64 {
        let rows = self.record_count();
        if rows == 0 {
            0.0
        } else {
            affected as f64 / rows as f64
        }
    }

    fn aggregates(&self) -> impl Iterator<Item = (&PartitionSnapshot, &DailyAggregate)> {
        self.partitions
            .iter()
            .filter_map(|p| p.aggregate.as_ref().map(|a| (p, a)))
    }
}

pub type RuleCheck = fn(&TierSnapshot) -> ValidationResult;

#[derive(Clone, Copy)]
pub struct Rule {
    pub name: &'static str,
    pub category: RuleCategory,
    pub check: RuleCheck,
}

impl Rule {
    pub const fn new(name: &'static str, category: RuleCategory, check: RuleCheck) -> Self {
        Self {
            name,
            category,
            check,
        }
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("category", &self.category)
            .finish()
    }
}

/// Built-in rule set of a tier
pub fn rules_for(tier: Tier) -> Vec<Rule> {
    use RuleCategory::*;

    match tier {
        Tier::Raw | Tier::Cleaned => vec![
            Rule::new(INTEGRITY_CHECKSUM, Integrity, check_checksums),
            Rule::new(INTEGRITY_ROW_COUNT, Integrity, check_manifest_row_counts),
            Rule::new(SCHEMA_REQUIRED_FIELDS, Schema, check_required_fields),
            Rule::new(SCHEMA_FIELD_TYPES, Schema, check_field_types),
            Rule::new(SCHEMA_UNKNOWN_FIELDS, Schema, check_unknown_fields),
            Rule::new(COMPLETENESS_ROW_COUNT, Completeness, check_expected_counts),
            Rule::new(COMPLETENESS_REQUIRED_NULLS, Completeness, check_required_nulls),
            Rule::new(RANGE_NUMERIC_BOUNDS, Range, check_numeric_bounds),
            Rule::new(UNIQUENESS_IDENTIFIERS, Uniqueness, check_unique_identifiers),
            Rule::new(UNIQUENESS_CATEGORIES, Uniqueness, check_categorical_values),
        ],
        Tier::Aggregated => vec![
            Rule::new(INTEGRITY_CHECKSUM, Integrity, check_checksums),
            Rule::new(INTEGRITY_ROW_COUNT, Integrity, check_manifest_row_counts),
            Rule::new(SCHEMA_AGGREGATE_SHAPE, Schema, check_aggregate_shape),
            Rule::new(COMPLETENESS_ROW_COUNT, Completeness, check_expected_counts),
            Rule::new(COMPLETENESS_GROUP_TOTALS, Completeness, check_group_totals),
            Rule::new(RANGE_AGGREGATE_VALUES, Range, check_aggregate_values),
        ],
    }
}

pub fn within_tolerance(ratio: f64, tolerance: f64) -> bool {
    ratio <= tolerance + RATIO_EPSILON
}

/// Relative deviation of `actual` from `expected`
pub fn count_deviation(actual: u64, expected: u64) -> f64 {
    if expected == 0 {
        return if actual == 0 { 0.0 } else { 1.0 };
    }
    (actual as f64 - expected as f64).abs() / expected as f64
}

fn percent(ratio: f64) -> String {
    format!("{:.2}%", ratio * 100.0)
}

fn list_issues(issues: &[String]) -> String {
    let mut listed = issues
        .iter()
        .take(MAX_LISTED_ISSUES)
        .cloned()
        .collect::<Vec<_>>()
        .join("; ");
    if issues.len() > MAX_LISTED_ISSUES {
        listed.push_str(&format!(" (+{} more)", issues.len() - MAX_LISTED_ISSUES));
    }
    listed
}

/// Ratio rule outcome: BLOCKING beyond the tolerance, WARNING when some rows
/// are affected but the tolerance holds
fn graded(
    snapshot: &TierSnapshot, category: RuleCategory, name: &str, affected: usize,
    tolerance: f64, what: &str,
) -> ValidationResult {
    let ratio = snapshot.ratio(affected);
    let rows = snapshot.record_count();
    let details = format!(
        "{} of {} rows {} ({}, tolerance {})",
        affected,
        rows,
        what,
        percent(ratio),
        percent(tolerance)
    );

    let result = if affected == 0 {
        ValidationResult::pass(snapshot.tier, category, name, details)
    } else if within_tolerance(ratio, tolerance) {
        ValidationResult::fail(snapshot.tier, category, name, Severity::Warning, details)
    } else {
        ValidationResult::fail(snapshot.tier, category, name, Severity::Blocking, details)
    };
    result.with_ratio(ratio)
}

fn check_checksums(snapshot: &TierSnapshot) -> ValidationResult {
    let mut issues = Vec::new();
    for partition in &snapshot.partitions {
        match (&partition.manifest, &partition.payload) {
            (None, _) => issues.push(format!("{}: manifest missing", partition.key)),
            (_, None) => issues.push(format!("{}: object missing", partition.key)),
            (Some(manifest), Some(payload)) => {
                if manifest.byte_size != payload.len() as u64 {
                    issues.push(format!(
                        "{}: {} bytes stored, manifest says {}",
                        partition.key,
                        payload.len(),
                        manifest.byte_size
                    ));
                } else if !checksum::verify(payload, &manifest.checksum) {
                    issues.push(format!("{}: checksum mismatch", partition.key));
                }
            }
        }
    }

    let ratio = if snapshot.partitions.is_empty() {
        0.0
    } else {
        issues.len() as f64 / snapshot.partitions.len() as f64
    };

    if issues.is_empty() {
        ValidationResult::pass(
            snapshot.tier,
            RuleCategory::Integrity,
            INTEGRITY_CHECKSUM,
            format!("{} partition(s) verified", snapshot.partitions.len()),
        )
        .with_ratio(0.0)
    } else {
        ValidationResult::fail(
            snapshot.tier,
            RuleCategory::Integrity,
            INTEGRITY_CHECKSUM,
            Severity::Blocking,
            list_issues(&issues),
        )
        .with_ratio(ratio)
    }
}

fn check_manifest_row_counts(snapshot: &TierSnapshot) -> ValidationResult {
    let mut issues = Vec::new();
    for partition in &snapshot.partitions {
        let Some(manifest) = &partition.manifest else {
            continue;
        };
        if partition.malformed_lines > 0 {
            issues.push(format!(
                "{}: {} unreadable line(s)",
                partition.key, partition.malformed_lines
            ));
        }
        if let Some(actual) = partition.actual_rows(snapshot.tier) {
            if actual != manifest.row_count {
                issues.push(format!(
                    "{}: holds {} rows, manifest says {}",
                    partition.key, actual, manifest.row_count
                ));
            }
        }
    }

    if issues.is_empty() {
        ValidationResult::pass(
            snapshot.tier,
            RuleCategory::Integrity,
            INTEGRITY_ROW_COUNT,
            "Manifest row counts match partition contents",
        )
    } else {
        ValidationResult::fail(
            snapshot.tier,
            RuleCategory::Integrity,
            INTEGRITY_ROW_COUNT,
            Severity::Blocking,
            list_issues(&issues),
        )
    }
}

fn check_required_fields(snapshot: &TierSnapshot) -> ValidationResult {
    let required: Vec<&str> = snapshot
        .schema
        .required_fields()
        .map(|f| f.name.as_str())
        .collect();

    let mut per_field: BTreeMap<&str, usize> = BTreeMap::new();
    let affected = snapshot
        .records()
        .filter(|record| {
            let mut missing = false;
            for name in &required {
                if !record.fields.contains_key(*name) {
                    *per_field.entry(*name).or_default() += 1;
                    missing = true;
                }
            }
            missing
        })
        .count();

    let mut result = graded(
        snapshot,
        RuleCategory::Schema,
        SCHEMA_REQUIRED_FIELDS,
        affected,
        snapshot.thresholds.null_threshold,
        "lack a required field",
    );
    if !per_field.is_empty() {
        let fields: Vec<String> = per_field
            .iter()
            .map(|(name, count)| format!("{} absent in {}", name, count))
            .collect();
        result.details = format!("{}: {}", result.details, fields.join(", "));
    }
    result
}

fn check_field_types(snapshot: &TierSnapshot) -> ValidationResult {
    let mut mismatched: BTreeSet<String> = BTreeSet::new();
    let affected = snapshot
        .records()
        .filter(|record| {
            let mut bad = false;
            for spec in &snapshot.schema.fields {
                if let Some(value) = record.get(&spec.name) {
                    if !value.conforms_to(spec.field_type) {
                        mismatched.insert(format!("{} (expected {})", spec.name, spec.field_type));
                        bad = true;
                    }
                }
            }
            bad
        })
        .count();

    let mut result = graded(
        snapshot,
        RuleCategory::Schema,
        SCHEMA_FIELD_TYPES,
        affected,
        snapshot.thresholds.type_mismatch_tolerance,
        "have a value of the wrong type",
    );
    if !mismatched.is_empty() {
        let fields: Vec<String> = mismatched.into_iter().collect();
        result.details = format!("{}: {}", result.details, fields.join(", "));
    }
    result
}

fn check_unknown_fields(snapshot: &TierSnapshot) -> ValidationResult {
    let declared: HashSet<&str> = snapshot
        .schema
        .fields
        .iter()
        .map(|f| f.name.as_str())
        .collect();
    let unknown: BTreeSet<&str> = snapshot
        .records()
        .flat_map(|r| r.fields.keys())
        .map(String::as_str)
        .filter(|name| !declared.contains(name))
        .collect();

    let details = if unknown.is_empty() {
        "No undeclared fields".to_string()
    } else {
        format!(
            "{} undeclared field(s) carried through: {}",
            unknown.len(),
            unknown.into_iter().collect::<Vec<_>>().join(", ")
        )
    };
    ValidationResult::pass(snapshot.tier, RuleCategory::Schema, SCHEMA_UNKNOWN_FIELDS, details)
}

fn check_expected_counts(snapshot: &TierSnapshot) -> ValidationResult {
    let tolerance = snapshot.thresholds.count_tolerance;
    let mut worst: Option<(f64, String)> = None;
    let mut checked = 0;

    for partition in &snapshot.partitions {
        let (Some(manifest), Some(actual)) =
            (&partition.manifest, partition.actual_rows(snapshot.tier))
        else {
            continue;
        };
        let Some(expected) = manifest.expected_count else {
            continue;
        };
        checked += 1;

        let deviation = count_deviation(actual, expected);
        if worst.as_ref().map(|(w, _)| deviation > *w).unwrap_or(true) {
            worst = Some((
                deviation,
                format!(
                    "{}: {} rows vs {} expected",
                    partition.key, actual, expected
                ),
            ));
        }
    }

    let Some((deviation, context)) = worst else {
        return ValidationResult::pass(
            snapshot.tier,
            RuleCategory::Completeness,
            COMPLETENESS_ROW_COUNT,
            "No expected counts to compare",
        )
        .with_ratio(0.0);
    };

    let details = format!(
        "Worst deviation {} over {} partition(s) ({}), tolerance {}",
        percent(deviation),
        checked,
        context,
        percent(tolerance)
    );
    let result = if within_tolerance(deviation, tolerance) {
        ValidationResult::pass(
            snapshot.tier,
            RuleCategory::Completeness,
            COMPLETENESS_ROW_COUNT,
            details,
        )
    } else {
        ValidationResult::fail(
            snapshot.tier,
            RuleCategory::Completeness,
            COMPLETENESS_ROW_COUNT,
            Severity::Blocking,
            details,
        )
    };
    result.with_ratio(deviation)
}

fn check_required_nulls(snapshot: &TierSnapshot) -> ValidationResult {
    let required: Vec<&str> = snapshot
        .schema
        .required_fields()
        .map(|f| f.name.as_str())
        .collect();
    let affected = snapshot
        .records()
        .filter(|record| required.iter().any(|name| record.is_null(name)))
        .count();

    graded(
        snapshot,
        RuleCategory::Completeness,
        COMPLETENESS_REQUIRED_NULLS,
        affected,
        snapshot.thresholds.null_threshold,
        "have a null required field",
    )
}

fn numeric_value(value: &FieldValue) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.coerce_to(FieldType::Float).and_then(|v| v.as_f64()))
}

fn check_numeric_bounds(snapshot: &TierSnapshot) -> ValidationResult {
    let ranged: Vec<_> = snapshot.schema.ranged_fields().collect();
    let mut per_field: BTreeMap<&str, usize> = BTreeMap::new();
    let affected = snapshot
        .records()
        .filter(|record| {
            let mut out = false;
            for spec in &ranged {
                let value = record.get(&spec.name).and_then(numeric_value);
                if let Some(v) = value {
                    if !spec.in_range(v) {
                        *per_field.entry(spec.name.as_str()).or_default() += 1;
                        out = true;
                    }
                }
            }
            out
        })
        .count();

    let mut result = graded(
        snapshot,
        RuleCategory::Range,
        RANGE_NUMERIC_BOUNDS,
        affected,
        snapshot.thresholds.range_tolerance,
        "fall outside a declared range",
    );
    if !per_field.is_empty() {
        let fields: Vec<String> = per_field
            .iter()
            .map(|(name, count)| format!("{} out of range in {}", name, count))
            .collect();
        result.details = format!("{}: {}", result.details, fields.join(", "));
    }
    result
}

/// Duplicates are enforced at the cleaned tier; in raw data they are only
/// reported
fn check_unique_identifiers(snapshot: &TierSnapshot) -> ValidationResult {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut examples: BTreeSet<&str> = BTreeSet::new();
    let mut duplicates = 0;
    for record in snapshot.records() {
        if !seen.insert(record.id.as_str()) {
            duplicates += 1;
            examples.insert(record.id.as_str());
        }
    }

    let ratio = snapshot.ratio(duplicates);
    if duplicates == 0 {
        return ValidationResult::pass(
            snapshot.tier,
            RuleCategory::Uniqueness,
            UNIQUENESS_IDENTIFIERS,
            "No duplicate identifiers",
        )
        .with_ratio(0.0);
    }

    let severity = if snapshot.tier == Tier::Raw {
        Severity::Warning
    } else {
        Severity::Blocking
    };
    let ids: Vec<String> = examples.into_iter().map(str::to_string).collect();
    ValidationResult::fail(
        snapshot.tier,
        RuleCategory::Uniqueness,
        UNIQUENESS_IDENTIFIERS,
        severity,
        format!(
            "{} duplicate identifier(s): {}",
            duplicates,
            list_issues(&ids)
        ),
    )
    .with_ratio(ratio)
}

fn category_label(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Null => None,
        FieldValue::String(s) => Some(s.clone()),
        FieldValue::Int(v) => Some(v.to_string()),
        FieldValue::Float(v) => Some(v.to_string()),
        FieldValue::Bool(v) => Some(v.to_string()),
    }
}

/// Any value outside a declared allowed set blocks: it usually means the
/// upstream schema drifted
fn check_categorical_values(snapshot: &TierSnapshot) -> ValidationResult {
    let categorical: Vec<_> = snapshot.schema.categorical_fields().collect();
    let mut unexpected: BTreeSet<String> = BTreeSet::new();
    let affected = snapshot
        .records()
        .filter(|record| {
            let mut bad = false;
            for spec in &categorical {
                if let Some(label) = record.get(&spec.name).and_then(category_label) {
                    if !spec.allows(&label) {
                        unexpected.insert(format!("{}={}", spec.name, label));
                        bad = true;
                    }
                }
            }
            bad
        })
        .count();

    let ratio = snapshot.ratio(affected);
    if affected == 0 {
        return ValidationResult::pass(
            snapshot.tier,
            RuleCategory::Uniqueness,
            UNIQUENESS_CATEGORIES,
            format!("{} categorical field(s) within their allowed sets", categorical.len()),
        )
        .with_ratio(0.0);
    }

    let values: Vec<String> = unexpected.into_iter().collect();
    ValidationResult::fail(
        snapshot.tier,
        RuleCategory::Uniqueness,
        UNIQUENESS_CATEGORIES,
        Severity::Blocking,
        format!(
            "{} rows carry unexpected values: {}",
            affected,
            list_issues(&values)
        ),
    )
    .with_ratio(ratio)
}

fn check_aggregate_shape(snapshot: &TierSnapshot) -> ValidationResult {
    let mut issues = Vec::new();
    for partition in &snapshot.partitions {
        if let Some(error) = &partition.decode_error {
            issues.push(format!("{}: {}", partition.key, error));
            continue;
        }
        if let (Some(manifest), Some(aggregate)) = (&partition.manifest, &partition.aggregate) {
            if aggregate.source_id != manifest.source_id {
                issues.push(format!(
                    "{}: aggregate belongs to source {}",
                    partition.key, aggregate.source_id
                ));
            }
        }
    }

    if issues.is_empty() {
        ValidationResult::pass(
            snapshot.tier,
            RuleCategory::Schema,
            SCHEMA_AGGREGATE_SHAPE,
            "Aggregates decode",
        )
    } else {
        ValidationResult::fail(
            snapshot.tier,
            RuleCategory::Schema,
            SCHEMA_AGGREGATE_SHAPE,
            Severity::Blocking,
            list_issues(&issues),
        )
    }
}

fn check_group_totals(snapshot: &TierSnapshot) -> ValidationResult {
    let mut issues = Vec::new();
    for (partition, aggregate) in snapshot.aggregates() {
        if aggregate.totals.row_count != aggregate.row_count {
            issues.push(format!(
                "{}: totals cover {} rows of {}",
                partition.key, aggregate.totals.row_count, aggregate.row_count
            ));
        }
        if aggregate.groups.is_empty() {
            continue;
        }
        let rows: u64 = aggregate.groups.values().map(|g| g.row_count).sum();
        let errors: u64 = aggregate.groups.values().map(|g| g.error_count).sum();
        if rows != aggregate.totals.row_count || errors != aggregate.totals.error_count {
            issues.push(format!(
                "{}: groups sum to {} rows / {} errors, totals are {} / {}",
                partition.key,
                rows,
                errors,
                aggregate.totals.row_count,
                aggregate.totals.error_count
            ));
        }
    }

    if issues.is_empty() {
        ValidationResult::pass(
            snapshot.tier,
            RuleCategory::Completeness,
            COMPLETENESS_GROUP_TOTALS,
            "Group summaries add up to totals",
        )
    } else {
        ValidationResult::fail(
            snapshot.tier,
            RuleCategory::Completeness,
            COMPLETENESS_GROUP_TOTALS,
            Severity::Blocking,
            list_issues(&issues),
        )
    }
}

fn check_aggregate_values(snapshot: &TierSnapshot) -> ValidationResult {
    let mut issues = Vec::new();
    for (partition, aggregate) in snapshot.aggregates() {
        let groups = std::iter::once(("(totals)", &aggregate.totals))
            .chain(aggregate.groups.iter().map(|(k, v)| (k.as_str(), v)));
        for (label, group) in groups {
            if !(0.0..=1.0).contains(&group.error_rate) {
                issues.push(format!(
                    "{} {}: error rate {} outside [0, 1]",
                    partition.key, label, group.error_rate
                ));
            }
            for (metric, summary) in &group.metrics {
                let ordered = summary.min <= summary.p50
                    && summary.p50 <= summary.p95
                    && summary.p95 <= summary.p99
                    && summary.p99 <= summary.max
                    && summary.mean >= summary.min - RATIO_EPSILON
                    && summary.mean <= summary.max + RATIO_EPSILON;
                if !ordered {
                    issues.push(format!(
                        "{} {}: {} summary is not ordered",
                        partition.key, label, metric
                    ));
                }
            }
        }
    }

    if issues.is_empty() {
        ValidationResult::pass(
            snapshot.tier,
            RuleCategory::Range,
            RANGE_AGGREGATE_VALUES,
            "Aggregate values are within bounds",
        )
    } else {
        ValidationResult::fail(
            snapshot.tier,
            RuleCategory::Range,
            RANGE_AGGREGATE_VALUES,
            Severity::Blocking,
            list_issues(&issues),
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::{
        TimeZone,
        Utc,
    };

    use super::*;
    use crate::application::writer::encode_records;
    use crate::domain::FieldSpec;

    fn schema() -> RecordSchema {
        RecordSchema::new(vec![
            FieldSpec::new("latency_ms", FieldType::Float)
                .required()
                .range(Some(0.0), Some(1_000.0)),
            FieldSpec::new("region", FieldType::String).allowed(["eu", "us"]),
        ])
    }

    fn records(count: usize) -> Vec<Record> {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 30, 0).unwrap();
        (0..count)
            .map(|i| {
                Record::new(format!("r{}", i), at)
                    .with_field("latency_ms", 10.0)
                    .with_field("region", "eu")
            })
            .collect()
    }

    fn snapshot(tier: Tier, records: Vec<Record>, expected: u64) -> TierSnapshot {
        let payload = encode_records(records.iter()).unwrap();
        let manifest = ManifestEntry {
            tier,
            partition_key: "p".to_string(),
            source_id: "orders".to_string(),
            row_count: records.len() as u64,
            byte_size: payload.len() as u64,
            checksum: checksum::sha256_hex(&payload),
            expected_count: Some(expected),
            window_start: None,
            window_end: None,
            written_at: Utc::now(),
        };
        TierSnapshot {
            tier,
            schema: schema(),
            thresholds: ValidationThresholds::default(),
            partitions: vec![PartitionSnapshot::decode(
                tier,
                "p",
                Some(manifest),
                Some(payload),
            )],
        }
    }

    #[test]
    fn test_count_tolerance_boundary() {
        let at_boundary = snapshot(Tier::Raw, records(9_500), 10_000);
        let result = check_expected_counts(&at_boundary);
        assert!(result.passed, "{}", result.details);
        assert_eq!(result.affected_ratio, Some(0.05));

        let beyond = snapshot(Tier::Raw, records(9_499), 10_000);
        let result = check_expected_counts(&beyond);
        assert!(result.is_blocking_failure());
    }

    #[test]
    fn test_count_deviation_with_zero_expected() {
        assert_eq!(count_deviation(0, 0), 0.0);
        assert_eq!(count_deviation(3, 0), 1.0);
        assert!(within_tolerance(0.05, 0.05));
        assert!(!within_tolerance(0.0501, 0.05));
    }

    #[test]
    fn test_required_field_absence_is_graded() {
        let mut rows = records(1_000);
        rows[0].fields.remove("latency_ms");
        let result = check_required_fields(&snapshot(Tier::Raw, rows.clone(), 1_000));
        assert!(result.is_warning_failure());

        for row in rows.iter_mut().take(20) {
            row.fields.remove("latency_ms");
        }
        let result = check_required_fields(&snapshot(Tier::Raw, rows, 1_000));
        assert!(result.is_blocking_failure());
        assert_eq!(result.affected_ratio, Some(0.02));
        assert!(result.details.contains("latency_ms absent in 20"));
    }

    #[test]
    fn test_unexpected_category_blocks() {
        let mut rows = records(100);
        rows[3] = rows[3].clone().with_field("region", "apac");

        let result = check_categorical_values(&snapshot(Tier::Cleaned, rows, 100));

        assert!(result.is_blocking_failure());
        assert!(result.details.contains("region=apac"));
    }

    #[test]
    fn test_duplicates_warn_in_raw_and_block_in_cleaned() {
        let mut rows = records(10);
        rows[1].id = rows[0].id.clone();

        let raw = check_unique_identifiers(&snapshot(Tier::Raw, rows.clone(), 10));
        let cleaned = check_unique_identifiers(&snapshot(Tier::Cleaned, rows, 10));

        assert!(raw.is_warning_failure());
        assert!(cleaned.is_blocking_failure());
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let mut snap = snapshot(Tier::Raw, records(5), 5);
        if let Some(payload) = snap.partitions[0].payload.as_mut() {
            payload[0] = b' ';
        }

        let result = check_checksums(&snap);
        assert!(result.is_blocking_failure());
        assert!(result.details.contains("checksum mismatch"));
    }

    #[test]
    fn test_out_of_range_within_tolerance_warns() {
        let mut rows = records(2_000);
        rows[0] = rows[0].clone().with_field("latency_ms", -5.0);

        let result = check_numeric_bounds(&snapshot(Tier::Raw, rows, 2_000));

        assert!(result.is_warning_failure());
        assert_eq!(result.affected_ratio, Some(0.0005));
    }

    #[test]
    fn test_unknown_fields_are_tolerated() {
        let rows = records(3)
            .into_iter()
            .map(|r| r.with_field("extra", 1i64))
            .collect();

        let result = check_unknown_fields(&snapshot(Tier::Raw, rows, 3));

        assert!(result.passed);
        assert!(result.details.contains("extra"));
    }
}
