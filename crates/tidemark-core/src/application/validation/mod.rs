mod gate;
pub mod rules;

use std::sync::Arc;
use std::time::Duration;

pub use gate::ValidationGate;
pub use rules::{
    rules_for,
    PartitionSnapshot,
    Rule,
    TierSnapshot,
};
use tokio::time::timeout;

use crate::domain::{
    DomainResult,
    RuleCategory,
    Severity,
    SourceProfile,
    Tier,
    ValidationReport,
    ValidationResult,
};
use crate::infrastructure::ObjectSink;

/// Runs a tier's rules over the partitions written to it
///
/// Categories run in a fixed order. Within a category evaluation stops at the
/// first BLOCKING failure, but every category runs so the report is complete.
pub struct ValidationEngine {
    sink: Arc<dyn ObjectSink>,
}

impl ValidationEngine {
    pub fn new(sink: Arc<dyn ObjectSink>) -> Self {
        Self { sink }
    }

    /// Reads manifests and payloads of `keys` into a snapshot
    pub async fn load(
        &self, tier: Tier, keys: &[String], profile: &SourceProfile,
    ) -> DomainResult<TierSnapshot> {
        let mut partitions = Vec::with_capacity(keys.len());
        for key in keys {
            let manifest = self.sink.read_manifest(key).await?;
            let payload = self.sink.read(key).await?;
            partitions.push(PartitionSnapshot::decode(tier, key.as_str(), manifest, payload));
        }

        Ok(TierSnapshot {
            tier,
            schema: profile.schema.clone(),
            thresholds: profile.thresholds.clone(),
            partitions,
        })
    }

    pub async fn validate(
        &self, tier: Tier, keys: &[String], profile: &SourceProfile,
    ) -> DomainResult<ValidationReport> {
        let snapshot = self.load(tier, keys, profile).await?;
        let report = evaluate(Arc::new(snapshot), &rules_for(tier)).await?;

        tracing::info!(
            source_id = %profile.source_id,
            tier = %tier,
            state = ?report.state,
            partitions = keys.len(),
            rows = report.rows_checked,
            blocking = report.blocking_failures().len(),
            warnings = report.warning_failures().len(),
            "Validation gate completed"
        );
        Ok(report)
    }
}

/// Evaluates `rules` against a snapshot and settles the gate
pub async fn evaluate(
    snapshot: Arc<TierSnapshot>, rules: &[Rule],
) -> DomainResult<ValidationReport> {
    let rule_timeout = Duration::from_secs(snapshot.thresholds.rule_timeout_secs.max(1));
    let max_attempts = snapshot.thresholds.rule_max_attempts.max(1);

    let mut gate = ValidationGate::new(snapshot.tier);
    gate.start(snapshot.rows_checked())?;

    for category in RuleCategory::ORDERED {
        for rule in rules.iter().filter(|r| r.category == category) {
            let result =
                run_rule(*rule, Arc::clone(&snapshot), rule_timeout, max_attempts).await;
            let blocking = result.is_blocking_failure();
            if blocking {
                tracing::warn!(
                    tier = %snapshot.tier,
                    rule = rule.name,
                    details = %result.details,
                    "Blocking validation failure"
                );
            }
            gate.record(result)?;
            if blocking {
                break;
            }
        }
    }

    gate.finish()?;
    Ok(gate.into_report())
}

/// Runs one rule off the async runtime, retrying timeouts; a rule that never
/// completes is a BLOCKING failure
async fn run_rule(
    rule: Rule, snapshot: Arc<TierSnapshot>, rule_timeout: Duration, max_attempts: u32,
) -> ValidationResult {
    let tier = snapshot.tier;

    for attempt in 1..=max_attempts {
        let input = Arc::clone(&snapshot);
        let handle = tokio::task::spawn_blocking(move || (rule.check)(&input));

        match timeout(rule_timeout, handle).await {
            Ok(Ok(result)) => return result,
            Ok(Err(e)) => {
                return ValidationResult::fail(
                    tier,
                    rule.category,
                    rule.name,
                    Severity::Blocking,
                    format!("Rule aborted: {}", e),
                );
            }
            Err(_) => {
                tracing::warn!(
                    tier = %tier,
                    rule = rule.name,
                    attempt,
                    "Validation rule timed out"
                );
            }
        }
    }

    ValidationResult::fail(
        tier,
        rule.category,
        rule.name,
        Severity::Blocking,
        format!(
            "Timed out after {} attempt(s) of {:?}",
            max_attempts, rule_timeout
        ),
    )
}

#[cfg(test)]
mod tests {
    use chrono::{
        TimeZone,
        Utc,
    };
    use tidemark_source_api::{
        FieldType,
        Record,
    };

    use super::*;
    use crate::application::writer::encode_records;
    use crate::domain::{
        FieldSpec,
        GateState,
        ManifestEntry,
        RecordSchema,
        ValidationThresholds,
    };
    use crate::infrastructure::checksum;
    use crate::infrastructure::MemoryObjectSink;

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

    async fn store(sink: &MemoryObjectSink, key: &str, records: &[Record], expected: u64) {
        let payload = encode_records(records.iter()).unwrap();
        let manifest = ManifestEntry {
            tier: Tier::Raw,
            partition_key: key.to_string(),
            source_id: "orders".to_string(),
            row_count: records.len() as u64,
            byte_size: payload.len() as u64,
            checksum: checksum::sha256_hex(&payload),
            expected_count: Some(expected),
            window_start: None,
            window_end: None,
            written_at: Utc::now(),
        };
        sink.write(key, &payload, &manifest).await.unwrap();
    }

    fn rows(count: usize, channel: &str) -> Vec<Record> {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap();
        (0..count)
            .map(|i| {
                Record::new(format!("{}-{}", channel, i), at)
                    .with_field("amount", 5.0)
                    .with_field("channel", channel)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_clean_partitions_pass() {
        let sink = Arc::new(MemoryObjectSink::new());
        store(&sink, "raw/orders/a", &rows(10, "web"), 10).await;
        store(&sink, "raw/orders/b", &rows(10, "store"), 10).await;
        let engine = ValidationEngine::new(sink);

        let report = engine
            .validate(
                Tier::Raw,
                &["raw/orders/a".to_string(), "raw/orders/b".to_string()],
                &profile(),
            )
            .await
            .unwrap();

        assert_eq!(report.state, GateState::Passed);
        assert_eq!(report.rows_checked, 20);
        assert_eq!(report.results.len(), rules_for(Tier::Raw).len());
    }

    #[tokio::test]
    async fn test_every_category_runs_after_a_blocking_failure() {
        let sink = Arc::new(MemoryObjectSink::new());
        let mut records = rows(10, "web");
        records[0].fields.remove("amount");
        records[1] = records[1].clone().with_field("channel", "fax");
        store(&sink, "raw/orders/a", &records, 10).await;
        let engine = ValidationEngine::new(sink);

        let report = engine
            .validate(Tier::Raw, &["raw/orders/a".to_string()], &profile())
            .await
            .unwrap();

        assert_eq!(report.state, GateState::Failed);
        let blocking = report.blocking_rule_names();
        assert!(blocking.contains(&rules::SCHEMA_REQUIRED_FIELDS.to_string()));
        assert!(blocking.contains(&rules::UNIQUENESS_CATEGORIES.to_string()));
        // the schema category stopped at its first blocking rule
        assert!(report.result(rules::SCHEMA_FIELD_TYPES).is_none());
        assert!(report.result(rules::RANGE_NUMERIC_BOUNDS).is_some());
    }

    #[tokio::test]
    async fn test_missing_partition_fails_integrity() {
        let sink = Arc::new(MemoryObjectSink::new());
        let engine = ValidationEngine::new(sink);

        let report = engine
            .validate(Tier::Raw, &["raw/orders/missing".to_string()], &profile())
            .await
            .unwrap();

        assert!(!report.passed());
        assert!(report
            .result(rules::INTEGRITY_CHECKSUM)
            .map(|r| r.is_blocking_failure())
            .unwrap_or(false));
    }

    fn slow_rule(_snapshot: &TierSnapshot) -> ValidationResult {
        std::thread::sleep(Duration::from_millis(1_500));
        ValidationResult::pass(Tier::Raw, RuleCategory::Range, "slow", "done")
    }

    #[tokio::test]
    async fn test_rule_timeout_is_blocking() {
        let snapshot = Arc::new(TierSnapshot {
            tier: Tier::Raw,
            schema: RecordSchema::default(),
            thresholds: ValidationThresholds {
                rule_timeout_secs: 1,
                rule_max_attempts: 1,
                ..Default::default()
            },
            partitions: Vec::new(),
        });

        let report = evaluate(snapshot, &[Rule::new("slow", RuleCategory::Range, slow_rule)])
            .await
            .unwrap();

        assert_eq!(report.state, GateState::Failed);
        assert!(report.results[0].details.contains("Timed out"));
    }
}
