use std::sync::Arc;

use chrono::Utc;

use super::writer::TieredWriter;
use crate::domain::{
    AnomalyKind,
    AnomalyRecord,
    AnomalySettings,
    AnomalySeverity,
    DailyAggregate,
    DomainResult,
};

const ROW_COUNT_METRIC: &str = "row_count";

/// Flags unusual days in the aggregated tier
///
/// Detection never blocks a run; findings are only reported.
pub struct AnomalyDetector {
    writer: Arc<TieredWriter>,
}

impl AnomalyDetector {
    pub fn new(writer: Arc<TieredWriter>) -> Self {
        Self { writer }
    }

    pub async fn detect(
        &self, today: &DailyAggregate, settings: &AnomalySettings,
    ) -> DomainResult<Vec<AnomalyRecord>> {
        let baseline = self
            .writer
            .baseline_aggregates(&today.source_id, today.date, settings.baseline_days)
            .await?;

        let mut anomalies = Vec::new();
        if let Some(volume) = detect_volume(today, &baseline, settings) {
            anomalies.push(volume);
        }

        let yesterday = today
            .date
            .pred_opt()
            .and_then(|d| baseline.iter().find(|a| a.date == d));
        match yesterday {
            Some(previous) => anomalies.extend(detect_distribution(today, previous, settings)),
            None => tracing::debug!(
                source_id = %today.source_id,
                date = %today.date,
                "No previous day aggregate, skipping distribution check"
            ),
        }

        Ok(anomalies)
    }
}

fn mean_and_stddev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// z-score of today's row count against the baseline days
pub fn detect_volume(
    today: &DailyAggregate, baseline: &[DailyAggregate], settings: &AnomalySettings,
) -> Option<AnomalyRecord> {
    if baseline.len() < settings.min_baseline_days {
        tracing::debug!(
            source_id = %today.source_id,
            baseline_days = baseline.len(),
            required = settings.min_baseline_days,
            "Baseline too short for volume detection"
        );
        return None;
    }

    let counts: Vec<f64> = baseline.iter().map(|a| a.row_count as f64).collect();
    let (mean, stddev) = mean_and_stddev(&counts);
    if stddev <= f64::EPSILON {
        return None;
    }

    let observed = today.row_count as f64;
    let z_score = (observed - mean) / stddev;
    if z_score.abs() <= settings.z_threshold {
        return None;
    }

    let severity = if z_score.abs() > settings.z_high_threshold {
        AnomalySeverity::High
    } else {
        AnomalySeverity::Medium
    };

    Some(AnomalyRecord {
        source_id: today.source_id.clone(),
        date: today.date,
        kind: AnomalyKind::Volume,
        metric_name: ROW_COUNT_METRIC.to_string(),
        observed_value: observed,
        baseline_mean: mean,
        baseline_stddev: stddev,
        z_score,
        distance: None,
        severity,
        detected_at: Utc::now(),
    })
}

/// Two-sample Kolmogorov-Smirnov statistic of two ascending samples
pub fn ks_statistic(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let (n, m) = (a.len() as f64, b.len() as f64);
    let (mut i, mut j) = (0, 0);
    let mut statistic: f64 = 0.0;

    while i < a.len() && j < b.len() {
        let x = a[i].min(b[j]);
        while i < a.len() && a[i] <= x {
            i += 1;
        }
        while j < b.len() && b[j] <= x {
            j += 1;
        }
        statistic = statistic.max((i as f64 / n - j as f64 / m).abs());
    }
    statistic
}

/// Compares each metric's distribution with the previous day's
pub fn detect_distribution(
    today: &DailyAggregate, previous: &DailyAggregate, settings: &AnomalySettings,
) -> Vec<AnomalyRecord> {
    let metrics: Vec<&String> = if settings.metrics.is_empty() {
        today.distributions.keys().collect()
    } else {
        settings.metrics.iter().collect()
    };

    metrics
        .into_iter()
        .filter_map(|metric| {
            let current = today.distribution(metric)?;
            let prior = previous.distribution(metric)?;
            if current.is_empty() || prior.is_empty() {
                return None;
            }

            let distance = ks_statistic(current, prior);
            let similarity = 1.0 - distance;
            if similarity >= settings.similarity_floor {
                return None;
            }

            let (observed, _) = mean_and_stddev(current);
            let (baseline_mean, baseline_stddev) = mean_and_stddev(prior);
            let z_score = if baseline_stddev > f64::EPSILON {
                (observed - baseline_mean) / baseline_stddev
            } else {
                0.0
            };
            let severity = if distance >= settings.distance_high_threshold {
                AnomalySeverity::High
            } else {
                AnomalySeverity::Medium
            };

            Some(AnomalyRecord {
                source_id: today.source_id.clone(),
                date: today.date,
                kind: AnomalyKind::Distribution,
                metric_name: metric.clone(),
                observed_value: observed,
                baseline_mean,
                baseline_stddev,
                z_score,
                distance: Some(distance),
                severity,
                detected_at: Utc::now(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{
        Duration,
        NaiveDate,
    };

    use super::*;
    use crate::domain::{
        GroupSummary,
        PipelineSettings,
    };
    use crate::infrastructure::MemoryObjectSink;

    fn day(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 31).unwrap() + Duration::days(offset)
    }

    fn aggregate(date: NaiveDate, rows: u64, latency: Vec<f64>) -> DailyAggregate {
        let mut distributions = BTreeMap::new();
        distributions.insert("latency_ms".to_string(), latency);
        DailyAggregate {
            source_id: "orders".to_string(),
            date,
            row_count: rows,
            totals: GroupSummary {
                row_count: rows,
                ..Default::default()
            },
            groups: BTreeMap::new(),
            distributions,
        }
    }

    fn baseline() -> Vec<DailyAggregate> {
        (1..=30)
            .map(|i| {
                let rows = if i % 2 == 0 { 1_250_000 } else { 1_150_000 };
                aggregate(day(-i), rows, vec![1.0, 2.0, 3.0])
            })
            .rev()
            .collect()
    }

    #[test]
    fn test_volume_drop_is_high_severity() {
        let today = aggregate(day(0), 500_000, vec![]);

        let anomaly = detect_volume(&today, &baseline(), &AnomalySettings::default()).unwrap();

        assert_eq!(anomaly.kind, AnomalyKind::Volume);
        assert_eq!(anomaly.severity, AnomalySeverity::High);
        assert_eq!(anomaly.baseline_mean, 1_200_000.0);
        assert_eq!(anomaly.baseline_stddev, 50_000.0);
        assert!((anomaly.z_score + 14.0).abs() < 1e-9);
    }

    #[test]
    fn test_volume_thresholds() {
        let settings = AnomalySettings::default();

        let normal = aggregate(day(0), 1_290_000, vec![]);
        assert!(detect_volume(&normal, &baseline(), &settings).is_none());

        let medium = aggregate(day(0), 1_330_000, vec![]);
        let anomaly = detect_volume(&medium, &baseline(), &settings).unwrap();
        assert_eq!(anomaly.severity, AnomalySeverity::Medium);
    }

    #[test]
    fn test_volume_needs_enough_baseline() {
        let short: Vec<_> = baseline().into_iter().take(3).collect();
        let today = aggregate(day(0), 10, vec![]);
        assert!(detect_volume(&today, &short, &AnomalySettings::default()).is_none());

        let flat: Vec<_> = (1..=10)
            .map(|i| aggregate(day(-i), 100, vec![]))
            .collect();
        assert!(detect_volume(&today, &flat, &AnomalySettings::default()).is_none());
    }

    #[test]
    fn test_ks_statistic() {
        let a: Vec<f64> = (0..100).map(|v| v as f64).collect();
        assert_eq!(ks_statistic(&a, &a), 0.0);

        let shifted: Vec<f64> = (50..150).map(|v| v as f64).collect();
        assert!((ks_statistic(&a, &shifted) - 0.5).abs() < 1e-9);

        let disjoint: Vec<f64> = (1_000..1_100).map(|v| v as f64).collect();
        assert_eq!(ks_statistic(&a, &disjoint), 1.0);
    }

    #[test]
    fn test_distribution_shift_flagged() {
        let previous = aggregate(day(-1), 100, (0..100).map(|v| v as f64).collect());
        let settings = AnomalySettings::default();

        let similar = aggregate(day(0), 100, (10..110).map(|v| v as f64).collect());
        assert!(detect_distribution(&similar, &previous, &settings).is_empty());

        let moderate = aggregate(day(0), 100, (30..130).map(|v| v as f64).collect());
        let found = detect_distribution(&moderate, &previous, &settings);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].severity, AnomalySeverity::Medium);

        let shifted = aggregate(day(0), 100, (60..160).map(|v| v as f64).collect());
        let found = detect_distribution(&shifted, &previous, &settings);
        assert_eq!(found[0].severity, AnomalySeverity::High);
        assert_eq!(found[0].metric_name, "latency_ms");
        assert!(found[0].distance.unwrap() > 0.5);
    }

    #[tokio::test]
    async fn test_detect_reads_baseline_from_aggregated_tier() {
        let sink = Arc::new(MemoryObjectSink::new());
        let writer = Arc::new(TieredWriter::new(sink, &PipelineSettings::default()));
        for previous in baseline() {
            writer.store_aggregate(&previous, None).await.unwrap();
        }
        let detector = AnomalyDetector::new(writer);

        let today = aggregate(day(0), 500_000, vec![40.0, 50.0, 60.0]);
        let anomalies = detector
            .detect(&today, &AnomalySettings::default())
            .await
            .unwrap();

        assert!(anomalies.iter().any(|a| a.kind == AnomalyKind::Volume));
        assert!(anomalies
            .iter()
            .any(|a| a.kind == AnomalyKind::Distribution && a.severity == AnomalySeverity::High));
    }
}
