use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{
    Deserialize,
    Serialize,
};

pub const ERROR_RATE_METRIC: &str = "error_rate";

pub const UNKNOWN_DIMENSION: &str = "(none)";

pub(crate) const MAX_DISTRIBUTION_POINTS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl MetricSummary {
    /// Summarizes `values`; returns `None` when there is nothing to summarize
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();

        Some(Self {
            count: count as u64,
            min: sorted[0],
            max: sorted[count - 1],
            mean: sum / count as f64,
            p50: percentile(&sorted, 50.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
        })
    }
}

/// Nearest-rank percentile over an ascending, non-empty slice
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Evenly spaced quantile points of an ascending slice, at most `max_points`
pub fn downsample_sorted(sorted: &[f64], max_points: usize) -> Vec<f64> {
    if sorted.len() <= max_points || max_points < 2 {
        return sorted.to_vec();
    }
    let last = (sorted.len() - 1) as f64;
    (0..max_points)
        .map(|i| {
            let idx = (i as f64 * last / (max_points - 1) as f64).round() as usize;
            sorted[idx]
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub row_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricSummary>,
}

/// Compact per-date summary written to the aggregated tier
///
/// Contains no wall-clock timestamps so that re-aggregating the same cleaned
/// partition yields identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub source_id: String,
    pub date: NaiveDate,
    pub row_count: u64,
    pub totals: GroupSummary,
    #[serde(default)]
    pub groups: BTreeMap<String, GroupSummary>,
    /// Sorted sample of each numeric metric, used for distribution comparison
    #[serde(default)]
    pub distributions: BTreeMap<String, Vec<f64>>,
}

impl DailyAggregate {
    pub fn distribution(&self, metric: &str) -> Option<&[f64]> {
        self.distributions.get(metric).map(Vec::as_slice)
    }
}
