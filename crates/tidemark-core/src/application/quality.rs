use chrono::Utc;

use super::validation::rules;
use crate::domain::{
    QualityScore,
    QualityWeights,
    ValidationReport,
};

/// Raw measurements a quality score is computed from
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualityInputs {
    pub expected_rows: u64,
    pub actual_rows: u64,
    pub required_null_ratio: f64,
    pub out_of_range_ratio: f64,
    pub duplicate_ratio: f64,
    pub unexpected_category_ratio: f64,
    pub warning_failures: u32,
}

impl QualityInputs {
    /// Collects ratios from the cleaned gate and warnings from every gate
    pub fn from_reports(
        expected_rows: u64, actual_rows: u64, cleaned: &ValidationReport,
        gates: &[ValidationReport],
    ) -> Self {
        let ratio = |name: &str| {
            cleaned
                .result(name)
                .and_then(|r| r.affected_ratio)
                .unwrap_or(0.0)
        };

        Self {
            expected_rows,
            actual_rows,
            required_null_ratio: ratio(rules::COMPLETENESS_REQUIRED_NULLS),
            out_of_range_ratio: ratio(rules::RANGE_NUMERIC_BOUNDS),
            duplicate_ratio: ratio(rules::UNIQUENESS_IDENTIFIERS),
            unexpected_category_ratio: ratio(rules::UNIQUENESS_CATEGORIES),
            warning_failures: gates
                .iter()
                .map(|g| g.warning_failures().len() as u32)
                .sum(),
        }
    }
}

pub struct QualityScorer {
    weights: QualityWeights,
}

impl QualityScorer {
    pub fn new(weights: QualityWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &QualityWeights {
        &self.weights
    }

    pub fn score(&self, inputs: &QualityInputs) -> QualityScore {
        let row_ratio = if inputs.expected_rows == 0 {
            1.0
        } else {
            (inputs.actual_rows as f64 / inputs.expected_rows as f64).min(1.0)
        };

        let completeness = percent(row_ratio * (1.0 - unit(inputs.required_null_ratio)));
        let accuracy = percent(1.0 - unit(inputs.out_of_range_ratio));
        let consistency = percent(
            1.0 - unit(inputs.duplicate_ratio + inputs.unexpected_category_ratio),
        );

        let total = self.weights.total();
        let weighted = self.weights.completeness * completeness
            + self.weights.accuracy * accuracy
            + self.weights.consistency * consistency;
        let weighted = if total > 0.0 { weighted / total } else { 0.0 };
        let penalty = self.weights.warning_penalty * inputs.warning_failures as f64;

        QualityScore {
            completeness,
            accuracy,
            consistency,
            overall: (weighted - penalty).clamp(0.0, 100.0),
            warning_count: inputs.warning_failures,
            computed_at: Utc::now(),
        }
    }
}

fn unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn percent(value: f64) -> f64 {
    (100.0 * value).clamp(0.0, 100.0)
}
