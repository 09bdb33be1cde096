use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Raw,
    Cleaned,
    Aggregated,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Raw => "raw",
            Tier::Cleaned => "cleaned",
            Tier::Aggregated => "aggregated",
        }
    }

    pub fn next(&self) -> Option<Tier> {
        match self {
            Tier::Raw => Some(Tier::Cleaned),
            Tier::Cleaned => Some(Tier::Aggregated),
            Tier::Aggregated => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Tier::Raw),
            "cleaned" => Ok(Tier::Cleaned),
            "aggregated" => Ok(Tier::Aggregated),
            _ => Err(format!("Unknown tier: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Blocking,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Blocking => "BLOCKING",
        }
    }
}

/// Rule categories, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleCategory {
    Integrity,
    Schema,
    Completeness,
    Range,
    Uniqueness,
}

impl RuleCategory {
    pub const ORDERED: [RuleCategory; 5] = [
        RuleCategory::Integrity,
        RuleCategory::Schema,
        RuleCategory::Completeness,
        RuleCategory::Range,
        RuleCategory::Uniqueness,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCategory::Integrity => "integrity",
            RuleCategory::Schema => "schema",
            RuleCategory::Completeness => "completeness",
            RuleCategory::Range => "range",
            RuleCategory::Uniqueness => "uniqueness",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub tier: Tier,
    pub rule_name: String,
    pub category: RuleCategory,
    pub passed: bool,
    pub severity: Severity,
    pub details: String,
    /// Fraction of rows affected by the rule, when the rule is row-based
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_ratio: Option<f64>,
}

impl ValidationResult {
    pub fn pass(
        tier: Tier, category: RuleCategory, rule_name: impl Into<String>, details: impl Into<String>,
    ) -> Self {
        Self {
            tier,
            rule_name: rule_name.into(),
            category,
            passed: true,
            severity: Severity::Info,
            details: details.into(),
            affected_ratio: None,
        }
    }

    pub fn fail(
        tier: Tier, category: RuleCategory, rule_name: impl Into<String>, severity: Severity,
        details: impl Into<String>,
    ) -> Self {
        Self {
            tier,
            rule_name: rule_name.into(),
            category,
            passed: false,
            severity,
            details: details.into(),
            affected_ratio: None,
        }
    }

    pub fn with_ratio(mut self, ratio: f64) -> Self {
        self.affected_ratio = Some(ratio);
        self
    }

    pub fn is_blocking_failure(&self) -> bool {
        !self.passed && self.severity == Severity::Blocking
    }

    pub fn is_warning_failure(&self) -> bool {
        !self.passed && self.severity == Severity::Warning
    }
}

/// Tier transition state: `Pending -> Running -> {Passed, Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GateState {
    Pending,
    Running,
    Passed,
    Failed,
}

impl GateState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GateState::Passed | GateState::Failed)
    }

    pub fn can_transition_to(&self, next: GateState) -> bool {
        matches!(
            (self, next),
            (GateState::Pending, GateState::Running)
                | (GateState::Running, GateState::Passed)
                | (GateState::Running, GateState::Failed)
                | (GateState::Failed, GateState::Running)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub tier: Tier,
    pub state: GateState,
    pub results: Vec<ValidationResult>,
    pub rows_checked: u64,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ValidationReport {
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            state: GateState::Pending,
            results: Vec::new(),
            rows_checked: 0,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn passed(&self) -> bool {
        self.state == GateState::Passed
    }

    pub fn blocking_failures(&self) -> Vec<&ValidationResult> {
        self.results
            .iter()
            .filter(|r| r.is_blocking_failure())
            .collect()
    }

    pub fn warning_failures(&self) -> Vec<&ValidationResult> {
        self.results
            .iter()
            .filter(|r| r.is_warning_failure())
            .collect()
    }

    pub fn blocking_rule_names(&self) -> Vec<String> {
        self.blocking_failures()
            .into_iter()
            .map(|r| r.rule_name.clone())
            .collect()
    }

    pub fn result(&self, rule_name: &str) -> Option<&ValidationResult> {
        self.results.iter().find(|r| r.rule_name == rule_name)
    }
}

/// Tolerances applied by the validation engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationThresholds {
    /// Allowed relative deviation between actual and expected row counts
    #[serde(default = "default_count_tolerance")]
    pub count_tolerance: f64,
    /// Maximum fraction of rows with a null required field
    #[serde(default = "default_null_threshold")]
    pub null_threshold: f64,
    /// Maximum fraction of rows with an out-of-range numeric field
    #[serde(default = "default_range_tolerance")]
    pub range_tolerance: f64,
    /// Maximum fraction of rows whose required field has the wrong type
    #[serde(default)]
    pub type_mismatch_tolerance: f64,
    #[serde(default = "default_rule_timeout_secs")]
    pub rule_timeout_secs: u64,
    #[serde(default = "default_rule_max_attempts")]
    pub rule_max_attempts: u32,
}

pub(crate) const DEFAULT_COUNT_TOLERANCE: f64 = 0.05;

pub(crate) const DEFAULT_NULL_THRESHOLD: f64 = 0.001;

pub(crate) const DEFAULT_RANGE_TOLERANCE: f64 = 0.001;

fn default_count_tolerance() -> f64 {
    DEFAULT_COUNT_TOLERANCE
}

fn default_null_threshold() -> f64 {
    DEFAULT_NULL_THRESHOLD
}

fn default_range_tolerance() -> f64 {
    DEFAULT_RANGE_TOLERANCE
}

fn default_rule_timeout_secs() -> u64 {
    30
}

fn default_rule_max_attempts() -> u32 {
    2
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            count_tolerance: default_count_tolerance(),
            null_threshold: default_null_threshold(),
            range_tolerance: default_range_tolerance(),
            type_mismatch_tolerance: 0.0,
            rule_timeout_secs: default_rule_timeout_secs(),
            rule_max_attempts: default_rule_max_attempts(),
        }
    }
}

/// Per-source overrides; unset fields inherit the global thresholds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationOverrides {
    pub count_tolerance: Option<f64>,
    pub null_threshold: Option<f64>,
    pub range_tolerance: Option<f64>,
    pub type_mismatch_tolerance: Option<f64>,
}

impl ValidationThresholds {
    pub fn merged(&self, overrides: &ValidationOverrides) -> Self {
        Self {
            count_tolerance: overrides.count_tolerance.unwrap_or(self.count_tolerance),
            null_threshold: overrides.null_threshold.unwrap_or(self.null_threshold),
            range_tolerance: overrides.range_tolerance.unwrap_or(self.range_tolerance),
            type_mismatch_tolerance: overrides
                .type_mismatch_tolerance
                .unwrap_or(self.type_mismatch_tolerance),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_transitions() {
        assert!(GateState::Pending.can_transition_to(GateState::Running));
        assert!(GateState::Running.can_transition_to(GateState::Failed));
        assert!(GateState::Failed.can_transition_to(GateState::Running));
        assert!(!GateState::Pending.can_transition_to(GateState::Passed));
        assert!(!GateState::Passed.can_transition_to(GateState::Running));
    }

    #[test]
    fn test_thresholds_merge_overrides() {
        let global = ValidationThresholds::default();
        let merged = global.merged(&ValidationOverrides {
            count_tolerance: Some(0.1),
            ..Default::default()
        });

        assert_eq!(merged.count_tolerance, 0.1);
        assert_eq!(merged.null_threshold, DEFAULT_NULL_THRESHOLD);
    }

    #[test]
    fn test_severity_serialization() {
        let json = serde_json::to_string(&Severity::Blocking).unwrap();
        assert_eq!(json, "\"BLOCKING\"");
        assert!(Severity::Blocking > Severity::Warning);
    }
}
