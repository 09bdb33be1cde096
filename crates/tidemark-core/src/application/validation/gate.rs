use chrono::Utc;

use crate::domain::{
    DomainError,
    DomainResult,
    GateState,
    Tier,
    ValidationReport,
    ValidationResult,
};

/// Tracks one tier transition through `Pending -> Running -> {Passed, Failed}`
///
/// A failed gate may be started again; each start counts as an attempt and
/// clears the previous attempt's results.
#[derive(Debug, Clone)]
pub struct ValidationGate {
    report: ValidationReport,
}

impl ValidationGate {
    pub fn new(tier: Tier) -> Self {
        Self {
            report: ValidationReport::new(tier),
        }
    }

    pub fn state(&self) -> GateState {
        self.report.state
    }

    pub fn report(&self) -> &ValidationReport {
        &self.report
    }

    pub fn into_report(self) -> ValidationReport {
        self.report
    }

    pub fn start(&mut self, rows_checked: u64) -> DomainResult<()> {
        self.transition(GateState::Running)?;
        self.report.attempts += 1;
        self.report.results.clear();
        self.report.rows_checked = rows_checked;
        self.report.started_at = Some(Utc::now());
        self.report.finished_at = None;
        Ok(())
    }

    pub fn record(&mut self, result: ValidationResult) -> DomainResult<()> {
        if self.report.state != GateState::Running {
            return Err(DomainError::InternalError(format!(
                "Cannot record {} on a {:?} gate",
                result.rule_name, self.report.state
            )));
        }
        self.report.results.push(result);
        Ok(())
    }

    /// Settles the gate: any BLOCKING failure fails it
    pub fn finish(&mut self) -> DomainResult<GateState> {
        let next = if self.report.results.iter().any(|r| r.is_blocking_failure()) {
            GateState::Failed
        } else {
            GateState::Passed
        };
        self.transition(next)?;
        self.report.finished_at = Some(Utc::now());
        Ok(next)
    }

    fn transition(&mut self, next: GateState) -> DomainResult<()> {
        if !self.report.state.can_transition_to(next) {
            return Err(DomainError::InternalError(format!(
                "Illegal {} gate transition {:?} -> {:?}",
                self.report.tier, self.report.state, next
            )));
        }
        tracing::trace!(
            tier = %self.report.tier,
            from = ?self.report.state,
            to = ?next,
            "Gate transition"
        );
        self.report.state = next;
        Ok(())
    }
}
