//! Test outcomes and session reporting
//!
//! Every descriptor submitted to a session ends in exactly one terminal
//! [`TestReport`], including descriptors that never ran.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::descriptor::TestId;

/// Why a test failed. Reporting-only: categories never change control flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Assertion,
    Timeout,
    NullReference,
    Setup,
    Teardown,
    Infrastructure,
    Unknown,
}

/// A categorized failure captured from a test body, hook, or fixture.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    pub category: FailureCategory,
    pub message: String,
}

impl TestFailure {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.category, self.message)
    }
}

/// Terminal outcome of one scheduled unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed(TestFailure),
    Skipped { reason: String },
    Cancelled,
    TimedOut,
}

impl Outcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Outcome::Passed)
    }

    /// Outcomes that a hard dependency treats as failure
    /// (Failed / TimedOut / Cancelled).
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_) | Outcome::TimedOut | Outcome::Cancelled)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Outcome::Passed => "✓",
            Outcome::Failed(_) => "✗",
            Outcome::Skipped { .. } => "○",
            Outcome::Cancelled => "⊘",
            Outcome::TimedOut => "⌛",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => write!(f, "PASS"),
            Outcome::Failed(failure) => write!(f, "FAIL {failure}"),
            Outcome::Skipped { reason } => write!(f, "SKIP ({reason})"),
            Outcome::Cancelled => write!(f, "CANCELLED"),
            Outcome::TimedOut => write!(f, "TIMEOUT"),
        }
    }
}

/// Result of one scheduled unit, as emitted to the host adapter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestReport {
    pub test_id: TestId,
    pub display_name: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    /// 1-based; greater than 1 only when retries ran.
    pub attempts: u32,
    /// Non-masking secondary failures: After-hook and teardown errors kept
    /// alongside the primary outcome.
    pub diagnostics: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TestReport {
    pub fn new(test_id: TestId, display_name: impl Into<String>, outcome: Outcome) -> Self {
        let now = Utc::now();
        Self {
            test_id,
            display_name: display_name.into(),
            outcome,
            duration_ms: 0,
            attempts: 1,
            diagnostics: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    /// Report for a unit that never entered `Running`.
    pub fn unscheduled(test_id: TestId, display_name: impl Into<String>, outcome: Outcome) -> Self {
        Self::new(test_id, display_name, outcome)
    }

    pub fn skipped(test_id: TestId, display_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            test_id,
            display_name,
            Outcome::Skipped {
                reason: reason.into(),
            },
        )
    }

    pub fn cancelled(test_id: TestId, display_name: impl Into<String>) -> Self {
        Self::new(test_id, display_name, Outcome::Cancelled)
    }
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}ms]",
            self.outcome.symbol(),
            self.display_name,
            self.duration_ms
        )?;
        if self.attempts > 1 {
            write!(f, " ({} attempts)", self.attempts)?;
        }
        match &self.outcome {
            Outcome::Failed(failure) => write!(f, " - {failure}")?,
            Outcome::Skipped { reason } => write!(f, " - {reason}")?,
            _ => {}
        }
        Ok(())
    }
}

/// Aggregated results of one session run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub timed_out: usize,
    pub total_duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reports: Vec<TestReport>,
}

impl SessionSummary {
    pub fn new(started_at: DateTime<Utc>, reports: Vec<TestReport>) -> Self {
        let total = reports.len();
        let passed = reports.iter().filter(|r| r.outcome.is_passed()).count();
        let failed = reports
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Failed(_)))
            .count();
        let skipped = reports
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Skipped { .. }))
            .count();
        let cancelled = reports
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Cancelled))
            .count();
        let timed_out = reports
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::TimedOut))
            .count();
        let total_duration_ms = reports.iter().map(|r| r.duration_ms).sum();

        Self {
            total,
            passed,
            failed,
            skipped,
            cancelled,
            timed_out,
            total_duration_ms,
            started_at,
            finished_at: Utc::now(),
            reports,
        }
    }

    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.passed as f64 / self.total as f64) * 100.0
        }
    }

    pub fn is_all_passed(&self) -> bool {
        self.passed == self.total
    }

    pub fn report_for(&self, test_id: &TestId) -> Option<&TestReport> {
        self.reports.iter().find(|r| &r.test_id == test_id)
    }
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        for report in &self.reports {
            writeln!(f, "  {report}")?;
        }
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(
            f,
            "Total: {} | Pass: {} | Fail: {} | Skip: {} | Cancelled: {} | Timeout: {}",
            self.total, self.passed, self.failed, self.skipped, self.cancelled, self.timed_out
        )?;
        writeln!(
            f,
            "Pass Rate: {:.1}% | Duration: {}ms",
            self.pass_rate(),
            self.total_duration_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, outcome: Outcome) -> TestReport {
        TestReport::new(TestId::new(name), name, outcome)
    }

    #[test]
    fn test_terminal_failure_classification() {
        assert!(Outcome::Failed(TestFailure::new(FailureCategory::Assertion, "x")).is_terminal_failure());
        assert!(Outcome::TimedOut.is_terminal_failure());
        assert!(Outcome::Cancelled.is_terminal_failure());
        assert!(!Outcome::Passed.is_terminal_failure());
        assert!(!Outcome::Skipped { reason: "dep".into() }.is_terminal_failure());
    }

    #[test]
    fn test_summary_counts() {
        let reports = vec![
            report("a", Outcome::Passed),
            report("b", Outcome::Failed(TestFailure::new(FailureCategory::Assertion, "boom"))),
            report("c", Outcome::Skipped { reason: "dependency failed".into() }),
            report("d", Outcome::Cancelled),
            report("e", Outcome::TimedOut),
        ];
        let summary = SessionSummary::new(Utc::now(), reports);
        assert_eq!(summary.total, 5);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.pass_rate(), 20.0);
    }

    #[test]
    fn test_report_lookup_by_id() {
        let summary = SessionSummary::new(Utc::now(), vec![report("a", Outcome::Passed)]);
        assert!(summary.report_for(&TestId::new("a")).is_some());
        assert!(summary.report_for(&TestId::new("missing")).is_none());
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(&Outcome::Skipped { reason: "dep".into() }).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "dep");
    }
}
