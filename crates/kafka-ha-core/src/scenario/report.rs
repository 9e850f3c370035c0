//! Step-by-step record of a scenario run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::Scenario;
use crate::checker::ConsistencyResult;
use crate::model::{OffsetSnapshot, TopicDescription, WriteSessionReport};

/// One step of a scenario run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    StartWrites,
    Settle,
    Baseline,
    ExtendBackoff,
    Perturb,
    OutageWindow,
    OutageCheck,
    ResumeOffsets,
    ProgressWindow,
    ProgressCheck,
    Revert,
    RecoveryWindow,
    RecoveryCheck,
    StopWrites,
    Consistency,
    Release,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::StartWrites => "start writes",
            Step::Settle => "settle",
            Step::Baseline => "baseline",
            Step::ExtendBackoff => "extend restart backoff",
            Step::Perturb => "perturb",
            Step::OutageWindow => "outage window",
            Step::OutageCheck => "outage check",
            Step::ResumeOffsets => "resume offsets",
            Step::ProgressWindow => "progress window",
            Step::ProgressCheck => "progress check",
            Step::Revert => "revert",
            Step::RecoveryWindow => "recovery window",
            Step::RecoveryCheck => "recovery check",
            Step::StopWrites => "stop writes",
            Step::Consistency => "consistency",
            Step::Release => "release",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: Step,
    pub passed: bool,
    /// Milliseconds since the scenario started
    pub at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Outcome of one scenario run, including what was last observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub passed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
    pub failed_step: Option<Step>,
    pub error: Option<String>,
    pub baseline: Option<TopicDescription>,
    pub last_description: Option<TopicDescription>,
    /// Taken at the baseline, before any perturbation
    pub initial_offsets: Option<OffsetSnapshot>,
    /// Taken once the outage has taken hold; later progress is measured from here
    #[serde(default)]
    pub resumed_offsets: Option<OffsetSnapshot>,
    pub last_offsets: Option<OffsetSnapshot>,
    pub write_report: Option<WriteSessionReport>,
    pub consistency: Option<ConsistencyResult>,
}

impl ScenarioReport {
    pub(crate) fn new(scenario: Scenario) -> Self {
        let now = Utc::now();
        Self {
            scenario,
            passed: false,
            started_at: now,
            finished_at: now,
            steps: Vec::new(),
            failed_step: None,
            error: None,
            baseline: None,
            last_description: None,
            initial_offsets: None,
            resumed_offsets: None,
            last_offsets: None,
            write_report: None,
            consistency: None,
        }
    }

    /// One-line outcome, e.g. for a terminal summary.
    pub fn summary(&self) -> String {
        match (&self.failed_step, &self.error) {
            (Some(step), Some(error)) => {
                format!("{}: FAILED at {}: {}", self.scenario, step, error)
            }
            _ if self.passed => {
                let acked = self
                    .write_report
                    .as_ref()
                    .map_or(0, WriteSessionReport::records_acked);
                format!("{}: passed ({} records acked)", self.scenario, acked)
            }
            _ => format!("{}: FAILED", self.scenario),
        }
    }
}
