//! Post-run verification of a write session against offset snapshots.
//!
//! Checks never stop at the first failure: every violated invariant is
//! collected with the data that broke it (partition, sequence, replica set)
//! so a failed run can be diagnosed from the report alone.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use tracing::{info, warn};

use crate::model::{OffsetSnapshot, ReplicaId, TopicDescription, WriteSessionReport};
use crate::{Error, Result};

/// Upper bound on sequences listed in one violation.
const MAX_LISTED: usize = 20;

/// How many failed records a run may write off before it is judged failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TolerancePolicy {
    /// Records that failed before reaching a broker; `None` means unlimited
    pub max_send_errors: Option<usize>,

    /// Records whose acknowledgement failed or timed out; `None` means unlimited
    pub max_ack_errors: Option<usize>,

    /// Every partition's high-water mark must move forward
    pub require_progress: bool,

    /// A sequence stored more than once is acceptable (at-least-once delivery)
    pub allow_log_duplicates: bool,
}

impl Default for TolerancePolicy {
    fn default() -> Self {
        Self {
            max_send_errors: Some(100),
            max_ack_errors: Some(100),
            require_progress: true,
            allow_log_duplicates: true,
        }
    }
}

impl TolerancePolicy {
    /// No failed record of any kind and no duplicates in the log.
    pub fn strict() -> Self {
        Self {
            max_send_errors: Some(0),
            max_ack_errors: Some(0),
            require_progress: true,
            allow_log_duplicates: false,
        }
    }
}

/// One broken invariant, with the data needed to diagnose it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "invariant", rename_all = "snake_case")]
pub enum Violation {
    OffsetRegressed { partition: usize, pre: i64, post: i64 },
    NoProgress { partition: usize, offset: i64 },
    PartitionCountChanged { pre: usize, post: usize },
    AckedNotIncreasing { first: Option<u64>, last: Option<u64> },
    DuplicateAck { sequence: u64 },
    AckOutOfOrder { previous: u64, sequence: u64 },
    AckedBeyondSent { last_acked: u64, last_sent: Option<u64> },
    UnaccountedSequence { count: usize, sequences: Vec<u64> },
    SendErrorsExceeded { count: usize, limit: usize },
    AckErrorsExceeded { count: usize, limit: usize },
    MissingAcknowledged { count: usize, sequences: Vec<u64> },
    DuplicateInLog { count: usize, sequences: Vec<u64> },
    IsrMismatch { expected: BTreeSet<ReplicaId>, actual: BTreeSet<ReplicaId> },
    LeaderUnchanged { leader: ReplicaId },
    LeaderMissing,
}

impl Violation {
    /// Short name of the invariant, stable across releases.
    pub fn invariant(&self) -> &'static str {
        match self {
            Violation::OffsetRegressed { .. } => "offset_regressed",
            Violation::NoProgress { .. } => "no_progress",
            Violation::PartitionCountChanged { .. } => "partition_count_changed",
            Violation::AckedNotIncreasing { .. } => "acked_not_increasing",
            Violation::DuplicateAck { .. } => "duplicate_ack",
            Violation::AckOutOfOrder { .. } => "ack_out_of_order",
            Violation::AckedBeyondSent { .. } => "acked_beyond_sent",
            Violation::UnaccountedSequence { .. } => "unaccounted_sequence",
            Violation::SendErrorsExceeded { .. } => "send_errors_exceeded",
            Violation::AckErrorsExceeded { .. } => "ack_errors_exceeded",
            Violation::MissingAcknowledged { .. } => "missing_acknowledged",
            Violation::DuplicateInLog { .. } => "duplicate_in_log",
            Violation::IsrMismatch { .. } => "isr_mismatch",
            Violation::LeaderUnchanged { .. } => "leader_unchanged",
            Violation::LeaderMissing => "leader_missing",
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::OffsetRegressed {
                partition,
                pre,
                post,
            } => write!(f, "partition {} went back from {} to {}", partition, pre, post),
            Violation::NoProgress { partition, offset } => {
                write!(f, "partition {} stayed at offset {}", partition, offset)
            }
            Violation::PartitionCountChanged { pre, post } => {
                write!(f, "partition count changed from {} to {}", pre, post)
            }
            Violation::AckedNotIncreasing { first, last } => write!(
                f,
                "last acked sequence {:?} did not advance past first acked {:?}",
                last, first
            ),
            Violation::DuplicateAck { sequence } => {
                write!(f, "sequence {} acknowledged twice", sequence)
            }
            Violation::AckOutOfOrder { previous, sequence } => write!(
                f,
                "sequence {} acknowledged after {}",
                sequence, previous
            ),
            Violation::AckedBeyondSent {
                last_acked,
                last_sent,
            } => write!(
                f,
                "acked sequence {} beyond last sent {:?}",
                last_acked, last_sent
            ),
            Violation::UnaccountedSequence { count, sequences } => write!(
                f,
                "{} sequences neither acked nor failed: {:?}",
                count, sequences
            ),
            Violation::SendErrorsExceeded { count, limit } => {
                write!(f, "{} send errors, tolerance {}", count, limit)
            }
            Violation::AckErrorsExceeded { count, limit } => {
                write!(f, "{} ack errors, tolerance {}", count, limit)
            }
            Violation::MissingAcknowledged { count, sequences } => write!(
                f,
                "{} acknowledged sequences missing from the log: {:?}",
                count, sequences
            ),
            Violation::DuplicateInLog { count, sequences } => write!(
                f,
                "{} sequences stored more than once: {:?}",
                count, sequences
            ),
            Violation::IsrMismatch { expected, actual } => {
                write!(f, "ISR is {:?}, expected {:?}", actual, expected)
            }
            Violation::LeaderUnchanged { leader } => {
                write!(f, "leader is still {}", leader)
            }
            Violation::LeaderMissing => write!(f, "topic has no leader"),
        }
    }
}

/// Outcome of a check: passed, or every invariant that did not hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyResult {
    pub passed: bool,
    pub violations: Vec<Violation>,
}

impl ConsistencyResult {
    pub fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    /// Convert a failed result into `Error::ConsistencyViolation`.
    ///
    /// The error names the first broken invariant and lists all of them.
    pub fn into_result(self) -> Result<()> {
        match self.violations.first() {
            None => Ok(()),
            Some(first) => {
                let detail = self
                    .violations
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(Error::violation(first.invariant(), detail))
            }
        }
    }
}

/// Verifies write-session reports and offset snapshots against a tolerance policy.
#[derive(Debug, Clone, Default)]
pub struct ConsistencyChecker {
    policy: TolerancePolicy,
}

impl ConsistencyChecker {
    pub fn new(policy: TolerancePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &TolerancePolicy {
        &self.policy
    }

    /// Check a finished session against the offsets taken before and after it.
    pub fn check(
        &self,
        report: &WriteSessionReport,
        pre: &OffsetSnapshot,
        post: &OffsetSnapshot,
    ) -> ConsistencyResult {
        let mut violations = offset_violations(pre, post, self.policy.require_progress);
        violations.extend(self.report_violations(report));
        self.finish(&report.topic, violations)
    }

    /// [`check`](Self::check) plus an audit of the records read back from the topic.
    pub fn check_with_read_back(
        &self,
        report: &WriteSessionReport,
        pre: &OffsetSnapshot,
        post: &OffsetSnapshot,
        log: &[u64],
    ) -> ConsistencyResult {
        let mut violations = offset_violations(pre, post, self.policy.require_progress);
        violations.extend(self.report_violations(report));
        violations.extend(self.log_violations(report, log));
        self.finish(&report.topic, violations)
    }

    /// Offsets taken mid-scenario must have moved past `pre` on every partition.
    ///
    /// Unlike [`ConsistencyChecker::check`] this ignores `require_progress`:
    /// writes resuming after a perturbation is what a scenario asserts.
    pub fn expect_progress(&self, pre: &OffsetSnapshot, post: &OffsetSnapshot) -> ConsistencyResult {
        ConsistencyResult::from_violations(offset_violations(pre, post, true))
    }

    /// Offsets must not have moved backwards from `pre`; standing still is fine.
    pub fn expect_retained(&self, pre: &OffsetSnapshot, post: &OffsetSnapshot) -> ConsistencyResult {
        ConsistencyResult::from_violations(offset_violations(pre, post, false))
    }

    /// ISR during an outage must be the full set minus the perturbed replica.
    ///
    /// With `expect_leader_change` the leader must also have moved off `target`.
    pub fn expect_outage(
        &self,
        full_replicas: &BTreeSet<ReplicaId>,
        target: ReplicaId,
        current: &TopicDescription,
        expect_leader_change: bool,
    ) -> ConsistencyResult {
        let mut expected = full_replicas.clone();
        expected.remove(&target);

        let mut violations = Vec::new();
        if current.in_sync_replicas != expected {
            violations.push(Violation::IsrMismatch {
                expected,
                actual: current.in_sync_replicas.clone(),
            });
        }
        if expect_leader_change {
            match current.leader {
                None => violations.push(Violation::LeaderMissing),
                Some(leader) if leader == target => {
                    violations.push(Violation::LeaderUnchanged { leader })
                }
                Some(_) => {}
            }
        }
        ConsistencyResult::from_violations(violations)
    }

    /// After recovery the ISR is whole again and the topic has a leader.
    ///
    /// With `previous_leader` set the leader must differ from it.
    pub fn expect_recovered(
        &self,
        full_replicas: &BTreeSet<ReplicaId>,
        current: &TopicDescription,
        previous_leader: Option<ReplicaId>,
    ) -> ConsistencyResult {
        let mut violations = Vec::new();
        if &current.in_sync_replicas != full_replicas {
            violations.push(Violation::IsrMismatch {
                expected: full_replicas.clone(),
                actual: current.in_sync_replicas.clone(),
            });
        }
        match (current.leader, previous_leader) {
            (None, _) => violations.push(Violation::LeaderMissing),
            (Some(leader), Some(previous)) if leader == previous => {
                violations.push(Violation::LeaderUnchanged { leader })
            }
            _ => {}
        }
        ConsistencyResult::from_violations(violations)
    }

    fn report_violations(&self, report: &WriteSessionReport) -> Vec<Violation> {
        let mut violations = Vec::new();

        match (report.first_acked_sequence, report.last_acked_sequence) {
            (Some(first), Some(last)) if last > first => {}
            (first, last) => violations.push(Violation::AckedNotIncreasing { first, last }),
        }

        if let Some(last_acked) = report.last_acked_sequence {
            if report.last_sent_sequence.map_or(true, |sent| last_acked > sent) {
                violations.push(Violation::AckedBeyondSent {
                    last_acked,
                    last_sent: report.last_sent_sequence,
                });
            }
        }

        let mut seen = HashSet::with_capacity(report.acked_sequences.len());
        let mut previous: Option<u64> = None;
        for &sequence in &report.acked_sequences {
            if !seen.insert(sequence) {
                violations.push(Violation::DuplicateAck { sequence });
            } else if let Some(previous) = previous.filter(|&p| sequence < p) {
                violations.push(Violation::AckOutOfOrder { previous, sequence });
            }
            previous = Some(previous.map_or(sequence, |p| p.max(sequence)));
        }

        if let Some(last_sent) = report.last_sent_sequence {
            let failed: HashSet<u64> = report
                .send_errors
                .iter()
                .chain(&report.ack_errors)
                .map(|f| f.sequence)
                .collect();
            let unaccounted: Vec<u64> = (0..=last_sent)
                .filter(|s| !seen.contains(s) && !failed.contains(s))
                .collect();
            if !unaccounted.is_empty() {
                violations.push(Violation::UnaccountedSequence {
                    count: unaccounted.len(),
                    sequences: unaccounted.into_iter().take(MAX_LISTED).collect(),
                });
            }
        }

        let send_errors = report.counted_send_errors();
        if let Some(limit) = self.policy.max_send_errors.filter(|&l| send_errors > l) {
            violations.push(Violation::SendErrorsExceeded {
                count: send_errors,
                limit,
            });
        }
        let ack_errors = report.counted_ack_errors();
        if let Some(limit) = self.policy.max_ack_errors.filter(|&l| ack_errors > l) {
            violations.push(Violation::AckErrorsExceeded {
                count: ack_errors,
                limit,
            });
        }

        violations
    }

    fn log_violations(&self, report: &WriteSessionReport, log: &[u64]) -> Vec<Violation> {
        let mut counts: BTreeMap<u64, usize> = BTreeMap::new();
        for &sequence in log {
            *counts.entry(sequence).or_default() += 1;
        }

        let mut violations = Vec::new();
        let missing: Vec<u64> = report
            .acked_sequences
            .iter()
            .copied()
            .filter(|s| !counts.contains_key(s))
            .collect();
        if !missing.is_empty() {
            violations.push(Violation::MissingAcknowledged {
                count: missing.len(),
                sequences: missing.into_iter().take(MAX_LISTED).collect(),
            });
        }

        if !self.policy.allow_log_duplicates {
            let duplicated: Vec<u64> = counts
                .iter()
                .filter(|(_, &n)| n > 1)
                .map(|(&s, _)| s)
                .collect();
            if !duplicated.is_empty() {
                violations.push(Violation::DuplicateInLog {
                    count: duplicated.len(),
                    sequences: duplicated.into_iter().take(MAX_LISTED).collect(),
                });
            }
        }
        violations
    }

    fn finish(&self, topic: &str, violations: Vec<Violation>) -> ConsistencyResult {
        if violations.is_empty() {
            info!("Consistency check passed for {}", topic);
        } else {
            for violation in &violations {
                warn!(
                    "Consistency violation on {} ({}): {}",
                    topic,
                    violation.invariant(),
                    violation
                );
            }
        }
        ConsistencyResult::from_violations(violations)
    }
}

fn offset_violations(
    pre: &OffsetSnapshot,
    post: &OffsetSnapshot,
    require_progress: bool,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    if pre.len() != post.len() {
        violations.push(Violation::PartitionCountChanged {
            pre: pre.len(),
            post: post.len(),
        });
    }

    for (partition, (&pre, &post)) in pre
        .as_slice()
        .iter()
        .zip(post.as_slice())
        .enumerate()
    {
        if post < pre {
            violations.push(Violation::OffsetRegressed {
                partition,
                pre,
                post,
            });
        } else if post == pre && require_progress {
            violations.push(Violation::NoProgress {
                partition,
                offset: post,
            });
        }
    }
    violations
}
