//! Consistency checker tests.
//!
//! Tests for the end-of-run verdict including:
//! - Gaps left by outages versus silent loss
//! - Tolerance policy thresholds
//! - Multi-partition offset progress
//! - Read-back audit under at-least-once delivery

use kafka_ha_core::{ConsistencyChecker, Error, ErrorKind, TolerancePolicy, Violation};

use super::helpers::{clean_report, failure, offsets, session_report};

// ============================================================================
// Outage Gaps
// ============================================================================

#[test]
fn test_outage_gap_is_tolerated_when_recorded() {
    // Sequences 40..=49 failed while the leader was down
    let acked: Vec<u64> = (0..40).chain(50..100).collect();
    let send_failed: Vec<u64> = (40..50).collect();
    let report = session_report(99, &acked, &send_failed);

    let result = ConsistencyChecker::default().check(&report, &offsets(&[10]), &offsets(&[100]));
    assert!(result.passed, "{:?}", result.violations);
}

#[test]
fn test_silent_gap_is_a_violation() {
    let mut report = clean_report(9);
    report.acked_sequences.retain(|s| *s != 4);

    let result = ConsistencyChecker::default().check(&report, &offsets(&[0]), &offsets(&[9]));
    assert_eq!(
        result.violations,
        vec![Violation::UnaccountedSequence {
            count: 1,
            sequences: vec![4]
        }]
    );
}

#[test]
fn test_unaccounted_list_is_truncated() {
    let report = kafka_ha_core::WriteSessionReport {
        acked_sequences: vec![0, 999],
        first_acked_sequence: Some(0),
        last_acked_sequence: Some(999),
        ack_errors: vec![],
        ..clean_report(999)
    };

    let result = ConsistencyChecker::default().check(&report, &offsets(&[0]), &offsets(&[2]));
    match &result.violations[..] {
        [Violation::UnaccountedSequence { count, sequences }] => {
            assert_eq!(*count, 998);
            assert_eq!(sequences.len(), 20);
            assert_eq!(sequences[0], 1);
        }
        other => panic!("unexpected violations: {:?}", other),
    }
}

// ============================================================================
// Tolerance Policy
// ============================================================================

#[test]
fn test_default_tolerance_is_one_hundred_per_phase() {
    let policy = TolerancePolicy::default();
    assert_eq!(policy.max_send_errors, Some(100));
    assert_eq!(policy.max_ack_errors, Some(100));
    assert!(policy.require_progress);
    assert!(policy.allow_log_duplicates);
}

#[test]
fn test_ack_errors_counted_separately_from_send_errors() {
    // 100 send errors is at the limit; 101 ack errors is past it
    let acked: Vec<u64> = (201..300).collect();
    let send_failed: Vec<u64> = (0..100).collect();
    let report = session_report(299, &acked, &send_failed);
    assert_eq!(report.counted_send_errors(), 100);
    assert_eq!(report.counted_ack_errors(), 101);

    let result = ConsistencyChecker::default().check(&report, &offsets(&[0]), &offsets(&[99]));
    assert_eq!(
        result.violations,
        vec![Violation::AckErrorsExceeded {
            count: 101,
            limit: 100
        }]
    );
}

#[test]
fn test_strict_policy_rejects_any_failure() {
    let acked: Vec<u64> = (0..10).filter(|s| *s != 3).collect();
    let report = session_report(9, &acked, &[3]);

    let strict = ConsistencyChecker::new(TolerancePolicy::strict());
    let result = strict.check(&report, &offsets(&[0]), &offsets(&[9]));
    assert_eq!(
        result.violations,
        vec![Violation::SendErrorsExceeded { count: 1, limit: 0 }]
    );
}

#[test]
fn test_cancelled_attempt_is_accounted_but_not_counted() {
    let acked: Vec<u64> = (0..10).collect();
    let mut report = session_report(10, &acked, &[10]);
    report.send_errors[0] = failure(10, ErrorKind::Cancelled);

    let strict = ConsistencyChecker::new(TolerancePolicy::strict());
    assert!(strict.check(&report, &offsets(&[0]), &offsets(&[10])).passed);
}

// ============================================================================
// Offsets
// ============================================================================

#[test]
fn test_every_partition_must_progress() {
    let report = clean_report(29);
    let result = ConsistencyChecker::default().check(
        &report,
        &offsets(&[3, 3, 3]),
        &offsets(&[13, 3, 14]),
    );
    assert_eq!(
        result.violations,
        vec![Violation::NoProgress {
            partition: 1,
            offset: 3
        }]
    );
}

#[test]
fn test_partition_count_change_is_reported() {
    let result =
        ConsistencyChecker::default().check(&clean_report(9), &offsets(&[0, 0]), &offsets(&[10]));
    assert!(result
        .violations
        .contains(&Violation::PartitionCountChanged { pre: 2, post: 1 }));
}

#[test]
fn test_acked_beyond_sent_is_reported() {
    let mut report = clean_report(9);
    report.last_sent_sequence = Some(8);
    report.acked_sequences.pop();
    report.acked_sequences.push(12);
    report.last_acked_sequence = Some(12);

    let result = ConsistencyChecker::default().check(&report, &offsets(&[0]), &offsets(&[10]));
    assert!(result.violations.contains(&Violation::AckedBeyondSent {
        last_acked: 12,
        last_sent: Some(8)
    }));
}

// ============================================================================
// Read-back Audit
// ============================================================================

#[test]
fn test_retried_record_stored_twice_is_at_least_once() {
    let report = clean_report(4);
    let log = [0, 1, 2, 2, 3, 4];

    let lenient = ConsistencyChecker::default();
    assert!(lenient
        .check_with_read_back(&report, &offsets(&[0]), &offsets(&[6]), &log)
        .passed);

    let strict = ConsistencyChecker::new(TolerancePolicy::strict());
    let result = strict.check_with_read_back(&report, &offsets(&[0]), &offsets(&[6]), &log);
    assert_eq!(
        result.violations,
        vec![Violation::DuplicateInLog {
            count: 1,
            sequences: vec![2]
        }]
    );
}

#[test]
fn test_lost_acknowledged_record_fails_with_sequence() {
    let report = clean_report(4);
    let log = [0, 1, 3, 4];

    let result = ConsistencyChecker::default().check_with_read_back(
        &report,
        &offsets(&[0]),
        &offsets(&[4]),
        &log,
    );
    let err = result.into_result().unwrap_err();
    match err {
        Error::ConsistencyViolation { invariant, detail } => {
            assert_eq!(invariant, "missing_acknowledged");
            assert!(detail.contains("[2]"), "{}", detail);
        }
        other => panic!("unexpected error: {}", other),
    }
}
