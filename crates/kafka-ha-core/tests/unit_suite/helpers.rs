//! Test helper utilities.
//!
//! Builders for write-session reports and snapshots used across unit tests.

use chrono::Utc;
use kafka_ha_core::{ErrorKind, OffsetSnapshot, WriteFailure, WriteSessionReport};

pub const TOPIC: &str = "ha-test-topic";

/// Report of a session that sent `0..=last_sent` and got `acked` acknowledged.
///
/// Every sequence that was neither acked nor listed in `send_failed` is
/// recorded as an ack-phase timeout so the report is fully accounted for.
pub fn session_report(last_sent: u64, acked: &[u64], send_failed: &[u64]) -> WriteSessionReport {
    let ack_errors = (0..=last_sent)
        .filter(|s| !acked.contains(s) && !send_failed.contains(s))
        .map(|s| failure(s, ErrorKind::Timeout))
        .collect();
    WriteSessionReport {
        topic: TOPIC.to_string(),
        started_at: Utc::now(),
        stopped_at: Utc::now(),
        last_sent_sequence: Some(last_sent),
        first_acked_sequence: acked.first().copied(),
        last_acked_sequence: acked.last().copied(),
        acked_sequences: acked.to_vec(),
        send_errors: send_failed
            .iter()
            .map(|&s| failure(s, ErrorKind::Unreachable))
            .collect(),
        ack_errors,
    }
}

/// Report where every sequence up to `last_sent` was acknowledged.
pub fn clean_report(last_sent: u64) -> WriteSessionReport {
    let acked: Vec<u64> = (0..=last_sent).collect();
    session_report(last_sent, &acked, &[])
}

pub fn failure(sequence: u64, kind: ErrorKind) -> WriteFailure {
    WriteFailure {
        sequence,
        kind,
        attempts: 5,
        message: format!("{:?}", kind),
    }
}

pub fn offsets(values: &[i64]) -> OffsetSnapshot {
    OffsetSnapshot::new(values.to_vec())
}
