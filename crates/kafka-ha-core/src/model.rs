//! Value types shared by the write session, observer, injector and checker.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::ErrorKind;

/// Broker id of a replica within the topic's replica set (e.g. 100, 101, 102).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub i32);

impl ReplicaId {
    /// Build a replica set from raw broker ids.
    pub fn set<I: IntoIterator<Item = i32>>(ids: I) -> BTreeSet<ReplicaId> {
        ids.into_iter().map(ReplicaId).collect()
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deployment-level identity of a cluster member (`kafka-k8s/0`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitRef {
    pub app: String,
    pub index: u32,
}

impl UnitRef {
    pub fn new(app: impl Into<String>, index: u32) -> Self {
        Self {
            app: app.into(),
            index,
        }
    }

    /// Name of the pod hosting this unit (`kafka-k8s-0`).
    pub fn pod_name(&self) -> String {
        format!("{}-{}", self.app, self.index)
    }
}

impl fmt::Display for UnitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.index)
    }
}

/// One element of the continuous write stream.
///
/// The payload is the decimal sequence number so that a read-back of the
/// topic can recover the stream without any side channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    sequence: u64,
    payload: Bytes,
}

impl Record {
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            payload: Bytes::from(sequence.to_string()),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Recover the sequence number from a payload read back from the topic.
    pub fn parse_sequence(payload: &[u8]) -> Option<u64> {
        std::str::from_utf8(payload).ok()?.trim().parse().ok()
    }
}

/// Where an acknowledged record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    pub partition: i32,
    pub offset: i64,
}

/// Point-in-time view of the harness topic's leadership.
///
/// `leader` is the leader of partition 0; `in_sync_replicas` is the set of
/// replicas that are in sync on every partition of the topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDescription {
    pub topic: String,
    pub leader: Option<ReplicaId>,
    pub in_sync_replicas: BTreeSet<ReplicaId>,
    pub replicas: BTreeSet<ReplicaId>,
}

/// High-water marks of every partition, indexed by partition number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OffsetSnapshot(Vec<i64>);

impl OffsetSnapshot {
    pub fn new(offsets: Vec<i64>) -> Self {
        Self(offsets)
    }

    pub fn get(&self, partition: usize) -> Option<i64> {
        self.0.get(partition).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Offset of the highest-numbered partition.
    pub fn last(&self) -> Option<i64> {
        self.0.last().copied()
    }

    pub fn total(&self) -> i64 {
        self.0.iter().sum()
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }
}

/// A record whose publish exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFailure {
    pub sequence: u64,
    pub kind: ErrorKind,
    pub attempts: u32,
    pub message: String,
}

/// Final accounting of one continuous write session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteSessionReport {
    pub topic: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub last_sent_sequence: Option<u64>,
    pub first_acked_sequence: Option<u64>,
    pub last_acked_sequence: Option<u64>,
    /// Acknowledged sequences in acknowledgement order
    pub acked_sequences: Vec<u64>,
    pub send_errors: Vec<WriteFailure>,
    pub ack_errors: Vec<WriteFailure>,
}

impl WriteSessionReport {
    /// Number of distinct records the session attempted.
    pub fn records_sent(&self) -> u64 {
        self.last_sent_sequence.map_or(0, |s| s + 1)
    }

    pub fn records_acked(&self) -> usize {
        self.acked_sequences.len()
    }

    /// Send failures, excluding attempts abandoned by a stop request.
    pub fn counted_send_errors(&self) -> usize {
        self.send_errors
            .iter()
            .filter(|f| f.kind != ErrorKind::Cancelled)
            .count()
    }

    pub fn counted_ack_errors(&self) -> usize {
        self.ack_errors
            .iter()
            .filter(|f| f.kind != ErrorKind::Cancelled)
            .count()
    }
}

/// Process-control signal delivered to a unit's primary process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Terminate,
    Kill,
    Stop,
    Continue,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Terminate => "SIGTERM",
            SignalKind::Kill => "SIGKILL",
            SignalKind::Stop => "SIGSTOP",
            SignalKind::Continue => "SIGCONT",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervisor restart backoff setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    Extend,
    Restore,
}

/// A fault applied to one cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Perturbation {
    Signal { target: UnitRef, kind: SignalKind },
    NetworkIsolate { target: UnitRef },
    NetworkRestore { target: UnitRef },
    UnitDelete { target: UnitRef },
    RestartDelayPolicy { target: UnitRef, policy: BackoffPolicy },
}

impl Perturbation {
    pub fn target(&self) -> &UnitRef {
        match self {
            Perturbation::Signal { target, .. }
            | Perturbation::NetworkIsolate { target }
            | Perturbation::NetworkRestore { target }
            | Perturbation::UnitDelete { target }
            | Perturbation::RestartDelayPolicy { target, .. } => target,
        }
    }
}

impl fmt::Display for Perturbation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Perturbation::Signal { target, kind } => write!(f, "{} -> {}", kind, target),
            Perturbation::NetworkIsolate { target } => write!(f, "isolate {}", target),
            Perturbation::NetworkRestore { target } => write!(f, "restore network {}", target),
            Perturbation::UnitDelete { target } => write!(f, "delete {}", target),
            Perturbation::RestartDelayPolicy { target, policy } => {
                write!(f, "restart backoff {:?} on {}", policy, target)
            }
        }
    }
}
