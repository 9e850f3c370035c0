//! Cluster backends: the query and publish seams the harness drives.
//!
//! [`KafkaCluster`] talks to a real cluster over the wire; [`SimulatedCluster`]
//! is an in-memory replicated log that also acts as its own control plane.

use async_trait::async_trait;

use crate::model::{OffsetSnapshot, PublishAck, Record, TopicDescription, UnitRef};
use crate::Result;

mod kafka;
mod simulated;

pub use kafka::KafkaCluster;
pub use simulated::{SimulatedCluster, SimulationProfile};

/// Read-only queries against the cluster under test.
#[async_trait]
pub trait ClusterQuery: Send + Sync {
    /// Leader and in-sync replicas of `topic`, asked of `target` or any member.
    async fn describe_topic(&self, topic: &str, target: Option<&UnitRef>)
        -> Result<TopicDescription>;

    /// High-water mark of every partition, in partition order.
    async fn read_offsets(&self, topic: &str, target: Option<&UnitRef>) -> Result<OffsetSnapshot>;

    /// Every sequence number stored in `topic`, partition by partition in log order.
    async fn read_records(&self, topic: &str) -> Result<Vec<u64>>;
}

/// Write side used by the continuous write session.
#[async_trait]
pub trait RecordPublisher: Send + Sync {
    /// Publish one record and wait for the acknowledgement of all in-sync replicas.
    async fn publish(&self, topic: &str, record: &Record) -> Result<PublishAck>;

    /// Drop every record in `topic` by deleting and recreating it.
    async fn reset_topic(&self, topic: &str) -> Result<()>;
}

/// Partition a sequence number is written to.
pub fn partition_for(sequence: u64, partitions: i32) -> i32 {
    (sequence % partitions.max(1) as u64) as i32
}
