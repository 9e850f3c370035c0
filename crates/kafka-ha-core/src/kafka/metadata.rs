//! Kafka Metadata API implementation.

use kafka_protocol::messages::{ApiKey, MetadataRequest, MetadataResponse, TopicName};
use kafka_protocol::protocol::StrBytes;
use std::collections::BTreeSet;
use tracing::debug;

use super::KafkaClient;
use crate::error::KafkaError;
use crate::model::{ReplicaId, TopicDescription};
use crate::Result;

/// UNKNOWN_TOPIC_OR_PARTITION
const UNKNOWN_TOPIC_OR_PARTITION: i16 = 3;

/// Broker metadata
#[derive(Debug, Clone)]
pub struct BrokerMetadata {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

impl BrokerMetadata {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Topic metadata
#[derive(Debug, Clone)]
pub struct TopicMetadata {
    pub name: String,
    /// Topic-level error; partitions may be empty when non-zero
    pub error_code: i16,
    pub partitions: Vec<PartitionMetadata>,
}

/// Partition metadata
#[derive(Debug, Clone)]
pub struct PartitionMetadata {
    pub partition_id: i32,
    pub leader_id: i32,
    pub replica_nodes: Vec<i32>,
    pub isr_nodes: Vec<i32>,
}

/// Brokers and topics returned by one Metadata request
#[derive(Debug, Clone, Default)]
pub struct ClusterMetadata {
    pub brokers: Vec<BrokerMetadata>,
    pub topics: Vec<TopicMetadata>,
}

impl TopicMetadata {
    /// Fail on a topic-level error code.
    ///
    /// Only an unknown topic means it does not exist. Anything else, such as
    /// LEADER_NOT_AVAILABLE while a leader is being elected, is a broker error
    /// the caller may retry.
    pub fn into_checked(self) -> Result<Self> {
        match self.error_code {
            0 => Ok(self),
            UNKNOWN_TOPIC_OR_PARTITION => Err(KafkaError::TopicNotExists(self.name).into()),
            code => Err(KafkaError::BrokerError {
                code,
                message: format!("metadata for topic {} unavailable", self.name),
            }
            .into()),
        }
    }

    /// Number of partitions, in partition-index order.
    pub fn partition_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.partitions.iter().map(|p| p.partition_id).collect();
        ids.sort_unstable();
        ids
    }

    /// Collapse per-partition leadership into a topic-level description.
    ///
    /// The leader is partition 0's leader (`-1` means offline); a replica is
    /// in sync only if it is in the ISR of every partition.
    pub fn describe(&self) -> TopicDescription {
        let mut partitions: Vec<&PartitionMetadata> = self.partitions.iter().collect();
        partitions.sort_by_key(|p| p.partition_id);

        let leader = partitions
            .first()
            .map(|p| p.leader_id)
            .filter(|id| *id >= 0)
            .map(ReplicaId);

        let mut in_sync: Option<BTreeSet<ReplicaId>> = None;
        let mut replicas = BTreeSet::new();
        for p in &partitions {
            let isr: BTreeSet<ReplicaId> = p.isr_nodes.iter().copied().map(ReplicaId).collect();
            in_sync = Some(match in_sync {
                None => isr,
                Some(acc) => acc.intersection(&isr).copied().collect(),
            });
            replicas.extend(p.replica_nodes.iter().copied().map(ReplicaId));
        }

        TopicDescription {
            topic: self.name.clone(),
            leader,
            in_sync_replicas: in_sync.unwrap_or_default(),
            replicas,
        }
    }
}

/// Fetch cluster metadata from the broker
pub async fn fetch_metadata(
    client: &KafkaClient,
    topics: Option<&[String]>,
) -> Result<ClusterMetadata> {
    let request = match topics {
        Some(topic_names) => {
            let topic_list: Vec<_> = topic_names
                .iter()
                .map(|name| {
                    kafka_protocol::messages::metadata_request::MetadataRequestTopic::default()
                        .with_name(Some(TopicName(StrBytes::from_string(name.clone()))))
                })
                .collect();
            MetadataRequest::default()
                .with_topics(Some(topic_list))
                .with_allow_auto_topic_creation(false)
        }
        None => MetadataRequest::default()
            .with_topics(None)
            .with_allow_auto_topic_creation(false),
    };

    let response: MetadataResponse = client.send_request(ApiKey::Metadata, request).await?;

    let brokers: Vec<BrokerMetadata> = response
        .brokers
        .iter()
        .map(|broker| BrokerMetadata {
            node_id: broker.node_id.0,
            host: broker.host.to_string(),
            port: broker.port,
        })
        .collect();

    let topics: Vec<TopicMetadata> = response
        .topics
        .iter()
        .filter_map(|topic| {
            let name = topic.name.as_ref()?.to_string();
            if topic.error_code != 0 {
                debug!("Topic {} has error code {}", name, topic.error_code);
            }

            let partitions: Vec<PartitionMetadata> = topic
                .partitions
                .iter()
                .map(|p| PartitionMetadata {
                    partition_id: p.partition_index,
                    leader_id: p.leader_id.0,
                    replica_nodes: p.replica_nodes.iter().map(|n| n.0).collect(),
                    isr_nodes: p.isr_nodes.iter().map(|n| n.0).collect(),
                })
                .collect();

            Some(TopicMetadata {
                name,
                error_code: topic.error_code,
                partitions,
            })
        })
        .collect();

    debug!(
        "Metadata: {} brokers, {} topics",
        brokers.len(),
        topics.len()
    );
    Ok(ClusterMetadata { brokers, topics })
}
