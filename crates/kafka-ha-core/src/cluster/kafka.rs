//! Real cluster backend over the Kafka wire client.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{partition_for, ClusterQuery, RecordPublisher};
use crate::config::{KafkaConfig, TopicConfig};
use crate::error::KafkaError;
use crate::kafka::{KafkaClient, PartitionLeaderRouter, TopicMetadata, TopicToCreate};
use crate::model::{OffsetSnapshot, PublishAck, Record, TopicDescription, UnitRef};
use crate::{Error, Result};

/// Bound on CreateTopics/DeleteTopics on the broker side.
const ADMIN_TIMEOUT_MS: i32 = 30_000;

/// Recreate attempts while a deleted topic is still being removed.
const RECREATE_ATTEMPTS: u32 = 30;

/// Bytes requested per fetch during read-back.
const FETCH_MAX_BYTES: i32 = 1024 * 1024;

/// A Kafka cluster reached through its bootstrap servers or a named member.
pub struct KafkaCluster {
    config: KafkaConfig,
    topic: TopicConfig,
    router: PartitionLeaderRouter,
}

impl KafkaCluster {
    pub fn new(config: KafkaConfig, topic: TopicConfig) -> Self {
        let router = PartitionLeaderRouter::new(config.clone());
        Self {
            config,
            topic,
            router,
        }
    }

    fn member_config(&self, unit: &UnitRef) -> KafkaConfig {
        let mut config = self.config.clone();
        config.bootstrap_servers = vec![self.config.member_address(unit.index)];
        config
    }

    async fn topic_metadata(&self, topic: &str, target: Option<&UnitRef>) -> Result<TopicMetadata> {
        match target {
            Some(unit) => {
                let client = KafkaClient::new(self.member_config(unit));
                client.connect().await?;
                client.get_topic_metadata(topic).await
            }
            None => self.router.topic_metadata(topic).await,
        }
    }

    async fn read_offsets_via(
        &self,
        router: &PartitionLeaderRouter,
        topic: &str,
    ) -> Result<OffsetSnapshot> {
        let metadata = router.topic_metadata(topic).await?;
        let mut offsets = Vec::with_capacity(metadata.partitions.len());
        for partition in metadata.partition_ids() {
            offsets.push(router.high_watermark(topic, partition).await?);
        }
        Ok(OffsetSnapshot::new(offsets))
    }
}

/// Map wire errors onto the harness taxonomy.
fn classify(error: Error, what: &str) -> Error {
    match error {
        Error::Kafka(KafkaError::TopicNotExists(topic)) => {
            Error::NotFound(format!("topic {}", topic))
        }
        Error::Kafka(KafkaError::ConnectionFailed { broker, message }) => {
            Error::Unreachable(format!("{} via {}: {}", what, broker, message))
        }
        Error::Kafka(KafkaError::NoBrokersAvailable) => {
            Error::Unreachable(format!("{}: no broker answered", what))
        }
        Error::Io(e) => Error::Unreachable(format!("{}: {}", what, e)),
        other => other,
    }
}

#[async_trait]
impl ClusterQuery for KafkaCluster {
    async fn describe_topic(
        &self,
        topic: &str,
        target: Option<&UnitRef>,
    ) -> Result<TopicDescription> {
        let metadata = self
            .topic_metadata(topic, target)
            .await
            .map_err(|e| classify(e, "describe topic"))?;
        let description = metadata.describe();
        debug!(
            "Topic {} leader={:?} isr={:?}",
            topic, description.leader, description.in_sync_replicas
        );
        Ok(description)
    }

    async fn read_offsets(&self, topic: &str, target: Option<&UnitRef>) -> Result<OffsetSnapshot> {
        let result = match target {
            Some(unit) => {
                let router = PartitionLeaderRouter::new(self.member_config(unit));
                self.read_offsets_via(&router, topic).await
            }
            None => self.read_offsets_via(&self.router, topic).await,
        };
        result.map_err(|e| classify(e, "read offsets"))
    }

    async fn read_records(&self, topic: &str) -> Result<Vec<u64>> {
        let metadata = self
            .router
            .topic_metadata(topic)
            .await
            .map_err(|e| classify(e, "read records"))?;

        let mut sequences = Vec::new();
        for partition in metadata.partition_ids() {
            let high_watermark = self.router.high_watermark(topic, partition).await?;
            let mut offset = 0i64;
            while offset < high_watermark {
                let (records, _) = self
                    .router
                    .fetch(topic, partition, offset, FETCH_MAX_BYTES)
                    .await?;
                let Some(last) = records.last() else {
                    break;
                };
                let next = last.offset + 1;
                for record in records.iter().filter(|r| r.offset >= offset) {
                    match record.value.as_deref().and_then(Record::parse_sequence) {
                        Some(sequence) => sequences.push(sequence),
                        None => warn!(
                            "Skipping foreign record at {}/{} offset {}",
                            topic, partition, record.offset
                        ),
                    }
                }
                offset = next;
            }
        }

        debug!("Read back {} records from {}", sequences.len(), topic);
        Ok(sequences)
    }
}

#[async_trait]
impl RecordPublisher for KafkaCluster {
    async fn publish(&self, topic: &str, record: &Record) -> Result<PublishAck> {
        let partition = partition_for(record.sequence(), self.topic.partitions);
        self.router
            .produce(topic, partition, record)
            .await
            .map_err(|e| classify(e, "publish"))
    }

    async fn reset_topic(&self, topic: &str) -> Result<()> {
        let admin = self.router.admin_client().await?;
        admin.delete_topic(topic, ADMIN_TIMEOUT_MS).await?;

        let spec = TopicToCreate {
            name: topic.to_string(),
            num_partitions: self.topic.partitions,
            replication_factor: self.topic.replication_factor,
        };

        // Deletion is asynchronous; "already exists" means it is still going
        for attempt in 1..=RECREATE_ATTEMPTS {
            let result = admin.create_topic(&spec, ADMIN_TIMEOUT_MS).await?;
            if result.is_success() {
                self.router.reset().await;
                info!("Reset topic {}", topic);
                return Ok(());
            }
            debug!(
                "Topic {} still being deleted (attempt {}/{})",
                topic, attempt, RECREATE_ATTEMPTS
            );
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        Err(Error::TimeoutExceeded {
            operation: format!("recreate topic {}", topic),
            timeout: Duration::from_secs(RECREATE_ATTEMPTS as u64),
        })
    }
}
