//! Partition leader routing for multi-broker Kafka clusters.
//!
//! Produce and ListOffsets must reach the partition leader. During a
//! failover the leader moves, so routes are dropped whenever a broker
//! answers NOT_LEADER_OR_FOLLOWER or its connection breaks, and the next
//! request re-resolves the leader from fresh metadata.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;
use crate::error::KafkaError;
use crate::model::{PublishAck, Record};
use crate::{Error, Result};

use super::fetch::FetchedRecord;
use super::metadata::{BrokerMetadata, ClusterMetadata, TopicMetadata};
use super::KafkaClient;

/// NOT_LEADER_OR_FOLLOWER
const NOT_LEADER_OR_FOLLOWER: i16 = 6;

/// Routes Kafka requests to the correct partition leader broker.
pub struct PartitionLeaderRouter {
    /// Configuration used for every connection this router opens
    config: KafkaConfig,

    /// Client used for metadata requests, reconnected on demand
    bootstrap_client: Mutex<Option<Arc<KafkaClient>>>,

    /// broker_id -> host:port
    broker_metadata: RwLock<HashMap<i32, BrokerMetadata>>,

    /// (topic, partition) -> leader broker_id
    partition_leaders: RwLock<HashMap<(String, i32), i32>>,

    /// broker_id -> connected client
    connections: RwLock<HashMap<i32, Arc<KafkaClient>>>,
}

impl PartitionLeaderRouter {
    /// Create a router. No connection is made until the first request.
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            bootstrap_client: Mutex::new(None),
            broker_metadata: RwLock::new(HashMap::new()),
            partition_leaders: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    async fn bootstrap(&self) -> Result<Arc<KafkaClient>> {
        let mut slot = self.bootstrap_client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(KafkaClient::new(self.config.clone()));
        client.connect().await?;
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Fetch metadata through the bootstrap connection and refresh the caches.
    pub async fn fetch_metadata(&self, topics: Option<&[String]>) -> Result<ClusterMetadata> {
        let client = self.bootstrap().await?;
        let metadata = match client.fetch_metadata(topics).await {
            Ok(metadata) => metadata,
            Err(e) => {
                // Next attempt walks the bootstrap list again
                *self.bootstrap_client.lock().await = None;
                return Err(e);
            }
        };

        {
            let mut brokers = self.broker_metadata.write().await;
            for broker in &metadata.brokers {
                brokers.insert(broker.node_id, broker.clone());
            }
        }

        {
            let mut leaders = self.partition_leaders.write().await;
            for topic in &metadata.topics {
                for partition in &topic.partitions {
                    let key = (topic.name.clone(), partition.partition_id);
                    if partition.leader_id >= 0 {
                        leaders.insert(key, partition.leader_id);
                    } else {
                        leaders.remove(&key);
                    }
                }
            }
        }

        debug!(
            "Refreshed metadata: {} brokers, {} topics",
            metadata.brokers.len(),
            metadata.topics.len()
        );
        Ok(metadata)
    }

    /// Get metadata for a specific topic.
    pub async fn topic_metadata(&self, topic: &str) -> Result<TopicMetadata> {
        let metadata = self.fetch_metadata(Some(&[topic.to_string()])).await?;
        metadata
            .topics
            .into_iter()
            .find(|t| t.name == topic)
            .ok_or_else(|| Error::from(KafkaError::TopicNotExists(topic.to_string())))?
            .into_checked()
    }

    /// Get the leader broker ID for a partition, refreshing metadata on a miss.
    pub async fn leader(&self, topic: &str, partition: i32) -> Result<i32> {
        let key = (topic.to_string(), partition);
        if let Some(leader) = self.partition_leaders.read().await.get(&key).copied() {
            return Ok(leader);
        }

        self.topic_metadata(topic).await?;
        self.partition_leaders
            .read()
            .await
            .get(&key)
            .copied()
            .ok_or_else(|| {
                KafkaError::PartitionNotAvailable {
                    topic: topic.to_string(),
                    partition,
                }
                .into()
            })
    }

    /// Get or create a connection to a specific broker.
    async fn broker_connection(&self, broker_id: i32) -> Result<Arc<KafkaClient>> {
        if let Some(client) = self.connections.read().await.get(&broker_id) {
            return Ok(Arc::clone(client));
        }

        let broker_addr = self
            .broker_metadata
            .read()
            .await
            .get(&broker_id)
            .map(BrokerMetadata::address)
            .ok_or_else(|| KafkaError::Protocol(format!("Unknown broker ID: {}", broker_id)))?;

        debug!(
            "Creating new connection to broker {} at {}",
            broker_id, broker_addr
        );

        let mut broker_config = self.config.clone();
        broker_config.bootstrap_servers = vec![broker_addr];

        let client = Arc::new(KafkaClient::new(broker_config));
        client.connect().await?;

        self.connections
            .write()
            .await
            .insert(broker_id, Arc::clone(&client));
        Ok(client)
    }

    async fn leader_client(&self, topic: &str, partition: i32) -> Result<(i32, Arc<KafkaClient>)> {
        let leader_id = self.leader(topic, partition).await?;
        let client = self.broker_connection(leader_id).await?;
        Ok((leader_id, client))
    }

    /// Drop the cached route and connection after a routing failure.
    pub async fn invalidate(&self, topic: &str, partition: i32, broker_id: i32) {
        self.partition_leaders
            .write()
            .await
            .remove(&(topic.to_string(), partition));
        self.connections.write().await.remove(&broker_id);
        debug!(
            "Invalidated route {}/{} -> broker {}",
            topic, partition, broker_id
        );
    }

    /// Inspect a routed request's outcome; returns true when it should be retried.
    async fn handle_route_error(
        &self,
        error: &crate::Error,
        topic: &str,
        partition: i32,
        broker_id: i32,
    ) -> bool {
        if is_not_leader_error(error) {
            warn!(
                "NOT_LEADER_OR_FOLLOWER from broker {} for {}/{}, refreshing leader",
                broker_id, topic, partition
            );
            self.invalidate(topic, partition, broker_id).await;
            return true;
        }
        if is_connection_error(error) {
            info!(
                "Connection to broker {} lost while routing {}/{}",
                broker_id, topic, partition
            );
            self.invalidate(topic, partition, broker_id).await;
        }
        false
    }

    /// Produce one record to the partition leader.
    ///
    /// A NOT_LEADER_OR_FOLLOWER answer is retried once against the new leader.
    pub async fn produce(&self, topic: &str, partition: i32, record: &Record) -> Result<PublishAck> {
        let (leader_id, client) = self.leader_client(topic, partition).await?;
        match client.produce(topic, partition, record).await {
            Ok(ack) => Ok(ack),
            Err(e) => {
                if !self.handle_route_error(&e, topic, partition, leader_id).await {
                    return Err(e);
                }
                let (leader_id, client) = self.leader_client(topic, partition).await?;
                let result = client.produce(topic, partition, record).await;
                if let Err(ref e) = result {
                    self.handle_route_error(e, topic, partition, leader_id).await;
                }
                result
            }
        }
    }

    /// High-water mark of a partition, read from its leader.
    pub async fn high_watermark(&self, topic: &str, partition: i32) -> Result<i64> {
        let (leader_id, client) = self.leader_client(topic, partition).await?;
        match client.high_watermark(topic, partition).await {
            Ok(offset) => Ok(offset),
            Err(e) => {
                if !self.handle_route_error(&e, topic, partition, leader_id).await {
                    return Err(e);
                }
                let (leader_id, client) = self.leader_client(topic, partition).await?;
                let result = client.high_watermark(topic, partition).await;
                if let Err(ref e) = result {
                    self.handle_route_error(e, topic, partition, leader_id).await;
                }
                result
            }
        }
    }

    /// Fetch records from the partition leader.
    pub async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_bytes: i32,
    ) -> Result<(Vec<FetchedRecord>, i64)> {
        let (leader_id, client) = self.leader_client(topic, partition).await?;
        let result = client.fetch(topic, partition, offset, max_bytes).await;
        if let Err(ref e) = result {
            self.handle_route_error(e, topic, partition, leader_id).await;
        }
        result
    }

    /// Create or delete topics through the bootstrap connection.
    pub async fn admin_client(&self) -> Result<Arc<KafkaClient>> {
        self.bootstrap().await
    }

    /// Forget every cached route, connection and the bootstrap client.
    pub async fn reset(&self) {
        self.partition_leaders.write().await.clear();
        self.connections.write().await.clear();
        *self.bootstrap_client.lock().await = None;
        debug!("Cleared routing caches");
    }
}

/// Check if an error is a NOT_LEADER_OR_FOLLOWER error (code 6).
fn is_not_leader_error(error: &crate::Error) -> bool {
    matches!(
        error,
        crate::Error::Kafka(KafkaError::BrokerError { code, .. }) if *code == NOT_LEADER_OR_FOLLOWER
    )
}

/// Errors after which the cached connection can no longer be trusted.
fn is_connection_error(error: &crate::Error) -> bool {
    matches!(
        error,
        crate::Error::Kafka(KafkaError::ConnectionFailed { .. })
            | crate::Error::Kafka(KafkaError::Protocol(_))
            | crate::Error::Kafka(KafkaError::Timeout(_))
            | crate::Error::Kafka(KafkaError::NoBrokersAvailable)
            | crate::Error::Io(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_not_leader_error() {
        let error = crate::Error::Kafka(KafkaError::BrokerError {
            code: 6,
            message: "NOT_LEADER_OR_FOLLOWER".to_string(),
        });
        assert!(is_not_leader_error(&error));
        assert!(!is_connection_error(&error));

        let other_error = crate::Error::Kafka(KafkaError::BrokerError {
            code: 19,
            message: "NOT_ENOUGH_REPLICAS".to_string(),
        });
        assert!(!is_not_leader_error(&other_error));
    }

    #[test]
    fn test_connection_errors_drop_routes() {
        let error = crate::Error::Kafka(KafkaError::ConnectionFailed {
            broker: "kafka-k8s-0:9092".to_string(),
            message: "reset by peer".to_string(),
        });
        assert!(is_connection_error(&error));
        assert!(!is_connection_error(&crate::Error::Config("x".into())));
    }

    #[tokio::test]
    async fn test_invalidate_forgets_leader() {
        let router =
            PartitionLeaderRouter::new(KafkaConfig::with_bootstrap(vec!["127.0.0.1:1".to_string()]));
        router
            .partition_leaders
            .write()
            .await
            .insert(("t".to_string(), 0), 101);
        assert_eq!(router.leader("t", 0).await.unwrap(), 101);

        router.invalidate("t", 0, 101).await;
        assert!(router.partition_leaders.read().await.is_empty());
    }
}
