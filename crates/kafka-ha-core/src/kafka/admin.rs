//! Kafka Admin API implementation (CreateTopics, DeleteTopics).

use kafka_protocol::messages::{
    create_topics_request::{CreatableTopic, CreateTopicsRequest},
    ApiKey, CreateTopicsResponse, DeleteTopicsRequest, DeleteTopicsResponse, TopicName,
};
use kafka_protocol::protocol::StrBytes;
use tracing::{debug, info, warn};

use super::KafkaClient;
use crate::error::KafkaError;
use crate::Result;

/// TOPIC_ALREADY_EXISTS
const TOPIC_ALREADY_EXISTS: i16 = 36;

/// UNKNOWN_TOPIC_OR_PARTITION
const UNKNOWN_TOPIC_OR_PARTITION: i16 = 3;

/// A topic to be created
#[derive(Debug, Clone)]
pub struct TopicToCreate {
    pub name: String,
    pub num_partitions: i32,
    /// Replication factor (-1 for broker default)
    pub replication_factor: i16,
}

/// Result of creating a single topic
#[derive(Debug, Clone)]
pub struct CreateTopicResult {
    pub name: String,
    /// Error code (0 = success, 36 = TOPIC_ALREADY_EXISTS)
    pub error_code: i16,
    pub error_message: Option<String>,
}

impl CreateTopicResult {
    /// Check if the topic was created successfully or already existed
    pub fn is_success_or_exists(&self) -> bool {
        self.is_success() || self.already_exists()
    }

    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }

    pub fn already_exists(&self) -> bool {
        self.error_code == TOPIC_ALREADY_EXISTS
    }
}

/// Create a topic, treating "already exists" as success
pub async fn create_topic(
    client: &KafkaClient,
    topic: &TopicToCreate,
    timeout_ms: i32,
) -> Result<CreateTopicResult> {
    debug!(
        "Creating topic {} ({} partitions, rf={})",
        topic.name, topic.num_partitions, topic.replication_factor
    );

    let creatable = CreatableTopic::default()
        .with_name(TopicName(StrBytes::from_string(topic.name.clone())))
        .with_num_partitions(topic.num_partitions)
        .with_replication_factor(topic.replication_factor);

    let request = CreateTopicsRequest::default()
        .with_topics(vec![creatable])
        .with_timeout_ms(timeout_ms)
        .with_validate_only(false);

    let response: CreateTopicsResponse = client.send_request(ApiKey::CreateTopics, request).await?;

    let topic_result = response
        .topics
        .iter()
        .find(|t| t.name.as_str() == topic.name)
        .ok_or_else(|| {
            KafkaError::Protocol(format!("No CreateTopics result for {}", topic.name))
        })?;

    let result = CreateTopicResult {
        name: topic.name.clone(),
        error_code: topic_result.error_code,
        error_message: topic_result.error_message.as_ref().map(|s| s.to_string()),
    };

    if result.is_success() {
        info!("Created topic: {}", result.name);
    } else if result.already_exists() {
        debug!("Topic already exists: {}", result.name);
    } else {
        warn!(
            "Failed to create topic {}: error_code={}, message={:?}",
            result.name, result.error_code, result.error_message
        );
        return Err(KafkaError::BrokerError {
            code: result.error_code,
            message: format!(
                "Failed to create topic {}: {}",
                result.name,
                result.error_message.as_deref().unwrap_or("no message")
            ),
        }
        .into());
    }

    Ok(result)
}

/// Delete a topic; a topic that does not exist counts as deleted
pub async fn delete_topic(client: &KafkaClient, topic: &str, timeout_ms: i32) -> Result<()> {
    let request = DeleteTopicsRequest::default()
        .with_topic_names(vec![TopicName(StrBytes::from_string(topic.to_string()))])
        .with_timeout_ms(timeout_ms);

    let response: DeleteTopicsResponse = client.send_request(ApiKey::DeleteTopics, request).await?;

    for result in &response.responses {
        match result.error_code {
            0 => info!("Deleted topic: {}", topic),
            UNKNOWN_TOPIC_OR_PARTITION => debug!("Topic {} did not exist", topic),
            code => {
                return Err(KafkaError::BrokerError {
                    code,
                    message: format!("Failed to delete topic {}: code {}", topic, code),
                }
                .into())
            }
        }
    }

    Ok(())
}
