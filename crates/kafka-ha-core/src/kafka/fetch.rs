//! Kafka Fetch and ListOffsets API implementation.

use bytes::Bytes;
use kafka_protocol::messages::{
    ApiKey, BrokerId, FetchRequest, FetchResponse as KafkaFetchResponse, ListOffsetsRequest,
    TopicName,
};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::RecordBatchDecoder;
use tracing::trace;

use super::KafkaClient;
use crate::error::KafkaError;
use crate::Result;

/// ListOffsets timestamp selecting the log end (high-water mark).
pub const LATEST_TIMESTAMP: i64 = -1;

/// ListOffsets timestamp selecting the log start.
pub const EARLIEST_TIMESTAMP: i64 = -2;

/// A record read back from a partition
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    pub offset: i64,
    pub value: Option<Bytes>,
}

/// Fetch records from a topic/partition, returning them with the high watermark
pub async fn fetch(
    client: &KafkaClient,
    topic: &str,
    partition: i32,
    offset: i64,
    max_bytes: i32,
) -> Result<(Vec<FetchedRecord>, i64)> {
    let fetch_partition = kafka_protocol::messages::fetch_request::FetchPartition::default()
        .with_partition(partition)
        .with_fetch_offset(offset)
        .with_partition_max_bytes(max_bytes)
        .with_log_start_offset(-1);

    let fetch_topic = kafka_protocol::messages::fetch_request::FetchTopic::default()
        .with_topic(TopicName(StrBytes::from_string(topic.to_string())))
        .with_partitions(vec![fetch_partition]);

    let request = FetchRequest::default()
        .with_replica_id(BrokerId(-1)) // Client mode
        .with_max_wait_ms(500)
        .with_min_bytes(1)
        .with_max_bytes(max_bytes)
        .with_isolation_level(0) // READ_UNCOMMITTED
        .with_topics(vec![fetch_topic]);

    let response: KafkaFetchResponse = client.send_request(ApiKey::Fetch, request).await?;

    let mut records = Vec::new();
    let mut high_watermark = 0i64;

    for topic_response in &response.responses {
        if topic_response.topic.as_str() != topic {
            continue;
        }

        for partition_response in &topic_response.partitions {
            if partition_response.partition_index != partition {
                continue;
            }

            if partition_response.error_code != 0 {
                return Err(KafkaError::BrokerError {
                    code: partition_response.error_code,
                    message: format!(
                        "Fetch error for {}:{}: code {}",
                        topic, partition, partition_response.error_code
                    ),
                }
                .into());
            }

            high_watermark = partition_response.high_watermark;

            if let Some(ref records_data) = partition_response.records {
                if !records_data.is_empty() {
                    records.extend(decode_records(records_data)?);
                }
            }
        }
    }

    trace!(
        "Fetched {} records from {}:{} starting at offset {}",
        records.len(),
        topic,
        partition,
        offset
    );

    Ok((records, high_watermark))
}

fn decode_records(data: &Bytes) -> Result<Vec<FetchedRecord>> {
    let mut buf = data.clone();

    let decoded_records = RecordBatchDecoder::decode::<
        _,
        fn(&mut Bytes, kafka_protocol::records::Compression) -> anyhow::Result<Bytes>,
    >(&mut buf)
    .map_err(|e| KafkaError::Protocol(format!("Failed to decode records: {:?}", e)))?;

    Ok(decoded_records
        .into_iter()
        .map(|record| FetchedRecord {
            offset: record.offset,
            value: record.value,
        })
        .collect())
}

/// List offset for a specific timestamp
pub async fn list_offset(
    client: &KafkaClient,
    topic: &str,
    partition: i32,
    timestamp: i64,
) -> Result<i64> {
    let list_partition =
        kafka_protocol::messages::list_offsets_request::ListOffsetsPartition::default()
            .with_partition_index(partition)
            .with_timestamp(timestamp);

    let list_topic = kafka_protocol::messages::list_offsets_request::ListOffsetsTopic::default()
        .with_name(TopicName(StrBytes::from_string(topic.to_string())))
        .with_partitions(vec![list_partition]);

    let request = ListOffsetsRequest::default()
        .with_replica_id(BrokerId(-1))
        .with_isolation_level(0)
        .with_topics(vec![list_topic]);

    let response: kafka_protocol::messages::ListOffsetsResponse =
        client.send_request(ApiKey::ListOffsets, request).await?;

    for topic_response in &response.topics {
        if topic_response.name.as_str() != topic {
            continue;
        }

        for partition_response in &topic_response.partitions {
            if partition_response.partition_index != partition {
                continue;
            }

            if partition_response.error_code != 0 {
                return Err(KafkaError::BrokerError {
                    code: partition_response.error_code,
                    message: format!(
                        "ListOffsets error for {}:{}: code {}",
                        topic, partition, partition_response.error_code
                    ),
                }
                .into());
            }

            return Ok(partition_response.offset);
        }
    }

    Err(KafkaError::PartitionNotAvailable {
        topic: topic.to_string(),
        partition,
    }
    .into())
}
