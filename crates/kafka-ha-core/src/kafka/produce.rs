//! Kafka Produce API implementation.

use bytes::{Bytes, BytesMut};
use indexmap::IndexMap;
use kafka_protocol::messages::{
    ApiKey, ProduceRequest, ProduceResponse as KafkaProduceResponse, TopicName,
};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::{
    Compression, Record as WireRecord, RecordBatchEncoder, RecordEncodeOptions, TimestampType,
    NO_PARTITION_LEADER_EPOCH, NO_PRODUCER_EPOCH, NO_PRODUCER_ID, NO_SEQUENCE,
};
use tracing::trace;

use super::KafkaClient;
use crate::error::KafkaError;
use crate::model::{PublishAck, Record};
use crate::Result;

/// Header carrying the stream sequence number alongside the payload.
pub const SEQUENCE_HEADER: &str = "x-ha-sequence";

/// Broker-side bound on waiting for all in-sync replicas.
const PRODUCE_TIMEOUT_MS: i32 = 30_000;

/// Produce one record to a topic/partition and wait for all in-sync replicas
pub async fn produce(
    client: &KafkaClient,
    topic: &str,
    partition: i32,
    record: &Record,
) -> Result<PublishAck> {
    let mut headers: IndexMap<StrBytes, Option<Bytes>> = IndexMap::new();
    headers.insert(
        StrBytes::from_static_str(SEQUENCE_HEADER),
        Some(Bytes::from(record.sequence().to_be_bytes().to_vec())),
    );

    let wire_record = WireRecord {
        transactional: false,
        control: false,
        partition_leader_epoch: NO_PARTITION_LEADER_EPOCH,
        producer_id: NO_PRODUCER_ID,
        producer_epoch: NO_PRODUCER_EPOCH,
        timestamp_type: TimestampType::Creation,
        offset: 0, // Assigned by the broker
        sequence: NO_SEQUENCE,
        timestamp: chrono::Utc::now().timestamp_millis(),
        key: Some(Bytes::from(record.sequence().to_string())),
        value: Some(record.payload().clone()),
        headers,
    };

    let options = RecordEncodeOptions {
        version: 2,
        compression: Compression::None,
    };

    let mut records_buf = BytesMut::new();
    RecordBatchEncoder::encode::<
        _,
        _,
        fn(&mut BytesMut, &mut BytesMut, kafka_protocol::records::Compression) -> anyhow::Result<()>,
    >(&mut records_buf, [wire_record].iter(), &options)
        .map_err(|e| KafkaError::Protocol(format!("Failed to encode records: {:?}", e)))?;

    let partition_data = kafka_protocol::messages::produce_request::PartitionProduceData::default()
        .with_index(partition)
        .with_records(Some(records_buf.freeze()));

    let topic_data = kafka_protocol::messages::produce_request::TopicProduceData::default()
        .with_name(TopicName(StrBytes::from_string(topic.to_string())))
        .with_partition_data(vec![partition_data]);

    let request = ProduceRequest::default()
        .with_acks(-1) // Wait for all in-sync replicas
        .with_timeout_ms(PRODUCE_TIMEOUT_MS)
        .with_topic_data(vec![topic_data]);

    let response: KafkaProduceResponse = client.send_request(ApiKey::Produce, request).await?;

    for topic_response in &response.responses {
        if topic_response.name.as_str() != topic {
            continue;
        }

        for partition_response in &topic_response.partition_responses {
            if partition_response.index != partition {
                continue;
            }

            if partition_response.error_code != 0 {
                return Err(KafkaError::BrokerError {
                    code: partition_response.error_code,
                    message: format!(
                        "Produce error for {}:{} sequence {}: code {}",
                        topic,
                        partition,
                        record.sequence(),
                        partition_response.error_code
                    ),
                }
                .into());
            }

            trace!(
                "Produced sequence {} to {}:{} at offset {}",
                record.sequence(),
                topic,
                partition,
                partition_response.base_offset
            );

            return Ok(PublishAck {
                partition,
                offset: partition_response.base_offset,
            });
        }
    }

    Err(KafkaError::Protocol("No partition response in produce response".to_string()).into())
}
