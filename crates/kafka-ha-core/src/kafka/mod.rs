//! Kafka protocol client implementation.

mod admin;
mod client;
mod fetch;
mod metadata;
mod produce;
mod router;

pub use admin::{CreateTopicResult, TopicToCreate};
pub use client::KafkaClient;
pub use fetch::{FetchedRecord, EARLIEST_TIMESTAMP, LATEST_TIMESTAMP};
pub use metadata::{BrokerMetadata, ClusterMetadata, PartitionMetadata, TopicMetadata};
pub use produce::SEQUENCE_HEADER;
pub use router::PartitionLeaderRouter;
