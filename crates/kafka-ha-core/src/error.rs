//! Error types for the HA harness core library.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the HA harness.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka protocol error
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// No cluster member answered within the query timeout
    #[error("Unreachable: {0}")]
    Unreachable(String),

    /// Referenced topic, partition or unit does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A perturbation could not be applied to its target
    #[error("Failed to deliver perturbation to {target}: {message}")]
    DeliveryFailed { target: String, message: String },

    /// A checked invariant did not hold
    #[error("Consistency violation ({invariant}): {detail}")]
    ConsistencyViolation { invariant: String, detail: String },

    /// A wait window or bounded call elapsed without the expected result
    #[error("Timed out after {timeout:?}: {operation}")]
    TimeoutExceeded { operation: String, timeout: Duration },

    /// Control plane command failed for a reason other than delivery
    #[error("Control plane error: {0}")]
    ControlPlane(String),

    /// Operation not permitted in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Authentication(String),
}

/// Kafka-specific errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum KafkaError {
    /// Connection failed
    #[error("Failed to connect to broker {broker}: {message}")]
    ConnectionFailed { broker: String, message: String },

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Broker error response
    #[error("Broker returned error code {code}: {message}")]
    BrokerError { code: i16, message: String },

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// No available brokers
    #[error("No available brokers")]
    NoBrokersAvailable,

    /// Topic does not exist
    #[error("Topic does not exist: {0}")]
    TopicNotExists(String),

    /// Partition not available
    #[error("Partition {partition} not available for topic {topic}")]
    PartitionNotAvailable { topic: String, partition: i32 },
}

/// Serializable classification of an error, recorded in write-session reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ErrorKind {
    Unreachable,
    NotFound,
    Timeout,
    Broker { code: i16 },
    Protocol,
    /// Retry loop abandoned because the session was stopping
    Cancelled,
    Other,
}

impl ErrorKind {
    /// Whether the failure happened after the request may have reached the
    /// leader, i.e. the record's fate is ambiguous.
    pub fn is_ack_phase(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Broker { .. } | ErrorKind::Protocol
        )
    }
}

impl Error {
    /// Classify this error for reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Unreachable(_) => ErrorKind::Unreachable,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::TimeoutExceeded { .. } => ErrorKind::Timeout,
            Error::Io(_) => ErrorKind::Unreachable,
            Error::Kafka(k) => match k {
                KafkaError::ConnectionFailed { .. }
                | KafkaError::NoBrokersAvailable
                | KafkaError::PartitionNotAvailable { .. } => ErrorKind::Unreachable,
                KafkaError::Protocol(_) => ErrorKind::Protocol,
                KafkaError::BrokerError { code, .. } => ErrorKind::Broker { code: *code },
                KafkaError::Timeout(_) => ErrorKind::Timeout,
                KafkaError::TopicNotExists(_) => ErrorKind::NotFound,
            },
            _ => ErrorKind::Other,
        }
    }

    /// Whether retrying the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Config(_)
                | Error::InvalidState(_)
                | Error::Authentication(_)
                | Error::Serialization(_)
        )
    }

    pub(crate) fn violation(invariant: &str, detail: impl Into<String>) -> Self {
        Error::ConsistencyViolation {
            invariant: invariant.to_string(),
            detail: detail.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
