//! Kafka client for protocol-level communication.

use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::messages::{ApiKey, RequestHeader, ResponseHeader};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::protocol::{Decodable, Encodable};
use socket2::{SockRef, TcpKeepalive};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::config::{KafkaConfig, SaslMechanism, SecurityProtocol};
use crate::error::KafkaError;
use crate::model::{PublishAck, Record};
use crate::{Error, Result};

use super::fetch::FetchedRecord;
use super::metadata::{ClusterMetadata, TopicMetadata};

/// Kafka client for protocol-level operations against one broker.
pub struct KafkaClient {
    /// Configuration
    config: KafkaConfig,

    /// Connection to the current broker
    connection: Mutex<Option<BrokerConnection>>,

    /// Correlation ID counter
    correlation_id: AtomicI32,
}

struct BrokerConnection {
    stream: TcpStream,
    address: String,
}

impl KafkaClient {
    /// Create a new Kafka client
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
            correlation_id: AtomicI32::new(1),
        }
    }

    /// Connect to the first reachable bootstrap server
    pub async fn connect(&self) -> Result<()> {
        for server in &self.config.bootstrap_servers {
            match self.try_connect(server).await {
                Ok(stream) => {
                    let mut conn = self.connection.lock().await;
                    *conn = Some(BrokerConnection {
                        stream,
                        address: server.clone(),
                    });
                    drop(conn);

                    if self.config.security.security_protocol == SecurityProtocol::SaslPlaintext {
                        self.authenticate().await?;
                    }

                    debug!("Connected to Kafka broker: {}", server);
                    return Ok(());
                }
                Err(e) => {
                    debug!("Failed to connect to {}: {}", server, e);
                    continue;
                }
            }
        }

        Err(KafkaError::NoBrokersAvailable.into())
    }

    /// Address of the broker this client is connected to.
    pub async fn connected_address(&self) -> Option<String> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.address.clone())
    }

    async fn try_connect(&self, server: &str) -> Result<TcpStream> {
        let tcp_stream =
            TcpStream::connect(server)
                .await
                .map_err(|e| KafkaError::ConnectionFailed {
                    broker: server.to_string(),
                    message: e.to_string(),
                })?;

        self.configure_socket(&tcp_stream, server)?;
        Ok(tcp_stream)
    }

    /// Configure TCP socket options (keepalive, nodelay) based on connection config.
    fn configure_socket(&self, stream: &TcpStream, server: &str) -> Result<()> {
        let conn_config = &self.config.connection;
        let sock_ref = SockRef::from(stream);

        if conn_config.tcp_nodelay {
            sock_ref
                .set_nodelay(true)
                .map_err(|e| KafkaError::ConnectionFailed {
                    broker: server.to_string(),
                    message: format!("Failed to set TCP_NODELAY: {}", e),
                })?;
        }

        if conn_config.tcp_keepalive {
            let keepalive = TcpKeepalive::new()
                .with_time(Duration::from_secs(conn_config.keepalive_time_secs))
                .with_interval(Duration::from_secs(conn_config.keepalive_interval_secs));

            sock_ref
                .set_tcp_keepalive(&keepalive)
                .map_err(|e| KafkaError::ConnectionFailed {
                    broker: server.to_string(),
                    message: format!("Failed to set TCP keepalive: {}", e),
                })?;
        }

        Ok(())
    }

    async fn authenticate(&self) -> Result<()> {
        let security = &self.config.security;

        match security.sasl_mechanism {
            Some(SaslMechanism::Plain) | None => {
                self.sasl_plain_auth(
                    security.sasl_username.as_deref().unwrap_or(""),
                    security.sasl_password.as_deref().unwrap_or(""),
                )
                .await
            }
        }
    }

    async fn sasl_plain_auth(&self, username: &str, password: &str) -> Result<()> {
        use kafka_protocol::messages::{SaslAuthenticateRequest, SaslHandshakeRequest};

        let handshake_request = SaslHandshakeRequest::default().with_mechanism("PLAIN".into());
        let _handshake_response: kafka_protocol::messages::SaslHandshakeResponse = self
            .send_request(ApiKey::SaslHandshake, handshake_request)
            .await?;

        // PLAIN format: \0username\0password
        let mut auth_bytes = Vec::new();
        auth_bytes.push(0);
        auth_bytes.extend_from_slice(username.as_bytes());
        auth_bytes.push(0);
        auth_bytes.extend_from_slice(password.as_bytes());

        let auth_request =
            SaslAuthenticateRequest::default().with_auth_bytes(Bytes::from(auth_bytes));
        let auth_response: kafka_protocol::messages::SaslAuthenticateResponse = self
            .send_request(ApiKey::SaslAuthenticate, auth_request)
            .await?;

        if auth_response.error_code != 0 {
            return Err(crate::Error::Authentication(format!(
                "SASL authentication failed: {}",
                auth_response
                    .error_message
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("error code {}", auth_response.error_code))
            )));
        }

        debug!("SASL PLAIN authentication successful");
        Ok(())
    }

    fn next_correlation_id(&self) -> i32 {
        self.correlation_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a request and receive a response
    pub async fn send_request<Req, Resp>(&self, api_key: ApiKey, request: Req) -> Result<Resp>
    where
        Req: Encodable + Default,
        Resp: Decodable + Default,
    {
        let correlation_id = self.next_correlation_id();
        let api_version = self.get_api_version(api_key);

        let header = RequestHeader::default()
            .with_request_api_key(api_key as i16)
            .with_request_api_version(api_version)
            .with_correlation_id(correlation_id)
            .with_client_id(Some(StrBytes::from_static_str("kafka-ha")));

        let header_version = api_key.request_header_version(api_version);
        let mut buf = BytesMut::new();

        // Reserve space for the length prefix
        buf.put_i32(0);

        header
            .encode(&mut buf, header_version)
            .map_err(|e| KafkaError::Protocol(format!("Failed to encode header: {:?}", e)))?;
        request
            .encode(&mut buf, api_version)
            .map_err(|e| KafkaError::Protocol(format!("Failed to encode request: {:?}", e)))?;

        let len = (buf.len() - 4) as i32;
        buf[0..4].copy_from_slice(&len.to_be_bytes());

        trace!(
            "Sending request: api_key={:?}, api_version={}, correlation_id={}, len={}",
            api_key,
            api_version,
            correlation_id,
            len
        );

        let mut guard = self.connection.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| KafkaError::ConnectionFailed {
                broker: "<none>".to_string(),
                message: "Not connected".to_string(),
            })?;

        if let Err(e) = conn.stream.write_all(&buf).await {
            let broker = conn.address.clone();
            // A broken stream is never reused
            *guard = None;
            return Err(KafkaError::ConnectionFailed {
                broker,
                message: format!("Failed to send request: {}", e),
            }
            .into());
        }

        let mut len_buf = [0u8; 4];
        if let Err(e) = conn.stream.read_exact(&mut len_buf).await {
            *guard = None;
            return Err(
                KafkaError::Protocol(format!("Failed to read response length: {}", e)).into(),
            );
        }
        let response_len = i32::from_be_bytes(len_buf) as usize;

        trace!("Receiving response: len={}", response_len);

        let mut response_buf = vec![0u8; response_len];
        if let Err(e) = conn.stream.read_exact(&mut response_buf).await {
            *guard = None;
            return Err(
                KafkaError::Protocol(format!("Failed to read response body: {}", e)).into(),
            );
        }

        let mut response_bytes = Bytes::from(response_buf);
        let response_header_version = api_key.response_header_version(api_version);
        let response_header = ResponseHeader::decode(&mut response_bytes, response_header_version)
            .map_err(|e| {
                KafkaError::Protocol(format!("Failed to decode response header: {:?}", e))
            })?;

        // A caller that timed out mid-request leaves a stale response on the stream
        if response_header.correlation_id != correlation_id {
            *guard = None;
            return Err(KafkaError::Protocol(format!(
                "Correlation id mismatch: expected {}, got {}",
                correlation_id, response_header.correlation_id
            ))
            .into());
        }
        drop(guard);

        let response = Resp::decode(&mut response_bytes, api_version)
            .map_err(|e| KafkaError::Protocol(format!("Failed to decode response: {:?}", e)))?;

        Ok(response)
    }

    /// Get the API version to use for a given API key
    fn get_api_version(&self, api_key: ApiKey) -> i16 {
        match api_key {
            ApiKey::Metadata => 9,
            ApiKey::Fetch => 11,
            ApiKey::Produce => 8,
            ApiKey::SaslHandshake => 1,
            ApiKey::SaslAuthenticate => 2,
            ApiKey::ListOffsets => 5,
            ApiKey::CreateTopics => 5,
            ApiKey::DeleteTopics => 4,
            _ => 0,
        }
    }

    /// Fetch cluster metadata
    pub async fn fetch_metadata(&self, topics: Option<&[String]>) -> Result<ClusterMetadata> {
        super::metadata::fetch_metadata(self, topics).await
    }

    /// Get metadata for a specific topic
    pub async fn get_topic_metadata(&self, topic: &str) -> Result<TopicMetadata> {
        let metadata = self.fetch_metadata(Some(&[topic.to_string()])).await?;
        metadata
            .topics
            .into_iter()
            .find(|t| t.name == topic)
            .ok_or_else(|| Error::from(KafkaError::TopicNotExists(topic.to_string())))?
            .into_checked()
    }

    /// Fetch records from a topic/partition
    pub async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_bytes: i32,
    ) -> Result<(Vec<FetchedRecord>, i64)> {
        super::fetch::fetch(self, topic, partition, offset, max_bytes).await
    }

    /// Latest offset (high-water mark) of a partition
    pub async fn high_watermark(&self, topic: &str, partition: i32) -> Result<i64> {
        super::fetch::list_offset(self, topic, partition, super::fetch::LATEST_TIMESTAMP).await
    }

    /// Produce a single record with acks=all
    pub async fn produce(&self, topic: &str, partition: i32, record: &Record) -> Result<PublishAck> {
        super::produce::produce(self, topic, partition, record).await
    }

    /// Create a topic
    pub async fn create_topic(
        &self,
        topic: &super::TopicToCreate,
        timeout_ms: i32,
    ) -> Result<super::CreateTopicResult> {
        super::admin::create_topic(self, topic, timeout_ms).await
    }

    /// Delete a topic
    pub async fn delete_topic(&self, topic: &str, timeout_ms: i32) -> Result<()> {
        super::admin::delete_topic(self, topic, timeout_ms).await
    }
}
