//! Read-only observation of the cluster under test.
//!
//! Every call issues a fresh query; nothing is cached between calls. Each
//! attempt is bounded by the query timeout so a hung broker surfaces as
//! `Unreachable` instead of stalling the caller.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cluster::ClusterQuery;
use crate::config::ObserverOptions;
use crate::error::ErrorKind;
use crate::model::{OffsetSnapshot, TopicDescription, UnitRef};
use crate::{Error, Result};

/// Stateless metadata and offset queries with bounded retries.
#[derive(Clone)]
pub struct ClusterObserver {
    query: Arc<dyn ClusterQuery>,
    options: ObserverOptions,
}

impl ClusterObserver {
    pub fn new(query: Arc<dyn ClusterQuery>, options: ObserverOptions) -> Self {
        Self { query, options }
    }

    /// Leader and ISR of `topic`, asked of `target` or of any reachable member.
    pub async fn describe_topic(
        &self,
        topic: &str,
        target: Option<&UnitRef>,
    ) -> Result<TopicDescription> {
        let query = self.query.as_ref();
        let description = self
            .with_retries("describe_topic", topic, target, move || {
                query.describe_topic(topic, target)
            })
            .await?;
        debug!(
            "Observed {}: leader={:?}, isr={:?}",
            topic, description.leader, description.in_sync_replicas
        );
        Ok(description)
    }

    /// High-water marks of every partition, partition index ascending.
    pub async fn read_offsets(&self, topic: &str, target: Option<&UnitRef>) -> Result<OffsetSnapshot> {
        let query = self.query.as_ref();
        let snapshot = self
            .with_retries("read_offsets", topic, target, move || {
                query.read_offsets(topic, target)
            })
            .await?;
        debug!("Observed {} offsets: {:?}", topic, snapshot.as_slice());
        Ok(snapshot)
    }

    /// Every sequence number stored in `topic`.
    pub async fn read_records(&self, topic: &str) -> Result<Vec<u64>> {
        let query = self.query.as_ref();
        self.with_retries("read_records", topic, None, move || query.read_records(topic))
            .await
    }

    async fn with_retries<T, F, Fut>(
        &self,
        operation: &str,
        topic: &str,
        target: Option<&UnitRef>,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.options.attempts.max(1);
        let timeout = self.options.query_timeout();
        let via = target.map_or_else(|| "any member".to_string(), |u| u.to_string());
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match tokio::time::timeout(timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => Error::Unreachable(format!(
                    "{} of {} via {} got no answer within {:?}",
                    operation, topic, via, timeout
                )),
            };

            if error.kind() == ErrorKind::NotFound || !error.is_retryable() || attempt >= attempts {
                return Err(match error {
                    Error::Unreachable(_) | Error::NotFound(_) => error,
                    other if other.kind() == ErrorKind::Unreachable => Error::Unreachable(format!(
                        "{} of {} via {}: {}",
                        operation, topic, via, other
                    )),
                    other => other,
                });
            }

            warn!(
                "{} of {} via {} failed (attempt {}/{}): {}",
                operation, topic, via, attempt, attempts, error
            );
            tokio::time::sleep(self.options.retry_delay()).await;
        }
    }
}
