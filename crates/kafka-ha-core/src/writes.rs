//! Continuous write session: a background loop publishing a numbered stream.
//!
//! Sequence numbers come from a single counter owned by the session, so no
//! number is ever issued twice, including across a stop and restart. Publish
//! failures are retried with exponential backoff; a record that exhausts its
//! attempts is written off in the report and the loop moves on.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cluster::RecordPublisher;
use crate::config::WriteOptions;
use crate::error::{ErrorKind, KafkaError};
use crate::model::{PublishAck, Record, WriteFailure, WriteSessionReport};
use crate::{Error, Result};

/// Live counters of a running session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteProgress {
    pub last_sent_sequence: Option<u64>,
    pub last_acked_sequence: Option<u64>,
    pub records_acked: usize,
    pub send_errors: usize,
    pub ack_errors: usize,
}

#[derive(Debug, Default)]
struct Ledger {
    started_at: Option<DateTime<Utc>>,
    last_sent: Option<u64>,
    first_acked: Option<u64>,
    last_acked: Option<u64>,
    acked: Vec<u64>,
    send_errors: Vec<WriteFailure>,
    ack_errors: Vec<WriteFailure>,
}

impl Ledger {
    fn record_ack(&mut self, sequence: u64) {
        self.first_acked.get_or_insert(sequence);
        self.last_acked = Some(sequence);
        self.acked.push(sequence);
    }

    fn record_failure(&mut self, failure: WriteFailure, ack_phase: bool) {
        if ack_phase {
            self.ack_errors.push(failure);
        } else {
            self.send_errors.push(failure);
        }
    }
}

/// Outcome of publishing one record with retries.
enum Delivery {
    Acked(PublishAck),
    Failed { failure: WriteFailure, ack_phase: bool },
    /// Stop requested while waiting to retry
    Cancelled { failure: WriteFailure, ack_phase: bool },
}

struct RunningLoop {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// State shared between the session and its loop task.
#[derive(Clone)]
struct LoopContext {
    topic: String,
    options: WriteOptions,
    publisher: Arc<dyn RecordPublisher>,
    next_sequence: Arc<AtomicU64>,
    ledger: Arc<Mutex<Ledger>>,
}

/// Publishes `0, 1, 2, ...` to one topic until stopped.
pub struct ContinuousWriteSession {
    context: LoopContext,
    running: Option<RunningLoop>,
}

impl ContinuousWriteSession {
    pub fn new(
        topic: impl Into<String>,
        options: WriteOptions,
        publisher: Arc<dyn RecordPublisher>,
    ) -> Self {
        Self {
            context: LoopContext {
                topic: topic.into(),
                options,
                publisher,
                next_sequence: Arc::new(AtomicU64::new(0)),
                ledger: Arc::new(Mutex::new(Ledger::default())),
            },
            running: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.context.topic
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Launch the background write loop.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::InvalidState(format!(
                "write session on {} is already running",
                self.context.topic
            )));
        }

        self.context
            .ledger
            .lock()
            .started_at
            .get_or_insert_with(Utc::now);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let context = self.context.clone();
        let handle = tokio::spawn(async move { context.run(shutdown_rx).await });

        info!(
            "Started continuous writes to {} at sequence {}",
            self.context.topic,
            self.context.next_sequence.load(Ordering::SeqCst)
        );
        self.running = Some(RunningLoop {
            shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Counters as of now; the loop keeps running.
    pub fn progress(&self) -> WriteProgress {
        let ledger = self.context.ledger.lock();
        WriteProgress {
            last_sent_sequence: ledger.last_sent,
            last_acked_sequence: ledger.last_acked,
            records_acked: ledger.acked.len(),
            send_errors: ledger.send_errors.len(),
            ack_errors: ledger.ack_errors.len(),
        }
    }

    /// Stop the loop and return the final report.
    ///
    /// An attempt already in flight finishes; no new attempt starts.
    pub async fn stop(&mut self) -> Result<WriteSessionReport> {
        let running = self.running.take().ok_or_else(|| {
            Error::InvalidState(format!(
                "write session on {} is not running",
                self.context.topic
            ))
        })?;

        let _ = running.shutdown_tx.send(());
        running
            .handle
            .await
            .map_err(|e| Error::InvalidState(format!("write loop aborted: {}", e)))?;

        let report = self.report();
        info!(
            "Stopped continuous writes to {}: sent={}, acked={}, send_errors={}, ack_errors={}",
            report.topic,
            report.records_sent(),
            report.records_acked(),
            report.send_errors.len(),
            report.ack_errors.len()
        );
        Ok(report)
    }

    /// Reset counters and discard the topic's records. Only allowed while stopped.
    pub async fn clear(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::InvalidState(format!(
                "cannot clear {} while writes are running",
                self.context.topic
            )));
        }

        self.context
            .publisher
            .reset_topic(&self.context.topic)
            .await?;
        *self.context.ledger.lock() = Ledger::default();
        self.context.next_sequence.store(0, Ordering::SeqCst);
        info!("Cleared write session on {}", self.context.topic);
        Ok(())
    }

    fn report(&self) -> WriteSessionReport {
        let ledger = self.context.ledger.lock();
        let now = Utc::now();
        WriteSessionReport {
            topic: self.context.topic.clone(),
            started_at: ledger.started_at.unwrap_or(now),
            stopped_at: now,
            last_sent_sequence: ledger.last_sent,
            first_acked_sequence: ledger.first_acked,
            last_acked_sequence: ledger.last_acked,
            acked_sequences: ledger.acked.clone(),
            send_errors: ledger.send_errors.clone(),
            ack_errors: ledger.ack_errors.clone(),
        }
    }
}

impl Drop for ContinuousWriteSession {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            warn!(
                "Write session on {} dropped while running; stopping loop",
                self.context.topic
            );
            let _ = running.shutdown_tx.send(());
        }
    }
}

impl LoopContext {
    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
            let record = Record::new(sequence);
            self.ledger.lock().last_sent = Some(sequence);

            match self.deliver(&record, &mut shutdown_rx).await {
                Delivery::Acked(ack) => {
                    trace!(
                        "Sequence {} acked at {}:{}",
                        sequence,
                        ack.partition,
                        ack.offset
                    );
                    self.ledger.lock().record_ack(sequence);
                }
                Delivery::Failed { failure, ack_phase } => {
                    warn!(
                        "Giving up on sequence {} after {} attempts: {}",
                        sequence, failure.attempts, failure.message
                    );
                    self.ledger.lock().record_failure(failure, ack_phase);
                }
                Delivery::Cancelled { failure, ack_phase } => {
                    debug!("Sequence {} abandoned by stop request", sequence);
                    self.ledger.lock().record_failure(failure, ack_phase);
                    return;
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(self.options.interval()) => {}
            }
        }
    }

    /// Publish one record, retrying with exponential backoff.
    async fn deliver(
        &self,
        record: &Record,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Delivery {
        let timeout = self.options.publish_timeout();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                timeout,
                self.publisher.publish(&self.topic, record),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(KafkaError::Timeout(format!(
                    "publish of sequence {} exceeded {:?}",
                    record.sequence(),
                    timeout
                ))
                .into()),
            };

            let error = match result {
                Ok(ack) => return Delivery::Acked(ack),
                Err(e) => e,
            };

            let kind = error.kind();
            let failure = WriteFailure {
                sequence: record.sequence(),
                kind,
                attempts: attempt,
                message: error.to_string(),
            };
            if attempt >= self.options.max_attempts || !error.is_retryable() {
                return Delivery::Failed {
                    failure,
                    ack_phase: kind.is_ack_phase(),
                };
            }

            let delay = backoff_delay(&self.options, record.sequence(), attempt);
            debug!(
                "Publish of sequence {} failed (attempt {}/{}), retrying in {:?}: {}",
                record.sequence(),
                attempt,
                self.options.max_attempts,
                delay,
                error
            );

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    return Delivery::Cancelled {
                        failure: WriteFailure {
                            kind: ErrorKind::Cancelled,
                            ..failure
                        },
                        ack_phase: kind.is_ack_phase(),
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Exponential backoff capped at `max_backoff_ms`, plus under 10% jitter.
///
/// The jitter is a hash of the sequence and attempt, so retries of
/// neighbouring records spread out while a given retry always waits the same.
fn backoff_delay(options: &WriteOptions, sequence: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let backoff_ms = options
        .initial_backoff_ms
        .saturating_mul(1u64 << exponent)
        .min(options.max_backoff_ms);
    let spread = sequence
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(u64::from(attempt))
        % 1_000;
    let jitter_ms = backoff_ms.saturating_mul(spread) / 10_000;
    Duration::from_millis((backoff_ms + jitter_ms).min(options.max_backoff_ms))
}
