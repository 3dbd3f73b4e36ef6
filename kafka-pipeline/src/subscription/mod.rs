//! Subscriptions - one running pipeline fed by one transport
//!
//! Each subscription owns a long-running consumption loop that reads records
//! sequentially from its transport, decodes them and pushes them into the head
//! of its pipeline. Stage hand-offs are bounded, so a slow pipeline stalls the
//! loop instead of buffering.
//!
//! Unsubscribing cancels the loop; the loop then completes the pipeline head,
//! waits for every stage to drain (in-flight items finish, partial batches
//! flush) and only then closes the transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::kafka::message::Message;
use crate::kafka::metrics_consts::{
    CONSUMER_DECODE_ERRORS, CONSUMER_MESSAGES_RECEIVED, CONSUMER_TRANSPORT_ERRORS,
    SUBSCRIPTIONS_ACTIVE, UNSUBSCRIBE_TIMEOUTS,
};
use crate::kafka::transport::{Committer, Transport, TransportCommitter};
use crate::pipelines::{Pipeline, Stage};

pub mod decoder;
pub mod manager;

pub use decoder::{JsonDecoder, PayloadDecoder, Utf8Decoder};
pub use manager::{HandlerRegistry, SubscriptionManager, SubscriptionRequest};

/// Base delay after a consume error; multiplied by the number of consecutive errors.
pub const CONSUME_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const MAX_CONSUME_ERROR_BACKOFF_STEPS: u32 = 10;

struct Shared {
    topic: String,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
    query_timeout: Duration,
}

/// Live handle to one running pipeline. Clones refer to the same subscription.
#[derive(Clone)]
pub struct Subscription {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.shared.topic)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Start the consumption loop for an already subscribed transport.
    pub(crate) fn start<T: Send + Sync + 'static>(
        topic: String,
        transport: Arc<dyn Transport>,
        decoder: Arc<dyn PayloadDecoder<T>>,
        pipeline: Pipeline<T>,
        cancel: CancellationToken,
        query_timeout: Duration,
    ) -> Self {
        let (done_tx, done_rx) = watch::channel(false);

        let consumer = ConsumptionLoop {
            topic: topic.clone(),
            transport: transport.clone(),
            decoder,
            head: pipeline.head().clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(async move {
            consumer.run().await;
            done_tx.send_replace(true);
        });

        Self {
            shared: Arc::new(Shared {
                topic,
                transport,
                cancel,
                done: done_rx,
                query_timeout,
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    /// Partition numbers currently assigned. Empty once the subscription has closed.
    pub fn partitions(&self) -> Vec<i32> {
        match self.shared.transport.assignment() {
            Ok(partitions) => partitions.iter().map(|p| p.partition_number()).collect(),
            Err(e) => {
                debug!(topic = %self.shared.topic, error = ?e, "No assignment available");
                vec![]
            }
        }
    }

    /// Committed position per assigned partition, as `(partition, next offset)`.
    /// Partitions without a commit, or whose query failed, report None.
    pub fn committed_offsets(&self) -> Vec<(i32, Option<i64>)> {
        let Ok(partitions) = self.shared.transport.assignment() else {
            return vec![];
        };
        partitions
            .iter()
            .map(|partition| {
                let committed = self
                    .shared
                    .transport
                    .committed(partition, self.shared.query_timeout)
                    .unwrap_or_else(|e| {
                        warn!(
                            topic = partition.topic(),
                            partition = partition.partition_number(),
                            error = ?e,
                            "Failed to query committed offset"
                        );
                        None
                    });
                (partition.partition_number(), committed)
            })
            .collect()
    }

    pub fn is_running(&self) -> bool {
        !*self.shared.done.borrow()
    }

    /// Resolves once the consumption loop has drained and closed the transport.
    pub async fn completion(&self) {
        let mut done = self.shared.done.clone();
        if done.wait_for(|finished| *finished).await.is_err() {
            debug!(topic = %self.shared.topic, "Consumption loop dropped its completion signal");
        }
    }

    /// Stop consuming and wait up to `timeout` for the pipeline to drain.
    /// Returns false if the drain did not finish in time; it keeps running in
    /// the background.
    pub async fn unsubscribe(&self, timeout: Duration) -> bool {
        info!(topic = %self.shared.topic, "Unsubscribing");
        self.shared.cancel.cancel();

        match tokio::time::timeout(timeout, self.completion()).await {
            Ok(()) => {
                info!(topic = %self.shared.topic, "Unsubscribed");
                true
            }
            Err(_) => {
                warn!(
                    topic = %self.shared.topic,
                    timeout_ms = timeout.as_millis() as u64,
                    "Unsubscribe timed out before the pipeline drained"
                );
                metrics::counter!(UNSUBSCRIBE_TIMEOUTS).increment(1);
                false
            }
        }
    }
}

struct ConsumptionLoop<T> {
    topic: String,
    transport: Arc<dyn Transport>,
    decoder: Arc<dyn PayloadDecoder<T>>,
    head: Arc<dyn Stage<Message<T>>>,
    cancel: CancellationToken,
}

impl<T: Send + Sync + 'static> ConsumptionLoop<T> {
    async fn run(self) {
        info!(topic = %self.topic, pipeline = self.head.name(), "Consumption loop started");
        metrics::gauge!(SUBSCRIPTIONS_ACTIVE).increment(1.0);

        let committer: Arc<dyn Committer> = Arc::new(TransportCommitter(self.transport.clone()));
        let mut consecutive_errors: u32 = 0;

        loop {
            let record = match self.transport.consume(&self.cancel).await {
                Ok(Some(record)) => {
                    consecutive_errors = 0;
                    record
                }
                Ok(None) => break,
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    warn!(
                        topic = %self.topic,
                        consecutive_errors = consecutive_errors,
                        error = ?e,
                        "Error consuming from transport"
                    );
                    metrics::counter!(
                        CONSUMER_TRANSPORT_ERRORS,
                        "error_type" => e.error_type()
                    )
                    .increment(1);

                    let backoff = CONSUME_ERROR_BACKOFF
                        * consecutive_errors.min(MAX_CONSUME_ERROR_BACKOFF_STEPS);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => continue,
                    }
                }
            };

            metrics::counter!(CONSUMER_MESSAGES_RECEIVED, "topic" => self.topic.clone())
                .increment(1);

            let value = match self.decoder.decode(&record) {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        topic = %self.topic,
                        partition = record.partition.partition_number(),
                        offset = record.offset,
                        error = ?e,
                        "Skipping record with undecodable payload"
                    );
                    metrics::counter!(CONSUMER_DECODE_ERRORS, "topic" => self.topic.clone())
                        .increment(1);
                    continue;
                }
            };

            let message = Message::from_record(record, value, committer.clone());
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = self.head.send(message) => accepted,
            };
            if !accepted {
                break;
            }
        }

        info!(topic = %self.topic, "Consumption stopped - draining pipeline");
        self.head.complete();
        self.head.completion().await;
        self.transport.close();
        metrics::gauge!(SUBSCRIPTIONS_ACTIVE).decrement(1.0);
        info!(topic = %self.topic, "Pipeline drained and transport closed");
    }
}
