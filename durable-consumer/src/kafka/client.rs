use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::{BrokerClient, Partition, Record};
use crate::config::ConsumerConfig;
use crate::error::BrokerError;
use crate::kafka::config::ConsumerConfigBuilder;
use crate::kafka::context::DurableConsumerContext;
use crate::metrics_consts::CONSUMER_POLL_ERRORS;

/// `BrokerClient` backed by an rdkafka `StreamConsumer`.
pub struct KafkaBrokerClient {
    consumer: Arc<StreamConsumer<DurableConsumerContext>>,
    // Held by the blocking commit task until librdkafka returns, which can be
    // after the caller gave up waiting
    commit_lock: Arc<Mutex<()>>,
}

impl KafkaBrokerClient {
    /// Creating the client does not contact the brokers; that happens lazily once
    /// it subscribes and polls.
    pub fn new(config: &ConsumerConfig) -> Result<Self, BrokerError> {
        Self::from_client_config(&ConsumerConfigBuilder::from_consumer_config(config).build())
    }

    pub fn from_client_config(config: &ClientConfig) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer<DurableConsumerContext> =
            config.create_with_context(DurableConsumerContext::new())?;

        Ok(Self {
            consumer: Arc::new(consumer),
            commit_lock: Arc::new(Mutex::new(())),
        })
    }

    fn to_record(message: &BorrowedMessage<'_>) -> Record {
        Record::new(
            message.topic(),
            message.partition(),
            message.offset(),
            message.key().map(<[u8]>::to_vec),
            message.payload().map(<[u8]>::to_vec),
        )
    }
}

#[async_trait]
impl BrokerClient for KafkaBrokerClient {
    fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)?;
        info!("Subscribed to topics: {}", topics.join(", "));
        Ok(())
    }

    async fn poll(
        &self,
        timeout: Duration,
        max_records: usize,
    ) -> Result<Vec<Record>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut records = Vec::new();

        while records.len() < max_records {
            // Detach right away, borrowed messages must not be held across an await
            let received = match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Err(_) => break,
                Ok(result) => result.map(|message| Self::to_record(&message)),
            };

            match received {
                Ok(record) => records.push(record),
                // Only reported with enable.partition.eof, nothing went wrong
                Err(KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF)) => break,
                Err(e) => {
                    let error = BrokerError::from(e);
                    let kind = if error.is_fatal() { "fatal" } else { "retriable" };
                    metrics::counter!(CONSUMER_POLL_ERRORS, "kind" => kind).increment(1);
                    if records.is_empty() {
                        return Err(error);
                    }
                    // Already received records must still be dispatched
                    warn!(error = ?error, "Consumer error cut the poll short");
                    break;
                }
            }
        }

        Ok(records)
    }

    async fn commit(
        &self,
        offsets: &HashMap<Partition, i64>,
        timeout: Duration,
    ) -> Result<(), BrokerError> {
        let mut list = TopicPartitionList::new();
        for (partition, offset) in offsets {
            list.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*offset),
            )?;
        }

        // At most one commit in flight, so an older snapshot can never land after a
        // newer one
        let guard = self.commit_lock.clone().try_lock_owned().map_err(|_| {
            BrokerError::Unavailable("previous commit is still in flight".to_string())
        })?;
        let consumer = self.consumer.clone();
        let commit = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            // Synchronous so a success really means the broker stored the offsets
            consumer.commit(&list, CommitMode::Sync)
        });

        match tokio::time::timeout(timeout, commit).await {
            Ok(Ok(result)) => {
                debug!("Committed offsets for {} partitions", offsets.len());
                result.map_err(BrokerError::from)
            }
            Ok(Err(e)) => Err(BrokerError::Unavailable(format!(
                "commit task did not complete: {e}"
            ))),
            Err(_) => Err(BrokerError::CommitTimeout(timeout)),
        }
    }

    fn take_revoked(&self) -> Vec<Partition> {
        self.consumer.context().take_revoked()
    }

    /// Leaves the group right away. The underlying consumer is destroyed once a
    /// commit still running past its timeout returns as well.
    fn close(self) {
        info!("Closing Kafka consumer, leaving the group");
        self.consumer.unsubscribe();
    }
}
