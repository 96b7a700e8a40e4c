use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

/// A record read from the broker, owned by the runtime for one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
}

impl Record {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key,
            payload,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn topic_partition(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition)
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// The key as UTF-8, if present and valid.
    pub fn key_str(&self) -> Option<&str> {
        self.key().and_then(|k| std::str::from_utf8(k).ok())
    }

    /// The payload as UTF-8, if present and valid.
    pub fn value(&self) -> Option<&str> {
        self.payload().and_then(|p| std::str::from_utf8(p).ok())
    }
}

/// The broker client the runtime drives. The runtime is the only caller, from a
/// single task, so implementations need no internal coordination between calls.
///
/// Offsets handed to `commit` are the next offset to consume for each partition
/// (last completed offset + 1), following Kafka's convention.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Join the configured consumer group and subscribe to `topics`.
    fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for records, returning at most `max_records`. An empty
    /// batch means nothing arrived in time.
    async fn poll(&self, timeout: Duration, max_records: usize)
        -> Result<Vec<Record>, BrokerError>;

    async fn commit(
        &self,
        offsets: &HashMap<Partition, i64>,
        timeout: Duration,
    ) -> Result<(), BrokerError>;

    /// Partitions taken away from this member since the last call.
    fn take_revoked(&self) -> Vec<Partition> {
        Vec::new()
    }

    /// Leave the group and release the connection.
    fn close(self)
    where
        Self: Sized;
}
