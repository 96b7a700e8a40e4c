//! In-memory broker and helpers for exercising the consumer without Kafka.
//!
//! `MemoryBroker` keeps per-partition logs and per-group committed offsets. Each
//! partition is owned by the longest-standing live member of a group subscribed to
//! its topic. A member that has not polled for its max poll interval is evicted
//! the next time anyone polls, and a closed or dropped client leaves immediately.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::broker::{BrokerClient, Partition, Record};
use crate::commit::CommitHooks;
use crate::config::ConsumerConfig;
use crate::error::BrokerError;
use crate::handler::{CompletionSink, RecordHandler};

const POLL_SLEEP: Duration = Duration::from_millis(5);

struct Member {
    group: String,
    topics: Vec<String>,
    last_poll: Instant,
    max_poll_interval: Duration,
    // Next offset to hand out, per owned partition
    positions: HashMap<Partition, i64>,
    revoked: Vec<Partition>,
}

#[derive(Default)]
struct BrokerState {
    logs: HashMap<Partition, Vec<Record>>,
    partition_counts: HashMap<String, i32>,
    committed: HashMap<(String, Partition), i64>,
    // Keyed by join order, so the lowest id is the longest-standing member
    members: std::collections::BTreeMap<u64, Member>,
    next_member_id: u64,
    available: bool,
    // Group coordinator reachability, independent of fetching
    commits_available: bool,
    commit_delay: Duration,
}

impl BrokerState {
    fn evict_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .members
            .iter()
            .filter(|(_, m)| now.duration_since(m.last_poll) > m.max_poll_interval)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            info!(member = id, "Evicting member that stopped polling");
            self.members.remove(&id);
        }
    }

    fn owner_of(&self, group: &str, partition: &Partition) -> Option<u64> {
        self.members
            .iter()
            .find(|(_, m)| m.group == group && m.topics.iter().any(|t| t == partition.topic()))
            .map(|(id, _)| *id)
    }

    /// Bring `member_id`'s assignment in line with current ownership.
    fn rebalance(&mut self, member_id: u64) {
        let Some(member) = self.members.get(&member_id) else {
            return;
        };
        let group = member.group.clone();

        let mut owned = Vec::new();
        for (topic, count) in &self.partition_counts {
            for n in 0..*count {
                let partition = Partition::new(topic.clone(), n);
                if self.owner_of(&group, &partition) == Some(member_id) {
                    owned.push(partition);
                }
            }
        }

        let committed: HashMap<Partition, i64> = owned
            .iter()
            .map(|p| {
                let offset = self
                    .committed
                    .get(&(group.clone(), p.clone()))
                    .copied()
                    .unwrap_or(0);
                (p.clone(), offset)
            })
            .collect();

        let Some(member) = self.members.get_mut(&member_id) else {
            return;
        };
        let lost: Vec<Partition> = member
            .positions
            .keys()
            .filter(|p| !owned.contains(p))
            .cloned()
            .collect();
        for partition in lost {
            debug!(member = member_id, partition = %partition, "Partition revoked");
            member.positions.remove(&partition);
            member.revoked.push(partition);
        }
        for (partition, offset) in committed {
            member.positions.entry(partition).or_insert(offset);
        }
    }
}

/// Shared handle to an in-memory broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let state = BrokerState {
            available: true,
            commits_available: true,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let mut state = self.state.lock().unwrap();
        state.partition_counts.insert(topic.to_string(), partitions);
        for n in 0..partitions {
            state.logs.entry(Partition::new(topic, n)).or_default();
        }
    }

    /// Append a UTF-8 key/value record, partitioned by key. Returns its offset.
    pub fn send(&self, topic: &str, key: &str, value: &str) -> i64 {
        let partitions = self
            .state
            .lock()
            .unwrap()
            .partition_counts
            .get(topic)
            .copied()
            .unwrap_or(1);
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let partition = (hasher.finish() % partitions as u64) as i32;

        self.send_bytes(topic, partition, Some(key), value.as_bytes().to_vec())
    }

    /// Append a raw record to a specific partition. Returns its offset.
    pub fn send_bytes(&self, topic: &str, partition: i32, key: Option<&str>, payload: Vec<u8>) -> i64 {
        let mut state = self.state.lock().unwrap();
        let log = state.logs.entry(Partition::new(topic, partition)).or_default();
        let offset = log.len() as i64;
        log.push(Record::new(
            topic,
            partition,
            offset,
            key.map(|k| k.as_bytes().to_vec()),
            Some(payload),
        ));
        offset
    }

    /// Make every poll, commit and subscribe fail until switched back on.
    pub fn set_available(&self, available: bool) {
        self.state.lock().unwrap().available = available;
    }

    /// Make commits fail while polling keeps working, as when only the group
    /// coordinator is unreachable.
    pub fn set_commits_available(&self, available: bool) {
        self.state.lock().unwrap().commits_available = available;
    }

    /// Delay every commit by `delay`.
    pub fn set_commit_delay(&self, delay: Duration) {
        self.state.lock().unwrap().commit_delay = delay;
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .unwrap()
            .committed
            .get(&(group.to_string(), Partition::new(topic, partition)))
            .copied()
    }

    pub fn member_count(&self, group: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .members
            .values()
            .filter(|m| m.group == group)
            .count()
    }

    /// A client joining the configured group once it subscribes.
    pub fn client(&self, config: &ConsumerConfig) -> MemoryBrokerClient {
        let mut state = self.state.lock().unwrap();
        state.next_member_id += 1;
        MemoryBrokerClient {
            state: self.state.clone(),
            member_id: state.next_member_id,
            group: config.kafka_consumer_group.clone(),
            max_poll_interval: config.max_poll_interval.0,
        }
    }
}

pub struct MemoryBrokerClient {
    state: Arc<Mutex<BrokerState>>,
    member_id: u64,
    group: String,
    max_poll_interval: Duration,
}

impl MemoryBrokerClient {
    fn try_poll(&self, max_records: usize) -> Result<Vec<Record>, BrokerError> {
        let mut state = self.state.lock().unwrap();
        if !state.available {
            return Err(BrokerError::Unavailable("memory broker is offline".to_string()));
        }

        let now = Instant::now();
        let Some(member) = state.members.get_mut(&self.member_id) else {
            return Err(BrokerError::Closed);
        };
        member.last_poll = now;
        state.evict_expired(now);
        if !state.members.contains_key(&self.member_id) {
            return Err(BrokerError::Closed);
        }
        state.rebalance(self.member_id);

        let BrokerState { logs, members, .. } = &mut *state;
        let Some(member) = members.get_mut(&self.member_id) else {
            return Err(BrokerError::Closed);
        };

        let mut partitions: Vec<Partition> = member.positions.keys().cloned().collect();
        partitions.sort();

        let mut records = Vec::new();
        for partition in partitions {
            let Some(log) = logs.get(&partition) else {
                continue;
            };
            let Some(position) = member.positions.get_mut(&partition) else {
                continue;
            };
            while records.len() < max_records {
                let Some(record) = usize::try_from(*position).ok().and_then(|i| log.get(i)) else {
                    break;
                };
                records.push(record.clone());
                *position += 1;
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl BrokerClient for MemoryBrokerClient {
    fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        if !state.available {
            return Err(BrokerError::Unavailable("memory broker is offline".to_string()));
        }
        state.members.insert(
            self.member_id,
            Member {
                group: self.group.clone(),
                topics: topics.to_vec(),
                last_poll: Instant::now(),
                max_poll_interval: self.max_poll_interval,
                positions: HashMap::new(),
                revoked: Vec::new(),
            },
        );
        Ok(())
    }

    async fn poll(
        &self,
        timeout: Duration,
        max_records: usize,
    ) -> Result<Vec<Record>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let records = self.try_poll(max_records)?;
            if !records.is_empty() || Instant::now() >= deadline {
                return Ok(records);
            }
            tokio::time::sleep(POLL_SLEEP).await;
        }
    }

    async fn commit(
        &self,
        offsets: &HashMap<Partition, i64>,
        _timeout: Duration,
    ) -> Result<(), BrokerError> {
        let delay = self.state.lock().unwrap().commit_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if !state.available || !state.commits_available {
            return Err(BrokerError::Unavailable(
                "group coordinator is unreachable".to_string(),
            ));
        }
        if !state.members.contains_key(&self.member_id) {
            return Err(BrokerError::Closed);
        }
        for (partition, offset) in offsets {
            state
                .committed
                .insert((self.group.clone(), partition.clone()), *offset);
        }
        Ok(())
    }

    fn take_revoked(&self) -> Vec<Partition> {
        let mut state = self.state.lock().unwrap();
        state
            .members
            .get_mut(&self.member_id)
            .map(|m| std::mem::take(&mut m.revoked))
            .unwrap_or_default()
    }

    fn close(self) {
        debug!(member = self.member_id, "Closing memory broker client");
    }
}

impl Drop for MemoryBrokerClient {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.members.remove(&self.member_id);
        }
    }
}

/// Commit hook events in the order they fired.
#[derive(Debug, Clone)]
pub enum CommitEvent {
    Before(HashMap<Partition, i64>),
    Committed(HashMap<Partition, i64>),
    Failed(HashMap<Partition, i64>, String),
}

#[derive(Default)]
pub struct RecordingCommitHooks {
    events: Mutex<Vec<CommitEvent>>,
}

impl RecordingCommitHooks {
    pub fn events(&self) -> Vec<CommitEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn committed_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, CommitEvent::Committed(_)))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, CommitEvent::Failed(..)))
            .count()
    }

    /// Highest offset committed for `partition` through these hooks.
    pub fn last_committed(&self, partition: &Partition) -> Option<i64> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                CommitEvent::Committed(offsets) => offsets.get(partition).copied(),
                _ => None,
            })
            .max()
    }
}

impl CommitHooks for RecordingCommitHooks {
    fn before_commit(&self, offsets: &HashMap<Partition, i64>) {
        self.events
            .lock()
            .unwrap()
            .push(CommitEvent::Before(offsets.clone()));
    }

    fn on_committed(&self, offsets: &HashMap<Partition, i64>) {
        self.events
            .lock()
            .unwrap()
            .push(CommitEvent::Committed(offsets.clone()));
    }

    fn on_commit_failed(&self, offsets: &HashMap<Partition, i64>, error: &BrokerError) {
        self.events
            .lock()
            .unwrap()
            .push(CommitEvent::Failed(offsets.clone(), error.to_string()));
    }
}

/// What a `RecordingHandler` does with each record it receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerMode {
    Succeed,
    Fail,
    ReturnError,
    Panic,
    /// Keep the sink and never signal
    Hold,
}

struct RecordingHandlerInner {
    mode: HandlerMode,
    received: Mutex<Vec<Record>>,
    held: Mutex<Vec<CompletionSink>>,
    calls: AtomicUsize,
}

/// Handler that records every record it sees. Clones share the same recordings.
#[derive(Clone)]
pub struct RecordingHandler {
    inner: Arc<RecordingHandlerInner>,
}

impl RecordingHandler {
    pub fn new(mode: HandlerMode) -> Self {
        Self {
            inner: Arc::new(RecordingHandlerInner {
                mode,
                received: Mutex::new(Vec::new()),
                held: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn received(&self) -> Vec<Record> {
        self.inner.received.lock().unwrap().clone()
    }

    pub fn received_values(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|r| r.value().map(str::to_string))
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }
}

impl RecordHandler for RecordingHandler {
    fn handle(&self, record: Record, sink: CompletionSink) -> anyhow::Result<()> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.received.lock().unwrap().push(record);

        match self.inner.mode {
            HandlerMode::Succeed => sink.succeed(),
            HandlerMode::Fail => sink.fail("handler rejected the record"),
            HandlerMode::ReturnError => anyhow::bail!("handler returned an error"),
            HandlerMode::Panic => panic!("handler panicked"),
            HandlerMode::Hold => self.inner.held.lock().unwrap().push(sink),
        }
        Ok(())
    }
}

/// Poll `condition` until it holds or `timeout` passes. Returns whether it held.
pub async fn wait_for<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
