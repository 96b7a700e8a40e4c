//! Watermark Tracker - tracks which dispatched offsets have been handled
//!
//! Per partition, the tracker keeps only the dispatched offsets that are not yet
//! resolved successfully: those still waiting for a completion and those that
//! failed. An offset handled successfully is forgotten at once; each retained entry
//! remembers the offset dispatched right before it, which is all the watermark needs
//! once every lower entry is gone. A failed or still pending offset blocks the
//! watermark, and everything above, for as long as this tracker lives.
//!
//! The tracker is owned by the consumer loop. Handlers never touch it; their
//! completions reach it through the loop.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, warn};

use crate::broker::Partition;
use crate::metrics_consts::{PARTITION_PENDING, PARTITION_RESETS, PARTITION_WATERMARK};

/// Identifies one dispatch. Completions carry it back so a completion that belongs
/// to a partition's earlier generation can be told apart and ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DispatchId {
    pub partition: Partition,
    pub offset: i64,
    pub generation: u64,
}

#[derive(Debug)]
struct OffsetEntry {
    /// Dispatches at this offset still waiting for a completion
    outstanding: usize,
    /// Set once any dispatch at this offset completed unsuccessfully
    failed: bool,
    /// Offset dispatched just before this one in the same generation
    previous: Option<i64>,
}

struct PartitionState {
    generation: u64,
    /// Dispatched offsets that are pending or failed
    entries: BTreeMap<i64, OffsetEntry>,
    /// Number of entries with outstanding dispatches
    pending: usize,
    highest_dispatched: Option<i64>,
    watermark: Option<i64>,
}

impl PartitionState {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            entries: BTreeMap::new(),
            pending: 0,
            highest_dispatched: None,
            watermark: None,
        }
    }

    /// Everything below the lowest retained entry resolved successfully.
    fn advance(&mut self) -> bool {
        let candidate = match self.entries.first_key_value() {
            Some((_, first)) => first.previous,
            None => self.highest_dispatched,
        };
        if candidate > self.watermark {
            self.watermark = candidate;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
pub struct WatermarkTracker {
    partitions: HashMap<Partition, PartitionState>,
    next_generation: u64,
}

impl WatermarkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a single dispatch of `offset`.
    pub fn record_dispatched(&mut self, partition: &Partition, offset: i64) -> DispatchId {
        self.record_dispatched_n(partition, offset, 1)
    }

    /// Record `count` dispatches of the same physical `offset`, one per logical
    /// message it carries. With `count == 0` the offset is handled immediately.
    ///
    /// Offsets are expected in strictly increasing order per partition. An offset at
    /// or below the highest one already dispatched means the broker repositioned the
    /// partition; its state is discarded and tracking restarts from `offset`.
    pub fn record_dispatched_n(
        &mut self,
        partition: &Partition,
        offset: i64,
        count: usize,
    ) -> DispatchId {
        let repositioned = self
            .partitions
            .get(partition)
            .map(|state| state.highest_dispatched.is_some_and(|h| offset <= h));
        match repositioned {
            Some(false) => {}
            Some(true) => {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    "Offset went backwards, resetting partition tracking"
                );
                metrics::counter!(
                    PARTITION_RESETS,
                    "topic" => partition.topic().to_string(),
                    "partition" => partition.partition_number().to_string()
                )
                .increment(1);
                self.partitions.remove(partition);
            }
            None => {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    "Tracking new partition"
                );
            }
        }

        let next_generation = &mut self.next_generation;
        let state = self
            .partitions
            .entry(partition.clone())
            .or_insert_with(|| {
                *next_generation += 1;
                PartitionState::new(*next_generation)
            });
        let generation = state.generation;
        let previous = state.highest_dispatched.replace(offset);
        if count > 0 {
            state.entries.insert(
                offset,
                OffsetEntry {
                    outstanding: count,
                    failed: false,
                    previous,
                },
            );
            state.pending += 1;
        }
        state.advance();
        Self::publish(partition, state);

        DispatchId {
            partition: partition.clone(),
            offset,
            generation,
        }
    }

    /// Record the completion of one dispatch. Returns true if the watermark moved.
    pub fn record_completed(&mut self, dispatch: &DispatchId, ok: bool) -> bool {
        let partition = &dispatch.partition;
        let Some(state) = self.partitions.get_mut(partition) else {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = dispatch.offset,
                "Ignoring completion for untracked partition"
            );
            return false;
        };

        if state.generation != dispatch.generation {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = dispatch.offset,
                generation = dispatch.generation,
                current_generation = state.generation,
                "Ignoring completion from a previous partition generation"
            );
            return false;
        }

        let Some(entry) = state.entries.get_mut(&dispatch.offset) else {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = dispatch.offset,
                "Completion for an offset that is not pending"
            );
            return false;
        };

        if entry.outstanding == 0 {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = dispatch.offset,
                "Surplus completion for an already resolved offset"
            );
            return false;
        }

        entry.outstanding -= 1;
        if !ok {
            if !entry.failed {
                info!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = dispatch.offset,
                    "Offset failed, watermark is blocked until redelivery"
                );
            }
            entry.failed = true;
        }
        if entry.outstanding == 0 {
            state.pending -= 1;
            if !entry.failed {
                state.entries.remove(&dispatch.offset);
            }
        }

        let advanced = state.advance();
        Self::publish(partition, state);
        advanced
    }

    /// Highest offset that, together with every lower dispatched offset, completed
    /// successfully.
    pub fn current_watermark(&self, partition: &Partition) -> Option<i64> {
        self.partitions.get(partition).and_then(|s| s.watermark)
    }

    /// Next offset to consume for every partition that has a watermark.
    pub fn committable_offsets(&self) -> HashMap<Partition, i64> {
        self.partitions
            .iter()
            .filter_map(|(partition, state)| {
                state.watermark.map(|offset| (partition.clone(), offset + 1))
            })
            .collect()
    }

    /// Offsets dispatched on `partition` that still await a completion.
    pub fn pending_offsets(&self, partition: &Partition) -> Vec<i64> {
        self.partitions
            .get(partition)
            .map(|state| {
                state
                    .entries
                    .iter()
                    .filter(|(_, e)| e.outstanding > 0)
                    .map(|(offset, _)| *offset)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Offsets on `partition` that failed and now hold the watermark back.
    pub fn failed_offsets(&self, partition: &Partition) -> Vec<i64> {
        self.partitions
            .get(partition)
            .map(|state| {
                state
                    .entries
                    .iter()
                    .filter(|(_, e)| e.failed)
                    .map(|(offset, _)| *offset)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.partitions.values().map(|state| state.pending).sum()
    }

    /// Forget a partition, e.g. after it was revoked from this member.
    pub fn clear_partition(&mut self, partition: &Partition) {
        if self.partitions.remove(partition).is_some() {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Cleared watermark tracking for revoked partition"
            );
        }
    }

    pub fn clear_all(&mut self) {
        self.partitions.clear();
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn publish(partition: &Partition, state: &PartitionState) {
        if let Some(watermark) = state.watermark {
            metrics::gauge!(
                PARTITION_WATERMARK,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .set(watermark as f64);
        }
        metrics::gauge!(
            PARTITION_PENDING,
            "topic" => partition.topic().to_string(),
            "partition" => partition.partition_number().to_string()
        )
        .set(state.pending as f64);
    }
}
