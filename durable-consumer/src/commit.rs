//! Commit Coordinator - persists watermarks to the broker on a fixed cadence
//!
//! Every attempt snapshots the tracker's committable offsets, sends only the
//! partitions that moved since the last successful commit, and bounds the broker
//! call with the commit timeout. A failed attempt changes nothing locally, so the
//! next attempt simply retries with whatever is committable by then.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::broker::{BrokerClient, Partition};
use crate::error::BrokerError;
use crate::metrics_consts::{COMMIT_ATTEMPTS, COMMIT_DURATION_MS};
use crate::watermark::WatermarkTracker;

/// Observer for commit attempts. For each attempt `before_commit` fires first,
/// followed by exactly one of `on_committed` or `on_commit_failed`.
pub trait CommitHooks: Send + Sync {
    fn before_commit(&self, _offsets: &HashMap<Partition, i64>) {}

    fn on_committed(&self, _offsets: &HashMap<Partition, i64>) {}

    fn on_commit_failed(&self, _offsets: &HashMap<Partition, i64>, _error: &BrokerError) {}
}

/// Hooks that do nothing
pub struct NoopCommitHooks;

impl CommitHooks for NoopCommitHooks {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// No partition moved since the last successful commit
    NothingToCommit,
    /// Offsets for this many partitions were committed
    Committed(usize),
    Failed,
}

pub struct CommitCoordinator {
    commit_timeout: Duration,
    last_committed: HashMap<Partition, i64>,
    hooks: Arc<dyn CommitHooks>,
}

impl CommitCoordinator {
    pub fn new(commit_timeout: Duration, hooks: Arc<dyn CommitHooks>) -> Self {
        Self {
            commit_timeout,
            last_committed: HashMap::new(),
            hooks,
        }
    }

    pub async fn attempt_commit<C: BrokerClient>(
        &mut self,
        client: &C,
        tracker: &WatermarkTracker,
    ) -> CommitOutcome {
        let offsets: HashMap<Partition, i64> = tracker
            .committable_offsets()
            .into_iter()
            .filter(|(partition, offset)| self.last_committed.get(partition) != Some(offset))
            .collect();

        if offsets.is_empty() {
            debug!("No new offsets to commit");
            return CommitOutcome::NothingToCommit;
        }

        self.hooks.before_commit(&offsets);

        let start = Instant::now();
        let result = match tokio::time::timeout(
            self.commit_timeout,
            client.commit(&offsets, self.commit_timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BrokerError::CommitTimeout(self.commit_timeout)),
        };
        metrics::histogram!(COMMIT_DURATION_MS).record(start.elapsed().as_millis() as f64);

        match result {
            Ok(()) => {
                info!("Committed offsets for {} partitions", offsets.len());
                metrics::counter!(COMMIT_ATTEMPTS, "status" => "success").increment(1);
                self.hooks.on_committed(&offsets);
                let committed = offsets.len();
                self.last_committed.extend(offsets);
                CommitOutcome::Committed(committed)
            }
            Err(e) => {
                warn!(
                    error = ?e,
                    partitions = offsets.len(),
                    "Failed to commit offsets, will retry on next tick"
                );
                metrics::counter!(COMMIT_ATTEMPTS, "status" => "failed").increment(1);
                self.hooks.on_commit_failed(&offsets, &e);
                CommitOutcome::Failed
            }
        }
    }

    /// Last offset successfully committed for `partition` by this coordinator.
    pub fn last_committed(&self, partition: &Partition) -> Option<i64> {
        self.last_committed.get(partition).copied()
    }

    /// Drop bookkeeping for partitions no longer owned by this member.
    pub fn forget_partitions(&mut self, partitions: &[Partition]) {
        for partition in partitions {
            self.last_committed.remove(partition);
        }
    }
}
