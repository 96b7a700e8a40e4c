use std::sync::{Mutex, PoisonError};

use rdkafka::consumer::{ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::broker::Partition;

/// Consumer context that logs group events and remembers revoked partitions until
/// the consumer loop picks them up.
#[derive(Default)]
pub struct DurableConsumerContext {
    revoked: Mutex<Vec<Partition>>,
}

impl DurableConsumerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Partitions revoked since the last call.
    pub fn take_revoked(&self) -> Vec<Partition> {
        let mut revoked = self.revoked.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *revoked)
    }
}

fn partitions_of(list: &TopicPartitionList) -> Vec<Partition> {
    list.elements()
        .iter()
        .map(|elem| Partition::new(elem.topic(), elem.partition()))
        .collect()
}

impl ClientContext for DurableConsumerContext {}

impl ConsumerContext for DurableConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    return;
                }

                info!("Revoking {} partitions", partitions.count());
                self.revoked
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend(partitions_of(partitions));
            }
            Rebalance::Assign(partitions) => {
                info!("Assigning {} partitions", partitions.count());
            }
            Rebalance::Error(e) => {
                warn!(error = ?e, "Rebalance error");
            }
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            for partition in partitions_of(partitions) {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    "Partition assigned"
                );
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => {
                debug!("Broker acknowledged offsets for {} partitions", offsets.count());
            }
            Err(e) => {
                warn!("Broker rejected offset commit: {}", e);
            }
        }
    }
}
