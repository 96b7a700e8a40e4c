use std::time::Duration;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

/// Errors raised by a broker client while polling or committing.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("commit did not complete within {0:?}")]
    CommitTimeout(Duration),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker client is closed")]
    Closed,
}

impl BrokerError {
    /// Errors that retrying the same call will not clear. Everything else is
    /// transient: connectivity, timeouts, rebalances in progress.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::Closed
                | BrokerError::Kafka(
                    KafkaError::MessageConsumptionFatal(_)
                        | KafkaError::Canceled
                        | KafkaError::Global(RDKafkaErrorCode::Authentication)
                )
        )
    }
}

/// Errors affecting the lifecycle of a consumer runtime.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("failed to subscribe to topics: {0}")]
    Subscribe(#[source] BrokerError),
    #[error("consumer runtime was already started")]
    AlreadyStarted,
    #[error("consumer polling loop panicked")]
    LoopPanicked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        let fatal = [
            BrokerError::Kafka(KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::Fail)),
            BrokerError::Kafka(KafkaError::Global(RDKafkaErrorCode::Authentication)),
            BrokerError::Kafka(KafkaError::Canceled),
            BrokerError::Closed,
        ];
        for e in fatal {
            assert!(e.is_fatal(), "{e} should be fatal");
        }
    }

    #[test]
    fn test_retriable_errors() {
        let retriable = [
            BrokerError::Kafka(KafkaError::Global(RDKafkaErrorCode::AllBrokersDown)),
            BrokerError::Kafka(KafkaError::Global(
                RDKafkaErrorCode::BrokerTransportFailure,
            )),
            BrokerError::Kafka(KafkaError::MessageConsumption(
                RDKafkaErrorCode::OperationTimedOut,
            )),
            BrokerError::CommitTimeout(Duration::from_secs(1)),
            BrokerError::Unavailable("offline".to_string()),
        ];
        for e in retriable {
            assert!(!e.is_fatal(), "{e} should be retriable");
        }
    }
}
