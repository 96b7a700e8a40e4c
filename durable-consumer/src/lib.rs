//! At-least-once Kafka consumption with explicit completion signalling.
//!
//! Records are dispatched to a `RecordHandler` as soon as they are polled. The
//! handler reports success or failure through a `CompletionSink`, and an offset is
//! committed only once it and every offset below it on the same partition were
//! handled successfully. Anything else is redelivered to the next consumer that
//! picks the partition up.
//!
//! Payloads starting with the multi-message magic prefix (see `codec`) are
//! unpacked and each message they carry is dispatched on its own.

pub mod broker;
pub mod codec;
pub mod commit;
pub mod config;
pub mod error;
pub mod handler;
pub mod kafka;
pub mod metrics_consts;
pub mod runtime;
pub mod watermark;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

pub use broker::{BrokerClient, Partition, Record};
pub use commit::{CommitHooks, NoopCommitHooks};
pub use config::{ConsumerConfig, StopPolicy};
pub use error::{BrokerError, ConsumerError};
pub use handler::{AsyncHandler, CompletionSink, HandlerOutcome, RecordHandler};
pub use kafka::KafkaBrokerClient;
pub use runtime::{ConsumerRuntime, RuntimeState};
