pub mod client;
pub mod config;
pub mod context;

pub use client::KafkaBrokerClient;
pub use config::ConsumerConfigBuilder;
pub use context::DurableConsumerContext;
