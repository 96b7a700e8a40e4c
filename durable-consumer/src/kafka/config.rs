use rdkafka::ClientConfig;

use crate::config::ConsumerConfig;

/// Kafka consumer configuration builder with the defaults a durable group consumer
/// needs: offsets are only ever committed explicitly, never stored or committed
/// automatically by librdkafka.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Group consumer with auto commit and auto offset store disabled.
    pub fn for_group_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "45000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .set("auto.offset.reset", "earliest");

        Self { config }
    }

    /// Builder populated from a `ConsumerConfig`.
    ///
    /// librdkafka rejects a session timeout above the max poll interval, so the
    /// session timeout is capped at it, and the heartbeat kept at a third of the
    /// session timeout or less.
    pub fn from_consumer_config(config: &ConsumerConfig) -> Self {
        let max_poll_ms = duration_ms(config.max_poll_interval.0);
        let session_ms = duration_ms(config.session_timeout.0).min(max_poll_ms);
        let heartbeat_ms = (session_ms / 3).clamp(1, 3000);

        let mut builder = Self::for_group_consumer(&config.kafka_hosts, &config.kafka_consumer_group)
            .with_tls(config.kafka_tls)
            .with_offset_reset(&config.kafka_consumer_offset_reset)
            .with_max_poll_interval_ms(max_poll_ms)
            .with_session_timeout_ms(session_ms)
            .with_heartbeat_interval_ms(heartbeat_ms);

        for (key, value) in &config.kafka_consumer_properties.0 {
            builder = builder.set(key, value);
        }
        builder
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Set maximum time between poll() calls before the consumer leaves the group
    pub fn with_max_poll_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("max.poll.interval.ms", ms.to_string());
        self
    }

    /// How long the broker waits for heartbeats before declaring the consumer dead
    pub fn with_session_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("session.timeout.ms", ms.to_string());
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("heartbeat.interval.ms", ms.to_string());
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

fn duration_ms(duration: std::time::Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}
