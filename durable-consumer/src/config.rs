use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

/// Consumer settings, resolved once and never changed after the runtime starts.
#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    pub kafka_consumer_group: String,

    pub kafka_consumer_topics: TopicList,

    // Where a group with no committed offset starts: earliest, latest
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Upper bound on a single offset commit call
    #[envconfig(default = "5000")]
    pub commit_timeout: EnvMsDuration,

    // How often the current watermarks are committed
    #[envconfig(default = "1000")]
    pub commit_interval: EnvMsDuration,

    // How long one poll waits for records
    #[envconfig(default = "100")]
    pub poll_timeout: EnvMsDuration,

    #[envconfig(default = "500")]
    pub max_poll_records: usize,

    // The broker evicts a member that does not poll within this interval
    #[envconfig(default = "300000")]
    pub max_poll_interval: EnvMsDuration,

    #[envconfig(default = "45000")]
    pub session_timeout: EnvMsDuration,

    #[envconfig(default = "hard")]
    pub stop_policy: StopPolicy,

    // Extra librdkafka properties, "key=value,key=value"
    #[envconfig(default = "")]
    pub kafka_consumer_properties: PropertyList,
}

impl ConsumerConfig {
    /// Config with the same defaults as the environment loader.
    pub fn new(kafka_hosts: &str, group: &str, topics: &[&str]) -> Self {
        Self {
            kafka_hosts: kafka_hosts.to_string(),
            kafka_consumer_group: group.to_string(),
            kafka_consumer_topics: TopicList(topics.iter().map(|t| t.to_string()).collect()),
            kafka_consumer_offset_reset: "earliest".to_string(),
            kafka_tls: false,
            commit_timeout: EnvMsDuration::from_millis(5000),
            commit_interval: EnvMsDuration::from_millis(1000),
            poll_timeout: EnvMsDuration::from_millis(100),
            max_poll_records: 500,
            max_poll_interval: EnvMsDuration::from_millis(300_000),
            session_timeout: EnvMsDuration::from_millis(45_000),
            stop_policy: StopPolicy::Hard,
            kafka_consumer_properties: PropertyList::default(),
        }
    }

    pub fn topics(&self) -> &[String] {
        &self.kafka_consumer_topics.0
    }

    pub fn with_commit_timeout(mut self, timeout: time::Duration) -> Self {
        self.commit_timeout = EnvMsDuration(timeout);
        self
    }

    pub fn with_commit_interval(mut self, interval: time::Duration) -> Self {
        self.commit_interval = EnvMsDuration(interval);
        self
    }

    pub fn with_poll_timeout(mut self, timeout: time::Duration) -> Self {
        self.poll_timeout = EnvMsDuration(timeout);
        self
    }

    pub fn with_max_poll_records(mut self, max: usize) -> Self {
        self.max_poll_records = max;
        self
    }

    pub fn with_max_poll_interval(mut self, interval: time::Duration) -> Self {
        self.max_poll_interval = EnvMsDuration(interval);
        self
    }

    pub fn with_session_timeout(mut self, timeout: time::Duration) -> Self {
        self.session_timeout = EnvMsDuration(timeout);
        self
    }

    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.kafka_consumer_offset_reset = policy.to_string();
        self
    }

    pub fn with_stop_policy(mut self, policy: StopPolicy) -> Self {
        self.stop_policy = policy;
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.kafka_consumer_properties
            .0
            .push((key.to_string(), value.to_string()));
        self
    }
}

/// What `stop()` does with the broker connection once the polling loop has exited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopPolicy {
    /// Close the client: leave the group at once and let it rebalance.
    #[default]
    Hard,
    /// Keep the client open but idle until the broker evicts it for not polling.
    Soft,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseStopPolicyError(String);

impl std::fmt::Display for ParseStopPolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown stop policy {:?}, expected hard or soft", self.0)
    }
}

impl FromStr for StopPolicy {
    type Err = ParseStopPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hard" => Ok(StopPolicy::Hard),
            "soft" => Ok(StopPolicy::Soft),
            _ => Err(ParseStopPolicyError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

impl EnvMsDuration {
    pub fn from_millis(ms: u64) -> Self {
        EnvMsDuration(time::Duration::from_millis(ms))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Comma separated, non-empty list of topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicList(pub Vec<String>);

#[derive(Debug, PartialEq, Eq)]
pub struct TopicListIsEmptyError;

impl FromStr for TopicList {
    type Err = TopicListIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let topics: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        if topics.is_empty() {
            Err(TopicListIsEmptyError)
        } else {
            Ok(TopicList(topics))
        }
    }
}

/// Comma separated `key=value` pairs passed straight to librdkafka.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyList(pub Vec<(String, String)>);

#[derive(Debug, PartialEq, Eq)]
pub struct ParsePropertyListError(String);

impl FromStr for PropertyList {
    type Err = ParsePropertyListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    Ok((key.trim().to_string(), value.trim().to_string()))
                }
                _ => Err(ParsePropertyListError(pair.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(PropertyList)
    }
}
