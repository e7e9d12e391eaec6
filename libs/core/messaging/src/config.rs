//! Declarative configuration for producers and consumers.
//!
//! Everything here deserializes with serde so a [`BrokerConfig`] can be loaded
//! from a JSON (or any serde format) document. Numeric knobs are kept signed
//! and normalized by accessor methods, so a zero or negative value in a config
//! file falls back to the runtime default instead of disabling the feature.

use crate::error::BrokerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Handler retries when `retry_count` is not positive.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Fixed pause between handler attempts when `retry_delay_secs` is not positive.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Unacknowledged messages a consumer may hold when `prefetch` is not positive.
pub const DEFAULT_PREFETCH: u16 = 1;

/// Upper bound on waiting for a publish confirmation.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// First reconnect delay; doubles after each failed attempt.
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Cap on the reconnect delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(300);

/// Pause after a read error from a self-healing transport.
pub const READ_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Broker addresses plus optional credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    /// Tried in order; the first reachable address wins.
    #[serde(default)]
    pub addresses: Vec<String>,

    #[serde(default)]
    pub credentials: Option<Credentials>,
}

impl BrokerEndpoint {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
            credentials: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.addresses.is_empty() {
            write!(f, "<no addresses>")
        } else {
            write!(f, "{}", self.addresses.join(","))
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where a producer sends messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    /// Queue-oriented: a direct exchange and routing key. The empty exchange
    /// name is the default exchange, which routes to the queue named by the
    /// routing key.
    Exchange {
        #[serde(default)]
        exchange: String,
        #[serde(default)]
        routing_key: String,
    },
    /// Log-oriented: append to a topic.
    Topic { topic: String },
}

impl Destination {
    pub fn exchange(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Destination::Exchange {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    pub fn topic(topic: impl Into<String>) -> Self {
        Destination::Topic {
            topic: topic.into(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Destination::Exchange {
                exchange,
                routing_key,
            } if exchange.is_empty() && routing_key.is_empty() => {
                Err("exchange destination needs an exchange or a routing key".to_string())
            }
            Destination::Topic { topic } if topic.is_empty() => {
                Err("topic destination needs a topic name".to_string())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Exchange {
                exchange,
                routing_key,
            } => write!(f, "exchange '{exchange}' key '{routing_key}'"),
            Destination::Topic { topic } => write!(f, "topic '{topic}'"),
        }
    }
}

/// Where a consumer reads messages from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    Queue { queue: String },
    Topic { topic: String, group: String },
}

impl Source {
    pub fn queue(queue: impl Into<String>) -> Self {
        Source::Queue {
            queue: queue.into(),
        }
    }

    pub fn topic(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Source::Topic {
            topic: topic.into(),
            group: group.into(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Source::Queue { queue } if queue.is_empty() => {
                Err("queue source needs a queue name".to_string())
            }
            Source::Topic { topic, .. } if topic.is_empty() => {
                Err("topic source needs a topic name".to_string())
            }
            Source::Topic { group, .. } if group.is_empty() => {
                Err("topic source needs a consumer group".to_string())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Queue { queue } => write!(f, "queue '{queue}'"),
            Source::Topic { topic, group } => write!(f, "topic '{topic}' group '{group}'"),
        }
    }
}

/// Who acknowledges or commits a delivered message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// The consumer acks after the handler succeeds and rejects after retries
    /// are exhausted.
    #[default]
    Manual,
    /// The broker considers a message handled as soon as it is delivered.
    Auto,
}

impl AckMode {
    pub fn is_manual(&self) -> bool {
        matches!(self, AckMode::Manual)
    }
}

/// Where a log-oriented group without a committed position starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    Earliest,
    #[default]
    Latest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerConfig {
    pub key: String,

    /// Empty means inherit [`BrokerConfig::endpoint`].
    #[serde(default)]
    pub endpoint: BrokerEndpoint,

    pub destination: Destination,

    /// Return from `publish` once the payload is queued locally.
    #[serde(default, rename = "async")]
    pub async_send: bool,

    /// Enable broker confirmations when the producer is created.
    #[serde(default)]
    pub confirm: bool,

    #[serde(default)]
    pub confirm_timeout_secs: u64,

    /// Takes precedence over `confirm_timeout_secs` when non-zero.
    #[serde(default)]
    pub confirm_timeout_ms: u64,
}

impl ProducerConfig {
    pub fn new(key: impl Into<String>, destination: Destination) -> Self {
        Self {
            key: key.into(),
            endpoint: BrokerEndpoint::default(),
            destination,
            async_send: false,
            confirm: false,
            confirm_timeout_secs: 0,
            confirm_timeout_ms: 0,
        }
    }

    pub fn with_endpoint(mut self, endpoint: BrokerEndpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_async(mut self, async_send: bool) -> Self {
        self.async_send = async_send;
        self
    }

    pub fn with_confirm(mut self, confirm: bool) -> Self {
        self.confirm = confirm;
        self
    }

    /// Sub-millisecond remainders round up; a zero duration restores the
    /// default.
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        let millis = u64::try_from(timeout.as_micros().div_ceil(1_000)).unwrap_or(u64::MAX);
        self.confirm_timeout_ms = millis;
        self.confirm_timeout_secs = 0;
        self
    }

    pub fn confirm_timeout(&self) -> Duration {
        if self.confirm_timeout_ms > 0 {
            Duration::from_millis(self.confirm_timeout_ms)
        } else if self.confirm_timeout_secs > 0 {
            Duration::from_secs(self.confirm_timeout_secs)
        } else {
            DEFAULT_CONFIRM_TIMEOUT
        }
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.key.trim().is_empty() {
            return Err(BrokerError::invalid_config("producer key is empty"));
        }
        if self.endpoint.is_empty() {
            return Err(BrokerError::invalid_config(format!(
                "producer '{}' has no broker addresses",
                self.key
            )));
        }
        self.destination
            .validate()
            .map_err(|e| BrokerError::invalid_config(format!("producer '{}': {e}", self.key)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub key: String,

    /// Empty means inherit [`BrokerConfig::endpoint`].
    #[serde(default)]
    pub endpoint: BrokerEndpoint,

    pub source: Source,

    #[serde(default)]
    pub prefetch: i32,

    #[serde(default)]
    pub retry_count: i32,

    #[serde(default)]
    pub retry_delay_secs: i64,

    #[serde(default)]
    pub ack_mode: AckMode,

    #[serde(default)]
    pub start: StartPosition,

    /// Messages handled at once. 1 keeps delivery order.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Stable consumer name inside the broker; defaults to the key.
    #[serde(default)]
    pub consumer_tag: Option<String>,
}

fn default_concurrency() -> usize {
    1
}

impl ConsumerConfig {
    pub fn new(key: impl Into<String>, source: Source) -> Self {
        Self {
            key: key.into(),
            endpoint: BrokerEndpoint::default(),
            source,
            prefetch: 0,
            retry_count: 0,
            retry_delay_secs: 0,
            ack_mode: AckMode::default(),
            start: StartPosition::default(),
            concurrency: default_concurrency(),
            consumer_tag: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: BrokerEndpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_prefetch(mut self, prefetch: i32) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_retry(mut self, count: i32, delay_secs: i64) -> Self {
        self.retry_count = count;
        self.retry_delay_secs = delay_secs;
        self
    }

    pub fn with_ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    pub fn with_start(mut self, start: StartPosition) -> Self {
        self.start = start;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }

    pub fn retry_count(&self) -> u32 {
        if self.retry_count <= 0 {
            DEFAULT_RETRY_COUNT
        } else {
            self.retry_count as u32
        }
    }

    pub fn retry_delay(&self) -> Duration {
        if self.retry_delay_secs <= 0 {
            DEFAULT_RETRY_DELAY
        } else {
            Duration::from_secs(self.retry_delay_secs as u64)
        }
    }

    pub fn prefetch(&self) -> u16 {
        if self.prefetch <= 0 {
            DEFAULT_PREFETCH
        } else {
            u16::try_from(self.prefetch).unwrap_or(u16::MAX)
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    pub fn consumer_tag(&self) -> &str {
        self.consumer_tag.as_deref().unwrap_or(&self.key)
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.key.trim().is_empty() {
            return Err(BrokerError::invalid_config("consumer key is empty"));
        }
        if self.endpoint.is_empty() {
            return Err(BrokerError::invalid_config(format!(
                "consumer '{}' has no broker addresses",
                self.key
            )));
        }
        self.source
            .validate()
            .map_err(|e| BrokerError::invalid_config(format!("consumer '{}': {e}", self.key)))
    }
}

/// A declarative set of producers and consumers sharing a default endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub endpoint: BrokerEndpoint,

    #[serde(default)]
    pub producers: Vec<ProducerConfig>,

    #[serde(default)]
    pub consumers: Vec<ConsumerConfig>,
}

impl BrokerConfig {
    pub fn new(endpoint: BrokerEndpoint) -> Self {
        Self {
            endpoint,
            ..Default::default()
        }
    }

    pub fn with_producer(mut self, producer: ProducerConfig) -> Self {
        self.producers.push(producer);
        self
    }

    pub fn with_consumer(mut self, consumer: ConsumerConfig) -> Self {
        self.consumers.push(consumer);
        self
    }

    /// Copies the default endpoint into every entry that has none.
    pub fn resolved(&self) -> BrokerConfig {
        let mut resolved = self.clone();
        for producer in &mut resolved.producers {
            if producer.endpoint.is_empty() {
                producer.endpoint = self.endpoint.clone();
            }
        }
        for consumer in &mut resolved.consumers {
            if consumer.endpoint.is_empty() {
                consumer.endpoint = self.endpoint.clone();
            }
        }
        resolved
    }

    /// Validates every entry after endpoint inheritance.
    pub fn validate(&self) -> Result<(), BrokerError> {
        let resolved = self.resolved();
        for producer in &resolved.producers {
            producer.validate()?;
        }
        for consumer in &resolved.consumers {
            consumer.validate()?;
        }
        Ok(())
    }
}
