//! Redis transport options
//!
//! Shared by the streams and list-queue transports.

use std::time::Duration;

/// Default stream length before approximate trimming.
pub const DEFAULT_MAX_LENGTH: i64 = 100_000;

/// Default server-side wait of a blocking read.
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// How much longer than the server-side block the client waits for a
/// blocking read's reply.
pub const READ_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Default prefix for the transport's own bookkeeping keys.
pub const DEFAULT_KEY_PREFIX: &str = "broker:";

/// Options for the Redis transports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisOptions {
    /// How long a blocking read waits before polling again
    pub block_timeout: Duration,

    /// Maximum stream length (XADD MAXLEN ~)
    pub max_length: i64,

    /// Prefix for exchange, binding and processing-list keys
    pub key_prefix: String,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            max_length: DEFAULT_MAX_LENGTH,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl RedisOptions {
    /// Set the blocking read timeout (clamped to at least 1ms)
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    /// Set the maximum stream length
    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = max_length;
        self
    }

    /// Set the bookkeeping key prefix
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub(crate) fn block_millis(&self) -> u64 {
        u64::try_from(self.block_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// BLMOVE / BRPOP take the timeout in (fractional) seconds.
    pub(crate) fn block_seconds(&self) -> f64 {
        self.block_timeout.as_secs_f64()
    }

    /// Response timeout for connections that issue blocking reads. Longer
    /// than the block itself, so an expired block arrives as a nil reply.
    pub(crate) fn read_response_timeout(&self) -> Duration {
        self.block_timeout.saturating_add(READ_TIMEOUT_MARGIN)
    }

    pub(crate) fn exchanges_key(&self) -> String {
        format!("{}exchanges", self.key_prefix)
    }

    pub(crate) fn bindings_key(&self, exchange: &str, routing_key: &str) -> String {
        format!("{}bindings:{exchange}:{routing_key}", self.key_prefix)
    }

    pub(crate) fn processing_key(&self, queue: &str, consumer_tag: &str) -> String {
        format!("{}processing:{queue}:{consumer_tag}", self.key_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = RedisOptions::default();
        assert_eq!(options.block_millis(), 5000);
        assert_eq!(options.max_length, 100_000);
        assert_eq!(options.exchanges_key(), "broker:exchanges");
    }

    #[test]
    fn test_key_layout() {
        let options = RedisOptions::default().with_key_prefix("app:");
        assert_eq!(options.bindings_key("orders", "created"), "app:bindings:orders:created");
        assert_eq!(options.processing_key("jobs", "worker-1"), "app:processing:jobs:worker-1");
    }

    #[test]
    fn test_read_timeout_outlasts_the_block() {
        let options = RedisOptions::default();
        assert_eq!(options.read_response_timeout(), Duration::from_secs(10));

        let options = options.with_block_timeout(Duration::from_secs(30));
        assert!(options.read_response_timeout() > options.block_timeout);
    }

    #[test]
    fn test_block_timeout_is_clamped() {
        let options = RedisOptions::default().with_block_timeout(Duration::ZERO);
        assert_eq!(options.block_millis(), 1);
        assert_eq!(options.block_seconds(), 0.001);
    }
}
