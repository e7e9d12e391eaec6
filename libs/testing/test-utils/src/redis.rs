//! Throwaway Redis for broker integration tests.
//!
//! Each [`TestRedis`] owns its own container, so tests never share keys.
//! Besides a raw connection it offers the few inspections broker tests need:
//! list depth, stream length and a consumer group's pending count.

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisResult, Value};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

const IMAGE_TAG: &str = "8-alpine";
const REDIS_PORT: u16 = 6379;

/// Running Redis container, removed on drop.
///
/// ```no_run
/// use test_utils::TestRedis;
///
/// # async fn example() {
/// let redis = TestRedis::new().await;
/// // Point a transport at the container...
/// let address = redis.connection_string().to_string();
/// // ...and inspect what it left behind.
/// assert_eq!(redis.list_len("jobs").await, 0);
/// # }
/// ```
pub struct TestRedis {
    _container: ContainerAsync<Redis>,
    connection: MultiplexedConnection,
    url: String,
}

impl TestRedis {
    /// Starts a container and connects to it. Panics if Docker is unavailable.
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag(IMAGE_TAG)
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(REDIS_PORT)
            .await
            .expect("Failed to get Redis port");
        let url = format!("redis://127.0.0.1:{port}");

        let connection = Client::open(url.as_str())
            .expect("Failed to create Redis client")
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port, tag = IMAGE_TAG, "Test Redis ready");

        Self {
            _container: container,
            connection,
            url,
        }
    }

    /// Connection for seeding keys directly.
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// `redis://` URL usable as a broker endpoint address.
    pub fn connection_string(&self) -> &str {
        &self.url
    }

    /// Number of entries in a list; 0 when the key is missing.
    pub async fn list_len(&self, key: &str) -> usize {
        let mut conn = self.connection();
        conn.llen(key).await.expect("LLEN failed")
    }

    /// Number of entries in a stream; 0 when the key is missing.
    pub async fn stream_len(&self, key: &str) -> usize {
        let mut conn = self.connection();
        conn.xlen(key).await.expect("XLEN failed")
    }

    /// Entries delivered to `group` and not yet acknowledged.
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        let mut conn = self.connection();
        let summary: RedisResult<Value> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await;
        match summary.expect("XPENDING failed") {
            Value::Array(fields) => match fields.first() {
                Some(Value::Int(count)) => *count as usize,
                other => panic!("unexpected XPENDING count: {other:?}"),
            },
            other => panic!("unexpected XPENDING reply: {other:?}"),
        }
    }
}
