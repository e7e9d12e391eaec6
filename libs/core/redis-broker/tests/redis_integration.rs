//! Integration tests against a real Redis.
//!
//! Run with: cargo test -p redis-broker -- --ignored

use messaging::{
    AckMode, BrokerEndpoint, BrokerError, Bytes, Consumer, ConsumerConfig, ConsumerState,
    Destination, FailingHandler, MessageHandler, Producer, ProducerConfig, Source, StartPosition,
    handler_fn, BoxError,
};
use redis::AsyncCommands;
use redis_broker::{ListQueueTransport, RedisOptions, StreamsTransport};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::{TestKeys, TestRedis};

fn options() -> RedisOptions {
    RedisOptions::default().with_block_timeout(Duration::from_millis(200))
}

fn endpoint(redis: &TestRedis) -> BrokerEndpoint {
    BrokerEndpoint::new([redis.connection_string()])
}

/// Collects payloads and hands them to the test.
fn collector() -> (impl MessageHandler, Arc<Mutex<Vec<Bytes>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = seen.clone();
        handler_fn("collector", move |payload: Bytes| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(payload);
                Ok::<_, BoxError>(())
            }
        })
    };
    (handler, seen)
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_stream_publish_and_consume() {
    let redis = TestRedis::new().await;
    let transport = Arc::new(StreamsTransport::new(options()));

    let producer = Producer::connect(
        transport.as_ref(),
        ProducerConfig::new("events", Destination::topic("events")).with_endpoint(endpoint(&redis)),
    )
    .await
    .unwrap();
    producer.publish_with_confirm("first").await.unwrap();
    producer.publish("second").await.unwrap();

    let consumer = Consumer::connect(
        transport.clone(),
        ConsumerConfig::new("audit", Source::topic("events", "audit"))
            .with_endpoint(endpoint(&redis))
            .with_start(StartPosition::Earliest),
    )
    .await
    .unwrap();
    let (handler, seen) = collector();
    consumer.start(handler).await.unwrap();

    eventually("both entries", || seen.lock().unwrap().len() == 2).await;
    assert_eq!(
        *seen.lock().unwrap(),
        [Bytes::from_static(b"first"), Bytes::from_static(b"second")]
    );
    consumer.stop().await;

    // Everything was acknowledged.
    assert_eq!(redis.stream_len("events").await, 2);
    assert_eq!(redis.pending_count("events", "audit").await, 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_stream_rejected_entry_returns_on_next_subscribe() {
    let redis = TestRedis::new().await;
    let transport = Arc::new(StreamsTransport::new(options()));
    let keys = TestKeys::for_test("test_stream_rejected_entry_returns_on_next_subscribe");
    let topic = keys.key("topic", "events");
    let group = keys.key("group", "audit");
    let config = ConsumerConfig::new("audit", Source::topic(topic.as_str(), group.as_str()))
        .with_endpoint(endpoint(&redis))
        .with_start(StartPosition::Earliest)
        .with_retry(1, 1);

    let mut conn = redis.connection();
    let _: String = conn
        .xadd(&topic, "*", &[("payload", "poison")])
        .await
        .unwrap();

    let failing = Consumer::connect(transport.clone(), config.clone()).await.unwrap();
    failing.start(FailingHandler::new("broken")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    failing.stop().await;
    assert_eq!(redis.pending_count(&topic, &group).await, 1);

    let consumer = Consumer::connect(transport.clone(), config).await.unwrap();
    let (handler, seen) = collector();
    consumer.start(handler).await.unwrap();
    eventually("replayed entry", || seen.lock().unwrap().len() == 1).await;
    consumer.stop().await;
    assert_eq!(redis.pending_count(&topic, &group).await, 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_streams_reject_exchanges() {
    let redis = TestRedis::new().await;
    let err = Producer::connect(
        &StreamsTransport::new(options()),
        ProducerConfig::new("orders", Destination::exchange("orders", "created"))
            .with_endpoint(endpoint(&redis)),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BrokerError::Channel(_)));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_queue_routing_and_confirms() {
    let redis = TestRedis::new().await;
    let transport = ListQueueTransport::new(options());
    let endpoint = endpoint(&redis);

    let producer = Producer::connect(
        &transport,
        ProducerConfig::new("orders", Destination::exchange("orders", "created"))
            .with_endpoint(endpoint.clone())
            .with_confirm(true),
    )
    .await
    .unwrap();

    let err = producer.publish_with_confirm("nobody").await.unwrap_err();
    assert!(matches!(err, BrokerError::NotAcknowledged));

    transport
        .bind(&endpoint, "orders", "created", "billing")
        .await
        .unwrap();
    transport
        .bind(&endpoint, "orders", "created", "shipping")
        .await
        .unwrap();
    producer.publish_with_confirm("order-1").await.unwrap();

    let mut conn = redis.connection();
    let billing: Vec<Vec<u8>> = conn.lrange("billing", 0, -1).await.unwrap();
    let shipping: Vec<Vec<u8>> = conn.lrange("shipping", 0, -1).await.unwrap();
    assert_eq!(billing, [b"order-1".to_vec()]);
    assert_eq!(shipping, [b"order-1".to_vec()]);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_queue_consume_in_order_with_acks() {
    let redis = TestRedis::new().await;
    let transport = Arc::new(ListQueueTransport::new(options()));

    let producer = Producer::connect(
        transport.as_ref(),
        ProducerConfig::new("jobs", Destination::exchange("", "jobs")).with_endpoint(endpoint(&redis)),
    )
    .await
    .unwrap();
    for i in 0..3 {
        producer.publish(format!("job-{i}")).await.unwrap();
    }

    let consumer = Consumer::connect(
        transport.clone(),
        ConsumerConfig::new("jobs", Source::queue("jobs")).with_endpoint(endpoint(&redis)),
    )
    .await
    .unwrap();
    let (handler, seen) = collector();
    consumer.start(handler).await.unwrap();

    eventually("three jobs", || seen.lock().unwrap().len() == 3).await;
    let expected: Vec<Bytes> = (0..3).map(|i| Bytes::from(format!("job-{i}"))).collect();
    assert_eq!(*seen.lock().unwrap(), expected);
    consumer.stop().await;

    assert_eq!(redis.list_len("broker:processing:jobs:jobs").await, 0);
    assert_eq!(redis.list_len("jobs").await, 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_queue_restores_unacked_deliveries() {
    let redis = TestRedis::new().await;
    let transport = Arc::new(ListQueueTransport::new(options()));

    // A delivery left behind by a consumer that died before acking.
    let mut conn = redis.connection();
    let _: () = conn.lpush("broker:processing:jobs:jobs", "orphan").await.unwrap();

    let consumer = Consumer::connect(
        transport.clone(),
        ConsumerConfig::new("jobs", Source::queue("jobs")).with_endpoint(endpoint(&redis)),
    )
    .await
    .unwrap();
    let (handler, seen) = collector();
    consumer.start(handler).await.unwrap();

    eventually("restored delivery", || seen.lock().unwrap().len() == 1).await;
    assert_eq!(*seen.lock().unwrap(), [Bytes::from_static(b"orphan")]);
    assert_eq!(consumer.state(), ConsumerState::Consuming);
    consumer.stop().await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_queue_auto_ack_pops() {
    let redis = TestRedis::new().await;
    let transport = Arc::new(ListQueueTransport::new(options()));
    let mut conn = redis.connection();
    let _: () = conn.lpush("jobs", "job-1").await.unwrap();

    let consumer = Consumer::connect(
        transport.clone(),
        ConsumerConfig::new("jobs", Source::queue("jobs"))
            .with_endpoint(endpoint(&redis))
            .with_ack_mode(AckMode::Auto),
    )
    .await
    .unwrap();
    let (handler, seen) = collector();
    consumer.start(handler).await.unwrap();

    eventually("popped job", || seen.lock().unwrap().len() == 1).await;
    consumer.stop().await;

    assert_eq!(redis.list_len("broker:processing:jobs:jobs").await, 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_queue_delivery_mid_block_with_default_options() {
    let redis = TestRedis::new().await;
    let transport = Arc::new(ListQueueTransport::new(RedisOptions::default()));

    let consumer = Consumer::connect(
        transport.clone(),
        ConsumerConfig::new("jobs", Source::queue("jobs")).with_endpoint(endpoint(&redis)),
    )
    .await
    .unwrap();
    let (handler, seen) = collector();
    consumer.start(handler).await.unwrap();

    // Lands while the consumer's first BLMOVE is still blocked.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let mut conn = redis.connection();
    let _: () = conn.lpush("jobs", "late").await.unwrap();

    eventually("late job", || seen.lock().unwrap().len() == 1).await;
    assert_eq!(*seen.lock().unwrap(), [Bytes::from_static(b"late")]);
    assert_eq!(consumer.state(), ConsumerState::Consuming);
    consumer.stop().await;

    assert_eq!(redis.list_len("broker:processing:jobs:jobs").await, 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_stream_entry_mid_block_with_default_options() {
    let redis = TestRedis::new().await;
    let transport = Arc::new(StreamsTransport::new(RedisOptions::default()));

    let consumer = Consumer::connect(
        transport.clone(),
        ConsumerConfig::new("audit", Source::topic("events", "audit"))
            .with_endpoint(endpoint(&redis))
            .with_start(StartPosition::Latest),
    )
    .await
    .unwrap();
    let (handler, seen) = collector();
    consumer.start(handler).await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    let mut conn = redis.connection();
    let _: String = conn.xadd("events", "*", &[("payload", "late")]).await.unwrap();

    eventually("late entry", || seen.lock().unwrap().len() == 1).await;
    assert_eq!(*seen.lock().unwrap(), [Bytes::from_static(b"late")]);
    consumer.stop().await;

    // Acked over the shared connection while the next read was blocked.
    assert_eq!(redis.pending_count("events", "audit").await, 0);
}
