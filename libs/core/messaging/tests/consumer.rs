mod common;

use common::{endpoint, transport, wait_until, Recorder};
use messaging::{
    handler_fn, AckMode, BoxError, Bytes, Consumer, ConsumerConfig, ConsumerState, MemoryBroker,
    MessageHandler, Source, StartPosition,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Barrier, Notify};

fn queue_config(queue: &str) -> ConsumerConfig {
    ConsumerConfig::new(queue, Source::queue(queue))
        .with_endpoint(endpoint())
        .with_retry(3, 2)
}

fn topic_config(topic: &str, group: &str) -> ConsumerConfig {
    ConsumerConfig::new(group, Source::topic(topic, group))
        .with_endpoint(endpoint())
        .with_retry(3, 2)
        .with_start(StartPosition::Earliest)
}

#[tokio::test(start_paused = true)]
async fn test_queue_message_acked_once_after_retries() {
    let broker = MemoryBroker::new();
    broker.enqueue("orders", "order-1");
    let recorder = Recorder::default();

    let consumer = Consumer::connect(transport(&broker), queue_config("orders"))
        .await
        .unwrap();
    let started = tokio::time::Instant::now();
    consumer.start(recorder.handler(3)).await.unwrap();

    wait_until(Duration::from_secs(30), "four handler calls", || {
        recorder.calls() == 4
    })
    .await;
    wait_until(Duration::from_secs(1), "ack", || broker.unacked("orders") == 0).await;
    assert!(started.elapsed() >= Duration::from_secs(6));

    // Nothing comes back after the ack.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(recorder.calls(), 4);
    assert_eq!(broker.ready("orders"), 0);

    consumer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_topic_offset_committed_after_retries() {
    let broker = MemoryBroker::new();
    broker.append("events", "event-1");
    let recorder = Recorder::default();

    let consumer = Consumer::connect(transport(&broker), topic_config("events", "audit"))
        .await
        .unwrap();
    consumer.start(recorder.handler(2)).await.unwrap();

    wait_until(Duration::from_secs(30), "offset commit", || {
        broker.committed_offset("events", "audit") == Some(1)
    })
    .await;
    assert_eq!(recorder.calls(), 3);

    consumer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_queue_message_is_redelivered() {
    let broker = MemoryBroker::new();
    broker.enqueue("orders", "poison");
    let recorder = Recorder::default();

    let consumer = Consumer::connect(
        transport(&broker),
        queue_config("orders").with_retry(2, 1),
    )
    .await
    .unwrap();
    consumer.start(recorder.handler(u32::MAX)).await.unwrap();

    // Three attempts, a reject, then the requeued copy comes back.
    wait_until(Duration::from_secs(30), "redelivery", || recorder.calls() >= 4).await;
    assert!(recorder
        .seen()
        .iter()
        .all(|payload| payload == &Bytes::from_static(b"poison")));

    consumer.stop().await;
    assert_eq!(broker.ready("orders"), 1);
    assert_eq!(broker.unacked("orders"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_topic_message_stays_uncommitted() {
    let broker = MemoryBroker::new();
    broker.append("events", "poison");
    let recorder = Recorder::default();

    let consumer = Consumer::connect(
        transport(&broker),
        topic_config("events", "audit").with_retry(2, 1),
    )
    .await
    .unwrap();
    consumer.start(recorder.handler(u32::MAX)).await.unwrap();

    wait_until(Duration::from_secs(30), "three attempts", || recorder.calls() == 3).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    consumer.stop().await;
    assert_eq!(broker.committed_offset("events", "audit"), None);

    // A fresh member of the group reads it again.
    let again = Recorder::default();
    let fresh = Consumer::connect(transport(&broker), topic_config("events", "audit"))
        .await
        .unwrap();
    fresh.start(again.handler(0)).await.unwrap();
    wait_until(Duration::from_secs(5), "second delivery", || again.calls() == 1).await;
    assert_eq!(again.seen(), [Bytes::from_static(b"poison")]);
    fresh.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_in_flight_handler() {
    let broker = MemoryBroker::new();
    broker.enqueue("jobs", "job-1");

    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let finished = Arc::new(AtomicBool::new(false));

    let handler = {
        let entered = entered.clone();
        let release = release.clone();
        let finished = finished.clone();
        handler_fn("slow", move |_payload: Bytes| {
            let entered = entered.clone();
            let release = release.clone();
            let finished = finished.clone();
            async move {
                entered.notify_one();
                release.notified().await;
                finished.store(true, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            }
        })
    };

    let consumer = Arc::new(
        Consumer::connect(transport(&broker), queue_config("jobs"))
            .await
            .unwrap(),
    );
    consumer.start(handler).await.unwrap();
    entered.notified().await;

    let stopper = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.stop().await }
    });

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!stopper.is_finished());
    assert!(!finished.load(Ordering::SeqCst));

    release.notify_one();
    stopper.await.unwrap();

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert_eq!(broker.ready("jobs"), 0);
    assert_eq!(broker.unacked("jobs"), 0);
    assert_eq!(broker.open_links(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_single_width_preserves_order() {
    let broker = MemoryBroker::new();
    for i in 0..5 {
        broker.enqueue("jobs", format!("job-{i}"));
    }

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let recorder = Recorder::default();
    let handler = {
        let active = active.clone();
        let peak = peak.clone();
        let inner = Arc::new(recorder.handler(0));
        handler_fn("ordered", move |payload: Bytes| {
            let active = active.clone();
            let peak = peak.clone();
            let inner = inner.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                let result = inner.handle(payload).await;
                active.fetch_sub(1, Ordering::SeqCst);
                result
            }
        })
    };

    let consumer = Consumer::connect(transport(&broker), queue_config("jobs").with_prefetch(5))
        .await
        .unwrap();
    consumer.start(handler).await.unwrap();

    wait_until(Duration::from_secs(5), "five messages", || recorder.calls() == 5).await;
    let expected: Vec<Bytes> = (0..5).map(|i| Bytes::from(format!("job-{i}"))).collect();
    assert_eq!(recorder.seen(), expected);
    assert_eq!(peak.load(Ordering::SeqCst), 1);

    consumer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_wider_consumer_processes_in_parallel() {
    let broker = MemoryBroker::new();
    for i in 0..3 {
        broker.enqueue("jobs", format!("job-{i}"));
    }

    // Only passes once three handlers are running at the same time.
    let barrier = Arc::new(Barrier::new(3));
    let done = Arc::new(AtomicUsize::new(0));
    let handler = {
        let barrier = barrier.clone();
        let done = done.clone();
        handler_fn("parallel", move |_payload: Bytes| {
            let barrier = barrier.clone();
            let done = done.clone();
            async move {
                barrier.wait().await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            }
        })
    };

    let consumer = Consumer::connect(
        transport(&broker),
        queue_config("jobs").with_prefetch(3).with_concurrency(3),
    )
    .await
    .unwrap();
    consumer.start(handler).await.unwrap();

    wait_until(Duration::from_secs(5), "three parallel handlers", || {
        done.load(Ordering::SeqCst) == 3
    })
    .await;
    wait_until(Duration::from_secs(1), "acks", || broker.unacked("jobs") == 0).await;

    consumer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_read_errors_pause_and_continue() {
    let broker = MemoryBroker::new();
    broker.append("events", "event-1");
    broker.fail_next_reads(2);
    let recorder = Recorder::default();

    let consumer = Consumer::connect(transport(&broker), topic_config("events", "audit"))
        .await
        .unwrap();
    let started = tokio::time::Instant::now();
    consumer.start(recorder.handler(0)).await.unwrap();

    wait_until(Duration::from_secs(10), "delivery after read errors", || {
        recorder.calls() == 1
    })
    .await;
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(consumer.state(), ConsumerState::Consuming);

    consumer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_auto_ack_does_not_redeliver_failures() {
    let broker = MemoryBroker::new();
    broker.enqueue("jobs", "job-1");
    let recorder = Recorder::default();

    let consumer = Consumer::connect(
        transport(&broker),
        queue_config("jobs")
            .with_retry(1, 1)
            .with_ack_mode(AckMode::Auto),
    )
    .await
    .unwrap();
    consumer.start(recorder.handler(u32::MAX)).await.unwrap();

    wait_until(Duration::from_secs(10), "two attempts", || recorder.calls() == 2).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(recorder.calls(), 2);
    assert_eq!(broker.ready("jobs"), 0);
    assert_eq!(broker.unacked("jobs"), 0);

    consumer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_latest_start_skips_existing_entries() {
    let broker = MemoryBroker::new();
    broker.append("events", "old");
    let recorder = Recorder::default();

    let consumer = Consumer::connect(
        transport(&broker),
        topic_config("events", "fresh").with_start(StartPosition::Latest),
    )
    .await
    .unwrap();
    consumer.start(recorder.handler(0)).await.unwrap();

    broker.append("events", "new");
    wait_until(Duration::from_secs(5), "new entry", || recorder.calls() == 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(recorder.seen(), [Bytes::from_static(b"new")]);

    consumer.stop().await;
}
