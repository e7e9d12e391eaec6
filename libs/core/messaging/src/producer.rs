//! Producer: one connection, one destination, publishes in call order.
//!
//! Publishing never retries. A failed send is returned to the caller as
//! [`BrokerError::Publish`]; the caller decides whether to try again.
//!
//! Producers created with `async = true` hand payloads to a bounded outbox and
//! return. A single writer task drains the outbox in order and logs failures.

use crate::config::{Destination, ProducerConfig};
use crate::connection::Connection;
use crate::error::BrokerError;
use crate::message::Confirmation;
use crate::metrics::BrokerMetrics;
use crate::transport::Transport;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

/// Payloads an async producer buffers before `publish` waits for room.
pub const OUTBOX_CAPACITY: usize = 1024;

struct ProducerLink {
    connection: Option<Connection>,
    confirms_enabled: bool,
}

struct Outgoing {
    payload: Bytes,
    reply: Option<oneshot::Sender<Result<(), BrokerError>>>,
}

pub struct Producer {
    config: ProducerConfig,
    link: Arc<Mutex<ProducerLink>>,
    outbox: Option<mpsc::Sender<Outgoing>>,
    metrics: BrokerMetrics,
}

impl Producer {
    /// Connects, declares a named exchange destination, and enables confirm
    /// mode when configured. Any failure after the dial closes the connection.
    pub async fn connect(
        transport: &dyn Transport,
        config: ProducerConfig,
    ) -> Result<Self, BrokerError> {
        config.validate()?;
        let connection = Connection::connect(transport, &config.endpoint).await?;

        if let Err(e) = Self::prepare(&connection, &config).await {
            connection.close().await;
            return Err(e);
        }

        let link = Arc::new(Mutex::new(ProducerLink {
            connection: Some(connection),
            confirms_enabled: config.confirm,
        }));
        let metrics = BrokerMetrics::new(&config.key);

        let outbox = if config.async_send {
            let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
            tokio::spawn(drain_outbox(
                config.clone(),
                link.clone(),
                rx,
                metrics.clone(),
            ));
            Some(tx)
        } else {
            None
        };

        info!(
            producer = %config.key,
            destination = %config.destination,
            confirm = config.confirm,
            async_send = config.async_send,
            "Producer ready"
        );

        Ok(Self {
            config,
            link,
            outbox,
            metrics,
        })
    }

    async fn prepare(connection: &Connection, config: &ProducerConfig) -> Result<(), BrokerError> {
        let channel = connection.channel();
        if let Destination::Exchange { exchange, .. } = &config.destination {
            if !exchange.is_empty() {
                channel
                    .declare(&config.destination)
                    .await
                    .map_err(BrokerError::channel)?;
            }
        }
        if config.confirm {
            channel
                .enable_confirms()
                .await
                .map_err(BrokerError::channel)?;
        }
        Ok(())
    }

    pub fn key(&self) -> &str {
        &self.config.key
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn destination(&self) -> &Destination {
        &self.config.destination
    }

    /// Sends one message.
    ///
    /// Waits until the transport accepts the write, or, for async producers,
    /// until the payload is queued.
    pub async fn publish(&self, payload: impl Into<Bytes>) -> Result<(), BrokerError> {
        let payload = payload.into();
        if let Some(outbox) = &self.outbox {
            return outbox
                .send(Outgoing {
                    payload,
                    reply: None,
                })
                .await
                .map_err(|_| BrokerError::Closed(self.config.key.clone()));
        }

        let mut link = self.link.lock().await;
        let result = send(&self.config, &mut link, payload).await;
        self.record(&result, false);
        result
    }

    /// Sends one message and waits for the broker to confirm it.
    ///
    /// The connection stays locked for the send and the wait, so concurrent
    /// publishes queue behind the confirmation. The confirm timeout starts
    /// once the message is sent; for async producers, time spent queued in
    /// the outbox does not count against it.
    pub async fn publish_with_confirm(&self, payload: impl Into<Bytes>) -> Result<(), BrokerError> {
        let payload = payload.into();

        if let Some(outbox) = &self.outbox {
            let (reply, outcome) = oneshot::channel();
            outbox
                .send(Outgoing {
                    payload,
                    reply: Some(reply),
                })
                .await
                .map_err(|_| BrokerError::Closed(self.config.key.clone()))?;
            // The writer applies the timeout itself.
            return outcome
                .await
                .unwrap_or_else(|_| Err(BrokerError::Closed(self.config.key.clone())));
        }

        let mut link = self.link.lock().await;
        let result = send_confirmed(&self.config, &mut link, payload).await;
        self.record(&result, true);
        result
    }

    fn record(&self, result: &Result<(), BrokerError>, confirmed: bool) {
        record_outcome(&self.metrics, result, confirmed);
    }

    /// Closes the connection. Later publishes fail with [`BrokerError::Closed`].
    pub(crate) async fn release(&self) {
        let connection = self.link.lock().await.connection.take();
        if let Some(connection) = connection {
            connection.close().await;
            info!(producer = %self.config.key, "Producer released");
        }
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("key", &self.config.key)
            .field("destination", &self.config.destination)
            .finish_non_exhaustive()
    }
}

fn record_outcome(metrics: &BrokerMetrics, result: &Result<(), BrokerError>, confirmed: bool) {
    match result {
        Ok(()) => {
            metrics.message_published();
            if confirmed {
                metrics.confirm("ack");
            }
        }
        Err(e @ (BrokerError::ConfirmTimeout(_) | BrokerError::NotAcknowledged)) => {
            metrics.confirm(e.kind());
        }
        Err(e) => metrics.publish_failed(e.kind()),
    }
}

async fn send(
    config: &ProducerConfig,
    link: &mut ProducerLink,
    payload: Bytes,
) -> Result<(), BrokerError> {
    let connection = link
        .connection
        .as_ref()
        .ok_or_else(|| BrokerError::Closed(config.key.clone()))?;
    connection
        .channel()
        .publish(&config.destination, payload)
        .await
        .map_err(BrokerError::publish)
}

async fn send_confirmed(
    config: &ProducerConfig,
    link: &mut ProducerLink,
    payload: Bytes,
) -> Result<(), BrokerError> {
    let timeout = config.confirm_timeout();
    let connection = link
        .connection
        .as_ref()
        .ok_or_else(|| BrokerError::Closed(config.key.clone()))?;
    let channel = connection.channel();

    if !link.confirms_enabled {
        channel
            .enable_confirms()
            .await
            .map_err(BrokerError::publish)?;
        link.confirms_enabled = true;
        debug!(producer = %config.key, "Confirm mode enabled");
    }

    let pending = channel
        .publish_confirmed(&config.destination, payload)
        .await
        .map_err(BrokerError::publish)?;

    match tokio::time::timeout(timeout, pending).await {
        Ok(Ok(Confirmation::Ack)) => Ok(()),
        Ok(Ok(Confirmation::Nack)) => {
            warn!(producer = %config.key, "Broker rejected published message");
            Err(BrokerError::NotAcknowledged)
        }
        Ok(Err(_)) => Err(BrokerError::publish(
            "confirmation dropped before the broker answered",
        )),
        Err(_) => {
            warn!(producer = %config.key, timeout = ?timeout, "Publish confirmation timed out");
            Err(BrokerError::ConfirmTimeout(timeout))
        }
    }
}

async fn drain_outbox(
    config: ProducerConfig,
    link: Arc<Mutex<ProducerLink>>,
    mut rx: mpsc::Receiver<Outgoing>,
    metrics: BrokerMetrics,
) {
    while let Some(outgoing) = rx.recv().await {
        let mut guard = link.lock().await;
        match outgoing.reply {
            Some(reply) => {
                let result = send_confirmed(&config, &mut guard, outgoing.payload).await;
                record_outcome(&metrics, &result, true);
                let _ = reply.send(result);
            }
            None => {
                let result = send(&config, &mut guard, outgoing.payload).await;
                record_outcome(&metrics, &result, false);
                if let Err(e) = result {
                    error!(producer = %config.key, error = %e, "Async publish failed");
                }
            }
        }
    }
    debug!(producer = %config.key, "Outbox drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerEndpoint;
    use crate::memory::MemoryBroker;

    fn config(key: &str, destination: Destination) -> ProducerConfig {
        ProducerConfig::new(key, destination).with_endpoint(BrokerEndpoint::new(["mem://local"]))
    }

    #[tokio::test]
    async fn test_publish_in_call_order() {
        let broker = MemoryBroker::new();
        let producer = Producer::connect(&broker.transport(), config("p", Destination::topic("t")))
            .await
            .unwrap();

        for i in 0..5 {
            producer.publish(format!("m{i}")).await.unwrap();
        }
        assert_eq!(
            broker.topic_payloads("t"),
            ["m0", "m1", "m2", "m3", "m4"]
        );
    }

    #[tokio::test]
    async fn test_named_exchange_is_declared_on_connect() {
        let broker = MemoryBroker::new();
        let producer = Producer::connect(
            &broker.transport(),
            config("p", Destination::exchange("work", "jobs")),
        )
        .await
        .unwrap();

        // Declared but unbound: plain publishes are accepted and dropped.
        producer.publish("x").await.unwrap();
        broker.bind("work", "jobs", "jobs");
        producer.publish("y").await.unwrap();
        assert_eq!(broker.queued_payloads("jobs"), ["y"]);
    }

    #[tokio::test]
    async fn test_channel_failure_closes_connection() {
        let broker = MemoryBroker::new();
        broker.fail_next_channels(1);
        let err = Producer::connect(
            &broker.transport(),
            config("p", Destination::topic("t")).with_confirm(true),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BrokerError::Channel(_)));
        assert_eq!(broker.open_links(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_dial() {
        let broker = MemoryBroker::new();
        let err = Producer::connect(&broker.transport(), config("p", Destination::topic("")))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidConfig(_)));
        assert!(broker.dial_instants().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_not_retried() {
        let broker = MemoryBroker::new();
        let producer = Producer::connect(&broker.transport(), config("p", Destination::topic("t")))
            .await
            .unwrap();

        broker.sever_links();
        let err = producer.publish("lost").await.unwrap_err();
        assert!(matches!(err, BrokerError::Publish(_)));
        assert_eq!(broker.topic_len("t"), 0);
        assert_eq!(broker.dial_instants().len(), 1);
    }

    #[tokio::test]
    async fn test_released_producer_rejects_publish() {
        let broker = MemoryBroker::new();
        let producer = Producer::connect(&broker.transport(), config("p", Destination::topic("t")))
            .await
            .unwrap();

        producer.release().await;
        assert_eq!(broker.open_links(), 0);
        assert!(matches!(
            producer.publish("late").await,
            Err(BrokerError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_confirm_mode_enabled_lazily() {
        let broker = MemoryBroker::new();
        let producer = Producer::connect(&broker.transport(), config("p", Destination::topic("t")))
            .await
            .unwrap();

        producer.publish_with_confirm("c").await.unwrap();
        assert_eq!(broker.topic_len("t"), 1);
    }
}
