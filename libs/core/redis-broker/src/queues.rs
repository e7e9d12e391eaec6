//! Queue model over Redis lists
//!
//! Queues are lists. Producers `LPUSH`, consumers take from the other end,
//! so each queue is FIFO. Direct exchanges are emulated with two sets:
//! `{prefix}exchanges` holds declared exchange names and
//! `{prefix}bindings:{exchange}:{routing_key}` holds the bound queues. The
//! default (empty) exchange routes straight to the queue named by the
//! routing key.
//!
//! Manual-ack consumers use the reliable-queue pattern: `BLMOVE` moves each
//! delivery into a per-consumer processing list, ack removes it from there
//! and reject moves it back to the head of the queue. A new subscription
//! first returns whatever its processing list still holds. Auto-ack
//! consumers simply `BRPOP`.
//!
//! Links are plain multiplexed connections. A command that fails because
//! the connection is gone marks the link lost, which ends its subscriptions
//! and wakes the consumer's reconnect supervisor. So does a blocking read
//! whose reply never arrived: its delivery may already sit in the
//! processing list, and only the next subscription restores it.

use crate::config::RedisOptions;
use crate::connect::dial_first;
use crate::error::{is_connection_loss, is_response_timeout};
use messaging::{
    async_trait, settled, Acknowledger, BrokerEndpoint, BrokerError, Bytes, Channel,
    CloseNotifier, CloseSignal, Confirmation, Destination, Link, Message, PendingConfirm, Source,
    SubscribeOptions, Subscription, Transport,
};
use redis::aio::MultiplexedConnection;
use redis::{AsyncConnectionConfig, Client, RedisError, RedisResult, Script};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Moves a delivery from the processing list back to the consumer end of
/// its queue, but only if it is still held.
static REQUEUE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
            redis.call('RPUSH', KEYS[2], ARGV[1])
            return 1
        end
        return 0
        ",
    )
});

/// [`Transport`] for exchange / routing key / queue addressing on Redis lists.
#[derive(Debug, Clone, Default)]
pub struct ListQueueTransport {
    options: RedisOptions,
}

impl ListQueueTransport {
    pub fn new(options: RedisOptions) -> Self {
        Self { options }
    }

    /// Declares `exchange` and binds `queue` to it under `routing_key`.
    pub async fn bind(
        &self,
        endpoint: &BrokerEndpoint,
        exchange: &str,
        routing_key: &str,
        queue: &str,
    ) -> Result<(), BrokerError> {
        if exchange.is_empty() {
            return Err(BrokerError::invalid_config(
                "the default exchange cannot be bound",
            ));
        }

        let (_client, mut conn, _address) = dial_first(endpoint, connect).await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(self.options.exchanges_key())
            .arg(exchange)
            .ignore()
            .cmd("SADD")
            .arg(self.options.bindings_key(exchange, routing_key))
            .arg(queue)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(BrokerError::transport)?;

        info!(exchange = %exchange, routing_key = %routing_key, queue = %queue, "Bound queue");
        Ok(())
    }
}

async fn connect(client: Client) -> RedisResult<MultiplexedConnection> {
    client.get_multiplexed_async_connection().await
}

/// Maps a command failure, marking the link lost if the connection died.
fn observe(notifier: &CloseNotifier, err: RedisError) -> BrokerError {
    if is_connection_loss(&err) {
        notifier.lost(err.to_string());
    }
    BrokerError::transport(err)
}

#[async_trait]
impl Transport for ListQueueTransport {
    fn name(&self) -> &'static str {
        "redis-lists"
    }

    async fn dial(&self, endpoint: &BrokerEndpoint) -> Result<Box<dyn Link>, BrokerError> {
        let (client, conn, address) = dial_first(endpoint, connect).await?;
        Ok(Box::new(QueueLink {
            client,
            conn,
            address,
            options: self.options.clone(),
            notifier: CloseNotifier::new(),
        }))
    }
}

struct QueueLink {
    client: Client,
    conn: MultiplexedConnection,
    address: String,
    options: RedisOptions,
    notifier: CloseNotifier,
}

#[async_trait]
impl Link for QueueLink {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, BrokerError> {
        if self.notifier.is_closed() {
            return Err(BrokerError::transport("link is closed"));
        }
        Ok(Box::new(QueueChannel {
            client: self.client.clone(),
            conn: self.conn.clone(),
            options: self.options.clone(),
            notifier: self.notifier.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn close_signal(&self) -> Option<CloseSignal> {
        Some(self.notifier.subscribe())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        debug!(address = %self.address, "Closing Redis queue link");
        self.notifier.closed();
        Ok(())
    }
}

struct QueueChannel {
    client: Client,
    conn: MultiplexedConnection,
    options: RedisOptions,
    notifier: CloseNotifier,
    closed: AtomicBool,
}

impl QueueChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) || self.notifier.is_closed() {
            return Err(BrokerError::transport("channel is closed"));
        }
        Ok(())
    }

    /// Pushes the payload onto every queue the destination routes to.
    /// Returns how many queues received it.
    async fn route(&self, destination: &Destination, payload: Bytes) -> Result<usize, BrokerError> {
        self.ensure_open()?;
        let Destination::Exchange {
            exchange,
            routing_key,
        } = destination
        else {
            return Err(BrokerError::unsupported("redis lists have no topics"));
        };
        let mut conn = self.conn.clone();

        if exchange.is_empty() {
            let _: i64 = redis::cmd("LPUSH")
                .arg(routing_key)
                .arg(&payload[..])
                .query_async(&mut conn)
                .await
                .map_err(|e| observe(&self.notifier, e))?;
            return Ok(1);
        }

        let (declared, queues): (bool, Vec<String>) = redis::pipe()
            .cmd("SISMEMBER")
            .arg(self.options.exchanges_key())
            .arg(exchange)
            .cmd("SMEMBERS")
            .arg(self.options.bindings_key(exchange, routing_key))
            .query_async(&mut conn)
            .await
            .map_err(|e| observe(&self.notifier, e))?;

        if !declared {
            return Err(BrokerError::transport(format!(
                "exchange '{exchange}' is not declared"
            )));
        }
        if queues.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Message is unroutable");
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for queue in &queues {
            pipe.cmd("LPUSH").arg(queue).arg(&payload[..]).ignore();
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| observe(&self.notifier, e))?;
        Ok(queues.len())
    }

    /// Puts deliveries left in a processing list back on the queue, oldest
    /// nearest the consumer end. Returns how many were restored.
    async fn restore(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        processing: &str,
    ) -> Result<usize, BrokerError> {
        let mut restored = 0;
        loop {
            let moved: Option<Vec<u8>> = redis::cmd("LMOVE")
                .arg(processing)
                .arg(queue)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(conn)
                .await
                .map_err(|e| observe(&self.notifier, e))?;
            if moved.is_none() {
                return Ok(restored);
            }
            restored += 1;
        }
    }
}

#[async_trait]
impl Channel for QueueChannel {
    async fn declare(&self, destination: &Destination) -> Result<(), BrokerError> {
        self.ensure_open()?;
        match destination {
            Destination::Exchange { exchange, .. } if exchange.is_empty() => Ok(()),
            Destination::Exchange { exchange, .. } => {
                let mut conn = self.conn.clone();
                let _: i64 = redis::cmd("SADD")
                    .arg(self.options.exchanges_key())
                    .arg(exchange)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| observe(&self.notifier, e))?;
                Ok(())
            }
            Destination::Topic { .. } => Err(BrokerError::unsupported("redis lists have no topics")),
        }
    }

    async fn enable_confirms(&self) -> Result<(), BrokerError> {
        // The LPUSH reply is the confirmation.
        self.ensure_open()
    }

    async fn publish(&self, destination: &Destination, payload: Bytes) -> Result<(), BrokerError> {
        self.route(destination, payload).await.map(|_| ())
    }

    async fn publish_confirmed(
        &self,
        destination: &Destination,
        payload: Bytes,
    ) -> Result<PendingConfirm, BrokerError> {
        let routed = self.route(destination, payload).await?;
        Ok(settled(if routed > 0 {
            Confirmation::Ack
        } else {
            Confirmation::Nack
        }))
    }

    async fn subscribe(
        &self,
        source: &Source,
        options: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        self.ensure_open()?;
        let Source::Queue { queue } = source else {
            return Err(BrokerError::unsupported(
                "redis lists only consume from queues",
            ));
        };

        // Blocking reads get their own connection so acks and publishes on
        // the shared one are not queued behind them. Its response timeout
        // has to outlast the block.
        let config = AsyncConnectionConfig::new()
            .set_response_timeout(Some(self.options.read_response_timeout()));
        let mut reader = self
            .client
            .get_multiplexed_async_connection_with_config(&config)
            .await
            .map_err(|e| observe(&self.notifier, e))?;

        let manual = options.ack_mode.is_manual();
        let processing = self.options.processing_key(queue, &options.consumer_tag);
        let restored = if manual {
            self.restore(&mut reader, queue, &processing).await?
        } else {
            0
        };
        if restored > 0 {
            info!(queue = %queue, restored, "Restored unacknowledged deliveries");
        }

        Ok(Box::new(QueueSubscription {
            reader,
            acker: self.conn.clone(),
            queue: queue.clone(),
            processing,
            manual,
            permits: Arc::new(Semaphore::new(usize::from(options.prefetch.max(1)))),
            block_seconds: self.options.block_seconds(),
            closed: self.notifier.subscribe(),
            notifier: self.notifier.clone(),
            redelivered_left: restored,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct QueueSubscription {
    reader: MultiplexedConnection,
    acker: MultiplexedConnection,
    queue: String,
    processing: String,
    manual: bool,
    /// Unsettled deliveries allowed at once (manual mode).
    permits: Arc<Semaphore>,
    block_seconds: f64,
    closed: CloseSignal,
    notifier: CloseNotifier,
    /// Deliveries still to come from the restored processing list.
    redelivered_left: usize,
}

impl QueueSubscription {
    async fn pop(&mut self) -> RedisResult<Option<Vec<u8>>> {
        if self.manual {
            redis::cmd("BLMOVE")
                .arg(&self.queue)
                .arg(&self.processing)
                .arg("RIGHT")
                .arg("LEFT")
                .arg(self.block_seconds)
                .query_async(&mut self.reader)
                .await
        } else {
            let popped: Option<(String, Vec<u8>)> = redis::cmd("BRPOP")
                .arg(&self.queue)
                .arg(self.block_seconds)
                .query_async(&mut self.reader)
                .await?;
            Ok(popped.map(|(_, payload)| payload))
        }
    }

    fn delivery(&mut self, payload: Vec<u8>, permit: Option<OwnedSemaphorePermit>) -> Message {
        let payload = Bytes::from(payload);
        let redelivered = self.redelivered_left > 0;
        self.redelivered_left = self.redelivered_left.saturating_sub(1);

        let handle: Box<dyn Acknowledger> = match permit {
            Some(permit) => Box::new(ListDelivery {
                conn: self.acker.clone(),
                queue: self.queue.clone(),
                processing: self.processing.clone(),
                payload: payload.clone(),
                notifier: self.notifier.clone(),
                _permit: permit,
            }),
            None => Box::new(Popped),
        };
        Message::new(payload, handle).redelivered(redelivered)
    }
}

#[async_trait]
impl Subscription for QueueSubscription {
    async fn next(&mut self) -> Option<Result<Message, BrokerError>> {
        loop {
            if self.closed.borrow_and_update().is_some() {
                return None;
            }

            let permit = if self.manual {
                tokio::select! {
                    permit = self.permits.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => return None,
                    },
                    _ = self.closed.changed() => continue,
                }
            } else {
                None
            };

            match self.pop().await {
                Ok(Some(payload)) => return Some(Ok(self.delivery(payload, permit))),
                Ok(None) => {}
                Err(e) if is_response_timeout(&e) => {
                    warn!(queue = %self.queue, error = %e, "Blocking pop got no reply");
                    self.notifier.lost(e.to_string());
                    return None;
                }
                Err(e) if is_connection_loss(&e) => {
                    warn!(queue = %self.queue, error = %e, "Redis connection lost");
                    self.notifier.lost(e.to_string());
                    return None;
                }
                Err(e) => return Some(Err(BrokerError::receive(e))),
            }
        }
    }
}

/// A delivery held in the consumer's processing list.
struct ListDelivery {
    conn: MultiplexedConnection,
    queue: String,
    processing: String,
    payload: Bytes,
    notifier: CloseNotifier,
    /// Frees a prefetch slot once the delivery is settled and dropped.
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Acknowledger for ListDelivery {
    async fn ack(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(&self.payload[..])
            .query_async(&mut conn)
            .await
            .map_err(|e| observe(&self.notifier, e))?;
        if removed == 0 {
            return Err(BrokerError::transport(format!(
                "delivery from '{}' is no longer held",
                self.queue
            )));
        }
        Ok(())
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let requeued: i64 = REQUEUE
            .key(&self.processing)
            .key(&self.queue)
            .arg(&self.payload[..])
            .invoke_async(&mut conn)
            .await
            .map_err(|e| observe(&self.notifier, e))?;
        if requeued == 0 {
            return Err(BrokerError::transport(format!(
                "delivery from '{}' is no longer held",
                self.queue
            )));
        }
        debug!(queue = %self.queue, "Delivery requeued");
        Ok(())
    }
}

/// BRPOP deliveries are gone from the broker once popped.
struct Popped;

#[async_trait]
impl Acknowledger for Popped {
    async fn ack(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
