//! Log model over Redis Streams
//!
//! Topics are streams and consumer groups are Redis consumer groups:
//! - Publish is `XADD MAXLEN ~`. The reply carries the entry ID, so a
//!   successful XADD doubles as the confirmation.
//! - A subscription first re-reads the consumer's pending entries (ID `0`),
//!   then blocks on new ones (ID `>`).
//! - Ack is `XACK`. Reject leaves the entry pending, so it comes back on the
//!   next subscribe.
//!
//! The link is a [`ConnectionManager`], which re-establishes itself, so no
//! close signal is exposed and consumers run without a supervisor. Each
//! subscription blocks on a manager of its own, so acks and publishes never
//! wait behind a read. A read whose reply is given up on may still have
//! claimed entries; manual-ack subscriptions replay their pending list
//! after one.

use crate::config::RedisOptions;
use crate::connect::dial_first;
use crate::error::{is_busy_group, is_no_group, is_response_timeout};
use messaging::{
    async_trait, settled, AckMode, Acknowledger, BrokerEndpoint, BrokerError, Bytes, Channel,
    CloseSignal, Confirmation, Destination, Link, Message, PendingConfirm, Source, StartPosition,
    SubscribeOptions, Subscription, Transport,
};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::streams::StreamReadReply;
use redis::{Client, RedisResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Field holding the message body in every stream entry.
pub const PAYLOAD_FIELD: &str = "payload";

/// [`Transport`] for topic / consumer-group addressing on Redis Streams.
#[derive(Debug, Clone, Default)]
pub struct StreamsTransport {
    options: RedisOptions,
}

impl StreamsTransport {
    pub fn new(options: RedisOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Transport for StreamsTransport {
    fn name(&self) -> &'static str {
        "redis-streams"
    }

    async fn dial(&self, endpoint: &BrokerEndpoint) -> Result<Box<dyn Link>, BrokerError> {
        let (client, manager, address) = dial_first(endpoint, ConnectionManager::new).await?;
        Ok(Box::new(StreamsLink {
            client,
            manager,
            address,
            options: self.options.clone(),
        }))
    }
}

struct StreamsLink {
    client: Client,
    manager: ConnectionManager,
    address: String,
    options: RedisOptions,
}

#[async_trait]
impl Link for StreamsLink {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, BrokerError> {
        Ok(Box::new(StreamsChannel {
            client: self.client.clone(),
            manager: self.manager.clone(),
            options: self.options.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn close_signal(&self) -> Option<CloseSignal> {
        None
    }

    async fn close(&self) -> Result<(), BrokerError> {
        debug!(address = %self.address, "Releasing Redis streams link");
        Ok(())
    }
}

struct StreamsChannel {
    client: Client,
    manager: ConnectionManager,
    options: RedisOptions,
    closed: AtomicBool,
}

impl StreamsChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::transport("channel is closed"));
        }
        Ok(())
    }

    async fn append(&self, destination: &Destination, payload: Bytes) -> Result<String, BrokerError> {
        self.ensure_open()?;
        let Destination::Topic { topic } = destination else {
            return Err(BrokerError::unsupported(
                "redis streams only publish to topics",
            ));
        };

        let mut conn = self.manager.clone();
        let entry_id: String = redis::cmd("XADD")
            .arg(topic)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.options.max_length)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(&payload[..])
            .query_async(&mut conn)
            .await
            .map_err(BrokerError::transport)?;

        debug!(stream = %topic, entry_id = %entry_id, "Appended entry");
        Ok(entry_id)
    }
}

#[async_trait]
impl Channel for StreamsChannel {
    async fn declare(&self, destination: &Destination) -> Result<(), BrokerError> {
        self.ensure_open()?;
        match destination {
            // XADD creates the stream on first write.
            Destination::Topic { .. } => Ok(()),
            Destination::Exchange { .. } => Err(BrokerError::unsupported(
                "redis streams have no exchanges",
            )),
        }
    }

    async fn enable_confirms(&self) -> Result<(), BrokerError> {
        self.ensure_open()
    }

    async fn publish(&self, destination: &Destination, payload: Bytes) -> Result<(), BrokerError> {
        self.append(destination, payload).await.map(|_| ())
    }

    async fn publish_confirmed(
        &self,
        destination: &Destination,
        payload: Bytes,
    ) -> Result<PendingConfirm, BrokerError> {
        self.append(destination, payload).await?;
        Ok(settled(Confirmation::Ack))
    }

    async fn subscribe(
        &self,
        source: &Source,
        options: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        self.ensure_open()?;
        let Source::Topic { topic, group } = source else {
            return Err(BrokerError::unsupported(
                "redis streams only consume from topics",
            ));
        };

        let config = ConnectionManagerConfig::new()
            .set_response_timeout(Some(self.options.read_response_timeout()));
        let reader = ConnectionManager::new_with_config(self.client.clone(), config)
            .await
            .map_err(BrokerError::subscribe)?;

        let subscription = StreamSubscription {
            reader,
            manager: self.manager.clone(),
            topic: topic.clone(),
            group: group.clone(),
            consumer: options.consumer_tag.clone(),
            ack_mode: options.ack_mode,
            start: options.start,
            count: usize::from(options.prefetch.max(1)),
            block_millis: self.options.block_millis(),
            buffer: VecDeque::new(),
            pending_cursor: "0".to_string(),
            pending_drained: !options.ack_mode.is_manual(),
        };
        subscription.ensure_group().await?;
        Ok(Box::new(subscription))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct StreamSubscription {
    /// Carries XREADGROUP only.
    reader: ConnectionManager,
    manager: ConnectionManager,
    topic: String,
    group: String,
    consumer: String,
    ack_mode: AckMode,
    start: StartPosition,
    count: usize,
    block_millis: u64,
    buffer: VecDeque<Message>,
    /// Last pending entry replayed; pending reads resume after it.
    pending_cursor: String,
    /// Set once the consumer's pending entries have been replayed.
    pending_drained: bool,
}

impl StreamSubscription {
    /// Creates the consumer group if it doesn't exist. Where a new group
    /// starts follows the configured start position.
    async fn ensure_group(&self) -> Result<(), BrokerError> {
        let mut conn = self.manager.clone();
        let start_id = match self.start {
            StartPosition::Earliest => "0",
            StartPosition::Latest => "$",
        };

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.topic)
            .arg(&self.group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(stream = %self.topic, group = %self.group, start = start_id, "Created consumer group");
                Ok(())
            }
            Err(e) if is_busy_group(&e) => {
                debug!(stream = %self.topic, group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(BrokerError::subscribe(e)),
        }
    }

    /// One XREADGROUP round. `Ok(None)` means nothing arrived.
    async fn read(&self, pending: bool) -> RedisResult<Option<StreamReadReply>> {
        let mut conn = self.reader.clone();
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(self.count);

        if !pending {
            cmd.arg("BLOCK").arg(self.block_millis);
            if !self.ack_mode.is_manual() {
                cmd.arg("NOACK");
            }
        }

        cmd.arg("STREAMS")
            .arg(&self.topic)
            .arg(if pending { self.pending_cursor.as_str() } else { ">" });

        cmd.query_async(&mut conn).await
    }

    /// Turns a reply into buffered messages. Returns how many entries it had
    /// and the ids of entries without a payload.
    fn buffer_reply(&mut self, reply: StreamReadReply, redelivered: bool) -> (usize, Vec<String>) {
        let mut entries = 0;
        let mut malformed = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                entries += 1;
                if redelivered {
                    self.pending_cursor = entry.id.clone();
                }
                let Some(payload) = entry.get::<Vec<u8>>(PAYLOAD_FIELD) else {
                    warn!(
                        stream = %self.topic,
                        entry_id = %entry.id,
                        "Entry has no payload field, skipping"
                    );
                    malformed.push(entry.id);
                    continue;
                };

                let handle: Box<dyn Acknowledger> = if self.ack_mode.is_manual() {
                    Box::new(EntryAck {
                        manager: self.manager.clone(),
                        topic: self.topic.clone(),
                        group: self.group.clone(),
                        id: entry.id,
                    })
                } else {
                    Box::new(NoAck)
                };
                self.buffer
                    .push_back(Message::new(Bytes::from(payload), handle).redelivered(redelivered));
            }
        }
        (entries, malformed)
    }

    /// Acks skipped entries so they don't sit in the pending list.
    async fn discard(&self, ids: &[String]) {
        if ids.is_empty() || !self.ack_mode.is_manual() {
            return;
        }
        let mut conn = self.manager.clone();
        let result: RedisResult<i64> = redis::cmd("XACK")
            .arg(&self.topic)
            .arg(&self.group)
            .arg(ids)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(stream = %self.topic, error = %e, "Failed to ack skipped entries");
        }
    }
}

#[async_trait]
impl Subscription for StreamSubscription {
    async fn next(&mut self) -> Option<Result<Message, BrokerError>> {
        loop {
            if let Some(message) = self.buffer.pop_front() {
                return Some(Ok(message));
            }

            let pending = !self.pending_drained;
            match self.read(pending).await {
                Ok(Some(reply)) => {
                    let (entries, malformed) = self.buffer_reply(reply, pending);
                    self.discard(&malformed).await;
                    if pending && entries == 0 {
                        debug!(stream = %self.topic, group = %self.group, "Pending entries replayed");
                        self.pending_drained = true;
                    }
                }
                Ok(None) => {
                    if pending {
                        self.pending_drained = true;
                    }
                }
                Err(e) if is_response_timeout(&e) => {
                    warn!(stream = %self.topic, group = %self.group, error = %e, "XREADGROUP got no reply");
                    if self.ack_mode.is_manual() {
                        self.pending_cursor = "0".to_string();
                        self.pending_drained = false;
                    }
                    return Some(Err(BrokerError::receive(e)));
                }
                Err(e) if is_no_group(&e) => {
                    warn!(stream = %self.topic, group = %self.group, "Consumer group missing, recreating");
                    if let Err(create_err) = self.ensure_group().await {
                        warn!(error = %create_err, "Failed to recreate consumer group");
                    }
                    return Some(Err(BrokerError::receive(e)));
                }
                Err(e) => return Some(Err(BrokerError::receive(e))),
            }
        }
    }
}

struct EntryAck {
    manager: ConnectionManager,
    topic: String,
    group: String,
    id: String,
}

#[async_trait]
impl Acknowledger for EntryAck {
    async fn ack(&self) -> Result<(), BrokerError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(&self.topic)
            .arg(&self.group)
            .arg(&self.id)
            .query_async(&mut conn)
            .await
            .map_err(BrokerError::transport)?;

        debug!(stream = %self.topic, entry_id = %self.id, "Acknowledged entry");
        Ok(())
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        debug!(stream = %self.topic, entry_id = %self.id, "Entry left pending");
        Ok(())
    }
}

/// Entries read with NOACK are settled on delivery.
struct NoAck;

#[async_trait]
impl Acknowledger for NoAck {
    async fn ack(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
