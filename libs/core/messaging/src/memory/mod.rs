//! In-process broker implementing both the queue and the log model.
//!
//! Used by the test suites and for local runs without infrastructure. Faults
//! can be injected to exercise connection setup failures, read errors, lost
//! links and withheld confirmations.
//!
//! ```rust,ignore
//! let broker = MemoryBroker::new();
//! let transport: Arc<dyn Transport> = Arc::new(broker.transport());
//! let registry = Registry::new(transport);
//! broker.sever_links(); // every supervised consumer starts reconnecting
//! ```

mod log;
mod queue;

use crate::config::{BrokerEndpoint, Destination, Source, StartPosition};
use crate::error::BrokerError;
use crate::message::{settled, Confirmation, PendingConfirm};
use crate::transport::{
    Channel, CloseNotifier, CloseReason, CloseSignal, Link, SubscribeOptions, Subscription,
    Transport,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::time::Instant;

use self::log::{TopicState, TopicSubscription};
use self::queue::{QueueState, QueueSubscription};

/// How confirmed publishes are answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfirmBehavior {
    /// Ack routed messages, nack unroutable ones.
    #[default]
    Ack,
    Nack,
    /// Never answer; confirmations stay pending until released.
    Withhold,
}

#[derive(Debug, Default)]
struct Faults {
    failing_dials: u32,
    failing_channels: u32,
    failing_reads: u32,
    refused: HashSet<String>,
    confirms: ConfirmBehavior,
}

#[derive(Default)]
pub(crate) struct BrokerState {
    queues: HashMap<String, QueueState>,
    exchanges: HashSet<String>,
    bindings: HashMap<(String, String), Vec<String>>,
    topics: HashMap<String, TopicState>,
    links: BTreeMap<u64, CloseNotifier>,
    next_id: u64,
    faults: Faults,
    dials: Vec<Instant>,
    withheld: Vec<oneshot::Sender<Confirmation>>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Consumes one injected read fault, if any.
    fn take_read_fault(&mut self) -> Option<BrokerError> {
        if self.faults.failing_reads == 0 {
            return None;
        }
        self.faults.failing_reads -= 1;
        Some(BrokerError::receive("injected read failure"))
    }

    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    fn topic(&mut self, name: &str) -> &mut TopicState {
        self.topics.entry(name.to_string()).or_default()
    }

    /// Delivers a payload to its destination. Returns how many queues or
    /// topics received it.
    fn route(&mut self, destination: &Destination, payload: Bytes) -> Result<usize, BrokerError> {
        match destination {
            Destination::Topic { topic } => {
                self.topic(topic).append(payload);
                Ok(1)
            }
            Destination::Exchange {
                exchange,
                routing_key,
            } if exchange.is_empty() => {
                self.queue(routing_key).push(payload);
                Ok(1)
            }
            Destination::Exchange {
                exchange,
                routing_key,
            } => {
                if !self.exchanges.contains(exchange) {
                    return Err(BrokerError::transport(format!(
                        "exchange '{exchange}' is not declared"
                    )));
                }
                let bound = self
                    .bindings
                    .get(&(exchange.clone(), routing_key.clone()))
                    .cloned()
                    .unwrap_or_default();
                for queue in &bound {
                    self.queue(queue).push(payload.clone());
                }
                Ok(bound.len())
            }
        }
    }

    /// Drops a link and requeues whatever its consumers left unacknowledged.
    fn release_link(&mut self, link_id: u64, reason: CloseReason) {
        let Some(notifier) = self.links.remove(&link_id) else {
            return;
        };
        for queue in self.queues.values_mut() {
            queue.requeue_link(link_id);
        }
        match reason {
            CloseReason::Closed => notifier.closed(),
            CloseReason::Lost(cause) => notifier.lost(cause),
        };
    }
}

/// Shared handle to an in-process broker. Clones see the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
pub(crate) struct BrokerInner {
    state: Mutex<BrokerState>,
}

impl BrokerInner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.inner.clone(),
        }
    }

    /// The next `n` dials fail.
    pub fn fail_next_dials(&self, n: u32) {
        self.inner.lock().faults.failing_dials = n;
    }

    /// The next `n` channel opens fail.
    pub fn fail_next_channels(&self, n: u32) {
        self.inner.lock().faults.failing_channels = n;
    }

    /// The next `n` subscription reads return an error.
    pub fn fail_next_reads(&self, n: u32) {
        self.inner.lock().faults.failing_reads = n;
    }

    /// Dials to this address are refused.
    pub fn refuse_address(&self, address: impl Into<String>) {
        self.inner.lock().faults.refused.insert(address.into());
    }

    pub fn set_confirm_behavior(&self, behavior: ConfirmBehavior) {
        self.inner.lock().faults.confirms = behavior;
    }

    /// Answers every withheld confirmation.
    pub fn release_confirms(&self, confirmation: Confirmation) -> usize {
        let pending: Vec<_> = self.inner.lock().withheld.drain(..).collect();
        let count = pending.len();
        for tx in pending {
            let _ = tx.send(confirmation);
        }
        count
    }

    /// Drops every open link as if the broker went away. Returns how many
    /// links were severed.
    pub fn sever_links(&self) -> usize {
        let mut state = self.inner.lock();
        let ids: Vec<u64> = state.links.keys().copied().collect();
        for id in &ids {
            state.release_link(*id, CloseReason::Lost("connection reset by broker".to_string()));
        }
        ids.len()
    }

    pub fn open_links(&self) -> usize {
        self.inner.lock().links.len()
    }

    /// Instants of every dial attempt, failed ones included.
    pub fn dial_instants(&self) -> Vec<Instant> {
        self.inner.lock().dials.clone()
    }

    pub fn declare_exchange(&self, exchange: impl Into<String>) {
        self.inner.lock().exchanges.insert(exchange.into());
    }

    /// Binds a queue to a direct exchange under a routing key.
    pub fn bind(
        &self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        queue: impl Into<String>,
    ) {
        let exchange = exchange.into();
        let queue = queue.into();
        let mut state = self.inner.lock();
        state.exchanges.insert(exchange.clone());
        state.queue(&queue);
        let bound = state
            .bindings
            .entry((exchange, routing_key.into()))
            .or_default();
        if !bound.contains(&queue) {
            bound.push(queue);
        }
    }

    pub fn enqueue(&self, queue: &str, payload: impl Into<Bytes>) {
        self.inner.lock().queue(queue).push(payload.into());
    }

    pub fn append(&self, topic: &str, payload: impl Into<Bytes>) {
        self.inner.lock().topic(topic).append(payload.into());
    }

    /// Messages waiting in a queue.
    pub fn ready(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, QueueState::ready_len)
    }

    /// Messages delivered from a queue and not yet settled.
    pub fn unacked(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, QueueState::unacked_len)
    }

    /// Payloads waiting in a queue, front first.
    pub fn queued_payloads(&self, queue: &str) -> Vec<Bytes> {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(QueueState::ready_payloads)
            .unwrap_or_default()
    }

    pub fn topic_len(&self, topic: &str) -> usize {
        self.inner.lock().topics.get(topic).map_or(0, TopicState::len)
    }

    pub fn topic_payloads(&self, topic: &str) -> Vec<Bytes> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(TopicState::payloads)
            .unwrap_or_default()
    }

    /// Next offset the group will read after a restart.
    pub fn committed_offset(&self, topic: &str, group: &str) -> Option<u64> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .and_then(|t| t.committed(group))
    }
}

/// [`Transport`] over a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryTransport {
    broker: Arc<BrokerInner>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn dial(&self, endpoint: &BrokerEndpoint) -> Result<Box<dyn Link>, BrokerError> {
        let mut state = self.broker.lock();
        state.dials.push(Instant::now());

        if state.faults.failing_dials > 0 {
            state.faults.failing_dials -= 1;
            return Err(BrokerError::transport("connection refused"));
        }

        let Some(address) = endpoint
            .addresses
            .iter()
            .find(|address| !state.faults.refused.contains(*address))
        else {
            return Err(BrokerError::transport(format!(
                "no reachable address in [{endpoint}]"
            )));
        };
        let address = address.clone();

        let id = state.next_id();
        let notifier = CloseNotifier::new();
        state.links.insert(id, notifier.clone());

        Ok(Box::new(MemoryLink {
            id,
            address,
            broker: self.broker.clone(),
            notifier,
        }))
    }
}

struct MemoryLink {
    id: u64,
    address: String,
    broker: Arc<BrokerInner>,
    notifier: CloseNotifier,
}

#[async_trait]
impl Link for MemoryLink {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, BrokerError> {
        let mut state = self.broker.lock();
        if state.faults.failing_channels > 0 {
            state.faults.failing_channels -= 1;
            return Err(BrokerError::transport(format!(
                "channel refused by {}",
                self.address
            )));
        }
        if self.notifier.is_closed() {
            return Err(BrokerError::transport("link is closed"));
        }

        Ok(Box::new(MemoryChannel {
            link_id: self.id,
            broker: self.broker.clone(),
            notifier: self.notifier.clone(),
            confirms: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    fn close_signal(&self) -> Option<CloseSignal> {
        Some(self.notifier.subscribe())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.lock().release_link(self.id, CloseReason::Closed);
        Ok(())
    }
}

struct MemoryChannel {
    link_id: u64,
    broker: Arc<BrokerInner>,
    notifier: CloseNotifier,
    confirms: AtomicBool,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) || self.notifier.is_closed() {
            return Err(BrokerError::transport("channel is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare(&self, destination: &Destination) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if let Destination::Exchange { exchange, .. } = destination {
            if !exchange.is_empty() {
                self.broker.lock().exchanges.insert(exchange.clone());
            }
        }
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.confirms.store(true, Ordering::Release);
        Ok(())
    }

    async fn publish(&self, destination: &Destination, payload: Bytes) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.lock().route(destination, payload)?;
        Ok(())
    }

    async fn publish_confirmed(
        &self,
        destination: &Destination,
        payload: Bytes,
    ) -> Result<PendingConfirm, BrokerError> {
        self.ensure_open()?;
        if !self.confirms.load(Ordering::Acquire) {
            return Err(BrokerError::unsupported("confirm mode is not enabled"));
        }

        let mut state = self.broker.lock();
        let routed = state.route(destination, payload)?;
        match state.faults.confirms {
            ConfirmBehavior::Ack if routed > 0 => Ok(settled(Confirmation::Ack)),
            ConfirmBehavior::Ack | ConfirmBehavior::Nack => Ok(settled(Confirmation::Nack)),
            ConfirmBehavior::Withhold => {
                let (tx, rx) = oneshot::channel();
                state.withheld.push(tx);
                Ok(rx)
            }
        }
    }

    async fn subscribe(
        &self,
        source: &Source,
        options: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let sub_id = state.next_id();

        match source {
            Source::Queue { queue } => {
                let notify = state.queue(queue).notify();
                Ok(Box::new(QueueSubscription::new(
                    self.broker.clone(),
                    self.link_id,
                    sub_id,
                    queue.clone(),
                    options,
                    self.notifier.subscribe(),
                    notify,
                )))
            }
            Source::Topic { topic, group } => {
                let topic_state = state.topic(topic);
                let cursor = topic_state.committed(group).unwrap_or(match options.start {
                    StartPosition::Earliest => 0,
                    StartPosition::Latest => topic_state.len() as u64,
                });
                let notify = topic_state.notify();
                Ok(Box::new(TopicSubscription::new(
                    self.broker.clone(),
                    topic.clone(),
                    group.clone(),
                    cursor,
                    options.ack_mode,
                    self.notifier.subscribe(),
                    notify,
                )))
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
