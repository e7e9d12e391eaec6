use super::BrokerInner;
use crate::config::AckMode;
use crate::error::BrokerError;
use crate::message::{Acknowledger, Message};
use crate::transport::{CloseSignal, SubscribeOptions, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone)]
struct Envelope {
    payload: Bytes,
    redelivered: bool,
}

struct Unacked {
    link_id: u64,
    sub_id: u64,
    envelope: Envelope,
}

#[derive(Default)]
pub(crate) struct QueueState {
    ready: VecDeque<Envelope>,
    /// Keyed by delivery tag, so requeueing keeps delivery order.
    unacked: BTreeMap<u64, Unacked>,
    notify: Arc<Notify>,
}

impl QueueState {
    pub(crate) fn push(&mut self, payload: Bytes) {
        self.ready.push_back(Envelope {
            payload,
            redelivered: false,
        });
        self.notify.notify_waiters();
    }

    pub(crate) fn notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub(crate) fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub(crate) fn ready_payloads(&self) -> Vec<Bytes> {
        self.ready.iter().map(|e| e.payload.clone()).collect()
    }

    fn held_by(&self, sub_id: u64) -> usize {
        self.unacked.values().filter(|u| u.sub_id == sub_id).count()
    }

    /// Puts deliveries held over a dead link back at the head of the queue.
    pub(crate) fn requeue_link(&mut self, link_id: u64) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.link_id == link_id)
            .map(|(tag, _)| *tag)
            .collect();
        if tags.is_empty() {
            return;
        }
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue_front(unacked.envelope);
            }
        }
        self.notify.notify_waiters();
    }

    fn requeue_front(&mut self, mut envelope: Envelope) {
        envelope.redelivered = true;
        self.ready.push_front(envelope);
    }
}

pub(crate) struct QueueSubscription {
    broker: Arc<BrokerInner>,
    link_id: u64,
    sub_id: u64,
    queue: String,
    ack_mode: AckMode,
    prefetch: usize,
    closed: CloseSignal,
    notify: Arc<Notify>,
}

impl QueueSubscription {
    pub(crate) fn new(
        broker: Arc<BrokerInner>,
        link_id: u64,
        sub_id: u64,
        queue: String,
        options: &SubscribeOptions,
        closed: CloseSignal,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            broker,
            link_id,
            sub_id,
            queue,
            ack_mode: options.ack_mode,
            prefetch: usize::from(options.prefetch.max(1)),
            closed,
            notify,
        }
    }

    fn try_take(&self) -> Option<Result<Message, BrokerError>> {
        let mut state = self.broker.lock();
        if let Some(err) = state.take_read_fault() {
            return Some(Err(err));
        }

        let tag = state.next_id();
        let queue = state.queue(&self.queue);
        if self.ack_mode.is_manual() && queue.held_by(self.sub_id) >= self.prefetch {
            return None;
        }
        let envelope = queue.ready.pop_front()?;
        let payload = envelope.payload.clone();
        let redelivered = envelope.redelivered;

        let handle: Box<dyn Acknowledger> = if self.ack_mode.is_manual() {
            queue.unacked.insert(
                tag,
                Unacked {
                    link_id: self.link_id,
                    sub_id: self.sub_id,
                    envelope,
                },
            );
            Box::new(QueueDelivery {
                broker: self.broker.clone(),
                queue: self.queue.clone(),
                tag,
            })
        } else {
            Box::new(AutoAcked)
        };

        Some(Ok(Message::new(payload, handle).redelivered(redelivered)))
    }
}

#[async_trait]
impl Subscription for QueueSubscription {
    async fn next(&mut self) -> Option<Result<Message, BrokerError>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.borrow_and_update().is_some() {
                return None;
            }
            if let Some(delivery) = self.try_take() {
                return Some(delivery);
            }

            tokio::select! {
                _ = &mut notified => {}
                changed = self.closed.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

struct QueueDelivery {
    broker: Arc<BrokerInner>,
    queue: String,
    tag: u64,
}

#[async_trait]
impl Acknowledger for QueueDelivery {
    async fn ack(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        let queue = state.queue(&self.queue);
        if queue.unacked.remove(&self.tag).is_none() {
            return Err(BrokerError::transport(format!(
                "unknown delivery tag {}",
                self.tag
            )));
        }
        queue.notify.notify_waiters();
        Ok(())
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        let queue = state.queue(&self.queue);
        let Some(unacked) = queue.unacked.remove(&self.tag) else {
            return Err(BrokerError::transport(format!(
                "unknown delivery tag {}",
                self.tag
            )));
        };
        queue.requeue_front(unacked.envelope);
        queue.notify.notify_waiters();
        Ok(())
    }
}

/// Handle for deliveries the broker already settled.
struct AutoAcked;

#[async_trait]
impl Acknowledger for AutoAcked {
    async fn ack(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
