use super::BrokerInner;
use crate::config::AckMode;
use crate::error::BrokerError;
use crate::message::{Acknowledger, Message};
use crate::transport::{CloseSignal, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
pub(crate) struct TopicState {
    entries: Vec<Bytes>,
    /// Next offset to read per group.
    committed: HashMap<String, u64>,
    notify: Arc<Notify>,
}

impl TopicState {
    pub(crate) fn append(&mut self, payload: Bytes) {
        self.entries.push(payload);
        self.notify.notify_waiters();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn payloads(&self) -> Vec<Bytes> {
        self.entries.clone()
    }

    pub(crate) fn notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub(crate) fn committed(&self, group: &str) -> Option<u64> {
        self.committed.get(group).copied()
    }

    /// Commits never move a group backwards.
    fn commit(&mut self, group: &str, offset: u64) {
        let next = offset + 1;
        let position = self.committed.entry(group.to_string()).or_insert(0);
        if next > *position {
            *position = next;
        }
    }
}

pub(crate) struct TopicSubscription {
    broker: Arc<BrokerInner>,
    topic: String,
    group: String,
    cursor: u64,
    ack_mode: AckMode,
    closed: CloseSignal,
    notify: Arc<Notify>,
}

impl TopicSubscription {
    pub(crate) fn new(
        broker: Arc<BrokerInner>,
        topic: String,
        group: String,
        cursor: u64,
        ack_mode: AckMode,
        closed: CloseSignal,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            broker,
            topic,
            group,
            cursor,
            ack_mode,
            closed,
            notify,
        }
    }

    fn try_read(&mut self) -> Option<Result<Message, BrokerError>> {
        let mut state = self.broker.lock();
        if let Some(err) = state.take_read_fault() {
            return Some(Err(err));
        }

        let topic = state.topic(&self.topic);
        let offset = self.cursor;
        let payload = topic.entries.get(usize::try_from(offset).ok()?)?.clone();
        self.cursor += 1;

        let handle: Box<dyn Acknowledger> = if self.ack_mode.is_manual() {
            Box::new(OffsetCommit {
                broker: self.broker.clone(),
                topic: self.topic.clone(),
                group: self.group.clone(),
                offset,
            })
        } else {
            topic.commit(&self.group, offset);
            Box::new(AutoCommitted)
        };

        Some(Ok(Message::new(payload, handle)))
    }
}

#[async_trait]
impl Subscription for TopicSubscription {
    async fn next(&mut self) -> Option<Result<Message, BrokerError>> {
        loop {
            let notify = self.notify.clone();
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.borrow_and_update().is_some() {
                return None;
            }
            if let Some(delivery) = self.try_read() {
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

struct OffsetCommit {
    broker: Arc<BrokerInner>,
    topic: String,
    group: String,
    offset: u64,
}

#[async_trait]
impl Acknowledger for OffsetCommit {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.broker
            .lock()
            .topic(&self.topic)
            .commit(&self.group, self.offset);
        Ok(())
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        debug!(topic = %self.topic, group = %self.group, offset = self.offset, "Leaving offset uncommitted");
        Ok(())
    }
}

struct AutoCommitted;

#[async_trait]
impl Acknowledger for AutoCommitted {
    async fn ack(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_only_moves_forward() {
        let mut topic = TopicState::default();
        topic.commit("g", 4);
        topic.commit("g", 1);
        assert_eq!(topic.committed("g"), Some(5));
        assert_eq!(topic.committed("other"), None);
    }
}
