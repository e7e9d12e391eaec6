//! Backend seams.
//!
//! A [`Transport`] dials a [`Link`] (one network session), a link opens a
//! [`Channel`] (the logical session used for publishing and subscribing), and a
//! channel hands out [`Subscription`]s. Backends live outside this module: the
//! in-memory broker in [`crate::memory`] and the Redis transports in the
//! `redis-broker` crate.

use crate::config::{AckMode, BrokerEndpoint, Destination, Source, StartPosition};
use crate::error::BrokerError;
use crate::message::{Message, PendingConfirm};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;

/// Why a link stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed on request.
    Closed,
    /// Lost without a request; the consumer should reconnect.
    Lost(String),
}

/// Observes the close of a link. `None` while it is open.
pub type CloseSignal = watch::Receiver<Option<CloseReason>>;

/// Sending side of a [`CloseSignal`], kept by backends.
///
/// Only the first reason is recorded, so an explicit close followed by the
/// socket dropping is still seen as `Closed`.
#[derive(Debug, Clone)]
pub struct CloseNotifier {
    tx: Arc<watch::Sender<Option<CloseReason>>>,
}

impl CloseNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> CloseSignal {
        self.tx.subscribe()
    }

    /// Marks the link lost. Returns false if it was already closed.
    pub fn lost(&self, cause: impl Into<String>) -> bool {
        let cause = cause.into();
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(CloseReason::Lost(cause));
                true
            } else {
                false
            }
        })
    }

    pub fn closed(&self) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(CloseReason::Closed);
                true
            } else {
                false
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl Default for CloseNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Options a consumer passes when it subscribes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub consumer_tag: String,
    pub ack_mode: AckMode,
    pub start: StartPosition,
    /// Unacknowledged deliveries held at once; also the read batch size.
    pub prefetch: u16,
}

/// Dials broker endpoints.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    async fn dial(&self, endpoint: &BrokerEndpoint) -> Result<Box<dyn Link>, BrokerError>;
}

/// One dialed session with a broker.
#[async_trait]
pub trait Link: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, BrokerError>;

    /// Reports unexpected loss of the session.
    ///
    /// `None` means the backend reconnects on its own and surfaces failures as
    /// read errors instead; such links are never supervised.
    fn close_signal(&self) -> Option<CloseSignal>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Logical session used to publish and subscribe.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declares the destination (a direct, durable exchange) if the backend
    /// has such a notion.
    async fn declare(&self, destination: &Destination) -> Result<(), BrokerError>;

    async fn enable_confirms(&self) -> Result<(), BrokerError>;

    /// Returns once the backend has accepted the write.
    async fn publish(&self, destination: &Destination, payload: Bytes) -> Result<(), BrokerError>;

    /// Sends and returns a handle that resolves with the broker's verdict.
    async fn publish_confirmed(
        &self,
        destination: &Destination,
        payload: Bytes,
    ) -> Result<PendingConfirm, BrokerError>;

    async fn subscribe(
        &self,
        source: &Source,
        options: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A stream of deliveries.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next delivery.
    ///
    /// `None` means the subscription ended (its link closed). `Some(Err(_))` is
    /// a read error; the caller may poll again.
    async fn next(&mut self) -> Option<Result<Message, BrokerError>>;
}
