//! Delivered messages and their broker-side handles.

use crate::error::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use tokio::sync::oneshot;

/// Settles a single delivery with the broker.
///
/// Queue-oriented backends ack or nack-with-requeue. Log-oriented backends
/// commit on `ack` and leave the position untouched on `reject`.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn reject(&self) -> Result<(), BrokerError>;
}

/// An opaque payload plus the handle used to settle it.
pub struct Message {
    payload: Bytes,
    redelivered: bool,
    handle: Box<dyn Acknowledger>,
}

impl Message {
    pub fn new(payload: Bytes, handle: Box<dyn Acknowledger>) -> Self {
        Self {
            payload,
            redelivered: false,
            handle,
        }
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.handle.ack().await
    }

    pub async fn reject(&self) -> Result<(), BrokerError> {
        self.handle.reject().await
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Broker verdict on a confirmed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
}

/// Resolves once the broker confirms or rejects a publish.
pub type PendingConfirm = oneshot::Receiver<Confirmation>;

/// A confirmation that is already known when the publish returns.
pub fn settled(confirmation: Confirmation) -> PendingConfirm {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(confirmation);
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counting {
        acks: AtomicU32,
        rejects: AtomicU32,
    }

    struct Handle(Arc<Counting>);

    #[async_trait]
    impl Acknowledger for Handle {
        async fn ack(&self) -> Result<(), BrokerError> {
            self.0.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reject(&self) -> Result<(), BrokerError> {
            self.0.rejects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_message_delegates_to_handle() {
        let counts = Arc::new(Counting::default());
        let message = Message::new(Bytes::from_static(b"hello"), Box::new(Handle(counts.clone())))
            .redelivered(true);

        assert_eq!(message.payload().as_ref(), b"hello");
        assert!(message.is_redelivered());

        message.ack().await.unwrap();
        message.reject().await.unwrap();
        assert_eq!(counts.acks.load(Ordering::SeqCst), 1);
        assert_eq!(counts.rejects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_settled_confirmation() {
        let pending = settled(Confirmation::Nack);
        assert_eq!(pending.await.unwrap(), Confirmation::Nack);
    }
}
