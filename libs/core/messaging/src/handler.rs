//! Message handler trait.

use crate::error::BoxError;
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;

/// Handles the payload of one delivered message.
///
/// The runtime never looks inside the payload. A returned error counts as one
/// failed attempt; the consumer retries with a fixed delay up to its configured
/// retry count and then rejects or leaves the message uncommitted.
///
/// # Example
///
/// ```rust,ignore
/// struct AuditHandler { store: AuditStore }
///
/// #[async_trait]
/// impl MessageHandler for AuditHandler {
///     async fn handle(&self, payload: Bytes) -> Result<(), BoxError> {
///         self.store.append(&payload).await?;
///         Ok(())
///     }
///
///     fn name(&self) -> &'static str {
///         "audit_handler"
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: Bytes) -> Result<(), BoxError>;

    /// Used for logging and metrics labels.
    fn name(&self) -> &'static str {
        "handler"
    }
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, payload: Bytes) -> Result<(), BoxError> {
        (**self).handle(payload).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    name: &'static str,
    f: F,
}

/// Builds a handler from an async closure.
///
/// ```rust,ignore
/// let handler = handler_fn("printer", |payload: Bytes| async move {
///     println!("{}", String::from_utf8_lossy(&payload));
///     Ok::<_, BoxError>(())
/// });
/// ```
pub fn handler_fn<F, Fut, E>(name: &'static str, f: F) -> FnHandler<F>
where
    F: Fn(Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), E>> + Send,
    E: Into<BoxError>,
{
    FnHandler { name, f }
}

#[async_trait]
impl<F, Fut, E> MessageHandler for FnHandler<F>
where
    F: Fn(Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), E>> + Send,
    E: Into<BoxError>,
{
    async fn handle(&self, payload: Bytes) -> Result<(), BoxError> {
        (self.f)(payload).await.map_err(Into::into)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// A handler that accepts everything (for testing).
#[derive(Debug, Clone, Default)]
pub struct NoOpHandler;

#[async_trait]
impl MessageHandler for NoOpHandler {
    async fn handle(&self, _payload: Bytes) -> Result<(), BoxError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop_handler"
    }
}

/// A handler that always fails (for testing).
#[derive(Debug, Clone)]
pub struct FailingHandler {
    message: String,
}

impl FailingHandler {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn handle(&self, _payload: Bytes) -> Result<(), BoxError> {
        Err(self.message.clone().into())
    }

    fn name(&self) -> &'static str {
        "failing_handler"
    }
}
