//! Error types for the broker runtime.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Boxed error used at the handler and transport seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure of a single handler invocation.
///
/// Carries the 1-based attempt index so retry logs and the terminal
/// [`BrokerError::RetryExhausted`] outcome can say which attempt failed.
#[derive(Debug)]
pub struct HandlerError {
    attempt: u32,
    source: BoxError,
}

impl HandlerError {
    pub fn new(attempt: u32, source: impl Into<BoxError>) -> Self {
        Self {
            attempt,
            source: source.into(),
        }
    }

    /// 1-based attempt index.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn into_source(self) -> BoxError {
        self.source
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler failed on attempt {}: {}", self.attempt, self.source)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Errors produced by connections, producers, consumers and the registry.
///
/// Setup-time failures (`Connection`, `Channel`, `InvalidConfig`) are fatal to
/// registration. `Publish`, `ConfirmTimeout` and `NotAcknowledged` are always
/// returned to the publishing caller. `RetryExhausted` is the terminal outcome of
/// a single message; the receive loop logs it and moves on.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Raw backend failure, before a layer above gives it meaning.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    #[error("failed to connect to broker at {endpoint}: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to open channel: {0}")]
    Channel(#[source] BoxError),

    #[error("failed to publish message: {0}")]
    Publish(#[source] BoxError),

    #[error("publish confirmation timed out after {0:?}")]
    ConfirmTimeout(Duration),

    #[error("message was not acknowledged by the broker")]
    NotAcknowledged,

    #[error("failed to subscribe: {0}")]
    Subscribe(#[source] BoxError),

    #[error("failed to receive message: {0}")]
    Receive(#[source] BoxError),

    #[error("failed to acknowledge message: {0}")]
    Acknowledge(#[source] BoxError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("message processing failed after {attempts} attempts")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: HandlerError,
    },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("consumer '{0}' is already started")]
    AlreadyStarted(String),

    #[error("consumer '{0}' has been stopped")]
    Stopped(String),

    #[error("producer '{0}' has been released")]
    Closed(String),

    #[error("registration of '{key}' failed: {source}")]
    Registration {
        key: String,
        /// Keys that were registered before the failure and remain live.
        registered: Vec<String>,
        #[source]
        source: Box<BrokerError>,
    },
}

impl BrokerError {
    pub fn transport(err: impl Into<BoxError>) -> Self {
        Self::Transport(err.into())
    }

    pub fn connection(endpoint: impl Into<String>, err: impl Into<BoxError>) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            source: err.into(),
        }
    }

    pub fn channel(err: impl Into<BoxError>) -> Self {
        Self::Channel(err.into())
    }

    pub fn publish(err: impl Into<BoxError>) -> Self {
        Self::Publish(err.into())
    }

    pub fn subscribe(err: impl Into<BoxError>) -> Self {
        Self::Subscribe(err.into())
    }

    pub fn receive(err: impl Into<BoxError>) -> Self {
        Self::Receive(err.into())
    }

    pub fn acknowledge(err: impl Into<BoxError>) -> Self {
        Self::Acknowledge(err.into())
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    /// True for failures that happen while a connection is being set up.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection { .. }
                | BrokerError::Channel(_)
                | BrokerError::InvalidConfig(_)
        )
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Transport(_) => "transport",
            BrokerError::Connection { .. } => "connection",
            BrokerError::Channel(_) => "channel",
            BrokerError::Publish(_) => "publish",
            BrokerError::ConfirmTimeout(_) => "confirm_timeout",
            BrokerError::NotAcknowledged => "not_acknowledged",
            BrokerError::Subscribe(_) => "subscribe",
            BrokerError::Receive(_) => "receive",
            BrokerError::Acknowledge(_) => "acknowledge",
            BrokerError::Handler(_) => "handler",
            BrokerError::RetryExhausted { .. } => "retry_exhausted",
            BrokerError::Unsupported(_) => "unsupported",
            BrokerError::InvalidConfig(_) => "invalid_config",
            BrokerError::AlreadyStarted(_) => "already_started",
            BrokerError::Stopped(_) => "stopped",
            BrokerError::Closed(_) => "closed",
            BrokerError::Registration { .. } => "registration",
        }
    }
}
