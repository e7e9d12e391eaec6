//! Resilient broker client runtime.
//!
//! Producers and consumers talk to a broker through a stateful [`Connection`].
//! The runtime covers two broker models behind one set of traits:
//! - **Queue-oriented**: exchange / routing key / queue addressing with
//!   per-message ack and nack-with-requeue.
//! - **Log-oriented**: topic / consumer group addressing where an ack commits
//!   the group's position.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  key   ┌──────────┐  publish   ┌────────────┐
//! │   Registry   │───────▶│ Producer │───────────▶│            │
//! │ (BrokerConfig│        └──────────┘            │ Connection │──▶ Transport
//! │  allow-list) │  key   ┌──────────┐  subscribe │ (Link +    │    (memory,
//! │              │───────▶│ Consumer │───────────▶│  Channel)  │     redis, …)
//! └──────────────┘        └────┬─────┘            └─────▲──────┘
//!                              │ close signal           │ replace
//!                              ▼                        │
//!                     ReconnectSupervisor ──────────────┘
//! ```
//!
//! Two retry policies apply and they are independent: a failing handler is
//! retried with a fixed delay (`retry_delay`, default 2s), while a lost
//! connection is re-established with exponential backoff (1s doubling to
//! 300s, forever). Publishing is never retried.
//!
//! # Example
//!
//! ```rust,ignore
//! use messaging::{handler_fn, BrokerConfig, Registry};
//!
//! let config: BrokerConfig = serde_json::from_str(&raw)?;
//! let registry = Registry::new(transport);
//! registry.register_keys(&config, &["orders", "audit"]).await?;
//!
//! let orders = registry.producer("orders").expect("registered");
//! orders.publish_with_confirm(b"{\"id\":1}".as_slice()).await?;
//!
//! let audit = registry.consumer("audit").expect("registered");
//! audit
//!     .start(handler_fn("audit", |payload: Bytes| async move {
//!         store(payload).await
//!     }))
//!     .await?;
//! ```

mod config;
mod connection;
mod consumer;
mod error;
mod handler;
mod message;
pub mod memory;
pub mod metrics;
mod producer;
mod registry;
mod supervisor;
pub mod transport;

pub use config::{
    AckMode, BrokerConfig, BrokerEndpoint, ConsumerConfig, Credentials, Destination,
    ProducerConfig, Source, StartPosition, DEFAULT_CONFIRM_TIMEOUT, DEFAULT_PREFETCH,
    DEFAULT_RETRY_COUNT, DEFAULT_RETRY_DELAY, INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY,
    READ_ERROR_PAUSE,
};
pub use connection::Connection;
pub use consumer::{Consumer, ConsumerState};
pub use error::{BoxError, BrokerError, HandlerError};
pub use handler::{handler_fn, FailingHandler, FnHandler, MessageHandler, NoOpHandler};
pub use memory::{ConfirmBehavior, MemoryBroker};
pub use message::{settled, Acknowledger, Confirmation, Message, PendingConfirm};
pub use metrics::BrokerMetrics;
pub use producer::{Producer, OUTBOX_CAPACITY};
pub use registry::{Registration, Registry};
pub use supervisor::ReconnectBackoff;
pub use transport::{
    Channel, CloseNotifier, CloseReason, CloseSignal, Link, SubscribeOptions, Subscription,
    Transport,
};

// Re-exported for backend crates implementing the transport traits.
pub use async_trait::async_trait;
pub use bytes::Bytes;
