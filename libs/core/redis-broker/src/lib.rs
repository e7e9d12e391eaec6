//! Redis transports for the messaging runtime
//!
//! Two transports cover the two broker models:
//!
//! - [`StreamsTransport`]: **log model**. Topics are Redis Streams, consumer
//!   groups are stream consumer groups, ack is `XACK`. Backed by a
//!   `ConnectionManager`, so the link heals itself and consumers run
//!   without a reconnect supervisor.
//! - [`ListQueueTransport`]: **queue model**. Queues are lists with a
//!   per-consumer processing list for unacknowledged deliveries, and direct
//!   exchanges are emulated with binding sets. A lost connection is reported
//!   through the link's close signal, so consumers reconnect with backoff.
//!
//! ## Example
//!
//! ```rust,ignore
//! use messaging::{BrokerConfig, Registry};
//! use redis_broker::{RedisOptions, StreamsTransport};
//! use std::sync::Arc;
//!
//! let registry = Registry::new(Arc::new(StreamsTransport::new(RedisOptions::default())));
//! registry.register_all(&config).await?;
//! registry.producer("events").unwrap().publish_with_confirm("hello").await?;
//! ```

mod config;
mod connect;
mod error;
mod queues;
mod streams;

pub use config::{DEFAULT_BLOCK_TIMEOUT, DEFAULT_KEY_PREFIX, DEFAULT_MAX_LENGTH, RedisOptions};
pub use queues::ListQueueTransport;
pub use streams::{PAYLOAD_FIELD, StreamsTransport};
