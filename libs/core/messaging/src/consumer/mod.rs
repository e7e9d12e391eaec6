//! Consumer lifecycle.
//!
//! ```text
//! Stopped ──start──▶ Starting ──▶ Consuming ◀──▶ Reconnecting
//!    ▲                                │               │
//!    └──────────────stop──────────────┴───────────────┘
//! ```
//!
//! `start` subscribes and spawns the receive loop (see [`receive`]) plus, for
//! links that report unexpected closes, a [`ReconnectSupervisor`]. Both tasks
//! watch the same stop signal. `stop` raises it, waits for both tasks (a running
//! handler always finishes) and then closes the connection.

pub(crate) mod receive;

use crate::config::ConsumerConfig;
use crate::connection::Connection;
use crate::error::BrokerError;
use crate::handler::MessageHandler;
use crate::metrics::BrokerMetrics;
use crate::supervisor::ReconnectSupervisor;
use crate::transport::{SubscribeOptions, Subscription, Transport};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Starting,
    Consuming,
    Reconnecting,
}

impl ConsumerState {
    fn gauge_value(self) -> u8 {
        match self {
            ConsumerState::Stopped => 0,
            ConsumerState::Starting => 1,
            ConsumerState::Consuming => 2,
            ConsumerState::Reconnecting => 3,
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Stopped => "stopped",
            ConsumerState::Starting => "starting",
            ConsumerState::Consuming => "consuming",
            ConsumerState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// State shared by a consumer, its receive loop and its supervisor.
pub(crate) struct ConsumerShared {
    pub(crate) config: ConsumerConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) connection: Mutex<Option<Connection>>,
    pub(crate) reconnecting: AtomicBool,
    pub(crate) metrics: BrokerMetrics,
    state: watch::Sender<ConsumerState>,
    stop: watch::Sender<bool>,
    receive_loop: StdMutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConsumerShared {
    pub(crate) fn key(&self) -> &str {
        &self.config.key
    }

    pub(crate) fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
        self.metrics.consumer_state(state.gauge_value());
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub(crate) fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Subscribes to the configured source over `connection`.
    pub(crate) async fn arm(
        &self,
        connection: &Connection,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let options = SubscribeOptions {
            consumer_tag: self.config.consumer_tag().to_string(),
            ack_mode: self.config.ack_mode,
            start: self.config.start,
            prefetch: self.config.prefetch(),
        };
        connection
            .channel()
            .subscribe(&self.config.source, &options)
            .await
            .map_err(BrokerError::subscribe)
    }

    pub(crate) fn spawn_receive_loop(
        self: &Arc<Self>,
        handler: Arc<dyn MessageHandler>,
        subscription: Box<dyn Subscription>,
    ) {
        let handle = tokio::spawn(receive::run(self.clone(), handler, subscription));
        if lock(&self.receive_loop).replace(handle).is_some() {
            warn!(consumer = %self.key(), "Replaced a receive loop that was still registered");
        }
    }

    pub(crate) fn take_receive_loop(&self) -> Option<JoinHandle<()>> {
        lock(&self.receive_loop).take()
    }
}

/// Pulls messages from one source and runs them through a handler.
pub struct Consumer {
    shared: Arc<ConsumerShared>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

impl Consumer {
    /// Connects to the configured endpoint. Nothing is consumed until
    /// [`Consumer::start`].
    pub async fn connect(
        transport: Arc<dyn Transport>,
        config: ConsumerConfig,
    ) -> Result<Self, BrokerError> {
        config.validate()?;
        let connection = Connection::connect(transport.as_ref(), &config.endpoint).await?;

        let (state, _) = watch::channel(ConsumerState::Stopped);
        let (stop, _) = watch::channel(false);
        let metrics = BrokerMetrics::new(&config.key);

        info!(consumer = %config.key, source = %config.source, "Consumer connected");

        Ok(Self {
            shared: Arc::new(ConsumerShared {
                config,
                transport,
                connection: Mutex::new(Some(connection)),
                reconnecting: AtomicBool::new(false),
                metrics,
                state,
                stop,
                receive_loop: StdMutex::new(None),
            }),
            supervisor: StdMutex::new(None),
        })
    }

    pub fn key(&self) -> &str {
        self.shared.key()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConsumerState {
        *self.shared.state.borrow()
    }

    /// Follows state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.shared.state.subscribe()
    }

    /// Subscribes and starts consuming in the background.
    ///
    /// Returns once the subscription is armed. A consumer starts at most once:
    /// a second call fails with [`BrokerError::AlreadyStarted`], and a call
    /// after [`Consumer::stop`] fails with [`BrokerError::Stopped`].
    pub async fn start(&self, handler: impl MessageHandler + 'static) -> Result<(), BrokerError> {
        let key = self.key().to_string();
        if self.shared.is_stopping() {
            return Err(BrokerError::Stopped(key));
        }
        let claimed = self.shared.state.send_if_modified(|state| {
            if *state == ConsumerState::Stopped {
                *state = ConsumerState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(BrokerError::AlreadyStarted(key));
        }
        self.shared.set_state(ConsumerState::Starting);

        let handler: Arc<dyn MessageHandler> = Arc::new(handler);

        // Held until Consuming is published so a concurrent stop closes the
        // connection only after start is done with it.
        let connection = self.shared.connection.lock().await;
        let armed = match connection.as_ref() {
            Some(connection) => self
                .shared
                .arm(connection)
                .await
                .map(|subscription| (subscription, connection.close_signal())),
            None => Err(BrokerError::Stopped(key.clone())),
        };
        let (subscription, close_signal) = match armed {
            Ok(armed) => armed,
            Err(e) => {
                self.shared.set_state(ConsumerState::Stopped);
                return Err(e);
            }
        };

        self.shared
            .spawn_receive_loop(handler.clone(), subscription);

        match close_signal {
            Some(signal) => {
                let supervisor = ReconnectSupervisor::new(self.shared.clone(), handler.clone());
                *lock(&self.supervisor) = Some(tokio::spawn(supervisor.run(signal)));
            }
            None => debug!(consumer = %key, "Link reconnects on its own, no supervisor"),
        }

        self.shared.set_state(ConsumerState::Consuming);
        drop(connection);

        info!(
            consumer = %key,
            source = %self.shared.config.source,
            handler = handler.name(),
            concurrency = self.shared.config.concurrency(),
            "Consumer started"
        );
        Ok(())
    }

    /// Stops consuming and releases the connection.
    ///
    /// Waits for the message in flight, if any, to finish. Returns at once if
    /// a stop already happened or is underway.
    pub async fn stop(&self) {
        let first = self.shared.stop.send_if_modified(|stopping| {
            if *stopping {
                false
            } else {
                *stopping = true;
                true
            }
        });
        if !first {
            debug!(consumer = %self.key(), "Consumer already stopping");
            return;
        }
        info!(consumer = %self.key(), "Stopping consumer");

        let supervisor = lock(&self.supervisor).take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                warn!(consumer = %self.key(), error = %e, "Reconnect supervisor ended abnormally");
            }
        }

        if let Some(handle) = self.shared.take_receive_loop() {
            if let Err(e) = handle.await {
                warn!(consumer = %self.key(), error = %e, "Receive loop ended abnormally");
            }
        }

        let connection = self.shared.connection.lock().await.take();
        if let Some(connection) = connection {
            connection.close().await;
        }

        self.shared.set_state(ConsumerState::Stopped);
        info!(consumer = %self.key(), "Consumer stopped");
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        // Background tasks exit at their next boundary.
        self.shared.stop.send_replace(true);
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("key", &self.shared.config.key)
            .field("source", &self.shared.config.source)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
