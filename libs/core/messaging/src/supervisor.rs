//! Reconnect supervision for consumers on links that can be lost.
//!
//! The supervisor waits on the link's close signal. When the link is lost it
//! takes the reconnect guard, drops the stale connection and retries forever
//! with exponential backoff: 1s, 2s, 4s, … capped at 300s, with the delay
//! applied before every attempt. A successful attempt installs the new
//! connection, re-subscribes and spawns a fresh receive loop.
//!
//! Stop is honoured between attempts: it interrupts the backoff sleep, and a
//! connection that comes up after stop is closed instead of installed.

use crate::config::{INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY};
use crate::connection::Connection;
use crate::consumer::{ConsumerShared, ConsumerState};
use crate::handler::MessageHandler;
use crate::transport::{CloseReason, CloseSignal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Doubling delay sequence with a cap. Never gives up.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    next: Duration,
    max: Duration,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            next: initial,
            max,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.max);
        self.next = self.next.saturating_mul(2).min(self.max);
        self.attempts += 1;
        delay
    }

    /// Attempts handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
        self.attempts = 0;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY)
    }
}

impl Iterator for ReconnectBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

/// Sleeps unless stop is signalled first. Returns false if stopped.
pub(crate) async fn interruptible_sleep(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *stop.borrow() {
        return false;
    }
    tokio::select! {
        biased;
        _ = stop.changed() => false,
        _ = tokio::time::sleep(delay) => !*stop.borrow(),
    }
}

/// Releases the reconnect flag on drop.
struct ReconnectGuard<'a>(&'a AtomicBool);

impl<'a> ReconnectGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum Outcome {
    /// Consuming again. Carries the new link's close signal, if it has one.
    Resumed(Option<CloseSignal>),
    Stopped,
    /// Another reconnect holds the guard.
    Busy,
}

pub(crate) struct ReconnectSupervisor {
    shared: Arc<ConsumerShared>,
    handler: Arc<dyn MessageHandler>,
    initial_delay: Duration,
    max_delay: Duration,
}

impl ReconnectSupervisor {
    pub(crate) fn new(shared: Arc<ConsumerShared>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            shared,
            handler,
            initial_delay: INITIAL_RECONNECT_DELAY,
            max_delay: MAX_RECONNECT_DELAY,
        }
    }

    pub(crate) async fn run(self, mut signal: CloseSignal) {
        let key = self.shared.key().to_string();
        let mut stop = self.shared.stop_signal();
        debug!(consumer = %key, "Reconnect supervisor started");

        loop {
            if *stop.borrow_and_update() {
                break;
            }

            let reason = signal.borrow_and_update().clone();
            let cause = match reason {
                Some(CloseReason::Lost(cause)) => cause,
                Some(CloseReason::Closed) => {
                    debug!(consumer = %key, "Connection closed on request");
                    break;
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = stop.changed() => break,
                        changed = signal.changed() => match changed {
                            Ok(()) => continue,
                            Err(_) => "close notifier dropped".to_string(),
                        },
                    }
                }
            };

            if self.shared.is_stopping() {
                break;
            }
            error!(consumer = %key, cause = %cause, "Connection lost, reconnecting");

            match self.reconnect(&mut stop).await {
                Outcome::Resumed(Some(next)) => signal = next,
                Outcome::Resumed(None) => {
                    debug!(consumer = %key, "New link reconnects on its own");
                    break;
                }
                Outcome::Stopped => break,
                Outcome::Busy => {
                    debug!(consumer = %key, "Reconnect already in progress, ignoring close signal");
                    break;
                }
            }
        }

        debug!(consumer = %key, "Reconnect supervisor exited");
    }

    async fn reconnect(&self, stop: &mut watch::Receiver<bool>) -> Outcome {
        let Some(_guard) = ReconnectGuard::acquire(&self.shared.reconnecting) else {
            return Outcome::Busy;
        };
        let shared = &self.shared;
        let key = shared.key();
        shared.set_state(ConsumerState::Reconnecting);

        let stale = shared.connection.lock().await.take();
        if let Some(stale) = stale {
            stale.close().await;
        }
        // Its subscription has ended; a handler still running is allowed to finish.
        if let Some(previous) = shared.take_receive_loop() {
            if let Err(e) = previous.await {
                warn!(consumer = %key, error = %e, "Previous receive loop ended abnormally");
            }
        }

        let mut backoff = ReconnectBackoff::new(self.initial_delay, self.max_delay);
        loop {
            let delay = backoff.next_delay();
            let attempt = backoff.attempts();
            info!(consumer = %key, attempt, delay = ?delay, "Reconnecting");

            if !interruptible_sleep(stop, delay).await {
                return Outcome::Stopped;
            }
            shared.metrics.reconnect_attempt();

            let connection =
                match Connection::connect(shared.transport.as_ref(), &shared.config.endpoint).await
                {
                    Ok(connection) => connection,
                    Err(e) => {
                        warn!(consumer = %key, attempt, error = %e, "Reconnect attempt failed");
                        continue;
                    }
                };

            let subscription = match shared.arm(&connection).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!(consumer = %key, attempt, error = %e, "Failed to resubscribe after reconnect");
                    connection.close().await;
                    continue;
                }
            };

            if shared.is_stopping() {
                drop(subscription);
                connection.close().await;
                return Outcome::Stopped;
            }

            let signal = connection.close_signal();
            *shared.connection.lock().await = Some(connection);
            shared.spawn_receive_loop(self.handler.clone(), subscription);
            shared.set_state(ConsumerState::Consuming);
            shared.metrics.reconnected();
            info!(consumer = %key, attempts = attempt, "Successfully reconnected and resumed consuming");

            return Outcome::Resumed(signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence_doubles_and_caps() {
        let delays: Vec<u64> = ReconnectBackoff::default()
            .take(12)
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, [1, 2, 4, 8, 16, 32, 64, 128, 256, 300, 300, 300]);
    }

    #[test]
    fn test_backoff_never_exceeds_cap() {
        let mut backoff = ReconnectBackoff::default();
        for _ in 0..1_000 {
            assert!(backoff.next_delay() <= MAX_RECONNECT_DELAY);
        }
        assert_eq!(backoff.attempts(), 1_000);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = ReconnectBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.attempts(), 1);
    }

    #[test]
    fn test_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let guard = ReconnectGuard::acquire(&flag);
        assert!(guard.is_some());
        assert!(ReconnectGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(ReconnectGuard::acquire(&flag).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interruptible_sleep() {
        let (tx, mut rx) = watch::channel(false);
        assert!(interruptible_sleep(&mut rx, Duration::from_secs(1)).await);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send_replace(true);
            tx
        });
        let started = tokio::time::Instant::now();
        assert!(!interruptible_sleep(&mut rx, Duration::from_secs(60)).await);
        assert!(started.elapsed() < Duration::from_secs(60));
        let _tx = stopper.await.unwrap();
    }
}
