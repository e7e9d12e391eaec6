//! Receive loop and per-message processing.

use super::ConsumerShared;
use crate::config::{ConsumerConfig, READ_ERROR_PAUSE};
use crate::error::{BrokerError, HandlerError};
use crate::handler::MessageHandler;
use crate::message::Message;
use crate::metrics::BrokerMetrics;
use crate::supervisor::interruptible_sleep;
use crate::transport::Subscription;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Pulls deliveries until stop is signalled or the subscription ends.
///
/// The stop signal is only observed between messages. With a concurrency
/// width of 1 each message is processed inline, which keeps delivery order;
/// wider consumers fan out onto a [`JoinSet`] bounded by a semaphore and drain
/// it before returning.
pub(crate) async fn run(
    shared: Arc<ConsumerShared>,
    handler: Arc<dyn MessageHandler>,
    mut subscription: Box<dyn Subscription>,
) {
    let key = shared.key().to_string();
    let width = shared.config.concurrency();
    let permits = Arc::new(Semaphore::new(width));
    let mut in_flight = JoinSet::new();
    let mut stop = shared.stop_signal();

    debug!(consumer = %key, width, "Receive loop started");

    loop {
        if *stop.borrow_and_update() {
            break;
        }

        let permit = if width > 1 {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
            }
        } else {
            None
        };

        let next = tokio::select! {
            biased;
            _ = stop.changed() => break,
            next = subscription.next() => next,
        };

        match next {
            Some(Ok(message)) => {
                shared.metrics.message_received();
                match permit {
                    None => {
                        let outcome = process_message(
                            &shared.config,
                            &shared.metrics,
                            handler.as_ref(),
                            message,
                        )
                        .await;
                        report(&key, outcome);
                    }
                    Some(permit) => {
                        let shared = shared.clone();
                        let handler = handler.clone();
                        in_flight.spawn(async move {
                            let outcome = process_message(
                                &shared.config,
                                &shared.metrics,
                                handler.as_ref(),
                                message,
                            )
                            .await;
                            report(shared.key(), outcome);
                            drop(permit);
                        });
                        while let Some(joined) = in_flight.try_join_next() {
                            if let Err(e) = joined {
                                error!(consumer = %key, error = %e, "Message task panicked");
                            }
                        }
                    }
                }
            }
            Some(Err(e)) => {
                shared.metrics.receive_error();
                error!(consumer = %key, error = %e, "Failed to read message, polling again");
                if !interruptible_sleep(&mut stop, READ_ERROR_PAUSE).await {
                    break;
                }
            }
            None => {
                warn!(consumer = %key, "Subscription ended");
                break;
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!(consumer = %key, error = %e, "Message task panicked");
        }
    }
    debug!(consumer = %key, "Receive loop exited");
}

/// Runs one message through the handler with fixed-delay retry.
///
/// Makes up to `retry_count + 1` attempts with `retry_delay` between them. In
/// manual ack mode a success is acknowledged (or committed) exactly once, and
/// exhaustion rejects the message: queue backends requeue it, log backends
/// leave the offset uncommitted.
pub(crate) async fn process_message(
    config: &ConsumerConfig,
    metrics: &BrokerMetrics,
    handler: &dyn MessageHandler,
    message: Message,
) -> Result<(), BrokerError> {
    let retry_count = config.retry_count();
    let retry_delay = config.retry_delay();
    let manual = config.ack_mode.is_manual();
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match handler.handle(message.payload().clone()).await {
            Ok(()) => {
                if manual {
                    message.ack().await.map_err(BrokerError::acknowledge)?;
                }
                metrics.message_processed(started.elapsed());
                return Ok(());
            }
            Err(source) => {
                let failure = HandlerError::new(attempt, source);
                metrics.attempt_failed();
                warn!(
                    consumer = %config.key,
                    handler = handler.name(),
                    attempt,
                    max_attempts = retry_count + 1,
                    error = %failure,
                    "Processing attempt failed"
                );

                if attempt > retry_count {
                    if manual {
                        if let Err(e) = message.reject().await {
                            warn!(consumer = %config.key, error = %e, "Failed to reject message");
                        }
                    }
                    metrics.message_exhausted();
                    return Err(BrokerError::RetryExhausted {
                        attempts: attempt,
                        last: failure,
                    });
                }

                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

fn report(key: &str, outcome: Result<(), BrokerError>) {
    match outcome {
        Ok(()) => {}
        Err(BrokerError::RetryExhausted { attempts, last }) => {
            error!(consumer = %key, attempts, error = %last, "Message processing failed, retries exhausted");
        }
        Err(e) => {
            error!(consumer = %key, error = %e, "Failed to settle message");
        }
    }
}
