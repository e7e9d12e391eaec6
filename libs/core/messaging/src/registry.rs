//! Keyed registry of live producers and consumers.
//!
//! The application owns a [`Registry`] and passes it where producers and
//! consumers are needed. Registration walks a [`BrokerConfig`] in order
//! (producers, then consumers) and stops at the first failure. Entries that
//! were registered before the failure stay live and are listed in the error.
//! A duplicate key replaces the earlier entry, which is released.

use crate::config::{BrokerConfig, ConsumerConfig, ProducerConfig};
use crate::consumer::Consumer;
use crate::error::BrokerError;
use crate::producer::Producer;
use crate::transport::Transport;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// What a registration pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
    pub producers: Vec<String>,
    pub consumers: Vec<String>,
    /// Entries filtered out by the allow-list.
    pub skipped: Vec<String>,
    /// Keys whose earlier entry was replaced and released.
    pub superseded: Vec<String>,
}

impl Registration {
    fn registered(&self) -> Vec<String> {
        self.producers
            .iter()
            .chain(self.consumers.iter())
            .cloned()
            .collect()
    }
}

pub struct Registry {
    transport: Arc<dyn Transport>,
    producers: RwLock<HashMap<String, Arc<Producer>>>,
    consumers: RwLock<HashMap<String, Arc<Consumer>>>,
    registration: Mutex<()>,
}

impl Registry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            producers: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            registration: Mutex::new(()),
        }
    }

    /// Registers every producer and consumer in `config`.
    pub async fn register_all(&self, config: &BrokerConfig) -> Result<Registration, BrokerError> {
        self.register(config, None).await
    }

    /// Registers only the entries whose key is in `allowed`.
    pub async fn register_keys<S: AsRef<str>>(
        &self,
        config: &BrokerConfig,
        allowed: &[S],
    ) -> Result<Registration, BrokerError> {
        let allowed: HashSet<&str> = allowed.iter().map(|key| key.as_ref()).collect();
        self.register(config, Some(&allowed)).await
    }

    async fn register(
        &self,
        config: &BrokerConfig,
        allowed: Option<&HashSet<&str>>,
    ) -> Result<Registration, BrokerError> {
        let _serialized = self.registration.lock().await;
        let config = config.resolved();
        let admitted = |key: &str| allowed.map_or(true, |keys| keys.contains(key));
        let mut outcome = Registration::default();

        for producer in config.producers {
            if !admitted(&producer.key) {
                outcome.skipped.push(producer.key);
                continue;
            }
            let key = producer.key.clone();
            match self.insert_producer(producer).await {
                Ok(superseded) => {
                    if superseded {
                        outcome.superseded.push(key.clone());
                    }
                    outcome.producers.push(key);
                }
                Err(source) => return Err(failed(key, &outcome, source)),
            }
        }

        for consumer in config.consumers {
            if !admitted(&consumer.key) {
                outcome.skipped.push(consumer.key);
                continue;
            }
            let key = consumer.key.clone();
            match self.insert_consumer(consumer).await {
                Ok(superseded) => {
                    if superseded {
                        outcome.superseded.push(key.clone());
                    }
                    outcome.consumers.push(key);
                }
                Err(source) => return Err(failed(key, &outcome, source)),
            }
        }

        info!(
            producers = outcome.producers.len(),
            consumers = outcome.consumers.len(),
            skipped = outcome.skipped.len(),
            superseded = outcome.superseded.len(),
            "Broker entries registered"
        );
        Ok(outcome)
    }

    /// Registers a single producer. Returns true if it replaced an entry.
    pub async fn register_producer(&self, config: ProducerConfig) -> Result<bool, BrokerError> {
        let _serialized = self.registration.lock().await;
        self.insert_producer(config).await
    }

    /// Registers a single consumer. Returns true if it replaced an entry.
    pub async fn register_consumer(&self, config: ConsumerConfig) -> Result<bool, BrokerError> {
        let _serialized = self.registration.lock().await;
        self.insert_consumer(config).await
    }

    async fn insert_producer(&self, config: ProducerConfig) -> Result<bool, BrokerError> {
        let key = config.key.clone();
        let producer = Arc::new(Producer::connect(self.transport.as_ref(), config).await?);
        let previous = write(&self.producers).insert(key.clone(), producer);
        match previous {
            Some(previous) => {
                warn!(producer = %key, "Duplicate producer key, releasing the earlier entry");
                previous.release().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_consumer(&self, config: ConsumerConfig) -> Result<bool, BrokerError> {
        let key = config.key.clone();
        let consumer = Arc::new(Consumer::connect(self.transport.clone(), config).await?);
        let previous = write(&self.consumers).insert(key.clone(), consumer);
        match previous {
            Some(previous) => {
                warn!(consumer = %key, "Duplicate consumer key, stopping the earlier entry");
                previous.stop().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn producer(&self, key: &str) -> Option<Arc<Producer>> {
        read(&self.producers).get(key).cloned()
    }

    pub fn consumer(&self, key: &str) -> Option<Arc<Consumer>> {
        read(&self.consumers).get(key).cloned()
    }

    /// Registered producer keys, sorted.
    pub fn producer_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = read(&self.producers).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Registered consumer keys, sorted.
    pub fn consumer_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = read(&self.consumers).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Stops every consumer and releases every producer. Entries stay
    /// registered, so lookups still succeed but the handles are inert.
    pub async fn shutdown(&self) {
        let _serialized = self.registration.lock().await;
        let consumers: Vec<Arc<Consumer>> = read(&self.consumers).values().cloned().collect();
        let producers: Vec<Arc<Producer>> = read(&self.producers).values().cloned().collect();

        join_all(consumers.iter().map(|consumer| consumer.stop())).await;
        join_all(producers.iter().map(|producer| producer.release())).await;
        info!(
            consumers = consumers.len(),
            producers = producers.len(),
            "Registry shut down"
        );
    }
}

fn failed(key: String, outcome: &Registration, source: BrokerError) -> BrokerError {
    let registered = outcome.registered();
    warn!(key = %key, registered = ?registered, error = %source, "Registration aborted, earlier entries stay live");
    BrokerError::Registration {
        key,
        registered,
        source: Box::new(source),
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
