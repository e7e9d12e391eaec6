//! Relay Worker Service
//!
//! Moves messages between broker entries declared in one JSON file.
//!
//! ## Architecture
//!
//! ```text
//! BROKER_CONFIG (JSON)
//!   ↓ (BrokerConfig + routes)
//! Registry (BROKER_KEYS allow-list)
//!   ↓
//! Consumer "from" ──RelayHandler──▶ Producer "to"
//!   ↓ (fixed-delay retry, reconnect supervision)
//! Redis (Streams or lists, per BROKER_MODEL)
//! ```
//!
//! ## Features
//!
//! - One consumer per route, republishing every payload unchanged
//! - Confirmed publishes for producers declared with `"confirm": true`
//! - Health, readiness and Prometheus endpoints
//! - Graceful shutdown on SIGINT/SIGTERM

pub mod health;

use async_trait::async_trait;
use core_config::broker::{BrokerModel, RelaySettings};
use core_config::{Environment, FromEnv};
use eyre::{eyre, Result, WrapErr};
use health::HealthState;
use messaging::{BoxError, BrokerConfig, Bytes, MessageHandler, Producer, Registry, Transport};
use redis_broker::{ListQueueTransport, RedisOptions, StreamsTransport};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

/// One consumer key feeding one producer key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub from: String,
    pub to: String,
}

/// Contents of the file named by `BROKER_CONFIG`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(flatten)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub routes: Vec<Route>,
}

impl RelayConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).wrap_err("Invalid relay config")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read relay config {}", path.display()))?;
        Self::from_json(&raw)
    }
}

/// Republishes each payload through one producer.
pub struct RelayHandler {
    producer: Arc<Producer>,
}

impl RelayHandler {
    pub fn new(producer: Arc<Producer>) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl MessageHandler for RelayHandler {
    async fn handle(&self, payload: Bytes) -> Result<(), BoxError> {
        if self.producer.config().confirm {
            self.producer.publish_with_confirm(payload).await?;
        } else {
            self.producer.publish(payload).await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "relay"
    }
}

/// Picks the Redis transport for the configured broker model.
pub fn build_transport(settings: &RelaySettings) -> Arc<dyn Transport> {
    let options =
        RedisOptions::default().with_block_timeout(Duration::from_millis(settings.block_timeout_ms));
    match settings.model {
        BrokerModel::Log => Arc::new(StreamsTransport::new(options)),
        BrokerModel::Queue => Arc::new(ListQueueTransport::new(options)),
    }
}

/// Registers the config's entries, honouring the allow-list when one is set.
pub async fn register(registry: &Registry, config: &RelayConfig, keys: &[String]) -> Result<()> {
    let outcome = if keys.is_empty() {
        registry.register_all(&config.broker).await
    } else {
        registry.register_keys(&config.broker, keys).await
    }
    .wrap_err("Failed to register broker entries")?;

    info!(
        producers = ?outcome.producers,
        consumers = ?outcome.consumers,
        skipped = ?outcome.skipped,
        "Broker entries registered"
    );
    Ok(())
}

/// Starts one consumer per route. Returns the consumer keys in route order.
///
/// Both ends of every route must be registered.
pub async fn start_routes(registry: &Registry, routes: &[Route]) -> Result<Vec<String>> {
    let mut started = Vec::with_capacity(routes.len());
    for route in routes {
        let consumer = registry
            .consumer(&route.from)
            .ok_or_else(|| eyre!("route {} -> {}: no consumer registered as '{}'", route.from, route.to, route.from))?;
        let producer = registry
            .producer(&route.to)
            .ok_or_else(|| eyre!("route {} -> {}: no producer registered as '{}'", route.from, route.to, route.to))?;

        consumer
            .start(RelayHandler::new(producer))
            .await
            .wrap_err_with(|| format!("Failed to start route {} -> {}", route.from, route.to))?;
        info!(from = %route.from, to = %route.to, "Route started");
        started.push(route.from.clone());
    }
    Ok(started)
}

/// Start the health and metrics HTTP server
async fn start_health_server(state: HealthState, port: u16) -> Result<()> {
    let app = health::health_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the relay worker
///
/// 1. Sets up color-eyre and structured logging
/// 2. Installs the Prometheus recorder
/// 3. Loads settings and the broker config file
/// 4. Registers entries and starts every route
/// 5. Serves health endpoints until SIGINT/SIGTERM, then shuts the registry down
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    messaging::metrics::init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let name = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    info!(name, version, "Starting relay worker");
    info!("Environment: {:?}", environment);

    let settings = RelaySettings::from_env().wrap_err("Failed to load relay settings")?;
    info!(
        config = %settings.config_path,
        model = %settings.model,
        keys = ?settings.keys,
        "Relay settings loaded"
    );
    let config = RelayConfig::load(&settings.config_path)?;

    let registry = Arc::new(Registry::new(build_transport(&settings)));
    register(&registry, &config, &settings.keys).await?;

    let routes = match start_routes(&registry, &config.routes).await {
        Ok(routes) => routes,
        Err(e) => {
            registry.shutdown().await;
            return Err(e);
        }
    };

    let health_state = HealthState::new(registry.clone(), routes, name, version);
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, settings.health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    let signal = shutdown_signal().await;
    registry.shutdown().await;
    signal?;

    info!("Relay worker stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
