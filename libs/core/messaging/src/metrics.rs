//! Prometheus metrics for producers and consumers.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Installs the Prometheus recorder.
///
/// Call this once at startup. Later calls return the installed handle.
pub fn init_metrics() -> Result<&'static PrometheusHandle, BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok(handle)
    })
}

pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Renders metrics in Prometheus text format; empty before [`init_metrics`].
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Metric helpers labelled with a registry key.
#[derive(Debug, Clone)]
pub struct BrokerMetrics {
    key: String,
}

impl BrokerMetrics {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn message_published(&self) {
        counter!("broker_messages_published_total", "key" => self.key.clone()).increment(1);
    }

    pub fn publish_failed(&self, kind: &'static str) {
        counter!(
            "broker_publish_failures_total",
            "key" => self.key.clone(),
            "kind" => kind
        )
        .increment(1);
    }

    pub fn confirm(&self, outcome: &'static str) {
        counter!(
            "broker_confirms_total",
            "key" => self.key.clone(),
            "outcome" => outcome
        )
        .increment(1);
    }

    pub fn message_received(&self) {
        counter!("broker_messages_received_total", "key" => self.key.clone()).increment(1);
    }

    pub fn message_processed(&self, duration: Duration) {
        counter!(
            "broker_messages_processed_total",
            "key" => self.key.clone(),
            "outcome" => "success"
        )
        .increment(1);
        histogram!("broker_processing_duration_seconds", "key" => self.key.clone())
            .record(duration.as_secs_f64());
    }

    pub fn message_exhausted(&self) {
        counter!(
            "broker_messages_processed_total",
            "key" => self.key.clone(),
            "outcome" => "exhausted"
        )
        .increment(1);
    }

    pub fn attempt_failed(&self) {
        counter!("broker_handler_attempt_failures_total", "key" => self.key.clone()).increment(1);
    }

    pub fn receive_error(&self) {
        counter!("broker_receive_errors_total", "key" => self.key.clone()).increment(1);
    }

    pub fn reconnect_attempt(&self) {
        counter!("broker_reconnect_attempts_total", "key" => self.key.clone()).increment(1);
    }

    pub fn reconnected(&self) {
        counter!("broker_reconnects_total", "key" => self.key.clone()).increment(1);
    }

    /// Encodes the consumer state as a gauge value.
    pub fn consumer_state(&self, state: u8) {
        gauge!("broker_consumer_state", "key" => self.key.clone()).set(f64::from(state));
    }
}
