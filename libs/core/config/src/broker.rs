//! Broker settings for worker binaries.

use crate::{env_list, env_or_default, env_parse, env_required, ConfigError, FromEnv};
use std::fmt;
use std::str::FromStr;

/// Which broker model the worker talks to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BrokerModel {
    /// Topics and consumer groups (Redis Streams)
    #[default]
    Log,
    /// Exchanges, routing keys and queues (Redis lists)
    Queue,
}

impl FromStr for BrokerModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" | "stream" | "streams" => Ok(BrokerModel::Log),
            "queue" | "queues" | "list" => Ok(BrokerModel::Queue),
            other => Err(format!("unknown broker model '{other}', expected 'log' or 'queue'")),
        }
    }
}

impl fmt::Display for BrokerModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerModel::Log => f.write_str("log"),
            BrokerModel::Queue => f.write_str("queue"),
        }
    }
}

/// Settings for the relay worker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelaySettings {
    /// Path of the JSON broker config (BROKER_CONFIG, required)
    pub config_path: String,
    /// BROKER_MODEL, default `log`
    pub model: BrokerModel,
    /// BROKER_KEYS allow-list; empty registers everything
    pub keys: Vec<String>,
    /// HEALTH_PORT, default 8082
    pub health_port: u16,
    /// BROKER_BLOCK_TIMEOUT_MS, default 5000
    pub block_timeout_ms: u64,
}

impl FromEnv for RelaySettings {
    fn from_env() -> Result<Self, ConfigError> {
        let model = env_or_default("BROKER_MODEL", "log");
        let model = model.parse().map_err(|details| ConfigError::ParseError {
            key: "BROKER_MODEL".to_string(),
            details,
        })?;

        Ok(Self {
            config_path: env_required("BROKER_CONFIG")?,
            model,
            keys: env_list("BROKER_KEYS"),
            health_port: env_parse("HEALTH_PORT", 8082)?,
            block_timeout_ms: env_parse("BROKER_BLOCK_TIMEOUT_MS", 5000)?,
        })
    }
}
