//! Configuration for a replication slot session.
//!
//! Loaded from environment variables following the 12-factor pattern. The
//! recognized options are the slot id, the upstream connection parameters,
//! the publication and slot names, and replication tuning knobs. The
//! message handler is supplied in code when the engine is constructed.

use crate::retry::RetryConfig;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Everything one slot session needs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SlotConfig {
    /// Stable identifier for this slot's state (status registry, catalog
    /// pool key, persisted sequence cursor).
    pub id: String,
    pub connection: ConnectionConfig,
    /// Publication whose tables are streamed.
    pub publication: String,
    /// Server-side replication slot name.
    pub slot_name: String,
    pub replication: ReplicationTuning,
}

/// Upstream connection parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub ssl_mode: SslMode,
    pub connect_timeout_secs: u64,
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// SSL/TLS mode for the upstream connection.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum SslMode {
    #[default]
    Disable,
    Prefer,
    Require,
}

impl std::str::FromStr for SslMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            _ => Err(format!(
                "Invalid SSL mode: {s}. Valid values: disable, prefer, require"
            )),
        }
    }
}

/// Replication behavior knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationTuning {
    /// Persistence retry attempts before the slot is surfaced unhealthy.
    pub persist_attempts: u32,
    /// Catalog lookup retry attempts.
    pub catalog_attempts: u32,
    /// Reconnect backoff floor, milliseconds.
    pub backoff_initial_ms: u64,
    /// Reconnect backoff cap, seconds.
    pub backoff_max_secs: u64,
}

impl Default for ReplicationTuning {
    fn default() -> Self {
        Self {
            persist_attempts: 5,
            catalog_attempts: 5,
            backoff_initial_ms: 1_000,
            backoff_max_secs: 60,
        }
    }
}

impl ReplicationTuning {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.persist_attempts,
            initial_delay: Duration::from_millis(self.backoff_initial_ms),
            max_delay: Duration::from_secs(self.backoff_max_secs),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl SlotConfig {
    /// Loads configuration from environment variables.
    ///
    /// Required: `RELAY_PG_DATABASE`, `RELAY_PG_USER`, `RELAY_PG_PASSWORD`.
    /// Everything else has defaults.
    pub fn from_env() -> crate::Result<Self> {
        let connection = ConnectionConfig {
            host: env::var("RELAY_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env::var("RELAY_PG_PORT")
                .unwrap_or_else(|_| "5432".to_string())
                .parse::<u16>()
                .map_err(|_| Error::Config("RELAY_PG_PORT must be a valid port number".to_string()))?,
            database: env::var("RELAY_PG_DATABASE")
                .map_err(|_| Error::Config("RELAY_PG_DATABASE is required".to_string()))?,
            user: env::var("RELAY_PG_USER")
                .map_err(|_| Error::Config("RELAY_PG_USER is required".to_string()))?,
            password: env::var("RELAY_PG_PASSWORD")
                .map_err(|_| Error::Config("RELAY_PG_PASSWORD is required".to_string()))?,
            ssl_mode: env::var("RELAY_PG_SSL_MODE")
                .unwrap_or_else(|_| "disable".to_string())
                .parse::<SslMode>()
                .map_err(Error::Config)?,
            connect_timeout_secs: env::var("RELAY_PG_CONNECT_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse::<u64>()
                .unwrap_or(30),
        };

        let replication = ReplicationTuning {
            persist_attempts: env::var("RELAY_PERSIST_ATTEMPTS")
                .unwrap_or_else(|_| "5".to_string())
                .parse::<u32>()
                .unwrap_or(5),
            catalog_attempts: env::var("RELAY_CATALOG_ATTEMPTS")
                .unwrap_or_else(|_| "5".to_string())
                .parse::<u32>()
                .unwrap_or(5),
            backoff_initial_ms: env::var("RELAY_BACKOFF_INITIAL_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse::<u64>()
                .unwrap_or(1_000),
            backoff_max_secs: env::var("RELAY_BACKOFF_MAX_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse::<u64>()
                .unwrap_or(60),
        };

        let slot_name = env::var("RELAY_SLOT_NAME").unwrap_or_else(|_| "pg_relay_slot".to_string());

        Ok(SlotConfig {
            id: env::var("RELAY_SLOT_ID").unwrap_or_else(|_| slot_name.clone()),
            connection,
            publication: env::var("RELAY_PUBLICATION").unwrap_or_else(|_| "pg_relay_pub".to_string()),
            slot_name,
            replication,
        })
    }
}
