// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node configuration loaded from environment variables.
//!
//! Keys are the UPPER_SNAKE form of the dotted configuration keys, e.g.
//! `scheduler.lookupIntervalMilliseconds` becomes
//! `STEEP_SCHEDULER_LOOKUP_INTERVAL_MS`.

use std::collections::BTreeSet;
use std::time::Duration;

use thiserror::Error;

/// Which registry backend a node uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbDriver {
    /// In-memory registry (single node, tests).
    InMemory,
    /// PostgreSQL registry.
    PostgreSql,
    /// Document store. Recognized in configuration, not shipped in this
    /// build; selecting it fails at startup.
    MongoDb,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable holds a value that cannot be parsed.
    #[error("Invalid value '{value}' for {key}")]
    InvalidValue {
        /// The environment variable.
        key: &'static str,
        /// The offending value.
        value: String,
    },

    /// A required variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
}

/// Node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for temporary files.
    pub tmp_path: String,
    /// Directory under which process chain outputs are allocated.
    pub out_path: String,

    /// Scheduler poll interval.
    pub scheduler_lookup_interval: Duration,
    /// Controller poll interval.
    pub controller_lookup_interval: Duration,
    /// Orphan scan interval.
    pub controller_lookup_orphans_interval: Duration,

    /// Whether this node hosts an agent.
    pub agent_enabled: bool,
    /// Agent id; defaults to a random id per start.
    pub agent_id: String,
    /// Capabilities the agent advertises (comma-separated in the
    /// environment).
    pub agent_capabilities: BTreeSet<String>,
    /// Agent lease expiry when no chain arrives after allocation.
    pub agent_busy_timeout: Duration,
    /// Agent lease expiry after each completed chain.
    pub agent_idle_timeout: Duration,
    /// Output lines captured per executable.
    pub agent_output_lines_to_collect: usize,

    /// Registry backend.
    pub db_driver: DbDriver,
    /// Database connection string (required for non-inmemory drivers).
    pub db_url: Option<String>,
    /// Database username, merged into the connection when set.
    pub db_username: Option<String>,
    /// Database password, merged into the connection when set.
    pub db_password: Option<String>,

    /// Path to the service catalog (JSON list of services).
    pub services_path: Option<String>,
}

fn duration_ms(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(Duration::from_millis(default)),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let tmp_path =
            std::env::var("STEEP_TMP_PATH").unwrap_or_else(|_| "/tmp/steep".to_string());
        let out_path =
            std::env::var("STEEP_OUT_PATH").unwrap_or_else(|_| format!("{tmp_path}/out"));

        let scheduler_lookup_interval =
            duration_ms("STEEP_SCHEDULER_LOOKUP_INTERVAL_MS", 20_000)?;
        let controller_lookup_interval =
            duration_ms("STEEP_CONTROLLER_LOOKUP_INTERVAL_MS", 2_000)?;
        let controller_lookup_orphans_interval =
            duration_ms("STEEP_CONTROLLER_LOOKUP_ORPHANS_INTERVAL_MS", 300_000)?;

        let agent_enabled = match std::env::var("STEEP_AGENT_ENABLED") {
            Ok(value) => matches!(value.as_str(), "true" | "1" | "yes"),
            Err(_) => true,
        };
        let agent_id = std::env::var("STEEP_AGENT_ID")
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
        let agent_capabilities = std::env::var("STEEP_AGENT_CAPABILITIES")
            .unwrap_or_default()
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        let agent_busy_timeout = duration_ms("STEEP_AGENT_BUSY_TIMEOUT_MS", 60_000)?;
        let agent_idle_timeout = duration_ms("STEEP_AGENT_IDLE_TIMEOUT_MS", 60_000)?;
        let agent_output_lines_to_collect =
            match std::env::var("STEEP_AGENT_OUTPUT_LINES_TO_COLLECT") {
                Ok(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "STEEP_AGENT_OUTPUT_LINES_TO_COLLECT",
                    value,
                })?,
                Err(_) => 100,
            };

        let db_driver = match std::env::var("STEEP_DB_DRIVER") {
            Ok(value) => match value.as_str() {
                "inmemory" => DbDriver::InMemory,
                "postgresql" => DbDriver::PostgreSql,
                "mongodb" => DbDriver::MongoDb,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "STEEP_DB_DRIVER",
                        value,
                    })
                }
            },
            Err(_) => DbDriver::InMemory,
        };
        let db_url = std::env::var("STEEP_DB_URL").ok();
        if db_driver != DbDriver::InMemory && db_url.is_none() {
            return Err(ConfigError::MissingEnvVar("STEEP_DB_URL"));
        }

        Ok(Self {
            tmp_path,
            out_path,
            scheduler_lookup_interval,
            controller_lookup_interval,
            controller_lookup_orphans_interval,
            agent_enabled,
            agent_id,
            agent_capabilities,
            agent_busy_timeout,
            agent_idle_timeout,
            agent_output_lines_to_collect,
            db_driver,
            db_url,
            db_username: std::env::var("STEEP_DB_USERNAME").ok(),
            db_password: std::env::var("STEEP_DB_PASSWORD").ok(),
            services_path: std::env::var("STEEP_SERVICES_PATH").ok(),
        })
    }
}
