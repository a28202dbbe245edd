//! Configuration module for discount-ledger-service.

use chrono::Duration;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub reconciliation: ReconciliationSettings,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Tunables for the lock/session lifecycle. The defaults mirror what the
/// payout operators run in production: a period lock is held for at most two
/// hours, and a run that stops heartbeating for half an hour is considered
/// abandoned.
#[derive(Debug, Clone)]
pub struct ReconciliationSettings {
    pub lock_ttl_minutes: i64,
    pub session_stale_minutes: i64,
}

impl ReconciliationSettings {
    pub fn lock_ttl(&self) -> Duration {
        Duration::minutes(self.lock_ttl_minutes)
    }

    pub fn session_staleness(&self) -> Duration {
        Duration::minutes(self.session_stale_minutes)
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "discount-ledger-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            reconciliation: ReconciliationSettings {
                lock_ttl_minutes: env::var("LOCK_TTL_MINUTES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(120),
                session_stale_minutes: env::var("SESSION_STALE_MINUTES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            },
        })
    }
}
