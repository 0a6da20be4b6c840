//! Configuration module for subscription-service.

use service_core::config::{self as core_config, env_or, env_required};
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub store: StoreBackend,
    pub database: Option<DatabaseConfig>,
    pub order_service: UpstreamConfig,
    pub telco_service: UpstreamConfig,
    pub scheduler: SchedulerConfig,
    pub orders: OrderDispatchConfig,
}

/// Where subscription state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("expected postgres or memory, got {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick: Duration,
    pub generator_batch_size: i64,
    pub transition_batch_size: i64,
    pub history_batch_size: i64,
    pub history_tracking_interval: Duration,
    pub history_drift: Duration,
}

impl SchedulerConfig {
    /// Minimum spacing between two history snapshots of one subscription.
    pub fn history_window(&self) -> Duration {
        self.history_tracking_interval
            .saturating_sub(self.history_drift)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick: Duration::from_secs(10),
            generator_batch_size: 1,
            transition_batch_size: 4,
            history_batch_size: 10,
            history_tracking_interval: Duration::from_secs(3600),
            history_drift: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderDispatchConfig {
    pub queue_size: usize,
    pub retry_max_elapsed: Duration,
}

impl Default for OrderDispatchConfig {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            retry_max_elapsed: Duration::from_secs(60),
        }
    }
}

impl SubscriptionConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let store: StoreBackend = env_or("STORE_BACKEND", StoreBackend::Postgres)?;
        let database = match store {
            StoreBackend::Postgres => Some(DatabaseConfig {
                url: env_required("DATABASE_URL")?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2)?,
            }),
            StoreBackend::Memory => None,
        };

        let timeout = Duration::from_secs(env_or("UPSTREAM_TIMEOUT_SECS", 10)?);
        let defaults = SchedulerConfig::default();
        let order_defaults = OrderDispatchConfig::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "subscription-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            store,
            database,
            order_service: UpstreamConfig {
                url: env::var("ORDER_SERVICE_URL")
                    .unwrap_or_else(|_| "http://order-service:3001".to_string()),
                timeout,
            },
            telco_service: UpstreamConfig {
                url: env::var("TELCO_SERVICE_URL")
                    .unwrap_or_else(|_| "http://telco-gateway:3001".to_string()),
                timeout,
            },
            scheduler: SchedulerConfig {
                enabled: env_or("SCHEDULER_ENABLED", defaults.enabled)?,
                tick: Duration::from_secs(env_or("SCHEDULER_TICK_SECS", 10)?),
                generator_batch_size: env_or("GENERATOR_BATCH_SIZE", defaults.generator_batch_size)?,
                transition_batch_size: env_or(
                    "TRANSITION_BATCH_SIZE",
                    defaults.transition_batch_size,
                )?,
                history_batch_size: env_or("HISTORY_BATCH_SIZE", defaults.history_batch_size)?,
                history_tracking_interval: Duration::from_secs(env_or(
                    "HISTORY_TRACKING_INTERVAL_SECS",
                    3600,
                )?),
                history_drift: Duration::from_secs(env_or("HISTORY_DRIFT_SECS", 30)?),
            },
            orders: OrderDispatchConfig {
                queue_size: env_or("ORDER_QUEUE_SIZE", order_defaults.queue_size)?,
                retry_max_elapsed: Duration::from_secs(env_or(
                    "ORDER_RETRY_MAX_ELAPSED_SECS",
                    60,
                )?),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_window_subtracts_drift() {
        let scheduler = SchedulerConfig::default();
        assert_eq!(scheduler.history_window(), Duration::from_secs(3570));
    }

    #[test]
    fn history_window_never_underflows() {
        let scheduler = SchedulerConfig {
            history_tracking_interval: Duration::from_secs(10),
            history_drift: Duration::from_secs(30),
            ..Default::default()
        };
        assert_eq!(scheduler.history_window(), Duration::ZERO);
    }

    #[test]
    fn store_backend_parses_case_insensitively() {
        assert_eq!("Memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert!("redis".parse::<StoreBackend>().is_err());
    }
}
