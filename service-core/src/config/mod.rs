use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// Read an environment variable, falling back to `default` when it is unset.
///
/// A value that is present but does not parse is a configuration error rather than
/// a silent fallback.
pub fn env_or<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value {:?}: {}", key, raw, e))
        }),
        Err(_) => Ok(default),
    }
}

/// Read a required environment variable.
pub fn env_required(key: &str) -> Result<String, AppError> {
    std::env::var(key).map_err(|_| AppError::ConfigError(anyhow::anyhow!("{} is required", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_uses_default_when_unset() {
        let value: u64 = env_or("SERVICE_CORE_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn env_required_reports_missing_key() {
        let err = env_required("SERVICE_CORE_TEST_MISSING_VARIABLE").unwrap_err();
        assert!(err.to_string().contains("SERVICE_CORE_TEST_MISSING_VARIABLE"));
    }
}
