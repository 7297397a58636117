use dotenvy::dotenv;
use reqwest::Url;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::Level;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub settings_api_url: String,
    pub store_api_url: String,

    pub refresh_interval_secs: u64,
    pub http_timeout_ms: u64,

    pub mqtt_keep_alive_secs: u64,
    pub mqtt_retry_interval_ms: u64,
    pub mqtt_channel_capacity: usize,

    pub prune_stale_devices: bool,
    pub dedup_retention_secs: u64,

    pub log_level: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_retry_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RETRY_INTERVAL_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.http_timeout_ms) {
            return Err(ConfigError::ParsingError(format!(
                "HTTP_TIMEOUT_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }

        if !(1..=86_400).contains(&self.refresh_interval_secs) {
            return Err(ConfigError::ParsingError(
                "SETTINGS_REFRESH_INTERVAL_SECS must be between 1 and 86400".to_string(),
            ));
        }

        // rumqttc rejects keep-alives below five seconds
        if self.mqtt_keep_alive_secs < 5 {
            return Err(ConfigError::ParsingError(
                "MQTT_KEEP_ALIVE_SECS must be at least 5".to_string(),
            ));
        }

        if self.mqtt_channel_capacity == 0 {
            return Err(ConfigError::ParsingError(
                "MQTT_CHANNEL_CAPACITY must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required_url = |key: &str| -> Result<String, ConfigError> {
            let raw = lookup(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingOrInvalid(key.to_string()))?;
            let url = Url::parse(raw.trim())
                .map_err(|e| ConfigError::ParsingError(format!("{} is not a valid URL: {}", key, e)))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(ConfigError::ParsingError(format!(
                    "{} must use http or https",
                    key
                )));
            }
            Ok(url.to_string())
        };

        let config = Self {
            settings_api_url: required_url("MQTT_SETTINGS_API")?,
            store_api_url: required_url("MQTT_STORE_API")?,

            refresh_interval_secs: parse_or(&lookup, "SETTINGS_REFRESH_INTERVAL_SECS", 60)?,
            http_timeout_ms: parse_or(&lookup, "HTTP_TIMEOUT_MS", 10_000)?,

            mqtt_keep_alive_secs: parse_or(&lookup, "MQTT_KEEP_ALIVE_SECS", 10)?,
            mqtt_retry_interval_ms: parse_or(&lookup, "MQTT_RETRY_INTERVAL_MS", 5000)?,
            mqtt_channel_capacity: parse_or(&lookup, "MQTT_CHANNEL_CAPACITY", 10)?,

            prune_stale_devices: parse_or(&lookup, "PRUNE_STALE_DEVICES", true)?,
            dedup_retention_secs: parse_or(&lookup, "DEDUP_RETENTION_SECS", 86_400)?,

            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        };

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;
        config.tracing_level()?;

        Ok(config)
    }

    pub fn tracing_level(&self) -> Result<Level, ConfigError> {
        Level::from_str(self.log_level.trim()).map_err(|_| {
            ConfigError::ParsingError(format!("LOG_LEVEL '{}' is not a tracing level", self.log_level))
        })
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    /// `None` when eviction is disabled.
    pub fn dedup_retention(&self) -> Option<Duration> {
        (self.dedup_retention_secs > 0).then(|| Duration::from_secs(self.dedup_retention_secs))
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::ParsingError(format!("{} has an invalid value '{}'", key, raw))),
        _ => Ok(default),
    }
}
