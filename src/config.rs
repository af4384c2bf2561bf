use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use thiserror::Error;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_retry_interval_ms: u64,

    pub http_port: u16,
    pub db_path: String,

    pub write_buffer_size: usize,
    pub write_drain_timeout_ms: u64,
    pub observer_queue_size: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Validate retry and buffer sizing against sane operational bounds.
    fn validate_limits(&self) -> Result<(), ConfigError> {
        const MIN_RETRY_MS: u64 = 100;
        const MAX_RETRY_MS: u64 = 1_000_000;
        const MAX_BUFFER: usize = 100_000;

        if !(MIN_RETRY_MS..=MAX_RETRY_MS).contains(&self.mqtt_retry_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RETRY_INTERVAL_MS must be between {} and {} ms",
                MIN_RETRY_MS, MAX_RETRY_MS
            )));
        }
        if !(1..=MAX_BUFFER).contains(&self.write_buffer_size) {
            return Err(ConfigError::ParsingError(format!(
                "WRITE_BUFFER_SIZE must be between 1 and {}",
                MAX_BUFFER
            )));
        }
        if !(1..=MAX_BUFFER).contains(&self.observer_queue_size) {
            return Err(ConfigError::ParsingError(format!(
                "OBSERVER_QUEUE_SIZE must be between 1 and {}",
                MAX_BUFFER
            )));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        let config = Self {
            mqtt_host: env::var("MQTT_HOST")
                .map_err(|_| ConfigError::MissingOrInvalid("MQTT_HOST".to_string()))?,
            mqtt_port: env::var("MQTT_PORT")
                .map_err(|_| ConfigError::MissingOrInvalid("MQTT_PORT".to_string()))?
                .parse::<u16>()
                .map_err(|_| {
                    ConfigError::ParsingError("MQTT_PORT must be a valid number".to_string())
                })?,
            mqtt_username: env::var("MQTT_USERNAME").unwrap_or_default(), // Default to empty
            mqtt_password: env::var("MQTT_PASSWORD").unwrap_or_default(), // Default to empty
            mqtt_retry_interval_ms: env::var("MQTT_RETRY_INTERVAL_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse::<u64>()
                .map_err(|_| {
                    ConfigError::ParsingError(
                        "MQTT_RETRY_INTERVAL_MS must be a valid number".to_string(),
                    )
                })?,

            http_port: env::var("HTTP_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| {
                    ConfigError::ParsingError("HTTP_PORT must be a valid number".to_string())
                })?,
            db_path: env::var("DB_PATH").unwrap_or_else(|_| "aquaflux.db".to_string()),

            write_buffer_size: env::var("WRITE_BUFFER_SIZE")
                .unwrap_or_else(|_| "256".to_string())
                .parse::<usize>()
                .map_err(|_| {
                    ConfigError::ParsingError("WRITE_BUFFER_SIZE must be an integer".to_string())
                })?,
            write_drain_timeout_ms: env::var("WRITE_DRAIN_TIMEOUT_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse::<u64>()
                .map_err(|_| {
                    ConfigError::ParsingError(
                        "WRITE_DRAIN_TIMEOUT_MS must be a valid number".to_string(),
                    )
                })?,
            observer_queue_size: env::var("OBSERVER_QUEUE_SIZE")
                .unwrap_or_else(|_| "64".to_string())
                .parse::<usize>()
                .map_err(|_| {
                    ConfigError::ParsingError("OBSERVER_QUEUE_SIZE must be an integer".to_string())
                })?,
        };

        config.validate_limits()?;

        Ok(config)
    }
}
