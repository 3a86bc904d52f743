use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub event_buffer_size: usize,
    pub sample_buffer_size: usize,
    /// Live locations older than this are evicted; `None` disables eviction.
    pub stale_after: Option<Duration>,
    pub eviction_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let stale_after_secs: u64 = parse_or_default("STALE_AFTER_SECS", 300)?;
        let eviction_interval_secs: u64 = parse_or_default("EVICTION_INTERVAL_SECS", 30)?;
        if eviction_interval_secs == 0 {
            return Err(AppError::Internal(
                "invalid EVICTION_INTERVAL_SECS: must be > 0".to_string(),
            ));
        }

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            sample_buffer_size: parse_or_default("SAMPLE_BUFFER_SIZE", 64)?,
            stale_after: (stale_after_secs > 0).then(|| Duration::from_secs(stale_after_secs)),
            eviction_interval: Duration::from_secs(eviction_interval_secs),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            event_buffer_size: 1024,
            sample_buffer_size: 64,
            stale_after: Some(Duration::from_secs(300)),
            eviction_interval: Duration::from_secs(30),
        }
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
