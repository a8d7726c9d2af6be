use std::time::Duration;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub accrual_address: String,
    pub poll_interval: Duration,
    pub default_pause: Duration,
    pub jwt_secret: String,
    pub jwt_ttl: Duration,
    pub shutdown_timeout: Duration,
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| AppError::Config("DATABASE_URL must be set".to_string()))?,
            bind_address: std::env::var("RUN_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            accrual_address: std::env::var("ACCRUAL_SYSTEM_ADDRESS")
                .unwrap_or_else(|_| "http://localhost:8081".to_string()),
            poll_interval: Duration::from_secs(env_u64("ACCRUAL_POLL_INTERVAL_SECS", 2)?),
            default_pause: Duration::from_secs(env_u64("ACCRUAL_DEFAULT_PAUSE_SECS", 60)?),
            jwt_secret: std::env::var("JWT_SECRET")
                .unwrap_or_else(|_| "loyalty-dev-secret".to_string()),
            jwt_ttl: Duration::from_secs(env_u64("JWT_TTL_HOURS", 24)? * 3600),
            shutdown_timeout: Duration::from_secs(env_u64("SHUTDOWN_TIMEOUT_SECS", 10)?),
        })
    }
}

fn env_u64(name: &str, default: u64) -> AppResult<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map_err(|_| AppError::Config(format!("{} must be an integer, got {:?}", name, raw))),
        Err(_) => Ok(default),
    }
}
