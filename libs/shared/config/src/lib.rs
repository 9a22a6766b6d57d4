use std::env;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_PUSH_API_URL: &str = "https://exp.host/--/api/v2/push/send";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub auth_jwt_secret: String,
    pub redis_url: Option<String>,
    pub push_api_url: String,
    pub push_access_token: Option<String>,
    pub payment_webhook_secret: String,
    pub payment_simulation_enabled: bool,
    pub refund_webhook_secret: String,
    pub server_port: u16,
    pub lifecycle: LifecycleSettings,
}

/// Tuning knobs for the service request lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleSettings {
    pub start_code_length: usize,
    pub completion_code_length: usize,
    pub verification_timeout_minutes: i64,
    pub verification_sweep_interval_secs: u64,
    pub completion_max_attempts: u32,
    pub completion_backoff_ms: u64,
    pub max_write_attempts: u32,
    pub feed_channel_capacity: usize,
    pub event_bus_capacity: usize,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            start_code_length: 5,
            completion_code_length: 6,
            verification_timeout_minutes: 30,
            verification_sweep_interval_secs: 60,
            completion_max_attempts: 5,
            completion_backoff_ms: 200,
            max_write_attempts: 3,
            feed_channel_capacity: 128,
            event_bus_capacity: 256,
        }
    }
}

impl LifecycleSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            start_code_length: parse_or("START_CODE_LENGTH", defaults.start_code_length),
            completion_code_length: parse_or("COMPLETION_CODE_LENGTH", defaults.completion_code_length),
            verification_timeout_minutes: parse_or(
                "VERIFICATION_TIMEOUT_MINUTES",
                defaults.verification_timeout_minutes,
            ),
            verification_sweep_interval_secs: parse_or(
                "VERIFICATION_SWEEP_INTERVAL_SECS",
                defaults.verification_sweep_interval_secs,
            ),
            completion_max_attempts: parse_or("COMPLETION_MAX_ATTEMPTS", defaults.completion_max_attempts),
            completion_backoff_ms: parse_or("COMPLETION_BACKOFF_MS", defaults.completion_backoff_ms),
            max_write_attempts: parse_or("MAX_WRITE_ATTEMPTS", defaults.max_write_attempts),
            feed_channel_capacity: parse_or("FEED_CHANNEL_CAPACITY", defaults.feed_channel_capacity),
            event_bus_capacity: parse_or("EVENT_BUS_CAPACITY", defaults.event_bus_capacity),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            auth_jwt_secret: env::var("AUTH_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("AUTH_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            push_api_url: env::var("PUSH_API_URL")
                .unwrap_or_else(|_| {
                    warn!("PUSH_API_URL not set, using default");
                    DEFAULT_PUSH_API_URL.to_string()
                }),
            push_access_token: env::var("PUSH_ACCESS_TOKEN").ok().filter(|t| !t.is_empty()),
            payment_webhook_secret: env::var("PAYMENT_WEBHOOK_SECRET")
                .unwrap_or_else(|_| {
                    warn!("PAYMENT_WEBHOOK_SECRET not set, using empty value");
                    String::new()
                }),
            payment_simulation_enabled: parse_or("PAYMENT_SIMULATION_ENABLED", false),
            refund_webhook_secret: env::var("REFUND_WEBHOOK_SECRET")
                .unwrap_or_else(|_| {
                    warn!("REFUND_WEBHOOK_SECRET not set, using empty value");
                    String::new()
                }),
            server_port: parse_or("SERVER_PORT", 3000),
            lifecycle: LifecycleSettings::from_env(),
        };

        if config.redis_url.is_none() {
            warn!("REDIS_URL not set, falling back to in-memory stores");
        }

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.auth_jwt_secret.is_empty()
            && !self.payment_webhook_secret.is_empty()
            && !self.refund_webhook_secret.is_empty()
    }

    pub fn uses_redis(&self) -> bool {
        self.redis_url.is_some()
    }
}

fn parse_or<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has invalid value {:?}, using default {:?}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}
