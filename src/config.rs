//! Engine configuration.

use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Runtime configuration for the trading engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite connection string
    pub database_url: String,

    /// Leverage applied to every token before evaluation
    pub leverage: u32,

    /// Stoploss placement attempts before the order is left unprotected
    pub max_retry: u32,

    /// Delay between stoploss placement attempts (milliseconds)
    pub retry_delay_ms: u64,

    /// Attempts per user when writing a settlement
    pub settlement_max_retry: u32,

    /// Price/order-status polling interval (seconds)
    pub poll_interval_secs: u64,

    /// Upper bound on tokens evaluated concurrently in the daily batch
    pub max_concurrent_tokens: usize,

    /// Simulate fills instead of trading
    pub dry_run: bool,

    /// Exchange REST endpoint
    pub exchange_base_url: String,

    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    #[serde(skip_serializing)]
    pub api_secret: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./pool_trader.db?mode=rwc".to_string(),
            leverage: 1,
            max_retry: 3,
            retry_delay_ms: 500,
            settlement_max_retry: 3,
            poll_interval_secs: 5,
            max_concurrent_tokens: 4,
            dry_run: true,
            exchange_base_url: "https://fapi.binance.com".to_string(),
            api_key: None,
            api_secret: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by environment variables (`.env` is honoured).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Ok(url) = env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(v) = parse_var("ENGINE_LEVERAGE")? {
            config.leverage = v;
        }
        if let Some(v) = parse_var("ENGINE_MAX_RETRY")? {
            config.max_retry = v;
        }
        if let Some(v) = parse_var("ENGINE_RETRY_DELAY_MS")? {
            config.retry_delay_ms = v;
        }
        if let Some(v) = parse_var("ENGINE_SETTLEMENT_MAX_RETRY")? {
            config.settlement_max_retry = v;
        }
        if let Some(v) = parse_var("ENGINE_POLL_INTERVAL_SECS")? {
            config.poll_interval_secs = v;
        }
        if let Some(v) = parse_var("ENGINE_MAX_CONCURRENT_TOKENS")? {
            config.max_concurrent_tokens = v;
        }
        if let Some(v) = parse_var("ENGINE_DRY_RUN")? {
            config.dry_run = v;
        }
        if let Ok(url) = env::var("EXCHANGE_BASE_URL") {
            config.exchange_base_url = url;
        }
        config.api_key = env::var("EXCHANGE_API_KEY").ok();
        config.api_secret = env::var("EXCHANGE_API_SECRET").ok();

        // zero would mean "never place a stoploss"
        config.max_retry = config.max_retry.max(1);
        config.settlement_max_retry = config.settlement_max_retry.max(1);
        config.max_concurrent_tokens = config.max_concurrent_tokens.max(1);

        Ok(config)
    }

    /// Whether credentials for live trading are present.
    pub fn has_credentials(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
            && self.api_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {:?}", name, raw)),
        Err(_) => Ok(None),
    }
}
