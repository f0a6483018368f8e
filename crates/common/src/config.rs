use crate::{Error, Result};

const DEFAULT_INTERVALS: &[u32] = &[60, 300, 900, 3600];

/// All configuration loaded from environment variables at startup.
/// Missing required variables are reported with the variable name.
#[derive(Debug, Clone)]
pub struct Config {
    // Ingestion
    pub feed_url: String,
    /// Trading pair whose ticker channel is processed, e.g. "BTCUSD".
    pub trading_pair: String,

    // Aggregation
    /// Candlestick lengths in seconds, one aggregator each.
    pub candle_intervals: Vec<u32>,
    pub aggregation_timer_secs: u64,

    // Database
    pub database_url: String,

    // Bot config file path
    pub bot_config_path: String,
}

impl Config {
    /// Load all configuration from environment variables.
    /// Loads `.env` if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let candle_intervals = match optional_env("CANDLE_INTERVALS") {
            Some(raw) => parse_intervals(&raw)?,
            None => DEFAULT_INTERVALS.to_vec(),
        };

        let aggregation_timer_secs = match optional_env("AGGREGATION_TIMER_SECS") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                Error::Config(format!("AGGREGATION_TIMER_SECS is not a number: '{raw}'"))
            })?,
            None => 15,
        };

        Ok(Config {
            feed_url: required_env("FEED_URL")?,
            trading_pair: optional_env("TRADING_PAIR")
                .map(|p| p.trim().to_uppercase())
                .unwrap_or_else(|| "BTCUSD".to_string()),
            candle_intervals,
            aggregation_timer_secs,
            database_url: required_env("DATABASE_URL")?,
            bot_config_path: optional_env("BOT_CONFIG_PATH")
                .unwrap_or_else(|| "config/bots.toml".to_string()),
        })
    }
}

/// Parse a comma-separated list of interval lengths in seconds.
pub fn parse_intervals(raw: &str) -> Result<Vec<u32>> {
    let mut intervals = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let secs: u32 = part.parse().map_err(|_| {
            Error::Config(format!("CANDLE_INTERVALS contains non-numeric value: '{part}'"))
        })?;
        if secs == 0 {
            return Err(Error::Config("CANDLE_INTERVALS must not contain 0".into()));
        }
        if !intervals.contains(&secs) {
            intervals.push(secs);
        }
    }
    if intervals.is_empty() {
        return Err(Error::Config("CANDLE_INTERVALS is empty".into()));
    }
    Ok(intervals)
}

fn required_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| {
        Error::Config(format!(
            "Required environment variable '{key}' is not set. Check your .env file."
        ))
    })
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}
