use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tick and candlestick timestamps are microseconds since the Unix epoch.
pub const MICROS_PER_SEC: i64 = 1_000_000;

/// Length of a candlestick bucket in microseconds.
pub fn interval_micros(interval_secs: u32) -> i64 {
    i64::from(interval_secs) * MICROS_PER_SEC
}

fn micros_to_datetime(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// One normalized ticker snapshot.
///
/// Prices and volumes are the exchange's integer-scaled values. A tick is
/// never mutated once produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub avg: i64,
    pub buy: i64,
    pub high: i64,
    pub last: i64,
    pub low: i64,
    pub sell: i64,
    pub vol: i64,
    pub vwap: i64,
    /// Exchange timestamp in microseconds.
    pub time: i64,
}

impl Tick {
    pub fn timestamp(&self) -> DateTime<Utc> {
        micros_to_datetime(self.time)
    }
}

/// OHLCV summary of the ticks inside one `[time, time + interval)` bucket.
///
/// `(interval, time)` is the identity key: writing the same key twice
/// replaces the earlier record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candlestick {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub avg: f64,
    pub vol: f64,
    /// Bucket start in microseconds.
    pub time: i64,
    /// Bucket length in seconds.
    pub interval: u32,
}

impl Candlestick {
    /// Exclusive end of the bucket in microseconds.
    pub fn end(&self) -> i64 {
        self.time + interval_micros(self.interval)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        micros_to_datetime(self.time)
    }
}

/// Durable aggregation watermark for one interval.
///
/// Every tick earlier than `last_processed_time` has been folded into the
/// candlestick of its bucket. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingCursor {
    pub interval: u32,
    pub last_processed_time: i64,
}

impl ProcessingCursor {
    pub fn new(interval: u32, last_processed_time: i64) -> Self {
        Self {
            interval,
            last_processed_time,
        }
    }
}

/// Which asset a bot is currently committed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    #[default]
    Flat,
    Long,
    Short,
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Position::Flat => write!(f, "flat"),
            Position::Long => write!(f, "long"),
            Position::Short => write!(f, "short"),
        }
    }
}

impl std::str::FromStr for Position {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flat" => Ok(Position::Flat),
            "long" => Ok(Position::Long),
            "short" => Ok(Position::Short),
            other => Err(crate::Error::Store(format!("unknown position '{other}'"))),
        }
    }
}

/// Side of a simulated trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "BUY"),
            TradeSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Simulated balance of one named bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotAccount {
    pub name: String,
    pub start_usd: i64,
    pub start_btc: i64,
    pub start_time: DateTime<Utc>,
    pub current_usd: i64,
    pub current_btc: i64,
    pub position: Position,
}

impl BotAccount {
    /// A fresh account holding its starting balances, not yet in a position.
    pub fn new(name: &str, usd: i64, btc: i64, start_time: DateTime<Utc>) -> Self {
        Self {
            name: Self::normalize_name(name),
            start_usd: usd,
            start_btc: btc,
            start_time,
            current_usd: usd,
            current_btc: btc,
            position: Position::Flat,
        }
    }

    /// Account keys are lowercase ASCII letters only.
    pub fn normalize_name(raw: &str) -> String {
        raw.chars()
            .filter(|c| c.is_ascii_alphabetic())
            .map(|c| c.to_ascii_lowercase())
            .collect()
    }

    /// Restore the starting balances and restart the clock.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.current_usd = self.start_usd;
        self.current_btc = self.start_btc;
        self.start_time = now;
        self.position = Position::Flat;
    }
}

/// Record of one executed simulated trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub bot: String,
    pub side: TradeSide,
    /// Asset units bought or sold.
    pub units: i64,
    pub price: f64,
    pub usd_after: i64,
    pub btc_after: i64,
    pub position_after: Position,
    pub timestamp: DateTime<Utc>,
}

/// Emitted by an aggregator after a pass that wrote at least one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleEvent {
    pub interval: u32,
    /// Number of candlesticks written in the pass.
    pub buckets: usize,
    /// Cursor position after the pass.
    pub through: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn bot_names_keep_only_lowercase_letters() {
        assert_eq!(BotAccount::normalize_name("Ichimoku-Bot 2"), "ichimokubot");
        assert_eq!(BotAccount::normalize_name("123"), "");
    }

    #[test]
    fn reset_restores_starting_balances() {
        let start = Utc.timestamp_opt(1_000, 0).unwrap();
        let mut account = BotAccount::new("alpha", 1_000, 5, start);
        account.current_usd = 0;
        account.current_btc = 12;
        account.position = Position::Long;

        let later = Utc.timestamp_opt(2_000, 0).unwrap();
        account.reset(later);

        assert_eq!(account.current_usd, 1_000);
        assert_eq!(account.current_btc, 5);
        assert_eq!(account.position, Position::Flat);
        assert_eq!(account.start_time, later);
    }

    #[test]
    fn candlestick_end_is_exclusive_bucket_bound() {
        let candle = Candlestick {
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            avg: 1.0,
            vol: 1.0,
            time: 120_000_000,
            interval: 60,
        };
        assert_eq!(candle.end(), 180_000_000);
    }

    #[test]
    fn position_round_trips_through_text() {
        for p in [Position::Flat, Position::Long, Position::Short] {
            assert_eq!(p.to_string().parse::<Position>().unwrap(), p);
        }
    }
}
