use serde::{Deserialize, Deserializer};
use serde_json::Value;

use common::{Error, Result, Tick};

/// One routed event from the ingestion feed.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    Ticker(Tick),
    /// Order book update. Accepted, not processed.
    Depth(Value),
    /// Exchange trade lag report. Accepted, not processed.
    Lag(Value),
}

impl IngestEvent {
    /// Route a raw feed message by its `channel_name`.
    ///
    /// Only the configured `pair` is accepted on the ticker and depth channels.
    /// Anything else is `Error::MalformedEvent`; the caller drops the event and
    /// keeps consuming the stream.
    pub fn parse(pair: &str, text: &str) -> Result<Self> {
        let message: Value = serde_json::from_str(text)
            .map_err(|e| Error::MalformedEvent(format!("not JSON: {e}")))?;
        Self::from_value(pair, message)
    }

    /// Route an already decoded feed message.
    pub fn from_value(pair: &str, mut message: Value) -> Result<Self> {
        let channel = channel_name(&message)
            .ok_or_else(|| Error::MalformedEvent("missing channel_name".into()))?
            .to_string();

        match channel.split_once('.') {
            Some(("ticker", p)) if p == pair => {
                let raw = take_payload(&mut message, "ticker", &channel)?;
                Ok(IngestEvent::Ticker(normalize_ticker(raw)?))
            }
            Some(("depth", p)) if p == pair => Ok(IngestEvent::Depth(take_payload(
                &mut message,
                "depth",
                &channel,
            )?)),
            Some(("trade", "lag")) => Ok(IngestEvent::Lag(take_payload(
                &mut message,
                "lag",
                &channel,
            )?)),
            _ => Err(Error::MalformedEvent(format!("unknown channel '{channel}'"))),
        }
    }
}

/// The `channel_name` of a raw feed message, if it has one.
pub fn channel_name(message: &Value) -> Option<&str> {
    message.get("channel_name").and_then(Value::as_str)
}

fn take_payload(message: &mut Value, key: &str, channel: &str) -> Result<Value> {
    match message.get_mut(key).map(Value::take) {
        Some(Value::Null) | None => Err(Error::MalformedEvent(format!(
            "{channel} event has no '{key}' payload"
        ))),
        Some(payload) => Ok(payload),
    }
}

// ─── Exchange ticker JSON parsing ────────────────────────────────────────────

#[derive(Deserialize)]
struct RawTicker {
    avg: RawAmount,
    buy: RawAmount,
    high: RawAmount,
    last: RawAmount,
    low: RawAmount,
    sell: RawAmount,
    vol: RawAmount,
    vwap: RawAmount,
    #[serde(deserialize_with = "int_or_string")]
    now: i64,
}

#[derive(Deserialize)]
struct RawAmount {
    #[serde(deserialize_with = "int_or_string")]
    value_int: i64,
}

/// Parse one exchange ticker payload into a canonical `Tick`.
///
/// Every price field carries its integer-scaled `value_int`; `now` is the
/// exchange timestamp in microseconds.
pub fn normalize_ticker(raw: Value) -> Result<Tick> {
    let t: RawTicker = serde_json::from_value(raw)
        .map_err(|e| Error::MalformedEvent(format!("bad ticker payload: {e}")))?;

    if t.now < 0 {
        return Err(Error::MalformedEvent(format!("negative ticker time {}", t.now)));
    }

    Ok(Tick {
        avg: t.avg.value_int,
        buy: t.buy.value_int,
        high: t.high.value_int,
        last: t.last.value_int,
        low: t.low.value_int,
        sell: t.sell.value_int,
        vol: t.vol.value_int,
        vwap: t.vwap.value_int,
        time: t.now,
    })
}

fn int_or_string<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }

    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(v) => Ok(v),
        IntOrString::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn amount(v: i64) -> Value {
        json!({ "value": (v as f64 / 1e5).to_string(), "value_int": v.to_string(), "currency": "USD" })
    }

    fn ticker_message(channel: &str, now: &str) -> String {
        json!({
            "channel": "d5f06780-30a8-4a48-a2f8-7ed181b4a13f",
            "channel_name": channel,
            "op": "private",
            "origin": "broadcast",
            "private": "ticker",
            "ticker": {
                "avg": amount(12_000_000),
                "buy": amount(12_100_000),
                "high": amount(12_500_000),
                "last": amount(12_150_000),
                "low": amount(11_500_000),
                "sell": amount(12_200_000),
                "vol": { "value": "1000.5", "value_int": 100_050_000_000i64 },
                "vwap": amount(12_050_000),
                "item": "BTC",
                "now": now,
            }
        })
        .to_string()
    }

    #[test]
    fn ticker_event_is_normalized() {
        let text = ticker_message("ticker.BTCUSD", "1366230242125772");
        let event = IngestEvent::parse("BTCUSD", &text).unwrap();
        let IngestEvent::Ticker(tick) = event else {
            panic!("expected ticker, got {event:?}");
        };
        assert_eq!(tick.last, 12_150_000);
        assert_eq!(tick.avg, 12_000_000);
        assert_eq!(tick.high, 12_500_000);
        assert_eq!(tick.low, 11_500_000);
        assert_eq!(tick.vol, 100_050_000_000);
        assert_eq!(tick.time, 1_366_230_242_125_772);
    }

    #[test]
    fn numeric_timestamps_are_accepted() {
        let mut message: Value =
            serde_json::from_str(&ticker_message("ticker.BTCUSD", "0")).unwrap();
        message["ticker"]["now"] = json!(42);
        let event = IngestEvent::parse("BTCUSD", &message.to_string()).unwrap();
        assert!(matches!(event, IngestEvent::Ticker(Tick { time: 42, .. })));
    }

    #[test]
    fn other_pair_is_rejected() {
        let text = ticker_message("ticker.BTCEUR", "1");
        assert!(matches!(
            IngestEvent::parse("BTCUSD", &text),
            Err(Error::MalformedEvent(_))
        ));
    }

    #[test]
    fn depth_and_lag_are_accepted() {
        let depth = json!({ "channel_name": "depth.BTCUSD", "depth": { "price_int": "1" } });
        let lag = json!({ "channel_name": "trade.lag", "lag": { "age": 12 } });
        assert!(matches!(
            IngestEvent::parse("BTCUSD", &depth.to_string()),
            Ok(IngestEvent::Depth(_))
        ));
        assert!(matches!(
            IngestEvent::parse("BTCUSD", &lag.to_string()),
            Ok(IngestEvent::Lag(_))
        ));
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(IngestEvent::parse("BTCUSD", "not json").is_err());
        assert!(IngestEvent::parse("BTCUSD", r#"{"ticker":{}}"#).is_err());
        assert!(IngestEvent::parse("BTCUSD", r#"{"channel_name":"ticker.BTCUSD"}"#).is_err());

        let mut message: Value =
            serde_json::from_str(&ticker_message("ticker.BTCUSD", "1")).unwrap();
        message["ticker"]["last"]["value_int"] = json!("twelve");
        assert!(matches!(
            IngestEvent::parse("BTCUSD", &message.to_string()),
            Err(Error::MalformedEvent(_))
        ));
    }

    #[test]
    fn unknown_channel_is_rejected() {
        let text = json!({ "channel_name": "trade.BTC", "trade": {} }).to_string();
        assert!(matches!(
            IngestEvent::parse("BTCUSD", &text),
            Err(Error::MalformedEvent(_))
        ));
    }
}
