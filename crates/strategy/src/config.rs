use serde::{Deserialize, Serialize};

use common::{BotAccount, Error, Result};

use crate::indicators::{IchimokuParams, SarParams};

/// Top-level bot config file (TOML).
///
/// Example `config/bots.toml`:
/// ```toml
/// [[bot]]
/// name = "kumo"
/// usd_init = 100000000
/// btc_init = 0
/// interval = 300
///
/// # optional tuning
/// open_threshold_pct = 0.5
/// close_threshold_pct = 0.25
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BotFileConfig {
    #[serde(rename = "bot", default)]
    pub bots: Vec<BotConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BotConfig {
    /// Account key; normalized to lowercase letters.
    pub name: String,
    /// Starting cash, integer-scaled.
    pub usd_init: i64,
    /// Starting asset units.
    pub btc_init: i64,
    /// Candlestick interval the bot trades on, in seconds.
    pub interval: u32,
    /// Minimum tenkan/kijun divergence, in percent, to open a position.
    #[serde(default = "default_open_threshold")]
    pub open_threshold_pct: f64,
    /// Minimum tenkan/kijun divergence, in percent, to close a position.
    #[serde(default = "default_close_threshold")]
    pub close_threshold_pct: f64,
    /// Candlesticks kept for the SAR.
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_tenkan")]
    pub tenkan: usize,
    #[serde(default = "default_kijun")]
    pub kijun: usize,
    #[serde(default = "default_senkou")]
    pub senkou: usize,
    #[serde(default = "default_sar_acceleration")]
    pub sar_acceleration: f64,
    #[serde(default = "default_sar_maximum")]
    pub sar_maximum: f64,
    /// Degree of the price trend fitted over the window.
    #[serde(default = "default_trend_degree")]
    pub trend_degree: usize,
}

fn default_open_threshold() -> f64 {
    0.5
}
fn default_close_threshold() -> f64 {
    0.25
}
fn default_window() -> usize {
    25
}
fn default_tenkan() -> usize {
    9
}
fn default_kijun() -> usize {
    26
}
fn default_senkou() -> usize {
    52
}
fn default_sar_acceleration() -> f64 {
    0.02
}
fn default_sar_maximum() -> f64 {
    0.20
}
fn default_trend_degree() -> usize {
    2
}

impl BotConfig {
    /// A config with every tuning knob at its default.
    pub fn new(name: impl Into<String>, usd_init: i64, btc_init: i64, interval: u32) -> Self {
        Self {
            name: name.into(),
            usd_init,
            btc_init,
            interval,
            open_threshold_pct: default_open_threshold(),
            close_threshold_pct: default_close_threshold(),
            window: default_window(),
            tenkan: default_tenkan(),
            kijun: default_kijun(),
            senkou: default_senkou(),
            sar_acceleration: default_sar_acceleration(),
            sar_maximum: default_sar_maximum(),
            trend_degree: default_trend_degree(),
        }
    }

    pub fn account_name(&self) -> String {
        BotAccount::normalize_name(&self.name)
    }

    pub fn ichimoku(&self) -> IchimokuParams {
        IchimokuParams {
            tenkan: self.tenkan,
            kijun: self.kijun,
            senkou: self.senkou,
        }
    }

    pub fn sar(&self) -> SarParams {
        SarParams {
            acceleration: self.sar_acceleration,
            maximum: self.sar_maximum,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |what: String| Err(Error::Config(format!("bot '{}': {what}", self.name)));

        if self.account_name().is_empty() {
            return invalid("name has no letters".into());
        }
        if self.usd_init < 0 || self.btc_init < 0 {
            return invalid("starting balances must not be negative".into());
        }
        if self.interval == 0 {
            return invalid("interval must be positive".into());
        }
        if self.window < 2 {
            return invalid(format!("window must hold at least 2 candlesticks, got {}", self.window));
        }
        if self.tenkan == 0 || self.kijun == 0 || self.senkou == 0 {
            return invalid("ichimoku lengths must be positive".into());
        }
        if self.open_threshold_pct < 0.0 || self.close_threshold_pct < 0.0 {
            return invalid("thresholds must not be negative".into());
        }
        if self.sar_acceleration < 0.0 || self.sar_maximum < 0.0 {
            return invalid("SAR parameters must not be negative".into());
        }
        if self.trend_degree >= self.window {
            return invalid(format!(
                "trend degree {} needs a window of at least {} candlesticks",
                self.trend_degree,
                self.trend_degree + 1
            ));
        }
        Ok(())
    }
}

impl BotFileConfig {
    /// Load and validate a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read bot config at '{path}': {e}")))?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("bot config at '{path}': {e}")))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: BotFileConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;

        let mut seen = std::collections::HashSet::new();
        for bot in &file.bots {
            bot.validate()?;
            if !seen.insert(bot.account_name()) {
                return Err(Error::Config(format!(
                    "duplicate bot name '{}'",
                    bot.account_name()
                )));
            }
        }
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_optional_fields() {
        let file = BotFileConfig::parse(
            r#"
            [[bot]]
            name = "Kumo"
            usd_init = 1000
            btc_init = 0
            interval = 300
            "#,
        )
        .unwrap();

        let bot = &file.bots[0];
        assert_eq!(bot, &BotConfig::new("Kumo", 1000, 0, 300));
        assert_eq!(bot.account_name(), "kumo");
        assert_eq!(bot.ichimoku(), IchimokuParams::default());
        assert_eq!(bot.sar(), SarParams::default());
    }

    #[test]
    fn overrides_are_read() {
        let file = BotFileConfig::parse(
            r#"
            [[bot]]
            name = "fast"
            usd_init = 10
            btc_init = 2
            interval = 60
            window = 10
            tenkan = 3
            kijun = 5
            senkou = 8
            open_threshold_pct = 1.5
            trend_degree = 1
            "#,
        )
        .unwrap();
        let bot = &file.bots[0];
        assert_eq!(bot.window, 10);
        assert_eq!(bot.ichimoku().longest(), 8);
        assert_eq!(bot.open_threshold_pct, 1.5);
        assert_eq!(bot.close_threshold_pct, 0.25);
        assert_eq!(bot.trend_degree, 1);
    }

    #[test]
    fn empty_file_has_no_bots() {
        assert!(BotFileConfig::parse("").unwrap().bots.is_empty());
    }

    #[test]
    fn invalid_bots_are_rejected() {
        let nameless = r#"
            [[bot]]
            name = "42"
            usd_init = 1
            btc_init = 0
            interval = 60
        "#;
        assert!(matches!(BotFileConfig::parse(nameless), Err(Error::Config(_))));

        let duplicate = r#"
            [[bot]]
            name = "alpha"
            usd_init = 1
            btc_init = 0
            interval = 60

            [[bot]]
            name = "Alpha-1"
            usd_init = 1
            btc_init = 0
            interval = 300
        "#;
        assert!(BotFileConfig::parse(duplicate).is_err());

        let zero_interval = r#"
            [[bot]]
            name = "zero"
            usd_init = 1
            btc_init = 0
            interval = 0
        "#;
        assert!(BotFileConfig::parse(zero_interval).is_err());

        let steep_trend = r#"
            [[bot]]
            name = "steep"
            usd_init = 1
            btc_init = 0
            interval = 60
            window = 4
            trend_degree = 4
        "#;
        assert!(BotFileConfig::parse(steep_trend).is_err());
    }

    #[test]
    fn missing_file_is_config_error() {
        assert!(matches!(
            BotFileConfig::load("/nonexistent/bots.toml"),
            Err(Error::Config(_))
        ));
    }
}
