use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use common::{
    BotAccount, CandleEvent, Candlestick, Error, Position, Result, Store, Trade, TradeSide,
    MICROS_PER_SEC,
};

use crate::config::BotConfig;
use crate::error::IndicatorError;
use crate::indicators::{
    parabolic_sar, IchimokuEngine, IchimokuSnapshot, PolynomialFit, SarParams,
};
use crate::window::Window;

/// Tenkan/kijun divergence thresholds, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub open_pct: f64,
    pub close_pct: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            open_pct: 0.5,
            close_pct: 0.25,
        }
    }
}

/// A trade the rules call for, and the position it leads to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub side: TradeSide,
    pub next: Position,
}

/// Percentage divergence of tenkan from kijun, relative to their mean.
pub fn divergence_pct(tenkan: f64, kijun: f64) -> f64 {
    let mean = (tenkan + kijun) / 2.0;
    if mean == 0.0 {
        return 0.0;
    }
    ((tenkan - kijun).abs() / mean * 100.0).abs()
}

/// Evaluate the trading rules for one cycle.
///
/// Closing an open position takes precedence over opening one.
pub fn decide(
    position: Position,
    ichimoku: &IchimokuSnapshot,
    sar: f64,
    thresholds: &Thresholds,
) -> Option<Decision> {
    let IchimokuSnapshot {
        tenkan,
        kijun,
        senkou_a,
        senkou_b,
        chikou,
        lag_chikou,
        ..
    } = *ichimoku;
    let diff = divergence_pct(tenkan, kijun);
    if !diff.is_finite() {
        return None;
    }

    match position {
        Position::Long if diff > thresholds.close_pct && tenkan < kijun && chikou < sar => {
            return Some(Decision {
                side: TradeSide::Sell,
                next: Position::Flat,
            });
        }
        Position::Short if diff > thresholds.close_pct && tenkan > kijun && chikou > sar => {
            return Some(Decision {
                side: TradeSide::Buy,
                next: Position::Flat,
            });
        }
        _ => {}
    }

    if diff <= thresholds.open_pct {
        return None;
    }

    let cloud_top = senkou_a.max(senkou_b);
    let cloud_bottom = senkou_a.min(senkou_b);

    if position != Position::Long
        && tenkan > kijun
        && tenkan.min(kijun) > cloud_top
        && chikou > lag_chikou
    {
        return Some(Decision {
            side: TradeSide::Buy,
            next: Position::Long,
        });
    }

    if position != Position::Short
        && tenkan < kijun
        && tenkan.max(kijun) < cloud_bottom
        && chikou < lag_chikou
    {
        return Some(Decision {
            side: TradeSide::Sell,
            next: Position::Short,
        });
    }

    None
}

/// Spend all cash on whole units at `price`. Returns the units bought.
pub fn buy(account: &mut BotAccount, price: f64) -> i64 {
    let units = (account.current_usd as f64 / price).floor() as i64;
    let cost = (units as f64 * price).floor() as i64;
    account.current_usd -= cost;
    account.current_btc += units;
    units
}

/// Convert every held unit to cash at `price`. Returns the units sold.
pub fn sell(account: &mut BotAccount, price: f64) -> i64 {
    let units = account.current_btc;
    let proceeds = (units as f64 * price).floor() as i64;
    account.current_usd += proceeds;
    account.current_btc = 0;
    units
}

fn indicator_error(e: IndicatorError) -> Error {
    Error::Other(format!("indicator: {e}"))
}

/// One trading bot: its account, indicators, and candlestick window.
pub struct Bot {
    config: BotConfig,
    thresholds: Thresholds,
    sar_params: SarParams,
    account: BotAccount,
    ichimoku: IchimokuEngine,
    window: Window<Candlestick>,
    /// Bucket start of the newest candlestick consumed.
    last_seen: Option<i64>,
    store: Arc<dyn Store>,
}

impl Bot {
    const PAGE: usize = 500;

    /// Create the bot, initializing its account if the store has none.
    /// An existing account (balances and position) is resumed as stored.
    pub async fn load(config: BotConfig, store: Arc<dyn Store>) -> Result<Self> {
        config.validate()?;
        let ichimoku = IchimokuEngine::new(config.ichimoku()).map_err(indicator_error)?;
        let name = config.account_name();

        let fresh = BotAccount::new(&name, config.usd_init, config.btc_init, Utc::now());
        if store.init_account(&fresh).await? {
            info!(bot = %name, usd = fresh.current_usd, btc = fresh.current_btc, "Account created");
        }
        let account = store
            .account(&name)
            .await?
            .ok_or_else(|| Error::Store(format!("account '{name}' missing after init")))?;
        info!(
            bot = %name,
            interval = config.interval,
            position = %account.position,
            usd = account.current_usd,
            btc = account.current_btc,
            "Bot loaded"
        );

        Ok(Self {
            thresholds: Thresholds {
                open_pct: config.open_threshold_pct,
                close_pct: config.close_threshold_pct,
            },
            sar_params: config.sar(),
            window: Window::new(config.window),
            config,
            account,
            ichimoku,
            last_seen: None,
            store,
        })
    }

    pub fn name(&self) -> &str {
        &self.account.name
    }

    pub fn interval(&self) -> u32 {
        self.config.interval
    }

    pub fn account(&self) -> &BotAccount {
        &self.account
    }

    /// Average price the trend fitted over the window projects for the next
    /// candlestick. `None` until the window holds enough candlesticks.
    pub fn projected_price(&self) -> Option<f64> {
        let candles: Vec<Candlestick> = self.window.iter().cloned().collect();
        let latest = candles.last()?;
        let next = latest.time as f64 / MICROS_PER_SEC as f64 + f64::from(self.config.interval);
        match PolynomialFit::from_candles(&candles, self.config.trend_degree) {
            Ok(fit) => Some(fit.predict(next)),
            Err(e) => {
                debug!(bot = %self.name(), error = %e, "No trend fit");
                None
            }
        }
    }

    /// Pull new candlesticks, evaluate the rules, and trade if they say so.
    ///
    /// The account is persisted as a whole before it changes in memory, so a
    /// failed save leaves the bot exactly as it was.
    pub async fn cycle(&mut self) -> Result<Option<Trade>> {
        let pulled = self.pull_candles().await?;
        if pulled > 0 {
            debug!(bot = %self.name(), pulled, "Candlesticks consumed");
        }

        let Some(snapshot) = self.snapshot()? else {
            debug!(bot = %self.name(), candles = self.window.len(), "Indicators warming up");
            return Ok(None);
        };
        let Some(latest) = self.window.last() else {
            return Ok(None);
        };
        let price = latest.avg;
        if !(price > 0.0) {
            warn!(bot = %self.name(), price, "Skipping cycle on non-positive price");
            return Ok(None);
        }

        let (ichimoku, sar) = snapshot;
        let Some(decision) = decide(self.account.position, &ichimoku, sar, &self.thresholds) else {
            return Ok(None);
        };

        let mut next = self.account.clone();
        let units = match decision.side {
            TradeSide::Buy => buy(&mut next, price),
            TradeSide::Sell => sell(&mut next, price),
        };
        next.position = decision.next;
        self.store.save_account(&next).await?;
        self.account = next;

        let trade = Trade {
            bot: self.account.name.clone(),
            side: decision.side,
            units,
            price,
            usd_after: self.account.current_usd,
            btc_after: self.account.current_btc,
            position_after: self.account.position,
            timestamp: Utc::now(),
        };
        info!(
            bot = %trade.bot,
            side = %trade.side,
            units = trade.units,
            price = trade.price,
            usd = trade.usd_after,
            btc = trade.btc_after,
            position = %trade.position_after,
            projected = ?self.projected_price(),
            "Trade executed"
        );
        Ok(Some(trade))
    }

    /// Restore the starting balances.
    pub async fn reset(&mut self) -> Result<BotAccount> {
        let account = self
            .store
            .reset_account(&self.account.name, Utc::now())
            .await?
            .ok_or_else(|| Error::Store(format!("account '{}' missing", self.account.name)))?;
        info!(bot = %account.name, usd = account.current_usd, btc = account.current_btc, "Account reset");
        self.account = account.clone();
        Ok(account)
    }

    async fn pull_candles(&mut self) -> Result<usize> {
        let mut pulled = 0;
        loop {
            let after = self.last_seen.unwrap_or(i64::MIN);
            let batch = self
                .store
                .candlesticks_after(self.config.interval, after, Self::PAGE)
                .await?;
            let done = batch.len() < Self::PAGE;
            for candle in batch {
                self.ichimoku.push(&candle).map_err(indicator_error)?;
                self.window.push(candle);
                self.last_seen = Some(candle.time);
                pulled += 1;
            }
            if done {
                return Ok(pulled);
            }
        }
    }

    /// The Ichimoku lines and newest SAR, once both have enough history.
    fn snapshot(&self) -> Result<Option<(IchimokuSnapshot, f64)>> {
        if !self.ichimoku.has_enough_data() || self.window.len() < 2 {
            return Ok(None);
        }
        let ichimoku = match self.ichimoku.current() {
            Ok(s) => s,
            Err(IndicatorError::InsufficientData { .. }) => return Ok(None),
            Err(e) => return Err(indicator_error(e)),
        };

        let high: Vec<f64> = self.window.iter().map(|c| c.high).collect();
        let low: Vec<f64> = self.window.iter().map(|c| c.low).collect();
        let series = parabolic_sar(&high, &low, &self.sar_params).map_err(indicator_error)?;
        Ok(series.last().map(|(sar, _)| (ichimoku, sar)))
    }
}

// ─── Single-writer actor ─────────────────────────────────────────────────────

enum BotCommand {
    Cycle {
        reply: oneshot::Sender<Result<Option<Trade>>>,
    },
    Account {
        reply: oneshot::Sender<BotAccount>,
    },
    Reset {
        reply: oneshot::Sender<Result<BotAccount>>,
    },
}

/// Cloneable handle to the task that owns one bot.
///
/// Every cycle, query and reset goes through the bot's mailbox, so its
/// account is only ever touched by that one task.
#[derive(Clone)]
pub struct BotHandle {
    name: String,
    tx: mpsc::Sender<BotCommand>,
}

impl BotHandle {
    const MAILBOX: usize = 32;

    /// Spawn the bot task. It runs a cycle whenever `candles` announces new
    /// candlesticks for the bot's interval.
    pub fn spawn(bot: Bot, candles: broadcast::Receiver<CandleEvent>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(Self::MAILBOX);
        let handle = Self {
            name: bot.name().to_string(),
            tx,
        };
        let task = tokio::spawn(run(bot, rx, candles));
        (handle, task)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run a cycle now and wait for its outcome.
    pub async fn cycle(&self) -> Result<Option<Trade>> {
        let (reply, rx) = oneshot::channel();
        self.send(BotCommand::Cycle { reply }).await?;
        rx.await.map_err(|_| self.gone())?
    }

    pub async fn account(&self) -> Result<BotAccount> {
        let (reply, rx) = oneshot::channel();
        self.send(BotCommand::Account { reply }).await?;
        rx.await.map_err(|_| self.gone())
    }

    pub async fn reset(&self) -> Result<BotAccount> {
        let (reply, rx) = oneshot::channel();
        self.send(BotCommand::Reset { reply }).await?;
        rx.await.map_err(|_| self.gone())?
    }

    async fn send(&self, command: BotCommand) -> Result<()> {
        self.tx.send(command).await.map_err(|_| self.gone())
    }

    fn gone(&self) -> Error {
        Error::ActorGone(format!("bot {}", self.name))
    }
}

async fn run(
    mut bot: Bot,
    mut rx: mpsc::Receiver<BotCommand>,
    mut candles: broadcast::Receiver<CandleEvent>,
) {
    info!(bot = %bot.name(), interval = bot.interval(), "Bot running");
    let mut listening = true;

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else {
                    break;
                };
                match command {
                    BotCommand::Cycle { reply } => {
                        let _ = reply.send(bot.cycle().await);
                    }
                    BotCommand::Account { reply } => {
                        let _ = reply.send(bot.account().clone());
                    }
                    BotCommand::Reset { reply } => {
                        let _ = reply.send(bot.reset().await);
                    }
                }
            }

            event = candles.recv(), if listening => {
                match event {
                    Ok(event) if event.interval == bot.interval() => {
                        if let Err(e) = bot.cycle().await {
                            error!(bot = %bot.name(), error = %e, "Bot cycle failed");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Cycles pull everything newer than the last candlestick
                        // seen, so one cycle catches up.
                        warn!(bot = %bot.name(), dropped = n, "Bot lagged behind candle events");
                        if let Err(e) = bot.cycle().await {
                            error!(bot = %bot.name(), error = %e, "Bot cycle failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!(bot = %bot.name(), "Candle event channel closed");
                        listening = false;
                    }
                }
            }
        }
    }
    warn!(bot = %bot.name(), "Bot mailbox closed");
}
