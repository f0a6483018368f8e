use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use common::{Config, Store};
use engine::{Engine, SqliteStore, TickerFeed};
use strategy::{Bot, BotFileConfig, BotHandle};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env().context("loading configuration")?;
    info!(
        pair = %cfg.trading_pair,
        intervals = ?cfg.candle_intervals,
        timer_secs = cfg.aggregation_timer_secs,
        "Tradebot starting"
    );
    let bot_file = BotFileConfig::load(&cfg.bot_config_path).context("loading bot config")?;

    // ── Database ──────────────────────────────────────────────────────────────
    let sqlite = SqliteStore::connect(&cfg.database_url)
        .await
        .context("connecting to database")?;
    sqlite.migrate().await.context("running migrations")?;
    let store: Arc<dyn Store> = Arc::new(sqlite);
    info!("Database ready");

    // ── Engine ────────────────────────────────────────────────────────────────
    let (engine, engine_handle) = Engine::new(
        cfg.trading_pair.clone(),
        &cfg.candle_intervals,
        store.clone(),
        Duration::from_secs(cfg.aggregation_timer_secs),
    );

    // ── Bots ──────────────────────────────────────────────────────────────────
    let mut bots = Vec::with_capacity(bot_file.bots.len());
    for bot_cfg in bot_file.bots {
        if !cfg.candle_intervals.contains(&bot_cfg.interval) {
            warn!(
                bot = %bot_cfg.name,
                interval = bot_cfg.interval,
                "No aggregator for this interval; bot will only trade on stored candlesticks"
            );
        }
        let bot = Bot::load(bot_cfg, store.clone())
            .await
            .context("starting bot")?;
        let (handle, _task) = BotHandle::spawn(bot, engine_handle.subscribe_candles());
        bots.push(handle);
    }
    info!(bots = bots.len(), "Bots ready");

    // ── Spawn all tasks ───────────────────────────────────────────────────────
    let feed = TickerFeed::new(cfg.feed_url.clone(), engine_handle.raw_sender());
    tokio::spawn(engine.run());
    tokio::spawn(feed.run());

    info!("All subsystems started. Waiting for shutdown signal.");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;

    for bot in &bots {
        match bot.account().await {
            Ok(account) => info!(
                bot = %account.name,
                position = %account.position,
                usd = account.current_usd,
                btc = account.current_btc,
                "Final balance"
            ),
            Err(e) => warn!(bot = %bot.name(), error = %e, "Bot unavailable at shutdown"),
        }
    }
    info!("Shutdown signal received. Exiting.");
    Ok(())
}
