use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{BotAccount, Candlestick, ProcessingCursor, Result, Tick};

/// Abstraction over the durable, time-ordered store.
///
/// `SqliteStore` implements this for production.
/// `MemoryStore` implements this for simulation and tests.
///
/// Keys are scoped per interval (cursors, candlesticks) and per bot
/// (accounts). Each scope has exactly one writer: the aggregator actor for
/// an interval, the bot actor for an account.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append one tick to the ordered tick history.
    async fn append_tick(&self, tick: &Tick) -> Result<()>;

    /// Timestamp of the earliest tick with `time >= from`, if any.
    async fn first_tick_at_or_after(&self, from: i64) -> Result<Option<i64>>;

    /// All ticks with `start <= time < end`, oldest first.
    async fn ticks_between(&self, start: i64, end: i64) -> Result<Vec<Tick>>;

    /// Insert or replace the candlestick keyed by `(interval, time)`.
    async fn put_candlestick(&self, candle: &Candlestick) -> Result<()>;

    /// Up to `limit` candlesticks of `interval` with `time > after`, oldest first.
    async fn candlesticks_after(
        &self,
        interval: u32,
        after: i64,
        limit: usize,
    ) -> Result<Vec<Candlestick>>;

    async fn cursor(&self, interval: u32) -> Result<Option<ProcessingCursor>>;

    async fn set_cursor(&self, cursor: &ProcessingCursor) -> Result<()>;

    /// Write one bucket's candlestick (if it had ticks) and advance the cursor
    /// past it as a single unit.
    ///
    /// The default applies the two writes in sequence; a crash in between
    /// leaves the cursor behind and the bucket is recomputed identically.
    async fn commit_bucket(
        &self,
        candle: Option<&Candlestick>,
        cursor: &ProcessingCursor,
    ) -> Result<()> {
        if let Some(candle) = candle {
            self.put_candlestick(candle).await?;
        }
        self.set_cursor(cursor).await
    }

    /// Create the account only if no account with that name exists.
    /// Returns `true` when this call created it.
    async fn init_account(&self, account: &BotAccount) -> Result<bool>;

    async fn account(&self, name: &str) -> Result<Option<BotAccount>>;

    /// Replace the whole account record.
    async fn save_account(&self, account: &BotAccount) -> Result<()>;

    /// Restore an account to its starting balances. Returns the reset record,
    /// or `None` when the account does not exist.
    async fn reset_account(&self, name: &str, now: DateTime<Utc>) -> Result<Option<BotAccount>> {
        let Some(mut account) = self.account(name).await? else {
            return Ok(None);
        };
        account.reset(now);
        self.save_account(&account).await?;
        Ok(Some(account))
    }

    /// Keep the raw payload of an ingested event for later inspection.
    async fn archive_event(
        &self,
        channel: &str,
        received_at: DateTime<Utc>,
        payload: &str,
    ) -> Result<()>;
}
