use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Executor, Sqlite};

use common::{
    BotAccount, Candlestick, Error, Position, ProcessingCursor, Result, Store, Tick,
};

/// `Store` backed by SQLite.
///
/// A bucket's candlestick and cursor are committed in one transaction.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self::new(pool))
    }

    /// A private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ─── Rows ────────────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct TickRow {
    time: i64,
    avg: i64,
    buy: i64,
    high: i64,
    last: i64,
    low: i64,
    sell: i64,
    vol: i64,
    vwap: i64,
}

impl From<TickRow> for Tick {
    fn from(r: TickRow) -> Self {
        Tick {
            avg: r.avg,
            buy: r.buy,
            high: r.high,
            last: r.last,
            low: r.low,
            sell: r.sell,
            vol: r.vol,
            vwap: r.vwap,
            time: r.time,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CandlestickRow {
    interval_secs: i64,
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    avg: f64,
    vol: f64,
}

impl TryFrom<CandlestickRow> for Candlestick {
    type Error = Error;

    fn try_from(r: CandlestickRow) -> Result<Self> {
        let interval = u32::try_from(r.interval_secs)
            .map_err(|_| Error::Store(format!("bad interval {}", r.interval_secs)))?;
        Ok(Candlestick {
            open: r.open,
            high: r.high,
            low: r.low,
            close: r.close,
            avg: r.avg,
            vol: r.vol,
            time: r.time,
            interval,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    name: String,
    start_usd: i64,
    start_btc: i64,
    start_time: String,
    current_usd: i64,
    current_btc: i64,
    position: String,
}

impl TryFrom<AccountRow> for BotAccount {
    type Error = Error;

    fn try_from(r: AccountRow) -> Result<Self> {
        let start_time = DateTime::parse_from_rfc3339(&r.start_time)
            .map_err(|e| Error::Store(format!("bad start_time for '{}': {e}", r.name)))?
            .with_timezone(&Utc);
        Ok(BotAccount {
            position: r.position.parse::<Position>()?,
            name: r.name,
            start_usd: r.start_usd,
            start_btc: r.start_btc,
            start_time,
            current_usd: r.current_usd,
            current_btc: r.current_btc,
        })
    }
}

// ─── Statements shared between plain and transactional writes ───────────────

async fn upsert_candlestick<'e, E>(exec: E, c: &Candlestick) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO candlesticks (interval_secs, time, open, high, low, close, avg, vol)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(interval_secs, time) DO UPDATE SET
            open = excluded.open,
            high = excluded.high,
            low = excluded.low,
            close = excluded.close,
            avg = excluded.avg,
            vol = excluded.vol
        "#,
    )
    .bind(i64::from(c.interval))
    .bind(c.time)
    .bind(c.open)
    .bind(c.high)
    .bind(c.low)
    .bind(c.close)
    .bind(c.avg)
    .bind(c.vol)
    .execute(exec)
    .await?;
    Ok(())
}

async fn upsert_cursor<'e, E>(exec: E, cursor: &ProcessingCursor) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    // The cursor never moves backwards.
    sqlx::query(
        r#"
        INSERT INTO cursors (interval_secs, last_processed_time)
        VALUES (?1, ?2)
        ON CONFLICT(interval_secs) DO UPDATE SET
            last_processed_time = excluded.last_processed_time
        WHERE excluded.last_processed_time > cursors.last_processed_time
        "#,
    )
    .bind(i64::from(cursor.interval))
    .bind(cursor.last_processed_time)
    .execute(exec)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn append_tick(&self, tick: &Tick) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ticks (time, avg, buy, high, last, low, sell, vol, vwap)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(tick.time)
        .bind(tick.avg)
        .bind(tick.buy)
        .bind(tick.high)
        .bind(tick.last)
        .bind(tick.low)
        .bind(tick.sell)
        .bind(tick.vol)
        .bind(tick.vwap)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn first_tick_at_or_after(&self, from: i64) -> Result<Option<i64>> {
        let first: Option<i64> = sqlx::query_scalar("SELECT MIN(time) FROM ticks WHERE time >= ?1")
            .bind(from)
            .fetch_one(&self.pool)
            .await?;
        Ok(first)
    }

    async fn ticks_between(&self, start: i64, end: i64) -> Result<Vec<Tick>> {
        let rows: Vec<TickRow> = sqlx::query_as(
            r#"
            SELECT time, avg, buy, high, last, low, sell, vol, vwap
            FROM ticks
            WHERE time >= ?1 AND time < ?2
            ORDER BY time, id
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Tick::from).collect())
    }

    async fn put_candlestick(&self, candle: &Candlestick) -> Result<()> {
        upsert_candlestick(&self.pool, candle).await
    }

    async fn candlesticks_after(
        &self,
        interval: u32,
        after: i64,
        limit: usize,
    ) -> Result<Vec<Candlestick>> {
        let rows: Vec<CandlestickRow> = sqlx::query_as(
            r#"
            SELECT interval_secs, time, open, high, low, close, avg, vol
            FROM candlesticks
            WHERE interval_secs = ?1 AND time > ?2
            ORDER BY time
            LIMIT ?3
            "#,
        )
        .bind(i64::from(interval))
        .bind(after)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Candlestick::try_from).collect()
    }

    async fn cursor(&self, interval: u32) -> Result<Option<ProcessingCursor>> {
        let last: Option<i64> =
            sqlx::query_scalar("SELECT last_processed_time FROM cursors WHERE interval_secs = ?1")
                .bind(i64::from(interval))
                .fetch_optional(&self.pool)
                .await?;
        Ok(last.map(|t| ProcessingCursor::new(interval, t)))
    }

    async fn set_cursor(&self, cursor: &ProcessingCursor) -> Result<()> {
        upsert_cursor(&self.pool, cursor).await
    }

    async fn commit_bucket(
        &self,
        candle: Option<&Candlestick>,
        cursor: &ProcessingCursor,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if let Some(candle) = candle {
            upsert_candlestick(&mut *tx, candle).await?;
        }
        upsert_cursor(&mut *tx, cursor).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn init_account(&self, account: &BotAccount) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO accounts
                (name, start_usd, start_btc, start_time, current_usd, current_btc, position)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(&account.name)
        .bind(account.start_usd)
        .bind(account.start_btc)
        .bind(account.start_time.to_rfc3339())
        .bind(account.current_usd)
        .bind(account.current_btc)
        .bind(account.position.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn account(&self, name: &str) -> Result<Option<BotAccount>> {
        let row: Option<AccountRow> = sqlx::query_as(
            r#"
            SELECT name, start_usd, start_btc, start_time, current_usd, current_btc, position
            FROM accounts
            WHERE name = ?1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BotAccount::try_from).transpose()
    }

    async fn save_account(&self, account: &BotAccount) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts
                (name, start_usd, start_btc, start_time, current_usd, current_btc, position)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(name) DO UPDATE SET
                start_usd = excluded.start_usd,
                start_btc = excluded.start_btc,
                start_time = excluded.start_time,
                current_usd = excluded.current_usd,
                current_btc = excluded.current_btc,
                position = excluded.position
            "#,
        )
        .bind(&account.name)
        .bind(account.start_usd)
        .bind(account.start_btc)
        .bind(account.start_time.to_rfc3339())
        .bind(account.current_usd)
        .bind(account.current_btc)
        .bind(account.position.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_account(&self, name: &str, now: DateTime<Utc>) -> Result<Option<BotAccount>> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET current_usd = start_usd,
                current_btc = start_btc,
                start_time = ?2,
                position = 'flat'
            WHERE name = ?1
            "#,
        )
        .bind(name)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.account(name).await
    }

    async fn archive_event(
        &self,
        channel: &str,
        received_at: DateTime<Utc>,
        payload: &str,
    ) -> Result<()> {
        sqlx::query("INSERT INTO raw_events (channel, received_at, payload) VALUES (?1, ?2, ?3)")
            .bind(channel)
            .bind(received_at.to_rfc3339())
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tick(last: i64, time: i64) -> Tick {
        Tick {
            avg: last,
            buy: last,
            high: last,
            last,
            low: last,
            sell: last,
            vol: 1,
            vwap: last,
            time,
        }
    }

    fn candle(interval: u32, time: i64, close: f64) -> Candlestick {
        Candlestick {
            open: 1.0,
            high: close.max(1.0),
            low: 1.0,
            close,
            avg: 1.0,
            vol: 1.0,
            time,
            interval,
        }
    }

    #[tokio::test]
    async fn ticks_are_range_queried_in_time_order() {
        let store = SqliteStore::in_memory().await.unwrap();
        for (last, time) in [(3, 30), (1, 10), (2, 20), (4, 60)] {
            store.append_tick(&tick(last, time)).await.unwrap();
        }

        assert_eq!(store.first_tick_at_or_after(11).await.unwrap(), Some(20));
        assert_eq!(store.first_tick_at_or_after(61).await.unwrap(), None);

        let ticks = store.ticks_between(10, 60).await.unwrap();
        let lasts: Vec<i64> = ticks.iter().map(|t| t.last).collect();
        assert_eq!(lasts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn candlestick_upsert_replaces_same_key() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.put_candlestick(&candle(60, 0, 5.0)).await.unwrap();
        store.put_candlestick(&candle(60, 0, 7.0)).await.unwrap();
        store.put_candlestick(&candle(300, 0, 9.0)).await.unwrap();

        let minute = store.candlesticks_after(60, -1, 10).await.unwrap();
        assert_eq!(minute.len(), 1);
        assert_eq!(minute[0].close, 7.0);
        assert_eq!(store.candlesticks_after(300, -1, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn commit_bucket_writes_candle_and_cursor_together() {
        let store = SqliteStore::in_memory().await.unwrap();
        let cursor = ProcessingCursor::new(60, 60_000_000);
        store.commit_bucket(Some(&candle(60, 0, 2.0)), &cursor).await.unwrap();

        assert_eq!(store.cursor(60).await.unwrap(), Some(cursor));
        assert_eq!(store.candlesticks_after(60, -1, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cursor_never_moves_backwards() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.set_cursor(&ProcessingCursor::new(60, 120)).await.unwrap();
        store.set_cursor(&ProcessingCursor::new(60, 60)).await.unwrap();
        assert_eq!(store.cursor(60).await.unwrap().unwrap().last_processed_time, 120);
        assert_eq!(store.cursor(300).await.unwrap(), None);
    }

    #[tokio::test]
    async fn account_initialization_is_set_once() {
        let store = SqliteStore::in_memory().await.unwrap();
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let first = BotAccount::new("alpha", 1_000, 0, start);
        assert!(store.init_account(&first).await.unwrap());

        let mut traded = first.clone();
        traded.current_usd = 0;
        traded.current_btc = 10;
        traded.position = Position::Long;
        store.save_account(&traded).await.unwrap();

        let again = BotAccount::new("alpha", 5_000, 5, start);
        assert!(!store.init_account(&again).await.unwrap());
        assert_eq!(store.account("alpha").await.unwrap(), Some(traded));
    }

    #[tokio::test]
    async fn reset_restores_start_balances() {
        let store = SqliteStore::in_memory().await.unwrap();
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut account = BotAccount::new("beta", 1_000, 2, start);
        store.init_account(&account).await.unwrap();
        account.current_usd = 10;
        account.position = Position::Short;
        store.save_account(&account).await.unwrap();

        let now = Utc.timestamp_opt(1_800_000_000, 0).unwrap();
        let reset = store.reset_account("beta", now).await.unwrap().unwrap();
        assert_eq!(reset.current_usd, 1_000);
        assert_eq!(reset.current_btc, 2);
        assert_eq!(reset.position, Position::Flat);
        assert_eq!(reset.start_time, now);

        assert!(store.reset_account("nobody", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn raw_events_are_archived() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .archive_event("trade.lag", Utc::now(), r#"{"lag":{}}"#)
            .await
            .unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_events")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
