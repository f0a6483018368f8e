use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use common::{BotAccount, Candlestick, Error, ProcessingCursor, Result, Store, Tick};

/// A raw feed message kept by `archive_event`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedEvent {
    pub channel: String,
    pub received_at: DateTime<Utc>,
    pub payload: String,
}

#[derive(Default)]
struct State {
    /// Keyed by `(time, arrival sequence)` so equal timestamps keep arrival order.
    ticks: BTreeMap<(i64, u64), Tick>,
    next_seq: u64,
    candlesticks: BTreeMap<(u32, i64), Candlestick>,
    cursors: HashMap<u32, i64>,
    accounts: HashMap<String, BotAccount>,
    events: Vec<ArchivedEvent>,
}

/// In-memory `Store` for simulation and tests.
///
/// Every operation takes one lock over the whole state, so multi-part writes
/// such as `commit_bucket` are atomic. The store can be switched offline to
/// exercise transient-failure handling.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with `Error::Store`.
    pub fn set_offline(&self, offline: bool) {
        debug!(offline, "MemoryStore availability changed");
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every stored candlestick of `interval`, oldest first.
    pub async fn candlesticks(&self, interval: u32) -> Vec<Candlestick> {
        self.state
            .read()
            .await
            .candlesticks
            .range((interval, i64::MIN)..=(interval, i64::MAX))
            .map(|(_, c)| *c)
            .collect()
    }

    pub async fn archived_events(&self) -> Vec<ArchivedEvent> {
        self.state.read().await.events.clone()
    }

    pub async fn tick_count(&self) -> usize {
        self.state.read().await.ticks.len()
    }

    fn check(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Store("store unavailable".into()));
        }
        Ok(())
    }
}

fn advance_cursor(cursors: &mut HashMap<u32, i64>, cursor: &ProcessingCursor) {
    let slot = cursors.entry(cursor.interval).or_insert(cursor.last_processed_time);
    // The cursor never moves backwards.
    if cursor.last_processed_time > *slot {
        *slot = cursor.last_processed_time;
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn append_tick(&self, tick: &Tick) -> Result<()> {
        self.check()?;
        let mut state = self.state.write().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.ticks.insert((tick.time, seq), *tick);
        Ok(())
    }

    async fn first_tick_at_or_after(&self, from: i64) -> Result<Option<i64>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state.ticks.range((from, 0)..).next().map(|((time, _), _)| *time))
    }

    async fn ticks_between(&self, start: i64, end: i64) -> Result<Vec<Tick>> {
        self.check()?;
        if end <= start {
            return Ok(Vec::new());
        }
        let state = self.state.read().await;
        Ok(state.ticks.range((start, 0)..(end, 0)).map(|(_, t)| *t).collect())
    }

    async fn put_candlestick(&self, candle: &Candlestick) -> Result<()> {
        self.check()?;
        self.state
            .write()
            .await
            .candlesticks
            .insert((candle.interval, candle.time), *candle);
        Ok(())
    }

    async fn candlesticks_after(
        &self,
        interval: u32,
        after: i64,
        limit: usize,
    ) -> Result<Vec<Candlestick>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .candlesticks
            .range((interval, after)..=(interval, i64::MAX))
            .filter(|((_, time), _)| *time > after)
            .take(limit)
            .map(|(_, c)| *c)
            .collect())
    }

    async fn cursor(&self, interval: u32) -> Result<Option<ProcessingCursor>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .cursors
            .get(&interval)
            .map(|&t| ProcessingCursor::new(interval, t)))
    }

    async fn set_cursor(&self, cursor: &ProcessingCursor) -> Result<()> {
        self.check()?;
        advance_cursor(&mut self.state.write().await.cursors, cursor);
        Ok(())
    }

    async fn commit_bucket(
        &self,
        candle: Option<&Candlestick>,
        cursor: &ProcessingCursor,
    ) -> Result<()> {
        self.check()?;
        let mut state = self.state.write().await;
        if let Some(candle) = candle {
            state
                .candlesticks
                .insert((candle.interval, candle.time), *candle);
        }
        advance_cursor(&mut state.cursors, cursor);
        Ok(())
    }

    async fn init_account(&self, account: &BotAccount) -> Result<bool> {
        self.check()?;
        let mut state = self.state.write().await;
        if state.accounts.contains_key(&account.name) {
            return Ok(false);
        }
        state.accounts.insert(account.name.clone(), account.clone());
        Ok(true)
    }

    async fn account(&self, name: &str) -> Result<Option<BotAccount>> {
        self.check()?;
        Ok(self.state.read().await.accounts.get(name).cloned())
    }

    async fn save_account(&self, account: &BotAccount) -> Result<()> {
        self.check()?;
        self.state
            .write()
            .await
            .accounts
            .insert(account.name.clone(), account.clone());
        Ok(())
    }

    async fn reset_account(&self, name: &str, now: DateTime<Utc>) -> Result<Option<BotAccount>> {
        self.check()?;
        let mut state = self.state.write().await;
        Ok(state.accounts.get_mut(name).map(|account| {
            account.reset(now);
            account.clone()
        }))
    }

    async fn archive_event(
        &self,
        channel: &str,
        received_at: DateTime<Utc>,
        payload: &str,
    ) -> Result<()> {
        self.check()?;
        self.state.write().await.events.push(ArchivedEvent {
            channel: channel.to_string(),
            received_at,
            payload: payload.to_string(),
        });
        Ok(())
    }
}
