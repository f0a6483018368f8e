use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use common::{CandleEvent, Error, Result, Store};

use crate::aggregator::{AggregatorHandle, CandlestickAggregator};
use crate::normalizer::{channel_name, IngestEvent};

/// Cloneable handle passed to the feed and to bots.
#[derive(Clone)]
pub struct EngineHandle {
    raw_tx: mpsc::Sender<String>,
    candle_tx: broadcast::Sender<CandleEvent>,
    aggregators: Vec<AggregatorHandle>,
}

impl EngineHandle {
    /// Hand one raw feed message to the engine.
    pub async fn ingest(&self, text: impl Into<String>) -> Result<()> {
        self.raw_tx
            .send(text.into())
            .await
            .map_err(|_| Error::ActorGone("engine".into()))
    }

    /// Sender side of the ingestion mailbox, for feeds.
    pub fn raw_sender(&self) -> mpsc::Sender<String> {
        self.raw_tx.clone()
    }

    /// Subscribe to the announcements of newly written candlesticks.
    pub fn subscribe_candles(&self) -> broadcast::Receiver<CandleEvent> {
        self.candle_tx.subscribe()
    }

    pub fn aggregator(&self, interval: u32) -> Option<&AggregatorHandle> {
        self.aggregators.iter().find(|a| a.interval() == interval)
    }
}

/// The ingestion loop: archives and normalizes raw feed messages, appends
/// ticks, and triggers every interval's aggregator on each new tick and on
/// a periodic timer.
pub struct Engine {
    pair: String,
    store: Arc<dyn Store>,
    raw_rx: mpsc::Receiver<String>,
    aggregators: Vec<AggregatorHandle>,
    tasks: Vec<(u32, JoinHandle<()>)>,
    timer_period: Duration,
}

impl Engine {
    /// Build the engine and spawn one aggregator task per interval.
    /// Must be called from within a tokio runtime.
    pub fn new(
        pair: impl Into<String>,
        intervals: &[u32],
        store: Arc<dyn Store>,
        timer_period: Duration,
    ) -> (Self, EngineHandle) {
        let (raw_tx, raw_rx) = mpsc::channel(1024);
        let (candle_tx, _) = broadcast::channel(256);

        let (aggregators, tasks): (Vec<AggregatorHandle>, Vec<(u32, JoinHandle<()>)>) = intervals
            .iter()
            .map(|&interval| {
                let aggregator = CandlestickAggregator::new(interval, store.clone());
                let (handle, task) = AggregatorHandle::spawn(aggregator, candle_tx.clone());
                (handle, (interval, task))
            })
            .unzip();

        let handle = EngineHandle {
            raw_tx,
            candle_tx,
            aggregators: aggregators.clone(),
        };

        let engine = Engine {
            pair: pair.into(),
            store,
            raw_rx,
            aggregators,
            tasks,
            timer_period: timer_period.max(Duration::from_millis(100)),
        };

        (engine, handle)
    }

    /// Run the engine until every ingestion sender is dropped.
    /// Call from `tokio::spawn`.
    pub async fn run(mut self) {
        info!(
            pair = %self.pair,
            intervals = ?self.aggregators.iter().map(AggregatorHandle::interval).collect::<Vec<_>>(),
            "Engine running"
        );
        let mut timer = tokio::time::interval(self.timer_period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                raw = self.raw_rx.recv() => {
                    match raw {
                        Some(text) => self.handle_raw(text).await,
                        None => {
                            warn!("Ingestion channel closed, engine shutting down");
                            return;
                        }
                    }
                }

                _ = timer.tick() => self.trigger_all().await,
            }
        }
    }

    async fn handle_raw(&mut self, text: String) {
        let message: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Dropping unparsable feed message");
                return;
            }
        };

        let channel = channel_name(&message).unwrap_or("unknown").to_string();
        if let Err(e) = self.store.archive_event(&channel, Utc::now(), &text).await {
            error!(channel = %channel, error = %e, "Failed to archive raw event");
        }

        match IngestEvent::from_value(&self.pair, message) {
            Ok(IngestEvent::Ticker(tick)) => {
                if let Err(e) = self.store.append_tick(&tick).await {
                    error!(time = tick.time, error = %e, "Failed to append tick");
                    return;
                }
                debug!(time = tick.time, last = tick.last, "Tick appended");
                self.trigger_all().await;
            }
            Ok(IngestEvent::Depth(_)) | Ok(IngestEvent::Lag(_)) => {
                debug!(channel = %channel, "Ignoring non-ticker event");
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "Dropping malformed event");
            }
        }
    }

    async fn trigger_all(&mut self) {
        self.reap_stopped().await;
        let now = Utc::now().timestamp();
        for aggregator in &self.aggregators {
            if !aggregator.trigger(now) {
                debug!(interval = aggregator.interval(), "Aggregation pass already queued");
            }
        }
    }

    /// Drop aggregators whose task has ended, logging how it ended.
    async fn reap_stopped(&mut self) {
        let (stopped, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.tasks)
            .into_iter()
            .partition(|(_, task)| task.is_finished());
        self.tasks = running;

        for (interval, task) in stopped {
            self.aggregators.retain(|a| a.interval() != interval);
            match task.await {
                Ok(()) => warn!(interval, "Aggregator task exited"),
                Err(e) => error!(interval, error = %e, "Aggregator task failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use chrono::DateTime;
    use common::{BotAccount, Candlestick, ProcessingCursor, Tick};
    use memstore::MemoryStore;

    /// Panics whenever the cursor of one interval is read.
    struct BrokenInterval {
        inner: MemoryStore,
        broken: u32,
    }

    #[async_trait]
    impl Store for BrokenInterval {
        async fn append_tick(&self, tick: &Tick) -> Result<()> {
            self.inner.append_tick(tick).await
        }

        async fn first_tick_at_or_after(&self, from: i64) -> Result<Option<i64>> {
            self.inner.first_tick_at_or_after(from).await
        }

        async fn ticks_between(&self, start: i64, end: i64) -> Result<Vec<Tick>> {
            self.inner.ticks_between(start, end).await
        }

        async fn put_candlestick(&self, candle: &Candlestick) -> Result<()> {
            self.inner.put_candlestick(candle).await
        }

        async fn candlesticks_after(
            &self,
            interval: u32,
            after: i64,
            limit: usize,
        ) -> Result<Vec<Candlestick>> {
            self.inner.candlesticks_after(interval, after, limit).await
        }

        async fn cursor(&self, interval: u32) -> Result<Option<ProcessingCursor>> {
            if interval == self.broken {
                panic!("cursor table for {interval}s is corrupt");
            }
            self.inner.cursor(interval).await
        }

        async fn set_cursor(&self, cursor: &ProcessingCursor) -> Result<()> {
            self.inner.set_cursor(cursor).await
        }

        async fn init_account(&self, account: &BotAccount) -> Result<bool> {
            self.inner.init_account(account).await
        }

        async fn account(&self, name: &str) -> Result<Option<BotAccount>> {
            self.inner.account(name).await
        }

        async fn save_account(&self, account: &BotAccount) -> Result<()> {
            self.inner.save_account(account).await
        }

        async fn archive_event(
            &self,
            channel: &str,
            received_at: DateTime<Utc>,
            payload: &str,
        ) -> Result<()> {
            self.inner.archive_event(channel, received_at, payload).await
        }
    }

    #[tokio::test]
    async fn panicked_aggregator_is_dropped() {
        let store = Arc::new(BrokenInterval {
            inner: MemoryStore::new(),
            broken: 300,
        });
        let (mut engine, _handle) =
            Engine::new("BTCUSD", &[60, 300], store, Duration::from_secs(3600));

        engine.trigger_all().await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while engine.tasks.len() > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                engine.reap_stopped().await;
            }
        })
        .await
        .expect("broken aggregator never stopped");

        let intervals: Vec<u32> = engine.aggregators.iter().map(AggregatorHandle::interval).collect();
        assert_eq!(intervals, vec![60]);
        assert_eq!(engine.tasks[0].0, 60);
        assert!(!engine.tasks[0].1.is_finished());
    }
}
