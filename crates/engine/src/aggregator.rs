use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use common::{
    interval_micros, CandleEvent, Candlestick, Error, ProcessingCursor, Result, Store, Tick,
    MICROS_PER_SEC,
};

/// Folds the tick history of one interval into candlesticks.
///
/// The aggregator is resumable: its position lives in the store as a
/// `ProcessingCursor`, advanced one bucket at a time. Only the bucket that
/// contains `now` is left alone, since its data is still incomplete.
pub struct CandlestickAggregator {
    interval: u32,
    store: Arc<dyn Store>,
}

impl CandlestickAggregator {
    pub fn new(interval: u32, store: Arc<dyn Store>) -> Self {
        assert!(interval > 0, "candlestick interval must be positive");
        Self { interval, store }
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Process every fully elapsed bucket since the cursor, as of `now`
    /// (Unix seconds). Returns the number of candlesticks written.
    pub async fn advance(&self, now: i64) -> Result<usize> {
        self.pass(now).await.map(|event| event.buckets)
    }

    /// Like `advance`, also reporting where the cursor ended up.
    pub async fn pass(&self, now: i64) -> Result<CandleEvent> {
        let step = interval_micros(self.interval);
        let processing_end = (now * MICROS_PER_SEC).div_euclid(step) * step;

        let mut last = self
            .store
            .cursor(self.interval)
            .await?
            .map(|c| c.last_processed_time)
            .unwrap_or(0);
        let mut written = 0;

        while last < processing_end {
            // Jump straight to the next bucket that holds data.
            let Some(first) = self.store.first_tick_at_or_after(last).await? else {
                break;
            };
            if first >= processing_end {
                break;
            }

            let period_start = first.div_euclid(step) * step;
            let period_end = period_start + step;

            let ticks = self.store.ticks_between(period_start, period_end).await?;
            let candle = build_candlestick(self.interval, period_start, &ticks);

            let cursor = ProcessingCursor::new(self.interval, period_end);
            self.store.commit_bucket(candle.as_ref(), &cursor).await?;

            if let Some(c) = &candle {
                debug!(
                    interval = self.interval,
                    time = c.time,
                    open = c.open,
                    high = c.high,
                    low = c.low,
                    close = c.close,
                    ticks = ticks.len(),
                    "Candlestick written"
                );
                written += 1;
            }
            last = period_end;
        }

        if written > 0 {
            info!(interval = self.interval, buckets = written, through = last, "Aggregation pass complete");
        }

        Ok(CandleEvent {
            interval: self.interval,
            buckets: written,
            through: last,
        })
    }
}

/// Build the candlestick for the bucket starting at `period_start` from the
/// ticks inside it, oldest first. `None` for an empty bucket.
///
/// High and low come from each tick's `last` price; the ticker's own
/// high/low fields describe a longer exchange window and are not used.
pub fn build_candlestick(interval: u32, period_start: i64, ticks: &[Tick]) -> Option<Candlestick> {
    let first = ticks.first()?;
    let last = ticks.last()?;

    let mut high = first.last;
    let mut low = first.last;
    let mut avg_sum = 0.0;
    let mut vol_sum = 0.0;
    for t in ticks {
        high = high.max(t.last);
        low = low.min(t.last);
        avg_sum += t.avg as f64;
        vol_sum += t.vol as f64;
    }

    Some(Candlestick {
        open: first.last as f64,
        high: high as f64,
        low: low as f64,
        close: last.last as f64,
        avg: avg_sum / ticks.len() as f64,
        vol: vol_sum,
        time: period_start,
        interval,
    })
}

// ─── Single-writer actor ─────────────────────────────────────────────────────

enum AggregatorMessage {
    Advance {
        now: i64,
        reply: Option<oneshot::Sender<Result<usize>>>,
    },
}

/// Cloneable handle to the task that owns one interval's cursor.
///
/// All passes for an interval run one after another inside that task, so two
/// callers can never advance the same cursor concurrently.
#[derive(Clone)]
pub struct AggregatorHandle {
    interval: u32,
    tx: mpsc::Sender<AggregatorMessage>,
}

impl AggregatorHandle {
    const MAILBOX: usize = 16;

    /// Spawn the aggregator task. Passes that write buckets are announced on
    /// `candle_tx`.
    pub fn spawn(
        aggregator: CandlestickAggregator,
        candle_tx: broadcast::Sender<CandleEvent>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(Self::MAILBOX);
        let handle = Self {
            interval: aggregator.interval(),
            tx,
        };
        let task = tokio::spawn(run(aggregator, rx, candle_tx));
        (handle, task)
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Run a pass and wait for its result.
    pub async fn advance(&self, now: i64) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AggregatorMessage::Advance {
                now,
                reply: Some(reply),
            })
            .await
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())?
    }

    /// Queue a pass without waiting. Returns `false` when the mailbox is full,
    /// in which case an earlier queued pass will pick up the same work.
    pub fn trigger(&self, now: i64) -> bool {
        match self.tx.try_send(AggregatorMessage::Advance { now, reply: None }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(interval = self.interval, "Aggregator task has stopped");
                false
            }
        }
    }

    fn gone(&self) -> Error {
        Error::ActorGone(format!("aggregator {}s", self.interval))
    }
}

async fn run(
    aggregator: CandlestickAggregator,
    mut rx: mpsc::Receiver<AggregatorMessage>,
    candle_tx: broadcast::Sender<CandleEvent>,
) {
    info!(interval = aggregator.interval(), "Aggregator running");
    while let Some(message) = rx.recv().await {
        match message {
            AggregatorMessage::Advance { now, reply } => {
                let result = aggregator.pass(now).await;
                let outcome = match result {
                    Ok(event) => {
                        if event.buckets > 0 {
                            // Ignore send errors (no active receivers)
                            let _ = candle_tx.send(event);
                        }
                        Ok(event.buckets)
                    }
                    Err(e) => {
                        // The cursor stays at the last committed bucket; the
                        // next trigger resumes from there.
                        error!(interval = aggregator.interval(), error = %e, "Aggregation pass aborted");
                        Err(e)
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
        }
    }
    warn!(interval = aggregator.interval(), "Aggregator mailbox closed");
}
