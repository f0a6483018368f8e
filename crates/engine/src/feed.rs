use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use url::Url;

use common::{Error, Result};

/// Websocket ticker feed.
///
/// Connects to the configured feed URL and forwards every text frame,
/// unparsed, into the engine's ingestion mailbox. Reconnects automatically
/// with exponential backoff.
pub struct TickerFeed {
    url: String,
    raw_tx: mpsc::Sender<String>,
}

impl TickerFeed {
    pub fn new(url: impl Into<String>, raw_tx: mpsc::Sender<String>) -> Self {
        Self {
            url: url.into(),
            raw_tx,
        }
    }

    /// Run the feed loop until the engine stops listening.
    /// Call this inside a `tokio::spawn`.
    pub async fn run(self) {
        let mut backoff = Duration::from_secs(1);
        const MAX_BACKOFF: Duration = Duration::from_secs(60);

        loop {
            info!(url = %self.url, "Connecting to ticker feed");
            match self.connect_once().await {
                Ok(()) => {
                    info!(url = %self.url, "Ticker feed closed cleanly");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    backoff = Duration::from_secs(1);
                }
                Err(Error::ActorGone(_)) => {
                    warn!("Ingestion mailbox closed, stopping ticker feed");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, backoff = ?backoff, "Ticker feed error, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<()> {
        let url = Url::parse(&self.url).map_err(|e| Error::WebSocket(e.to_string()))?;

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        let (_, mut read) = ws_stream.split();

        while let Some(msg) = read.next().await {
            let msg = msg.map_err(|e| Error::WebSocket(e.to_string()))?;

            if let Message::Text(text) = msg {
                self.raw_tx
                    .send(text)
                    .await
                    .map_err(|_| Error::ActorGone("engine".into()))?;
            }
        }

        Ok(())
    }
}
