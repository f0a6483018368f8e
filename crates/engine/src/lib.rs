pub mod aggregator;
pub mod feed;
pub mod lifecycle;
pub mod normalizer;
pub mod sqlite;

pub use aggregator::{build_candlestick, AggregatorHandle, CandlestickAggregator};
pub use feed::TickerFeed;
pub use lifecycle::{Engine, EngineHandle};
pub use normalizer::IngestEvent;
pub use sqlite::SqliteStore;
