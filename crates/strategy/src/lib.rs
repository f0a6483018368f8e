pub mod bot;
pub mod config;
pub mod error;
pub mod indicators;
pub mod window;

pub use bot::{decide, Bot, BotHandle, Decision, Thresholds};
pub use config::{BotConfig, BotFileConfig};
pub use error::IndicatorError;
pub use window::Window;
