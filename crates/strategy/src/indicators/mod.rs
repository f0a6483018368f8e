pub mod ichimoku;
pub mod sar;
pub mod trend;

pub use ichimoku::{IchimokuEngine, IchimokuParams, IchimokuSnapshot};
pub use sar::{parabolic_sar, parabolic_sar_range, SarParams, SarSeries, Trend};
pub use trend::PolynomialFit;
