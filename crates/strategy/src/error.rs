use thiserror::Error;

/// Input validation failures of the indicator functions.
///
/// These are reported to the caller and never coerced into a value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndicatorError {
    #[error("insufficient data: have {have}, need {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("high and low series differ in length ({high} vs {low})")]
    LengthMismatch { high: usize, low: usize },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("index range {start}..={end} is invalid")]
    IndexOutOfRange { start: usize, end: usize },

    #[error("singular system")]
    Singular,
}
