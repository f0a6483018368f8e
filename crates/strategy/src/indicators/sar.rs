use serde::{Deserialize, Serialize};

use crate::error::IndicatorError;

/// Parabolic SAR tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SarParams {
    /// Acceleration factor increment, also its starting value.
    pub acceleration: f64,
    /// Cap on the acceleration factor.
    pub maximum: f64,
}

impl Default for SarParams {
    fn default() -> Self {
        Self {
            acceleration: 0.02,
            maximum: 0.20,
        }
    }
}

impl SarParams {
    fn validate(&self) -> Result<(), IndicatorError> {
        if !(self.acceleration >= 0.0) || !self.acceleration.is_finite() {
            return Err(IndicatorError::InvalidParameter(format!(
                "acceleration must be a non-negative number, got {}",
                self.acceleration
            )));
        }
        if !(self.maximum >= 0.0) || !self.maximum.is_finite() {
            return Err(IndicatorError::InvalidParameter(format!(
                "maximum must be a non-negative number, got {}",
                self.maximum
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Long,
    Short,
}

/// SAR output for bars `begin..begin + values.len()`.
///
/// `trends[i]` is the trend in force after bar `begin + i`, so a bar that
/// reversed the trend reports the new direction.
#[derive(Debug, Clone, PartialEq)]
pub struct SarSeries {
    pub begin: usize,
    pub values: Vec<f64>,
    pub trends: Vec<Trend>,
}

impl SarSeries {
    pub fn last(&self) -> Option<(f64, Trend)> {
        Some((*self.values.last()?, *self.trends.last()?))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Running SAR state between two bars.
struct SarState {
    trend: Trend,
    sar: f64,
    extreme: f64,
    af: f64,
    acceleration: f64,
    maximum: f64,
    prev_high: f64,
    prev_low: f64,
}

impl SarState {
    /// Seed from bars `start - 1` and `start`.
    ///
    /// The initial trend compares the directional movement between the two
    /// bars; a tie goes long. The first bar is consumed: its low (long) or
    /// high (short) becomes the first SAR.
    fn seed(high: &[f64], low: &[f64], start: usize, params: &SarParams) -> Self {
        let plus_dm = high[start] - high[start - 1];
        let minus_dm = low[start - 1] - low[start];
        let short = minus_dm > 0.0 && minus_dm > plus_dm;

        let (trend, sar, extreme) = if short {
            (Trend::Short, high[start - 1], low[start])
        } else {
            (Trend::Long, low[start - 1], high[start])
        };

        let acceleration = params.acceleration.min(params.maximum);
        Self {
            trend,
            sar,
            extreme,
            af: acceleration,
            acceleration,
            maximum: params.maximum,
            // The first step compares the start bar against itself.
            prev_high: high[start],
            prev_low: low[start],
        }
    }

    /// Consume one bar, returning the SAR that applied to it.
    fn step(&mut self, high: f64, low: f64) -> f64 {
        let (prev_high, prev_low) = (self.prev_high, self.prev_low);
        self.prev_high = high;
        self.prev_low = low;

        match self.trend {
            Trend::Long if low <= self.sar => {
                self.trend = Trend::Short;
                let out = self.extreme.max(prev_high).max(high);
                self.af = self.acceleration;
                self.extreme = low;
                self.sar = (out + self.af * (self.extreme - out)).max(prev_high).max(high);
                out
            }
            Trend::Short if high >= self.sar => {
                self.trend = Trend::Long;
                let out = self.extreme.min(prev_low).min(low);
                self.af = self.acceleration;
                self.extreme = high;
                self.sar = (out + self.af * (self.extreme - out)).min(prev_low).min(low);
                out
            }
            Trend::Long => {
                let out = self.sar;
                if high > self.extreme {
                    self.extreme = high;
                    self.af = (self.af + self.acceleration).min(self.maximum);
                }
                self.sar = (out + self.af * (self.extreme - out)).min(prev_low).min(low);
                out
            }
            Trend::Short => {
                let out = self.sar;
                if low < self.extreme {
                    self.extreme = low;
                    self.af = (self.af + self.acceleration).min(self.maximum);
                }
                self.sar = (out + self.af * (self.extreme - out)).max(prev_high).max(high);
                out
            }
        }
    }
}

/// Parabolic SAR over every bar from index 1 on.
pub fn parabolic_sar(high: &[f64], low: &[f64], params: &SarParams) -> Result<SarSeries, IndicatorError> {
    if high.len() < 2 {
        params.validate()?;
        return Err(IndicatorError::InsufficientData {
            have: high.len(),
            need: 2,
        });
    }
    parabolic_sar_range(high, low, 0, high.len() - 1, params)
}

/// Parabolic SAR for bars `start..=end`.
///
/// Bar 0 has no predecessor to seed from, so a `start` of 0 is moved up to 1
/// and the result then begins at bar 1.
pub fn parabolic_sar_range(
    high: &[f64],
    low: &[f64],
    start: usize,
    end: usize,
    params: &SarParams,
) -> Result<SarSeries, IndicatorError> {
    params.validate()?;
    if high.len() != low.len() {
        return Err(IndicatorError::LengthMismatch {
            high: high.len(),
            low: low.len(),
        });
    }
    if end < start || end >= high.len() {
        return Err(IndicatorError::IndexOutOfRange { start, end });
    }

    let start = start.max(1);
    if start > end {
        return Err(IndicatorError::InsufficientData {
            have: end + 1,
            need: 2,
        });
    }

    let mut state = SarState::seed(high, low, start, params);
    let mut values = Vec::with_capacity(end - start + 1);
    let mut trends = Vec::with_capacity(end - start + 1);
    for i in start..=end {
        values.push(state.step(high[i], low[i]));
        trends.push(state.trend);
    }

    Ok(SarSeries {
        begin: start,
        values,
        trends,
    })
}
