use serde::{Deserialize, Serialize};

use common::Candlestick;

use crate::error::IndicatorError;
use crate::window::Window;

/// Line lengths in candlesticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IchimokuParams {
    pub tenkan: usize,
    pub kijun: usize,
    pub senkou: usize,
}

impl Default for IchimokuParams {
    fn default() -> Self {
        Self {
            tenkan: 9,
            kijun: 26,
            senkou: 52,
        }
    }
}

impl IchimokuParams {
    /// The longest line.
    pub fn longest(&self) -> usize {
        self.tenkan.max(self.kijun).max(self.senkou)
    }

    /// Candlesticks needed before `current` can read every line. Chikou
    /// starts one candlestick late, so its lagged value needs `kijun + 1`.
    pub fn warm_up(&self) -> usize {
        self.longest().max(self.kijun + 1)
    }
}

/// The lines at the newest candlestick.
///
/// The senkou spans are read `kijun` candlesticks back (the forward
/// projection of the cloud); the `lag_*` fields are read further back for
/// comparison against the present.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IchimokuSnapshot {
    pub tenkan: f64,
    pub kijun: f64,
    pub senkou_a: f64,
    pub senkou_b: f64,
    pub chikou: f64,
    pub lag_chikou: f64,
    pub lag_senkou_a: f64,
    pub lag_senkou_b: f64,
}

#[derive(Debug, Clone, Copy)]
struct Bar {
    high: f64,
    low: f64,
    close: f64,
    time: i64,
}

/// Incremental Ichimoku Kinko Hyo over a candlestick stream.
#[derive(Debug, Clone)]
pub struct IchimokuEngine {
    params: IchimokuParams,
    bars: Window<Bar>,
    tenkan: Window<f64>,
    kijun: Window<f64>,
    senkou_a: Window<f64>,
    senkou_b: Window<f64>,
    chikou: Window<f64>,
}

impl IchimokuEngine {
    pub fn new(params: IchimokuParams) -> Result<Self, IndicatorError> {
        if params.tenkan == 0 || params.kijun == 0 || params.senkou == 0 {
            return Err(IndicatorError::InvalidParameter(format!(
                "ichimoku lengths must be positive, got {}/{}/{}",
                params.tenkan, params.kijun, params.senkou
            )));
        }
        let cap = params.longest();
        Ok(Self {
            params,
            bars: Window::new(cap),
            tenkan: Window::new(cap),
            kijun: Window::new(cap),
            senkou_a: Window::new(cap),
            senkou_b: Window::new(cap),
            chikou: Window::new(cap),
        })
    }

    pub fn params(&self) -> &IchimokuParams {
        &self.params
    }

    /// Append the next candlestick. Times must strictly increase.
    pub fn push(&mut self, candle: &Candlestick) -> Result<(), IndicatorError> {
        if let Some(last) = self.bars.last() {
            if candle.time <= last.time {
                return Err(IndicatorError::InvalidParameter(format!(
                    "candlestick at {} does not follow {}",
                    candle.time, last.time
                )));
            }
        }

        self.bars.push(Bar {
            high: candle.high,
            low: candle.low,
            close: candle.close,
            time: candle.time,
        });

        let tenkan = self.midpoint(self.params.tenkan);
        let kijun = self.midpoint(self.params.kijun);
        self.tenkan.push(tenkan);
        self.kijun.push(kijun);
        self.senkou_a.push((tenkan + kijun) / 2.0);
        self.senkou_b.push(self.midpoint(self.params.senkou));

        if let Some(previous) = self.bars.back(2) {
            self.chikou.push(previous.close);
        }
        Ok(())
    }

    /// Whether the longest line has a full window behind it. With `kijun`
    /// the longest line, `current` needs one candlestick more.
    pub fn has_enough_data(&self) -> bool {
        self.bars.is_full()
    }

    pub fn current(&self) -> Result<IchimokuSnapshot, IndicatorError> {
        let need = self.params.warm_up();
        let insufficient = || IndicatorError::InsufficientData {
            have: self.bars.len(),
            need,
        };
        if !self.has_enough_data() {
            return Err(insufficient());
        }

        let (kijun_n, senkou_n) = (self.params.kijun, self.params.senkou);
        let at = |line: &Window<f64>, n: usize| line.back(n).copied().ok_or_else(insufficient);

        Ok(IchimokuSnapshot {
            tenkan: at(&self.tenkan, 1)?,
            kijun: at(&self.kijun, 1)?,
            senkou_a: at(&self.senkou_a, kijun_n)?,
            senkou_b: at(&self.senkou_b, kijun_n)?,
            chikou: at(&self.chikou, 1)?,
            lag_chikou: at(&self.chikou, kijun_n)?,
            lag_senkou_a: at(&self.senkou_a, senkou_n)?,
            lag_senkou_b: at(&self.senkou_b, senkou_n)?,
        })
    }

    /// Midpoint of the highest high and lowest low of the newest `n` bars.
    fn midpoint(&self, n: usize) -> f64 {
        let (high, low) = self
            .bars
            .newest(n)
            .fold((f64::MIN, f64::MAX), |(h, l), b| (h.max(b.high), l.min(b.low)));
        (high + low) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(i: i64, high: f64, low: f64, close: f64) -> Candlestick {
        Candlestick {
            open: close,
            high,
            low,
            close,
            avg: close,
            vol: 1.0,
            time: i * 60_000_000,
            interval: 60,
        }
    }

    fn small() -> IchimokuEngine {
        IchimokuEngine::new(IchimokuParams {
            tenkan: 2,
            kijun: 3,
            senkou: 4,
        })
        .unwrap()
    }

    #[test]
    fn warm_up_reports_insufficient_data() {
        let mut engine = small();
        for i in 0..3 {
            engine.push(&candle(i, 10.0, 5.0, 7.0)).unwrap();
            assert!(!engine.has_enough_data());
            assert_eq!(
                engine.current(),
                Err(IndicatorError::InsufficientData {
                    have: i as usize + 1,
                    need: 4
                })
            );
        }
        engine.push(&candle(3, 10.0, 5.0, 7.0)).unwrap();
        assert!(engine.has_enough_data());
        assert!(engine.current().is_ok());
    }

    #[test]
    fn lines_follow_their_windows() {
        let mut engine = small();
        // (high, low, close)
        let bars = [
            (10.0, 2.0, 6.0),
            (12.0, 4.0, 8.0),
            (14.0, 6.0, 10.0),
            (16.0, 8.0, 12.0),
            (18.0, 10.0, 14.0),
        ];
        for (i, (h, l, c)) in bars.iter().enumerate() {
            engine.push(&candle(i as i64, *h, *l, *c)).unwrap();
        }

        let snap = engine.current().unwrap();
        // tenkan over bars 3..=4: (18 + 8) / 2
        assert_eq!(snap.tenkan, 13.0);
        // kijun over bars 2..=4: (18 + 6) / 2
        assert_eq!(snap.kijun, 12.0);
        // chikou is the previous close: history [6, 8, 10, 12].
        assert_eq!(snap.chikou, 12.0);
        assert_eq!(snap.lag_chikou, 8.0);

        // push0: t=(10+2)/2=6 k=6 -> a=6, b=6
        // push1: t=(12+2)/2=7 k=7 -> a=7, b=7
        // push2: t=(14+4)/2=9 k=(14+2)/2=8 -> a=8.5, b=8
        // push3: t=(16+6)/2=11 k=(16+4)/2=10 -> a=10.5, b=(16+2)/2=9
        // push4: t=13 k=12 -> a=12.5, b=(18+4)/2=11
        assert_eq!(snap.senkou_a, 8.5);
        assert_eq!(snap.senkou_b, 8.0);
        assert_eq!(snap.lag_senkou_a, 7.0);
        assert_eq!(snap.lag_senkou_b, 7.0);
    }

    #[test]
    fn longest_kijun_waits_for_lagged_chikou() {
        let params = IchimokuParams {
            tenkan: 9,
            kijun: 60,
            senkou: 52,
        };
        assert_eq!(params.warm_up(), 61);
        let mut engine = IchimokuEngine::new(params).unwrap();
        for i in 0..60 {
            engine.push(&candle(i, 10.0, 5.0, 7.0)).unwrap();
        }
        assert!(engine.has_enough_data());
        assert_eq!(
            engine.current(),
            Err(IndicatorError::InsufficientData { have: 60, need: 61 })
        );

        engine.push(&candle(60, 10.0, 5.0, 7.0)).unwrap();
        assert!(engine.current().is_ok());
    }

    #[test]
    fn old_bars_stop_affecting_extremes() {
        let mut engine = small();
        engine.push(&candle(0, 1_000.0, 0.0, 500.0)).unwrap();
        for i in 1..=4 {
            engine.push(&candle(i, 10.0, 8.0, 9.0)).unwrap();
        }
        let snap = engine.current().unwrap();
        assert_eq!(snap.tenkan, 9.0);
        assert_eq!(snap.kijun, 9.0);
    }

    #[test]
    fn out_of_order_candles_are_rejected() {
        let mut engine = small();
        engine.push(&candle(5, 10.0, 8.0, 9.0)).unwrap();
        assert!(matches!(
            engine.push(&candle(5, 10.0, 8.0, 9.0)),
            Err(IndicatorError::InvalidParameter(_))
        ));
        assert!(engine.push(&candle(4, 10.0, 8.0, 9.0)).is_err());
    }

    #[test]
    fn zero_length_is_invalid() {
        let params = IchimokuParams {
            tenkan: 0,
            ..IchimokuParams::default()
        };
        assert!(IchimokuEngine::new(params).is_err());
    }
}
