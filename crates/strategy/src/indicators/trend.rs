use common::{Candlestick, MICROS_PER_SEC};

use crate::error::IndicatorError;

/// Least-squares polynomial of price against time.
#[derive(Debug, Clone, PartialEq)]
pub struct PolynomialFit {
    /// Coefficients, constant term first, in powers of `time - origin`.
    coefficients: Vec<f64>,
    origin: f64,
}

impl PolynomialFit {
    /// Fit `(time, value)` points with a polynomial of `degree`.
    ///
    /// Time is shifted so the first point sits at zero; raw Unix timestamps
    /// raised to the second power would swamp the normal equations.
    pub fn fit(points: &[(f64, f64)], degree: usize) -> Result<Self, IndicatorError> {
        let terms = degree + 1;
        if points.len() < terms {
            return Err(IndicatorError::InsufficientData {
                have: points.len(),
                need: terms,
            });
        }
        let origin = points[0].0;

        // Normal equations: (XᵀX) β = Xᵀy, built as one augmented matrix.
        let mut system = vec![vec![0.0; terms + 1]; terms];
        for &(time, value) in points {
            let powers = powers(time - origin, 2 * degree);
            for (row, line) in system.iter_mut().enumerate() {
                for col in 0..terms {
                    line[col] += powers[row + col];
                }
                line[terms] += powers[row] * value;
            }
        }

        let coefficients = solve(system)?;
        Ok(Self {
            coefficients,
            origin,
        })
    }

    /// Fit candlestick average prices against bucket start in seconds.
    pub fn from_candles(candles: &[Candlestick], degree: usize) -> Result<Self, IndicatorError> {
        let points: Vec<(f64, f64)> = candles
            .iter()
            .map(|c| (c.time as f64 / MICROS_PER_SEC as f64, c.avg))
            .collect();
        Self::fit(&points, degree)
    }

    /// The fitted value at `time`, in the units the fit was built with.
    pub fn predict(&self, time: f64) -> f64 {
        let x = time - self.origin;
        // Horner
        self.coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
    }

    pub fn degree(&self) -> usize {
        self.coefficients.len() - 1
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }
}

fn powers(x: f64, up_to: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(up_to + 1);
    let mut p = 1.0;
    for _ in 0..=up_to {
        out.push(p);
        p *= x;
    }
    out
}

/// Gaussian elimination with partial pivoting on an `n × (n + 1)` augmented matrix.
fn solve(mut m: Vec<Vec<f64>>) -> Result<Vec<f64>, IndicatorError> {
    let n = m.len();
    let scale = m
        .iter()
        .flat_map(|row| row[..n].iter())
        .fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let eps = f64::EPSILON * scale.max(1.0) * n as f64;

    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))
            .unwrap_or(col);
        if m[pivot][col].abs() <= eps {
            return Err(IndicatorError::Singular);
        }
        m.swap(col, pivot);

        for row in col + 1..n {
            let factor = m[row][col] / m[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..=n {
                m[row][k] -= factor * m[col][k];
            }
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| m[row][k] * x[k]).sum();
        x[row] = (m[row][n] - tail) / m[row][row];
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_exact_quadratic() {
        let t0 = 1_366_230_000.0;
        let points: Vec<(f64, f64)> = (0..10)
            .map(|i| {
                let x = i as f64 * 60.0;
                (t0 + x, 3.0 + 0.5 * x - 0.001 * x * x)
            })
            .collect();

        let fit = PolynomialFit::fit(&points, 2).unwrap();

        assert_eq!(fit.degree(), 2);
        let c = fit.coefficients();
        assert!((c[0] - 3.0).abs() < 1e-6, "{c:?}");
        assert!((c[1] - 0.5).abs() < 1e-8, "{c:?}");
        assert!((c[2] + 0.001).abs() < 1e-10, "{c:?}");

        let ahead = t0 + 600.0;
        assert!((fit.predict(ahead) - (3.0 + 300.0 - 360.0)).abs() < 1e-6);
    }

    #[test]
    fn straight_line_through_noise_free_points() {
        let points = [(0.0, 1.0), (1.0, 3.0), (2.0, 5.0), (3.0, 7.0)];
        let fit = PolynomialFit::fit(&points, 1).unwrap();
        assert!((fit.predict(10.0) - 21.0).abs() < 1e-9);
    }

    #[test]
    fn too_few_points_is_insufficient() {
        let points = [(0.0, 1.0), (1.0, 2.0)];
        assert_eq!(
            PolynomialFit::fit(&points, 2),
            Err(IndicatorError::InsufficientData { have: 2, need: 3 })
        );
    }

    #[test]
    fn repeated_time_is_singular() {
        let points = [(5.0, 1.0), (5.0, 2.0), (5.0, 3.0)];
        assert_eq!(PolynomialFit::fit(&points, 1), Err(IndicatorError::Singular));
    }

    #[test]
    fn candles_fit_on_seconds() {
        let candles: Vec<Candlestick> = (0..4)
            .map(|i| Candlestick {
                open: 0.0,
                high: 0.0,
                low: 0.0,
                close: 0.0,
                avg: 100.0 + i as f64,
                vol: 1.0,
                time: i * 60 * MICROS_PER_SEC,
                interval: 60,
            })
            .collect();
        let fit = PolynomialFit::from_candles(&candles, 1).unwrap();
        assert!((fit.predict(240.0) - 104.0).abs() < 1e-9);
    }
}
