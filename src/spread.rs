use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use crate::error::EngineError;
use crate::model::{AlignedPrices, Pair, SpreadObservation};
use crate::stats::{linear_regression, mean_std};

const MIN_STD: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpreadModel {
    pub hedge_ratio: f64,
    pub lookback: usize,
}

impl SpreadModel {
    pub fn fit(pair: &str, prices: &AlignedPrices, lookback: usize) -> Result<Self, EngineError> {
        if prices.len() < lookback || prices.len() < 3 {
            return Err(EngineError::insufficient(pair, lookback.max(3), prices.len()));
        }
        let (_, slope, _) = linear_regression(&prices.a, &prices.b)
            .map_err(|e| EngineError::numerical(pair, e.to_string()))?;
        Ok(Self {
            hedge_ratio: slope,
            lookback,
        })
    }

    pub fn for_pair(pair: &Pair, lookback: usize) -> Self {
        Self {
            hedge_ratio: pair.hedge_ratio,
            lookback,
        }
    }

    pub fn spread(&self, price_a: f64, price_b: f64) -> f64 {
        price_a - self.hedge_ratio * price_b
    }

    pub fn spread_series(&self, prices: &AlignedPrices) -> Vec<f64> {
        prices
            .a
            .iter()
            .zip(&prices.b)
            .map(|(a, b)| self.spread(*a, *b))
            .collect()
    }

    pub fn observations(&self, prices: &AlignedPrices) -> Vec<SpreadObservation> {
        let spreads = self.spread_series(prices);
        let z = rolling_z_scores(&spreads, self.lookback);
        prices
            .timestamps
            .iter()
            .zip(spreads)
            .zip(z)
            .map(|((ts, spread), z_score)| SpreadObservation {
                timestamp: *ts,
                spread,
                z_score,
            })
            .collect()
    }
}

/// Trailing z-score at every bar; the window ends at (and includes) the bar.
/// `None` until `lookback` spreads are available.
pub fn rolling_z_scores(spreads: &[f64], lookback: usize) -> Vec<Option<f64>> {
    let mut window = RollingSpread::new(lookback);
    spreads.iter().map(|s| window.push(*s)).collect()
}

fn z_of(value: f64, mean: f64, std: f64) -> f64 {
    if std < MIN_STD {
        0.0
    } else {
        (value - mean) / std
    }
}

#[derive(Debug, Clone)]
pub struct RollingSpread {
    history: VecDeque<f64>,
    lookback: usize,
    last_timestamp: Option<DateTime<Utc>>,
}

impl RollingSpread {
    pub fn new(lookback: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(lookback + 1),
            lookback: lookback.max(2),
            last_timestamp: None,
        }
    }

    pub fn seeded(lookback: usize, spreads: &[f64]) -> Self {
        let mut out = Self::new(lookback);
        for s in spreads {
            out.push(*s);
        }
        out
    }

    /// Seed from history whose last bar is stamped `last`, so a re-polled
    /// copy of that bar is not counted twice.
    pub fn seeded_until(lookback: usize, spreads: &[f64], last: Option<DateTime<Utc>>) -> Self {
        let mut out = Self::seeded(lookback, spreads);
        out.last_timestamp = last;
        out
    }

    pub fn push(&mut self, spread: f64) -> Option<f64> {
        self.history.push_back(spread);
        while self.history.len() > self.lookback {
            self.history.pop_front();
        }
        self.z_score()
    }

    pub fn push_at(&mut self, at: DateTime<Utc>, spread: f64) -> Option<f64> {
        if self.last_timestamp.map_or(false, |last| at <= last) {
            return self.z_score();
        }
        self.last_timestamp = Some(at);
        self.push(spread)
    }

    pub fn z_score(&self) -> Option<f64> {
        if self.history.len() < self.lookback {
            return None;
        }
        let (mean, std) = mean_std(self.history.iter())?;
        let last = *self.history.back()?;
        Some(z_of(last, mean, std))
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::tests::ar1;
    use chrono::{Duration, TimeZone};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn synthetic_pair(seed: u64, n: usize, beta: f64) -> AlignedPrices {
        let mut rng = StdRng::seed_from_u64(seed);
        let step = Normal::new(0.0, 1.0).unwrap();
        let noise = ar1(seed + 100, n, 0.5, 0.5);
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let mut b = 100.0;
        let mut out = AlignedPrices::default();
        for i in 0..n {
            b += step.sample(&mut rng);
            out.timestamps.push(start + Duration::days(i as i64));
            out.b.push(b);
            out.a.push(5.0 + beta * b + noise[i]);
        }
        out
    }

    #[test]
    fn hedge_ratio_converges_as_window_grows() {
        let beta = 1.5;
        let short = synthetic_pair(42, 60, beta);
        let long = synthetic_pair(42, 2000, beta);
        let short_fit = SpreadModel::fit("A/B", &short, 60).unwrap();
        let long_fit = SpreadModel::fit("A/B", &long, 252).unwrap();
        assert!((long_fit.hedge_ratio - beta).abs() < 0.02);
        assert!((long_fit.hedge_ratio - beta).abs() <= (short_fit.hedge_ratio - beta).abs() + 0.02);
    }

    #[test]
    fn fit_requires_training_window() {
        let prices = synthetic_pair(1, 100, 1.0);
        let err = SpreadModel::fit("A/B", &prices, 252).unwrap_err();
        assert_eq!(err, EngineError::insufficient("A/B", 252, 100));
    }

    #[test]
    fn z_scores_never_look_ahead() {
        let prices = synthetic_pair(9, 300, 1.2);
        let model = SpreadModel::fit("A/B", &prices, 50).unwrap();
        let before = model.observations(&prices);

        let mut perturbed = prices.clone();
        for p in perturbed.a.iter_mut().skip(200) {
            *p *= 3.0;
        }
        let after = model.observations(&perturbed);
        for i in 0..200 {
            assert_eq!(before[i].z_score, after[i].z_score, "bar {}", i);
        }
        assert_ne!(before[250].z_score, after[250].z_score);
    }

    #[test]
    fn z_score_waits_for_full_window() {
        let z = rolling_z_scores(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(z[0], None);
        assert_eq!(z[1], None);
        assert!(z[2].is_some());
    }

    #[test]
    fn flat_spread_has_zero_z() {
        let mut rolling = RollingSpread::seeded(5, &[2.0; 5]);
        assert_eq!(rolling.push(2.0), Some(0.0));
    }

    #[test]
    fn push_at_ignores_stale_timestamps() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap();
        let mut rolling = RollingSpread::new(3);
        rolling.push_at(t0, 1.0);
        rolling.push_at(t0, 5.0);
        assert_eq!(rolling.len(), 1);
        rolling.push_at(t0 + Duration::minutes(5), 2.0);
        assert_eq!(rolling.len(), 2);
    }
}
