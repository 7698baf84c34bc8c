//! Regression and unit-root routines used by spread modelling and pair
//! discovery.
//!
//! The ADF implementation follows the usual construction: regress the first
//! difference on the lagged level, optional deterministic terms and lagged
//! differences; pick the lag count by AIC over a common sample, refit, and
//! read the t-value of the lagged level. P-values use MacKinnon's (1994)
//! response-surface approximation.

use nalgebra::{DMatrix, DVector};
use statrs::distribution::{ContinuousCDF, Normal};
use std::fmt;

const MIN_ADF_OBSERVATIONS: usize = 8;
const PERFECT_FIT_R2: f64 = 1.0 - 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub enum NumericalError {
    TooShort { needed: usize, available: usize },
    Singular(&'static str),
    Degenerate(String),
}

impl fmt::Display for NumericalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NumericalError::TooShort { needed, available } => {
                write!(f, "need {} observations, have {}", needed, available)
            }
            NumericalError::Singular(what) => write!(f, "singular design matrix in {}", what),
            NumericalError::Degenerate(reason) => f.write_str(reason),
        }
    }
}

impl std::error::Error for NumericalError {}

#[derive(Debug, Clone)]
pub struct OlsFit {
    pub coefficients: DVector<f64>,
    pub std_errors: DVector<f64>,
    pub rss: f64,
    pub tss: f64,
    pub nobs: usize,
}

impl OlsFit {
    pub fn t_value(&self, idx: usize) -> f64 {
        self.coefficients[idx] / self.std_errors[idx]
    }

    pub fn aic(&self) -> f64 {
        let n = self.nobs as f64;
        n * (self.rss / n).ln() + 2.0 * self.coefficients.len() as f64
    }

    pub fn r_squared(&self) -> f64 {
        if self.tss <= 0.0 {
            return 1.0;
        }
        1.0 - self.rss / self.tss
    }
}

pub fn ols(x: &DMatrix<f64>, y: &DVector<f64>, what: &'static str) -> Result<OlsFit, NumericalError> {
    let (nobs, k) = x.shape();
    if nobs <= k {
        return Err(NumericalError::TooShort {
            needed: k + 1,
            available: nobs,
        });
    }
    let xtx = x.transpose() * x;
    let xtx_inv = xtx.try_inverse().ok_or(NumericalError::Singular(what))?;
    let beta = &xtx_inv * (x.transpose() * y);
    let residuals = y - x * &beta;
    let rss = residuals.dot(&residuals);
    let y_mean = y.mean();
    let tss = y.iter().map(|v| (v - y_mean).powi(2)).sum::<f64>();
    if !rss.is_finite() || beta.iter().any(|b| !b.is_finite()) {
        return Err(NumericalError::Degenerate(format!(
            "non-finite estimate in {}",
            what
        )));
    }
    let sigma2 = rss / (nobs - k) as f64;
    let std_errors = DVector::from_iterator(
        k,
        (0..k).map(|i| (sigma2 * xtx_inv[(i, i)]).max(0.0).sqrt()),
    );
    Ok(OlsFit {
        coefficients: beta,
        std_errors,
        rss,
        tss,
        nobs,
    })
}

/// y = intercept + slope * x. Returns `(intercept, slope, fit)`.
pub fn linear_regression(y: &[f64], x: &[f64]) -> Result<(f64, f64, OlsFit), NumericalError> {
    let n = y.len().min(x.len());
    let design = DMatrix::from_fn(n, 2, |r, c| if c == 0 { 1.0 } else { x[r] });
    let target = DVector::from_column_slice(&y[..n]);
    let fit = ols(&design, &target, "linear regression")?;
    Ok((fit.coefficients[0], fit.coefficients[1], fit))
}

pub fn mean_std<'a, I>(values: I) -> Option<(f64, f64)>
where
    I: IntoIterator<Item = &'a f64>,
{
    let mut n = 0usize;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for v in values {
        n += 1;
        sum += v;
        sum_sq += v * v;
    }
    if n < 2 {
        return None;
    }
    let mean = sum / n as f64;
    let var = (sum_sq - n as f64 * mean * mean) / (n - 1) as f64;
    Some((mean, var.max(0.0).sqrt()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    None,
    Constant,
}

impl Trend {
    fn columns(self) -> usize {
        match self {
            Trend::None => 0,
            Trend::Constant => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdfResult {
    pub statistic: f64,
    pub p_value: f64,
    pub used_lag: usize,
    pub nobs: usize,
}

fn adf_design(
    levels: &[f64],
    diffs: &[f64],
    lags: usize,
    start: usize,
    trend: Trend,
) -> (DMatrix<f64>, DVector<f64>) {
    let rows = diffs.len() - start;
    let cols = 1 + lags + trend.columns();
    let x = DMatrix::from_fn(rows, cols, |r, c| {
        let t = start + r;
        match c {
            0 => levels[t],
            c if c <= lags => diffs[t - c],
            _ => 1.0,
        }
    });
    let y = DVector::from_column_slice(&diffs[start..]);
    (x, y)
}

/// `max_lag` defaults to `12 * (n / 100)^(1/4)` and is capped so the
/// regression keeps enough degrees of freedom.
pub fn adf(
    series: &[f64],
    max_lag: Option<usize>,
    trend: Trend,
    p_value_series: usize,
) -> Result<AdfResult, NumericalError> {
    let n = series.len();
    if n < MIN_ADF_OBSERVATIONS {
        return Err(NumericalError::TooShort {
            needed: MIN_ADF_OBSERVATIONS,
            available: n,
        });
    }
    let default_lag = (12.0 * (n as f64 / 100.0).powf(0.25)).ceil() as usize;
    let cap = (n / 2).saturating_sub(trend.columns() + 1);
    let max_lag = max_lag.unwrap_or(default_lag).min(cap);
    let diffs: Vec<f64> = series.windows(2).map(|w| w[1] - w[0]).collect();

    let mut best: Option<(f64, usize)> = None;
    for lags in 0..=max_lag {
        let (x, y) = adf_design(series, &diffs, lags, max_lag, trend);
        let aic = match ols(&x, &y, "adf lag search") {
            Ok(fit) if fit.rss > 0.0 => fit.aic(),
            Ok(_) => continue,
            Err(NumericalError::Singular(_)) => continue,
            Err(e) => return Err(e),
        };
        if best.map_or(true, |(b, _)| aic < b) {
            best = Some((aic, lags));
        }
    }
    let (_, used_lag) =
        best.ok_or_else(|| NumericalError::Degenerate("no usable ADF lag order".to_string()))?;

    let (x, y) = adf_design(series, &diffs, used_lag, used_lag, trend);
    let fit = ols(&x, &y, "adf regression")?;
    if fit.std_errors[0] <= 0.0 {
        return Err(NumericalError::Degenerate(
            "zero standard error on lagged level".to_string(),
        ));
    }
    let statistic = fit.t_value(0);
    Ok(AdfResult {
        statistic,
        p_value: mackinnon_p_value(statistic, p_value_series),
        used_lag,
        nobs: fit.nobs,
    })
}

// MacKinnon (1994) tables, constant-only regression, indexed by number of
// series minus one.
const TAU_MAX: [f64; 2] = [2.74, 0.92];
const TAU_MIN: [f64; 2] = [-18.83, -18.86];
const TAU_STAR: [f64; 2] = [-1.61, -2.62];
const TAU_SMALL_P: [[f64; 3]; 2] = [[2.1659, 1.4412, 0.038269], [2.92, 1.5012, 0.039796]];
const TAU_LARGE_P: [[f64; 4]; 2] = [
    [1.7339, 0.93202, -0.12745, -0.010368],
    [2.1945, 0.64695, -0.29903, -0.016748],
];

/// Approximate p-value of a Dickey-Fuller statistic for `n_series` (1 or 2)
/// integrated series, constant-only regression.
pub fn mackinnon_p_value(statistic: f64, n_series: usize) -> f64 {
    let idx = n_series.clamp(1, 2) - 1;
    if statistic.is_nan() {
        return 1.0;
    }
    if statistic > TAU_MAX[idx] {
        return 1.0;
    }
    if statistic < TAU_MIN[idx] {
        return 0.0;
    }
    let poly = |coefs: &[f64]| {
        coefs
            .iter()
            .rev()
            .fold(0.0, |acc, c| acc * statistic + c)
    };
    let z = if statistic <= TAU_STAR[idx] {
        poly(&TAU_SMALL_P[idx])
    } else {
        poly(&TAU_LARGE_P[idx])
    };
    match Normal::new(0.0, 1.0) {
        Ok(normal) => normal.cdf(z),
        Err(_) => 1.0,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CointegrationResult {
    pub statistic: f64,
    pub p_value: f64,
    pub hedge_ratio: f64,
    pub intercept: f64,
    pub residuals: Vec<f64>,
}

pub fn engle_granger(y: &[f64], x: &[f64]) -> Result<CointegrationResult, NumericalError> {
    if y.len() != x.len() {
        return Err(NumericalError::Degenerate(format!(
            "series lengths differ ({} vs {})",
            y.len(),
            x.len()
        )));
    }
    let (intercept, hedge_ratio, fit) = linear_regression(y, x)?;
    if fit.r_squared() >= PERFECT_FIT_R2 {
        return Err(NumericalError::Degenerate(
            "series are (almost) perfectly collinear".to_string(),
        ));
    }
    let residuals: Vec<f64> = y
        .iter()
        .zip(x)
        .map(|(yi, xi)| yi - intercept - hedge_ratio * xi)
        .collect();
    let test = adf(&residuals, None, Trend::None, 2)?;
    Ok(CointegrationResult {
        statistic: test.statistic,
        p_value: mackinnon_p_value(test.statistic, 2),
        hedge_ratio,
        intercept,
        residuals,
    })
}

/// Bars for the spread to decay halfway, from an AR(1) fit of its changes.
/// `None` when the fitted process does not mean-revert.
pub fn half_life(spread: &[f64]) -> Option<f64> {
    if spread.len() < 3 {
        return None;
    }
    let lagged = &spread[..spread.len() - 1];
    let changes: Vec<f64> = spread.windows(2).map(|w| w[1] - w[0]).collect();
    let (_, phi, _) = linear_regression(&changes, lagged).ok()?;
    let ar_coef = 1.0 + phi;
    if ar_coef <= 0.0 || ar_coef >= 1.0 {
        return None;
    }
    let hl = -(2.0_f64).ln() / ar_coef.ln();
    (hl.is_finite() && hl > 0.0).then_some(hl)
}
