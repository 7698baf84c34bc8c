use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::config::StatArbConfig;
use crate::error::EngineError;
use crate::model::{PortfolioWeights, PositionStatus};

const CAP_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortfolioParams {
    pub max_position_weight: f64,
    pub max_gross_leverage: f64,
    /// Gross weight (both legs) given to one open pair before capping.
    pub pair_gross_budget: f64,
}

impl PortfolioParams {
    /// Backtest sizing: each pair may use two full position slots.
    pub fn backtest(cfg: &StatArbConfig) -> Self {
        Self {
            max_position_weight: cfg.max_position_weight,
            max_gross_leverage: cfg.max_gross_leverage,
            pair_gross_budget: 2.0 * cfg.max_position_weight,
        }
    }

    /// Live sizing additionally honours the per-pair dollar exposure cap.
    pub fn live(cfg: &StatArbConfig) -> Self {
        let exposure_cap = if cfg.total_capital > 0.0 {
            cfg.max_exposure_per_pair / cfg.total_capital
        } else {
            f64::NAN
        };
        Self {
            max_position_weight: cfg.max_position_weight,
            max_gross_leverage: cfg.max_gross_leverage,
            pair_gross_budget: (2.0 * cfg.max_position_weight).min(exposure_cap),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenPair {
    pub ticker_a: String,
    pub ticker_b: String,
    pub hedge_ratio: f64,
    pub direction: PositionStatus,
    pub price_a: f64,
    pub price_b: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PortfolioConstructor {
    params: PortfolioParams,
}

impl PortfolioConstructor {
    pub fn new(params: PortfolioParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &PortfolioParams {
        &self.params
    }

    fn check_params(&self) -> Result<(), EngineError> {
        let p = &self.params;
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(p.max_position_weight) {
            return Err(EngineError::infeasible(format!(
                "max position weight {} must be positive",
                p.max_position_weight
            )));
        }
        if !positive(p.max_gross_leverage) {
            return Err(EngineError::infeasible(format!(
                "max gross leverage {} must be positive",
                p.max_gross_leverage
            )));
        }
        if !positive(p.pair_gross_budget) {
            return Err(EngineError::infeasible(format!(
                "per-pair budget {} leaves no room for a position",
                p.pair_gross_budget
            )));
        }
        Ok(())
    }

    /// Net dollar-neutral weights for the open book, per-leg clipped and
    /// proportionally de-levered.
    pub fn construct(&self, open: &[OpenPair]) -> Result<PortfolioWeights, EngineError> {
        self.check_params()?;
        let p = &self.params;
        let mut net: BTreeMap<String, f64> = BTreeMap::new();

        for pair in open {
            let sign = pair.direction.direction();
            if sign == 0.0 {
                continue;
            }
            let label = format!("{}/{}", pair.ticker_a, pair.ticker_b);
            let valid_price = |v: f64| v.is_finite() && v > 0.0;
            if !valid_price(pair.price_a) || !valid_price(pair.price_b) {
                return Err(EngineError::infeasible(format!(
                    "{}: no usable prices ({}, {})",
                    label, pair.price_a, pair.price_b
                )));
            }
            if !(pair.hedge_ratio.is_finite() && pair.hedge_ratio > 0.0) {
                return Err(EngineError::infeasible(format!(
                    "{}: hedge ratio {} cannot be dollar-neutral",
                    label, pair.hedge_ratio
                )));
            }
            // equal dollars per leg; the hedge ratio defines the spread, not the sizing
            let leg = p.pair_gross_budget / 2.0;
            let w_a = sign * leg;
            let w_b = -sign * leg;
            *net.entry(pair.ticker_a.clone()).or_insert(0.0) += w_a;
            *net.entry(pair.ticker_b.clone()).or_insert(0.0) += w_b;
        }

        for w in net.values_mut() {
            *w = w.clamp(-p.max_position_weight, p.max_position_weight);
        }

        let gross: f64 = net.values().map(|w| w.abs()).sum();
        if gross > p.max_gross_leverage {
            let scale = p.max_gross_leverage / gross;
            log::debug!(
                "[PORTFOLIO] gross {:.4} above {:.4}, scaling book by {:.4}",
                gross,
                p.max_gross_leverage,
                scale
            );
            for w in net.values_mut() {
                *w *= scale;
            }
        }

        let weights = PortfolioWeights::new(net);
        if weights.gross() > p.max_gross_leverage + CAP_TOLERANCE
            || weights.max_abs() > p.max_position_weight + CAP_TOLERANCE
        {
            return Err(EngineError::infeasible(format!(
                "book gross {:.6} / max leg {:.6} exceeds caps",
                weights.gross(),
                weights.max_abs()
            )));
        }
        Ok(weights)
    }
}

/// Whole-share targets for `weights` at `capital`, truncated toward zero.
pub fn share_targets(
    weights: &PortfolioWeights,
    capital: f64,
    prices: &BTreeMap<String, f64>,
) -> BTreeMap<String, Decimal> {
    let mut out = BTreeMap::new();
    for (ticker, w) in weights.iter() {
        let price = match prices.get(ticker) {
            Some(p) if *p > 0.0 => *p,
            _ => {
                log::warn!("[PORTFOLIO] no price for {}, target left unchanged", ticker);
                continue;
            }
        };
        let shares = Decimal::from_f64(w * capital / price)
            .map(|d| d.trunc())
            .unwrap_or(Decimal::ZERO);
        out.insert(ticker.clone(), shares);
    }
    out
}
