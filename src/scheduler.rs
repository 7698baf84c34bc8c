use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::Arc;

use crate::config::StatArbConfig;
use crate::discovery::{DiscoveryFailure, DiscoveryParams, PairDiscovery};
use crate::model::{
    AlignedPrices, Pair, PairKey, PortfolioWeights, PositionState, PricePanel, PriceSeries,
    SignalEvent, TradeWindow, TransitionReason,
};
use crate::portfolio::{OpenPair, PortfolioConstructor, PortfolioParams};
use crate::ports::price_provider::PriceProvider;
use crate::signal::{SignalEngine, SignalParams};
use crate::spread::{RollingSpread, SpreadModel};

/// Contiguous (train, trade) windows over `bars` bars.
///
/// The first trade slice starts right after the first `training` bars; each
/// following window moves by exactly `trading` bars and the last trade slice
/// may be shorter.
pub fn walk_forward_windows(bars: usize, training: usize, trading: usize) -> Vec<TradeWindow> {
    let mut windows = Vec::new();
    if training == 0 || trading == 0 {
        return windows;
    }
    let mut trade_start = training;
    while trade_start < bars {
        let trade_end = (trade_start + trading).min(bars);
        windows.push(TradeWindow {
            train_start: trade_start - training,
            train_end: trade_start,
            trade_start,
            trade_end,
        });
        trade_start = trade_end;
    }
    windows
}

#[derive(Debug, Clone, Serialize)]
pub struct BarRecord {
    pub timestamp: DateTime<Utc>,
    pub bar_index: usize,
    /// Previous bar's weights times this bar's simple returns.
    pub portfolio_return: f64,
    pub gross_leverage: f64,
    pub net_exposure: f64,
    pub selected_pairs: usize,
    pub open_pairs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowRecord {
    pub index: usize,
    pub train_start: DateTime<Utc>,
    pub train_end: DateTime<Utc>,
    pub trade_start: DateTime<Utc>,
    pub trade_end: DateTime<Utc>,
    pub tested: usize,
    pub candidates: usize,
    pub pairs: Vec<Pair>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub windows: Vec<WindowRecord>,
    pub bars: Vec<BarRecord>,
    pub events: Vec<SignalEvent>,
    pub failures: Vec<DiscoveryFailure>,
}

impl BacktestReport {
    pub fn write_json(&self, path: &str) -> Result<()> {
        let payload = serde_json::to_string_pretty(self).context("failed to encode report")?;
        fs::write(path, payload).with_context(|| format!("failed to write report {}", path))?;
        log::info!("[WALK] report written to {}", path);
        Ok(())
    }

    pub fn cumulative_return(&self) -> f64 {
        self.bars
            .iter()
            .fold(1.0, |acc, bar| acc * (1.0 + bar.portfolio_return))
            - 1.0
    }
}

struct ActivePair {
    pair: Pair,
    model: SpreadModel,
    state: PositionState,
    rolling: RollingSpread,
}

pub struct Backtester {
    training_window: usize,
    trading_window: usize,
    workers: usize,
    discovery: PairDiscovery,
    signals: SignalEngine,
    portfolio: PortfolioConstructor,
}

impl Backtester {
    pub fn new(cfg: &StatArbConfig) -> Self {
        Self {
            training_window: cfg.training_window,
            trading_window: cfg.trading_window,
            workers: cfg.discovery_workers,
            discovery: PairDiscovery::new(DiscoveryParams::from(cfg), cfg.sectors.clone()),
            signals: SignalEngine::new(SignalParams::from(cfg)),
            portfolio: PortfolioConstructor::new(PortfolioParams::backtest(cfg)),
        }
    }

    /// Fetch the configured range (or everything the provider holds) and walk it.
    pub async fn run_with_provider(
        &self,
        cfg: &StatArbConfig,
        provider: &dyn PriceProvider,
    ) -> Result<BacktestReport> {
        let (start, end) = match (cfg.start, cfg.end, provider.coverage()) {
            (Some(start), Some(end), _) => (start, end),
            (start, end, Some((first, last))) => (start.unwrap_or(first), end.unwrap_or(last)),
            _ => bail!("backtest needs BACKTEST_START/BACKTEST_END for this price provider"),
        };
        log::info!(
            "[WALK] fetching {} tickers for {}..{}",
            cfg.universe.len(),
            start,
            end
        );
        let prices = provider
            .get_prices(&cfg.universe, start, end)
            .await
            .context("backtest price history unavailable")?;
        self.run(&PricePanel::from_series(&prices)).await
    }

    pub async fn run(&self, panel: &PricePanel) -> Result<BacktestReport> {
        let windows = walk_forward_windows(panel.len(), self.training_window, self.trading_window);
        if windows.is_empty() {
            bail!(
                "history of {} bars is too short for a {}-bar training window",
                panel.len(),
                self.training_window
            );
        }
        let calendar = panel.calendar();
        let mut report = BacktestReport {
            start: calendar[0],
            end: calendar[calendar.len() - 1],
            windows: Vec::with_capacity(windows.len()),
            bars: Vec::new(),
            events: Vec::new(),
            failures: Vec::new(),
        };
        let mut active: BTreeMap<PairKey, ActivePair> = BTreeMap::new();
        let mut weights = PortfolioWeights::default();

        for (index, window) in windows.iter().enumerate() {
            let window_start = calendar[window.trade_start];
            let training = panel.slice(window.train_range());
            let outcome = if self.workers > 1 {
                self.discovery
                    .scan_parallel(Arc::new(training.clone()), window_start, self.workers)
                    .await
            } else {
                self.discovery.scan(&training, window_start)
            };
            log::info!(
                "[WALK] window {} train {}..{} trade {}..{}: {} pairs selected ({} tested)",
                index,
                calendar[window.train_start],
                calendar[window.train_end - 1],
                window_start,
                calendar[window.trade_end - 1],
                outcome.pairs.len(),
                outcome.tested
            );

            self.refresh(
                &mut active,
                &outcome.pairs,
                &training,
                window.trade_start as u64,
                window_start,
                &mut report.events,
            );
            report.windows.push(WindowRecord {
                index,
                train_start: calendar[window.train_start],
                train_end: calendar[window.train_end - 1],
                trade_start: window_start,
                trade_end: calendar[window.trade_end - 1],
                tested: outcome.tested,
                candidates: outcome.candidates,
                pairs: outcome.pairs,
            });
            report.failures.extend(outcome.failures);

            for bar in window.trade_range() {
                let record = self.step(panel, bar, &mut active, &mut weights, &mut report.events);
                report.bars.push(record);
            }
        }

        log::info!(
            "[WALK] finished {} windows, {} bars, {} signal events, cumulative return {:.4}",
            report.windows.len(),
            report.bars.len(),
            report.events.len(),
            report.cumulative_return()
        );
        Ok(report)
    }

    /// Swap in a window's selection. Deselected open pairs are flattened;
    /// kept pairs carry their position but take the new hedge ratio.
    fn refresh(
        &self,
        active: &mut BTreeMap<PairKey, ActivePair>,
        selected: &[Pair],
        training: &HashMap<String, PriceSeries>,
        bar_index: u64,
        at: DateTime<Utc>,
        events: &mut Vec<SignalEvent>,
    ) {
        let keep: BTreeMap<PairKey, &Pair> = selected.iter().map(|p| (p.key(), p)).collect();
        let dropped: Vec<PairKey> = active
            .keys()
            .filter(|k| !keep.contains_key(*k))
            .cloned()
            .collect();
        for key in dropped {
            if let Some(mut old) = active.remove(&key) {
                let label = old.pair.label();
                let z = old.rolling.z_score();
                if let Some(ev) = self.signals.force_flatten(
                    &label,
                    &mut old.state,
                    TransitionReason::Deselected,
                    bar_index,
                    at,
                    z,
                ) {
                    events.push(ev);
                }
            }
        }

        for (key, pair) in keep {
            let model = SpreadModel::for_pair(pair, self.training_window);
            let spreads = match (training.get(&pair.ticker_a), training.get(&pair.ticker_b)) {
                (Some(a), Some(b)) => model.spread_series(&AlignedPrices::align(a, b)),
                _ => Vec::new(),
            };
            let rolling = RollingSpread::seeded(self.training_window, &spreads);
            let state = active
                .remove(&key)
                .map(|old| old.state)
                .unwrap_or_default();
            active.insert(
                key,
                ActivePair {
                    pair: pair.clone(),
                    model,
                    state,
                    rolling,
                },
            );
        }
    }

    fn step(
        &self,
        panel: &PricePanel,
        bar: usize,
        active: &mut BTreeMap<PairKey, ActivePair>,
        weights: &mut PortfolioWeights,
        events: &mut Vec<SignalEvent>,
    ) -> BarRecord {
        let at = panel.calendar()[bar];
        let portfolio_return: f64 = if bar == 0 {
            0.0
        } else {
            weights
                .iter()
                .map(|(ticker, w)| {
                    match (panel.price(ticker, bar - 1), panel.price(ticker, bar)) {
                        (Some(prev), Some(now)) => w * (now / prev - 1.0),
                        _ => 0.0,
                    }
                })
                .sum()
        };

        let mut open = Vec::new();
        for entry in active.values_mut() {
            let label = entry.pair.label();
            let z = match (
                panel.price(&entry.pair.ticker_a, bar),
                panel.price(&entry.pair.ticker_b, bar),
            ) {
                (Some(pa), Some(pb)) => entry.rolling.push(entry.model.spread(pa, pb)),
                _ => {
                    log::debug!("[WALK] {} missing price at {}", label, at);
                    None
                }
            };
            if let Some(ev) = self
                .signals
                .on_bar(&label, &mut entry.state, z, bar as u64, at)
            {
                events.push(ev);
            }
            if entry.state.is_open() {
                let price_a = last_price(panel, &entry.pair.ticker_a, bar);
                let price_b = last_price(panel, &entry.pair.ticker_b, bar);
                if let (Some(price_a), Some(price_b)) = (price_a, price_b) {
                    open.push(OpenPair {
                        ticker_a: entry.pair.ticker_a.clone(),
                        ticker_b: entry.pair.ticker_b.clone(),
                        hedge_ratio: entry.pair.hedge_ratio,
                        direction: entry.state.status,
                        price_a,
                        price_b,
                    });
                }
            }
        }

        match self.portfolio.construct(&open) {
            Ok(next) => *weights = next,
            Err(err) => log::warn!("[PORTFOLIO] {} at {}, weights held", err, at),
        }

        BarRecord {
            timestamp: at,
            bar_index: bar,
            portfolio_return,
            gross_leverage: weights.gross(),
            net_exposure: weights.net(),
            selected_pairs: active.len(),
            open_pairs: open.len(),
        }
    }
}

fn last_price(panel: &PricePanel, ticker: &str, bar: usize) -> Option<f64> {
    (0..=bar).rev().find_map(|i| panel.price(ticker, i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PositionStatus;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    #[test]
    fn windows_tile_history_after_first_training_slice() {
        let windows = walk_forward_windows(100, 30, 20);
        let trade_starts: Vec<usize> = windows.iter().map(|w| w.trade_start).collect();
        assert_eq!(trade_starts, vec![30, 50, 70, 90]);
        let last = windows.last().unwrap();
        assert_eq!(last.trade_end, 100);
        assert_eq!(last.train_range(), 60..90);
    }

    #[test]
    fn too_short_history_has_no_windows() {
        assert!(walk_forward_windows(30, 30, 5).is_empty());
        assert!(walk_forward_windows(100, 30, 0).is_empty());
    }

    proptest! {
        #[test]
        fn windows_are_contiguous_and_never_look_ahead(
            bars in 0usize..600,
            training in 1usize..120,
            trading in 1usize..90,
        ) {
            let windows = walk_forward_windows(bars, training, trading);
            let mut expected_start = training;
            for w in &windows {
                prop_assert_eq!(w.trade_start, expected_start);
                prop_assert_eq!(w.train_end, w.trade_start);
                prop_assert_eq!(w.train_end - w.train_start, training);
                prop_assert!(w.trade_end > w.trade_start);
                prop_assert!(w.trade_end - w.trade_start <= trading);
                expected_start = w.trade_end;
            }
            if bars > training {
                prop_assert_eq!(expected_start, bars);
            } else {
                prop_assert!(windows.is_empty());
            }
        }
    }

    fn cfg() -> StatArbConfig {
        let mut cfg = StatArbConfig::with_trading_window(40);
        cfg.training_window = 120;
        cfg.universe = vec!["KO".into(), "PEP".into()];
        cfg.sectors = [("KO", "Staples"), ("PEP", "Staples")]
            .iter()
            .map(|(t, s)| (t.to_string(), s.to_string()))
            .collect();
        cfg.discovery_workers = 1;
        cfg
    }

    fn cointegrated_panel(bars: usize) -> PricePanel {
        let base = crate::stats::tests::ar1(11, bars, 1.0, 1.0);
        let noise = crate::stats::tests::ar1(12, bars, 0.3, 1.0);
        let t0 = Utc.with_ymd_and_hms(2021, 1, 4, 0, 0, 0).unwrap();
        let stamp = |i: usize| t0 + Duration::days(i as i64);
        let pep: Vec<(DateTime<Utc>, f64)> =
            (0..bars).map(|i| (stamp(i), 100.0 + base[i])).collect();
        let ko: Vec<(DateTime<Utc>, f64)> = (0..bars)
            .map(|i| (stamp(i), 20.0 + 1.5 * (100.0 + base[i]) + noise[i]))
            .collect();
        let mut series = HashMap::new();
        series.insert("KO".to_string(), PriceSeries::new("KO", ko).unwrap());
        series.insert("PEP".to_string(), PriceSeries::new("PEP", pep).unwrap());
        PricePanel::from_series(&series)
    }

    #[tokio::test]
    async fn backtest_covers_every_trade_bar_once() {
        let panel = cointegrated_panel(300);
        let report = Backtester::new(&cfg()).run(&panel).await.unwrap();
        assert_eq!(report.windows.len(), 5);
        assert_eq!(report.bars.len(), 300 - 120);
        let indices: Vec<usize> = report.bars.iter().map(|b| b.bar_index).collect();
        assert_eq!(indices, (120..300).collect::<Vec<_>>());
        assert!(report.windows.iter().any(|w| !w.pairs.is_empty()));
        for bar in &report.bars {
            assert!(bar.gross_leverage <= 4.0 + 1e-9);
        }
    }

    #[tokio::test]
    async fn short_history_is_rejected() {
        let panel = cointegrated_panel(100);
        assert!(Backtester::new(&cfg()).run(&panel).await.is_err());
    }

    #[test]
    fn deselected_open_pair_is_flattened_with_an_event() {
        let cfg = cfg();
        let bt = Backtester::new(&cfg);
        let at = Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap();
        let pair = Pair {
            ticker_a: "KO".into(),
            ticker_b: "PEP".into(),
            hedge_ratio: 1.5,
            p_value: 0.01,
            adf_p_value: 0.01,
            half_life: 5.0,
            sector: "Staples".into(),
            discovered_at: at,
        };
        let mut active = BTreeMap::new();
        active.insert(
            pair.key(),
            ActivePair {
                model: SpreadModel::for_pair(&pair, 120),
                state: PositionState::opened(PositionStatus::LongSpread, 3, at, Some(-2.2)),
                rolling: RollingSpread::new(120),
                pair,
            },
        );
        let mut events = Vec::new();
        bt.refresh(&mut active, &[], &HashMap::new(), 160, at, &mut events);
        assert!(active.is_empty());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, TransitionReason::Deselected);
        assert_eq!(events[0].to, PositionStatus::Flat);
    }
}
