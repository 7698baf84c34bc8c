use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ops::Range;

use crate::error::EngineError;

/// Timestamps are strictly increasing. Missing bars are simply absent, they
/// are never filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceSeries {
    ticker: String,
    points: Vec<(DateTime<Utc>, f64)>,
}

impl PriceSeries {
    pub fn new(ticker: &str, points: Vec<(DateTime<Utc>, f64)>) -> Result<Self, EngineError> {
        for w in points.windows(2) {
            if w[1].0 <= w[0].0 {
                return Err(EngineError::data_unavailable(format!(
                    "{}: timestamps not strictly increasing at {}",
                    ticker, w[1].0
                )));
            }
        }
        if let Some((ts, price)) = points.iter().find(|(_, p)| !p.is_finite() || *p <= 0.0) {
            return Err(EngineError::data_unavailable(format!(
                "{}: invalid price {} at {}",
                ticker, price, ts
            )));
        }
        Ok(Self {
            ticker: ticker.to_string(),
            points,
        })
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[(DateTime<Utc>, f64)] {
        &self.points
    }

    pub fn last(&self) -> Option<(DateTime<Utc>, f64)> {
        self.points.last().copied()
    }

    pub fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> PriceSeries {
        PriceSeries {
            ticker: self.ticker.clone(),
            points: self
                .points
                .iter()
                .filter(|(ts, _)| *ts >= start && *ts <= end)
                .copied()
                .collect(),
        }
    }

    pub fn tail(&self, len: usize) -> PriceSeries {
        let start = self.points.len().saturating_sub(len);
        PriceSeries {
            ticker: self.ticker.clone(),
            points: self.points[start..].to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlignedPrices {
    pub timestamps: Vec<DateTime<Utc>>,
    pub a: Vec<f64>,
    pub b: Vec<f64>,
}

impl AlignedPrices {
    pub fn align(a: &PriceSeries, b: &PriceSeries) -> Self {
        let mut out = AlignedPrices::default();
        let (mut i, mut j) = (0, 0);
        let (pa, pb) = (a.points(), b.points());
        while i < pa.len() && j < pb.len() {
            match pa[i].0.cmp(&pb[j].0) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    out.timestamps.push(pa[i].0);
                    out.a.push(pa[i].1);
                    out.b.push(pb[j].1);
                    i += 1;
                    j += 1;
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// All tickers on one master calendar (union of their timestamps).
#[derive(Debug, Clone, Default)]
pub struct PricePanel {
    calendar: Vec<DateTime<Utc>>,
    columns: BTreeMap<String, Vec<Option<f64>>>,
}

impl PricePanel {
    pub fn from_series(series: &HashMap<String, PriceSeries>) -> Self {
        let calendar: Vec<DateTime<Utc>> = series
            .values()
            .flat_map(|s| s.points().iter().map(|(ts, _)| *ts))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let index: HashMap<DateTime<Utc>, usize> = calendar
            .iter()
            .enumerate()
            .map(|(i, ts)| (*ts, i))
            .collect();
        let mut columns = BTreeMap::new();
        for (ticker, s) in series {
            let mut column = vec![None; calendar.len()];
            for (ts, price) in s.points() {
                column[index[ts]] = Some(*price);
            }
            columns.insert(ticker.clone(), column);
        }
        Self { calendar, columns }
    }

    pub fn len(&self) -> usize {
        self.calendar.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calendar.is_empty()
    }

    pub fn calendar(&self) -> &[DateTime<Utc>] {
        &self.calendar
    }

    pub fn tickers(&self) -> impl Iterator<Item = &String> {
        self.columns.keys()
    }

    pub fn price(&self, ticker: &str, bar: usize) -> Option<f64> {
        self.columns.get(ticker).and_then(|c| c.get(bar).copied().flatten())
    }

    pub fn series(&self, ticker: &str, bars: Range<usize>) -> Option<PriceSeries> {
        let column = self.columns.get(ticker)?;
        let points = bars
            .filter_map(|i| column.get(i).copied().flatten().map(|p| (self.calendar[i], p)))
            .collect();
        Some(PriceSeries {
            ticker: ticker.to_string(),
            points,
        })
    }

    pub fn slice(&self, bars: Range<usize>) -> HashMap<String, PriceSeries> {
        self.columns
            .keys()
            .filter_map(|t| self.series(t, bars.clone()).map(|s| (t.clone(), s)))
            .collect()
    }
}

/// Unordered pair identity, always stored with the tickers sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey(String, String);

impl PairKey {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            PairKey(a.to_string(), b.to_string())
        } else {
            PairKey(b.to_string(), a.to_string())
        }
    }

    pub fn tickers(&self) -> (&str, &str) {
        (&self.0, &self.1)
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.0, self.1)
    }
}

/// A selected pair. Spread is `price_a - hedge_ratio * price_b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pair {
    pub ticker_a: String,
    pub ticker_b: String,
    pub hedge_ratio: f64,
    pub p_value: f64,
    pub adf_p_value: f64,
    pub half_life: f64,
    pub sector: String,
    pub discovered_at: DateTime<Utc>,
}

impl Pair {
    pub fn key(&self) -> PairKey {
        PairKey::new(&self.ticker_a, &self.ticker_b)
    }

    pub fn label(&self) -> String {
        format!("{}/{}", self.ticker_a, self.ticker_b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpreadObservation {
    pub timestamp: DateTime<Utc>,
    pub spread: f64,
    pub z_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Flat,
    LongSpread,
    ShortSpread,
    Cooldown,
}

impl PositionStatus {
    pub fn is_directional(self) -> bool {
        matches!(self, PositionStatus::LongSpread | PositionStatus::ShortSpread)
    }

    pub fn direction(self) -> f64 {
        match self {
            PositionStatus::LongSpread => 1.0,
            PositionStatus::ShortSpread => -1.0,
            _ => 0.0,
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PositionStatus::Flat => "FLAT",
            PositionStatus::LongSpread => "LONG_SPREAD",
            PositionStatus::ShortSpread => "SHORT_SPREAD",
            PositionStatus::Cooldown => "COOLDOWN",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub status: PositionStatus,
    pub entry_bar_index: Option<u64>,
    pub entry_time: Option<DateTime<Utc>>,
    pub entry_z_score: Option<f64>,
    pub bars_held: u32,
    pub cooldown_remaining: u32,
    /// Set when an exit could not be confirmed by the broker.
    #[serde(default)]
    pub needs_attention: bool,
}

impl Default for PositionState {
    fn default() -> Self {
        Self::flat()
    }
}

impl PositionState {
    pub fn flat() -> Self {
        Self {
            status: PositionStatus::Flat,
            entry_bar_index: None,
            entry_time: None,
            entry_z_score: None,
            bars_held: 0,
            cooldown_remaining: 0,
            needs_attention: false,
        }
    }

    pub fn opened(
        status: PositionStatus,
        bar_index: u64,
        at: DateTime<Utc>,
        z_score: Option<f64>,
    ) -> Self {
        Self {
            status,
            entry_bar_index: Some(bar_index),
            entry_time: Some(at),
            entry_z_score: z_score,
            bars_held: 0,
            cooldown_remaining: 0,
            needs_attention: false,
        }
    }

    pub fn cooling(bars: u32) -> Self {
        Self {
            status: PositionStatus::Cooldown,
            cooldown_remaining: bars,
            ..Self::flat()
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.is_directional()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    Entry,
    SoftExit,
    HardStop,
    TimeStop,
    CooldownElapsed,
    Deselected,
    Reconciled,
}

impl TransitionReason {
    pub fn is_forced_exit(self) -> bool {
        matches!(self, TransitionReason::HardStop | TransitionReason::TimeStop)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub pair: String,
    pub from: PositionStatus,
    pub to: PositionStatus,
    pub reason: TransitionReason,
    pub timestamp: DateTime<Utc>,
    pub bar_index: u64,
    pub z_score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioWeights(BTreeMap<String, f64>);

impl PortfolioWeights {
    pub fn new(weights: BTreeMap<String, f64>) -> Self {
        Self(weights)
    }

    pub fn get(&self, ticker: &str) -> f64 {
        self.0.get(ticker).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    pub fn tickers(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn gross(&self) -> f64 {
        self.0.values().map(|w| w.abs()).sum()
    }

    pub fn net(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn max_abs(&self) -> f64 {
        self.0.values().fold(0.0, |acc, w| acc.max(w.abs()))
    }
}

/// Bar-index bounds of one train/trade cycle, half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeWindow {
    pub train_start: usize,
    pub train_end: usize,
    pub trade_start: usize,
    pub trade_end: usize,
}

impl TradeWindow {
    pub fn train_range(&self) -> Range<usize> {
        self.train_start..self.train_end
    }

    pub fn trade_range(&self) -> Range<usize> {
        self.trade_start..self.trade_end
    }
}
