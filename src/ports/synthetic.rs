use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;

use crate::config::StatArbConfig;
use crate::error::EngineError;
use crate::model::PriceSeries;
use crate::ports::price_provider::PriceProvider;

const FACTOR_VOL: f64 = 0.01;
const NOISE_PHI: f64 = 0.8;
const NOISE_SIGMA: f64 = 0.5;
const MIN_PRICE: f64 = 0.01;

#[derive(Debug, Clone)]
struct TickerModel {
    factor: usize,
    loading: f64,
    offset: f64,
    noise: f64,
}

#[derive(Debug)]
struct Generator {
    rng: StdRng,
    factors: Vec<f64>,
    tickers: BTreeMap<String, TickerModel>,
    bars: Vec<BTreeMap<String, f64>>,
}

impl Generator {
    fn step(&mut self) {
        for f in self.factors.iter_mut() {
            let z: f64 = self.rng.sample(StandardNormal);
            *f *= (FACTOR_VOL * z).exp();
        }
        let mut bar = BTreeMap::new();
        for (ticker, model) in self.tickers.iter_mut() {
            let z: f64 = self.rng.sample(StandardNormal);
            model.noise = NOISE_PHI * model.noise + NOISE_SIGMA * z;
            let price = model.loading * self.factors[model.factor] + model.offset + model.noise;
            bar.insert(ticker.clone(), price.max(MIN_PRICE));
        }
        self.bars.push(bar);
    }

    fn ensure(&mut self, bars: usize) {
        while self.bars.len() < bars {
            self.step();
        }
    }
}

/// Seeded sector-factor random walks on a regular bar grid.
///
/// Tickers sharing a sector load on the same factor plus stationary noise,
/// so same-sector pairs cointegrate. Unmapped tickers get a factor of their
/// own. Bars are generated lazily and cached, so results do not depend on the
/// order of queries.
#[derive(Debug)]
pub struct SyntheticProvider {
    origin: DateTime<Utc>,
    bar: Duration,
    total_bars: usize,
    generator: Mutex<Generator>,
    cursor: AtomicUsize,
}

impl SyntheticProvider {
    pub fn new(
        seed: u64,
        universe: &[String],
        sectors: &HashMap<String, String>,
        bar_secs: u64,
        total_bars: usize,
        warmup_bars: usize,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut factor_index: BTreeMap<String, usize> = BTreeMap::new();
        let mut factors = Vec::new();
        let mut tickers = BTreeMap::new();
        let mut sorted: Vec<&String> = universe.iter().collect();
        sorted.sort();
        sorted.dedup();
        for ticker in sorted {
            let key = sectors
                .get(ticker)
                .cloned()
                .unwrap_or_else(|| format!("__{}", ticker));
            let factor = *factor_index.entry(key).or_insert_with(|| {
                factors.push(rng.gen_range(50.0..150.0));
                factors.len() - 1
            });
            tickers.insert(
                ticker.clone(),
                TickerModel {
                    factor,
                    loading: rng.gen_range(0.5..2.0),
                    offset: rng.gen_range(0.0..20.0),
                    noise: 0.0,
                },
            );
        }
        let total_bars = total_bars.max(1);
        Self {
            origin: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            bar: Duration::seconds(bar_secs.max(1) as i64),
            total_bars,
            generator: Mutex::new(Generator {
                rng,
                factors,
                tickers,
                bars: Vec::new(),
            }),
            cursor: AtomicUsize::new(warmup_bars.min(total_bars - 1)),
        }
    }

    pub fn from_config(cfg: &StatArbConfig) -> Self {
        Self::new(
            cfg.synthetic_seed,
            &cfg.universe,
            &cfg.sectors,
            cfg.bar_secs,
            cfg.synthetic_bars,
            cfg.training_window,
        )
    }

    fn timestamp(&self, idx: usize) -> DateTime<Utc> {
        self.origin + self.bar * idx as i32
    }

    /// Bar indices whose timestamps fall inside `[start, end]`.
    fn index_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> std::ops::Range<usize> {
        let bar_secs = self.bar.num_seconds().max(1);
        let first = (start - self.origin).num_seconds();
        let lo = if first <= 0 {
            0
        } else {
            ((first + bar_secs - 1) / bar_secs) as usize
        };
        let last = (end - self.origin).num_seconds();
        let hi = if last < 0 {
            0
        } else {
            ((last / bar_secs) as usize + 1).min(self.total_bars)
        };
        lo..hi.max(lo)
    }
}

#[async_trait]
impl PriceProvider for SyntheticProvider {
    async fn get_prices(
        &self,
        tickers: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<String, PriceSeries>, EngineError> {
        if start > end {
            return Err(EngineError::data_unavailable(format!(
                "inverted range {}..{}",
                start, end
            )));
        }
        let range = self.index_range(start, end);
        if range.is_empty() {
            return Err(EngineError::data_unavailable(format!(
                "no synthetic bars in {}..{}",
                start, end
            )));
        }
        let mut generator = self
            .generator
            .lock()
            .map_err(|_| EngineError::data_unavailable("synthetic generator poisoned"))?;
        generator.ensure(range.end);
        let mut out = HashMap::new();
        for ticker in tickers {
            if !generator.tickers.contains_key(ticker) {
                continue;
            }
            let points = range
                .clone()
                .filter_map(|i| generator.bars[i].get(ticker).map(|p| (self.timestamp(i), *p)))
                .collect();
            out.insert(ticker.clone(), PriceSeries::new(ticker, points)?);
        }
        Ok(out)
    }

    fn now(&self) -> DateTime<Utc> {
        self.timestamp(self.cursor.load(AtomicOrdering::SeqCst))
    }

    fn advance(&self) -> bool {
        let current = self.cursor.load(AtomicOrdering::SeqCst);
        if current + 1 < self.total_bars {
            self.cursor.fetch_add(1, AtomicOrdering::SeqCst);
            true
        } else {
            false
        }
    }

    fn coverage(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((self.timestamp(0), self.timestamp(self.total_bars - 1)))
    }
}
