use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::config::StatArbConfig;
use crate::error::EngineError;
use crate::model::{AlignedPrices, Pair, PriceSeries};
use crate::stats::{adf, engle_granger, half_life, NumericalError, Trend};

pub const MIXED_SECTOR: &str = "MIXED";

#[derive(Debug, Clone)]
pub struct DiscoveryParams {
    pub coint_pvalue: f64,
    pub adf_pvalue: f64,
    pub adf_max_lag: usize,
    pub training_window: usize,
    pub hedge_ratio_min: f64,
    pub hedge_ratio_max: f64,
    pub max_half_life: Option<f64>,
    pub max_pairs: usize,
    pub max_pairs_per_sector: usize,
    pub sector_restricted: bool,
}

impl From<&StatArbConfig> for DiscoveryParams {
    fn from(cfg: &StatArbConfig) -> Self {
        Self {
            coint_pvalue: cfg.coint_pvalue,
            adf_pvalue: cfg.adf_pvalue,
            adf_max_lag: cfg.adf_max_lag,
            training_window: cfg.training_window,
            hedge_ratio_min: cfg.hedge_ratio_min,
            hedge_ratio_max: cfg.hedge_ratio_max,
            max_half_life: cfg.max_half_life_bars,
            max_pairs: cfg.max_pairs,
            max_pairs_per_sector: cfg.max_pairs_per_sector,
            sector_restricted: cfg.sector_restricted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryFailure {
    pub pair: String,
    pub window_start: DateTime<Utc>,
    pub error: EngineError,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryOutcome {
    pub pairs: Vec<Pair>,
    pub failures: Vec<DiscoveryFailure>,
    pub tested: usize,
    pub candidates: usize,
}

#[derive(Debug, Clone)]
struct Candidate {
    ticker_a: String,
    ticker_b: String,
    sector: String,
}

impl Candidate {
    fn label(&self) -> String {
        format!("{}/{}", self.ticker_a, self.ticker_b)
    }
}

#[derive(Debug, Clone)]
pub struct PairDiscovery {
    params: DiscoveryParams,
    sectors: HashMap<String, String>,
}

impl PairDiscovery {
    pub fn new(params: DiscoveryParams, sectors: HashMap<String, String>) -> Self {
        Self { params, sectors }
    }

    pub fn params(&self) -> &DiscoveryParams {
        &self.params
    }

    pub fn sector_of(&self, ticker: &str) -> Option<&str> {
        self.sectors.get(ticker).map(String::as_str)
    }

    /// Unordered candidate pairs, either within sectors or across the universe.
    fn candidates(&self, tickers: &[String]) -> Vec<Candidate> {
        let mut tickers: Vec<&String> = tickers.iter().collect();
        tickers.sort();
        tickers.dedup();

        let mut out = Vec::new();
        if self.params.sector_restricted {
            let mut by_sector: BTreeMap<&str, Vec<&String>> = BTreeMap::new();
            for t in &tickers {
                match self.sector_of(t) {
                    Some(sector) => by_sector.entry(sector).or_default().push(t),
                    None => log::warn!("[DISCOVERY] {} has no sector, excluded from scan", t),
                }
            }
            for (sector, members) in by_sector {
                for (i, a) in members.iter().enumerate() {
                    for b in &members[i + 1..] {
                        out.push(Candidate {
                            ticker_a: a.to_string(),
                            ticker_b: b.to_string(),
                            sector: sector.to_string(),
                        });
                    }
                }
            }
        } else {
            for (i, a) in tickers.iter().enumerate() {
                for b in &tickers[i + 1..] {
                    let sector = match (self.sector_of(a), self.sector_of(b)) {
                        (Some(sa), Some(sb)) if sa == sb => sa.to_string(),
                        _ => MIXED_SECTOR.to_string(),
                    };
                    out.push(Candidate {
                        ticker_a: a.to_string(),
                        ticker_b: b.to_string(),
                        sector,
                    });
                }
            }
        }
        out
    }

    /// Full test of one candidate. `Ok(None)` means a screen rejected it.
    fn evaluate(
        &self,
        candidate: &Candidate,
        training: &HashMap<String, PriceSeries>,
        window_start: DateTime<Utc>,
    ) -> Result<Option<Pair>, EngineError> {
        let label = candidate.label();
        let needed = self.params.training_window;
        let (a, b) = match (
            training.get(&candidate.ticker_a),
            training.get(&candidate.ticker_b),
        ) {
            (Some(a), Some(b)) => (a, b),
            (a, b) => {
                let available = a.map_or(0, |s| s.len()).min(b.map_or(0, |s| s.len()));
                return Err(EngineError::insufficient(&label, needed, available));
            }
        };
        let aligned = AlignedPrices::align(a, b);
        if aligned.len() < needed {
            return Err(EngineError::insufficient(&label, needed, aligned.len()));
        }

        let to_engine = |e: NumericalError| match e {
            NumericalError::TooShort { needed, available } => {
                EngineError::insufficient(&label, needed, available)
            }
            other => EngineError::numerical(&label, other.to_string()),
        };

        let coint = engle_granger(&aligned.a, &aligned.b).map_err(to_engine)?;
        if !(coint.p_value < self.params.coint_pvalue) {
            log::trace!("[DISCOVERY] {} coint p={:.4} rejected", label, coint.p_value);
            return Ok(None);
        }
        let hedge = coint.hedge_ratio;
        if hedge < self.params.hedge_ratio_min || hedge > self.params.hedge_ratio_max {
            log::debug!("[DISCOVERY] {} hedge ratio {:.3} out of bounds", label, hedge);
            return Ok(None);
        }

        let spread: Vec<f64> = aligned
            .a
            .iter()
            .zip(&aligned.b)
            .map(|(pa, pb)| pa - hedge * pb)
            .collect();
        let stationarity =
            adf(&spread, Some(self.params.adf_max_lag), Trend::Constant, 1).map_err(to_engine)?;
        if !(stationarity.p_value < self.params.adf_pvalue) {
            log::debug!(
                "[DISCOVERY] {} spread ADF p={:.4} rejected",
                label,
                stationarity.p_value
            );
            return Ok(None);
        }

        let hl = match half_life(&spread) {
            Some(hl) => hl,
            None => {
                log::debug!("[DISCOVERY] {} spread does not mean-revert", label);
                return Ok(None);
            }
        };
        if let Some(max_hl) = self.params.max_half_life {
            if hl > max_hl {
                log::debug!("[DISCOVERY] {} half-life {:.1} above {:.1}", label, hl, max_hl);
                return Ok(None);
            }
        }

        Ok(Some(Pair {
            ticker_a: candidate.ticker_a.clone(),
            ticker_b: candidate.ticker_b.clone(),
            hedge_ratio: hedge,
            p_value: coint.p_value,
            adf_p_value: stationarity.p_value,
            half_life: hl,
            sector: candidate.sector.clone(),
            discovered_at: window_start,
        }))
    }

    pub fn scan(
        &self,
        training: &HashMap<String, PriceSeries>,
        window_start: DateTime<Utc>,
    ) -> DiscoveryOutcome {
        let tickers: Vec<String> = training.keys().cloned().collect();
        let candidates = self.candidates(&tickers);
        let results = candidates
            .iter()
            .map(|c| (c.label(), self.evaluate(c, training, window_start)))
            .collect();
        self.finalize(results, window_start)
    }

    /// Same as [`scan`](Self::scan), with candidates spread over blocking workers.
    pub async fn scan_parallel(
        &self,
        training: Arc<HashMap<String, PriceSeries>>,
        window_start: DateTime<Utc>,
        workers: usize,
    ) -> DiscoveryOutcome {
        let tickers: Vec<String> = training.keys().cloned().collect();
        let candidates = self.candidates(&tickers);
        let workers = workers.max(1);
        let chunk_len = (candidates.len() + workers - 1) / workers;
        if chunk_len == 0 {
            return self.finalize(Vec::new(), window_start);
        }

        let this = Arc::new(self.clone());
        let mut join_set: JoinSet<(usize, Vec<IndexedResult>)> = JoinSet::new();
        for (chunk_idx, chunk) in candidates.chunks(chunk_len).enumerate() {
            let chunk = chunk.to_vec();
            let this = Arc::clone(&this);
            let training = Arc::clone(&training);
            join_set.spawn_blocking(move || {
                let batch = chunk
                    .iter()
                    .enumerate()
                    .map(|(i, c)| {
                        (
                            chunk_idx * chunk_len + i,
                            c.label(),
                            this.evaluate(c, &training, window_start),
                        )
                    })
                    .collect();
                (chunk_idx, batch)
            });
        }

        let mut indexed = Vec::with_capacity(candidates.len());
        let mut finished = BTreeSet::new();
        let mut worker_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((chunk_idx, batch)) => {
                    finished.insert(chunk_idx);
                    indexed.extend(batch);
                }
                Err(e) => {
                    log::error!("[DISCOVERY] worker failed at {}: {}", window_start, e);
                    worker_error = Some(e.to_string());
                }
            }
        }
        if let Some(reason) = worker_error {
            indexed.extend(lost_chunks(&candidates, chunk_len, &finished, &reason));
        }
        indexed.sort_by_key(|(idx, _, _)| *idx);
        let results = indexed
            .into_iter()
            .map(|(_, label, result)| (label, result))
            .collect();
        self.finalize(results, window_start)
    }

    fn finalize(
        &self,
        results: Vec<(String, Result<Option<Pair>, EngineError>)>,
        window_start: DateTime<Utc>,
    ) -> DiscoveryOutcome {
        let mut outcome = DiscoveryOutcome {
            tested: results.len(),
            ..Default::default()
        };
        let mut survivors = Vec::new();
        for (label, result) in results {
            match result {
                Ok(Some(pair)) => survivors.push(pair),
                Ok(None) => {}
                Err(error) => {
                    log::warn!(
                        "[DISCOVERY] {} skipped for window starting {}: {}",
                        label,
                        window_start,
                        error
                    );
                    outcome.failures.push(DiscoveryFailure {
                        pair: label,
                        window_start,
                        error,
                    });
                }
            }
        }
        outcome.candidates = survivors.len();
        outcome.pairs = self.rank_and_cap(survivors);
        log::info!(
            "[DISCOVERY] window {}: tested={} candidates={} selected={} failures={}",
            window_start,
            outcome.tested,
            outcome.candidates,
            outcome.pairs.len(),
            outcome.failures.len()
        );
        outcome
    }

    fn rank_and_cap(&self, mut pairs: Vec<Pair>) -> Vec<Pair> {
        pairs.sort_by(|x, y| compare_rank(x, y).then_with(|| x.key().cmp(&y.key())));
        let mut per_sector: HashMap<String, usize> = HashMap::new();
        let mut selected = Vec::new();
        for pair in pairs {
            if selected.len() >= self.params.max_pairs {
                break;
            }
            let count = per_sector.entry(pair.sector.clone()).or_insert(0);
            if *count >= self.params.max_pairs_per_sector {
                continue;
            }
            *count += 1;
            selected.push(pair);
        }
        selected
    }
}

/// Ascending p-value, ties broken by the faster half-life.
type IndexedResult = (usize, String, Result<Option<Pair>, EngineError>);

// Candidates of chunks whose worker never reported back, each recorded as a failure.
fn lost_chunks(
    candidates: &[Candidate],
    chunk_len: usize,
    finished: &BTreeSet<usize>,
    reason: &str,
) -> Vec<IndexedResult> {
    candidates
        .chunks(chunk_len)
        .enumerate()
        .filter(|(chunk_idx, _)| !finished.contains(chunk_idx))
        .flat_map(|(chunk_idx, chunk)| {
            chunk.iter().enumerate().map(move |(i, c)| {
                let label = c.label();
                let error =
                    EngineError::numerical(&label, format!("discovery worker failed: {}", reason));
                (chunk_idx * chunk_len + i, label, Err(error))
            })
        })
        .collect()
}

pub fn compare_rank(x: &Pair, y: &Pair) -> Ordering {
    x.p_value
        .total_cmp(&y.p_value)
        .then_with(|| x.half_life.total_cmp(&y.half_life))
}
