use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use crate::error::EngineError;
use crate::model::PriceSeries;
use crate::ports::price_provider::PriceProvider;

// One line of the JSONL dump: {"timestamp": <ms>, "prices": {"KO": 61.2, ...}}.
// Richer per-symbol snapshots with a `price` field are accepted too.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DumpedPrice {
    Plain(f64),
    Snapshot { price: f64 },
}

impl DumpedPrice {
    fn value(&self) -> f64 {
        match self {
            DumpedPrice::Plain(p) => *p,
            DumpedPrice::Snapshot { price } => *price,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DumpedDataEntry {
    timestamp: i64,
    prices: HashMap<String, DumpedPrice>,
}

#[derive(Debug)]
struct ReplayBar {
    at: DateTime<Utc>,
    prices: BTreeMap<String, f64>,
}

/// Price feed backed by a recorded JSONL file.
///
/// Backtests read any range directly. The live loop sees the file through a
/// cursor that starts after `warmup_bars` and moves one bar per tick.
#[derive(Debug)]
pub struct ReplayProvider {
    data: Vec<ReplayBar>,
    cursor: AtomicUsize,
}

impl ReplayProvider {
    pub fn new(path: &str, warmup_bars: usize) -> Result<Self, EngineError> {
        let file = File::open(path).map_err(|e| {
            EngineError::data_unavailable(format!("failed to open replay file {}: {}", path, e))
        })?;
        Self::from_reader(BufReader::new(file), warmup_bars)
    }

    pub fn from_reader<R: BufRead>(reader: R, warmup_bars: usize) -> Result<Self, EngineError> {
        let mut data: Vec<ReplayBar> = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| {
                EngineError::data_unavailable(format!("failed to read replay line: {}", e))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: DumpedDataEntry = serde_json::from_str(&line).map_err(|e| {
                EngineError::data_unavailable(format!(
                    "failed to parse replay entry {}: {}",
                    line_no + 1,
                    e
                ))
            })?;
            let at = Utc.timestamp_millis_opt(entry.timestamp).single().ok_or_else(|| {
                EngineError::data_unavailable(format!(
                    "replay entry {} has invalid timestamp {}",
                    line_no + 1,
                    entry.timestamp
                ))
            })?;
            if let Some(prev) = data.last() {
                if at <= prev.at {
                    return Err(EngineError::data_unavailable(format!(
                        "replay entry {} is not after {}",
                        line_no + 1,
                        prev.at
                    )));
                }
            }
            let mut prices = BTreeMap::new();
            for (ticker, price) in entry.prices {
                let value = price.value();
                if value.is_finite() && value > 0.0 {
                    prices.insert(ticker, value);
                } else {
                    log::warn!("[DATA] replay {} {} has invalid price {}", at, ticker, value);
                }
            }
            data.push(ReplayBar { at, prices });
        }

        if data.is_empty() {
            return Err(EngineError::data_unavailable(
                "data dump file is empty or invalid",
            ));
        }
        let cursor = warmup_bars.min(data.len() - 1);
        Ok(Self {
            data,
            cursor: AtomicUsize::new(cursor),
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl PriceProvider for ReplayProvider {
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
        let lo = self.data.partition_point(|bar| bar.at < start);
        let hi = self.data.partition_point(|bar| bar.at <= end);
        if lo >= hi {
            return Err(EngineError::data_unavailable(format!(
                "no replay bars in {}..{}",
                start, end
            )));
        }
        let mut out = HashMap::new();
        for ticker in tickers {
            let points: Vec<(DateTime<Utc>, f64)> = self.data[lo..hi]
                .iter()
                .filter_map(|bar| bar.prices.get(ticker).map(|p| (bar.at, *p)))
                .collect();
            if points.is_empty() {
                continue;
            }
            out.insert(ticker.clone(), PriceSeries::new(ticker, points)?);
        }
        Ok(out)
    }

    fn now(&self) -> DateTime<Utc> {
        let cursor = self.cursor.load(AtomicOrdering::SeqCst);
        self.data[cursor.min(self.data.len() - 1)].at
    }

    // Advances the simulation by one step. Returns false if the end is reached.
    fn advance(&self) -> bool {
        let current_cursor = self.cursor.load(AtomicOrdering::SeqCst);
        if current_cursor < self.data.len() - 1 {
            self.cursor.fetch_add(1, AtomicOrdering::SeqCst);
            true
        } else {
            false
        }
    }

    fn coverage(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((self.data.first()?.at, self.data.last()?.at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const DUMP: &str = r#"{"timestamp": 1700000000000, "prices": {"KO": 60.0, "PEP": 170.0}}
{"timestamp": 1700000300000, "prices": {"KO": {"price": 60.5, "funding_rate": 0.0}, "PEP": 171.0}}

{"timestamp": 1700000600000, "prices": {"KO": 61.0}}
"#;

    fn provider(warmup: usize) -> ReplayProvider {
        ReplayProvider::from_reader(Cursor::new(DUMP), warmup).unwrap()
    }

    fn tickers() -> Vec<String> {
        vec!["KO".to_string(), "PEP".to_string(), "XOM".to_string()]
    }

    #[tokio::test]
    async fn missing_tickers_are_omitted_not_zero_filled() {
        let p = provider(0);
        let (start, end) = p.coverage().unwrap();
        let prices = p.get_prices(&tickers(), start, end).await.unwrap();
        assert_eq!(prices["KO"].len(), 3);
        assert_eq!(prices["PEP"].len(), 2);
        assert!(!prices.contains_key("XOM"));
    }

    #[tokio::test]
    async fn empty_range_is_data_unavailable() {
        let p = provider(0);
        let (_, end) = p.coverage().unwrap();
        let later = end + chrono::Duration::days(1);
        let err = p.get_prices(&tickers(), later, later).await.unwrap_err();
        assert_eq!(err.kind(), "data_unavailable");
    }

    #[test]
    fn cursor_moves_until_exhausted() {
        let p = provider(1);
        let first = p.now();
        assert!(p.advance());
        assert!(p.now() > first);
        assert!(!p.advance());
    }

    #[test]
    fn out_of_order_entries_are_rejected() {
        let dump = "{\"timestamp\": 2000, \"prices\": {}}\n{\"timestamp\": 1000, \"prices\": {}}\n";
        let err = ReplayProvider::from_reader(Cursor::new(dump), 0).unwrap_err();
        assert_eq!(err.kind(), "data_unavailable");
    }
}
