use async_trait::async_trait;
use lazy_static::lazy_static;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::env;
use std::sync::{Mutex, MutexGuard};

use crate::error::EngineError;
use crate::trade::execution::broker::{Account, Broker};

lazy_static! {
    static ref PAPER_FILL_PROBABILITY: f64 = {
        match env::var("PAPER_FILL_PROBABILITY") {
            Ok(val) => val
                .parse::<f64>()
                .ok()
                .filter(|p| (0.0..=1.0).contains(p))
                .unwrap_or(1.0),
            Err(_) => 1.0,
        }
    };
}

#[derive(Debug)]
struct PaperBook {
    cash: Decimal,
    positions: BTreeMap<String, Decimal>,
    marks: BTreeMap<String, Decimal>,
    next_order_id: u64,
    rng: StdRng,
}

/// In-memory account that fills market orders at the last observed mark.
#[derive(Debug)]
pub struct PaperBroker {
    book: Mutex<PaperBook>,
    fill_probability: f64,
}

impl PaperBroker {
    pub fn new(cash: Decimal) -> Self {
        Self::with_positions(cash, BTreeMap::new())
    }

    pub fn with_positions(cash: Decimal, positions: BTreeMap<String, Decimal>) -> Self {
        Self {
            book: Mutex::new(PaperBook {
                cash,
                positions,
                marks: BTreeMap::new(),
                next_order_id: 1,
                rng: StdRng::from_entropy(),
            }),
            fill_probability: *PAPER_FILL_PROBABILITY,
        }
    }

    /// Override the emulated fill probability; the rng is seeded so partial
    /// fill sequences are reproducible.
    pub fn with_fill_probability(mut self, probability: f64, seed: u64) -> Self {
        self.fill_probability = probability.clamp(0.0, 1.0);
        if let Ok(book) = self.book.get_mut() {
            book.rng = StdRng::seed_from_u64(seed);
        }
        self
    }

    fn book(&self) -> Result<MutexGuard<'_, PaperBook>, EngineError> {
        self.book
            .lock()
            .map_err(|_| EngineError::data_unavailable("paper broker state poisoned"))
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn get_account(&self) -> Result<Account, EngineError> {
        let book = self.book()?;
        let mut equity = book.cash;
        for (ticker, qty) in &book.positions {
            if let Some(mark) = book.marks.get(ticker) {
                equity += *qty * *mark;
            }
        }
        Ok(Account {
            cash: book.cash,
            equity,
        })
    }

    async fn get_positions(&self) -> Result<BTreeMap<String, Decimal>, EngineError> {
        let book = self.book()?;
        Ok(book
            .positions
            .iter()
            .filter(|(_, q)| !q.is_zero())
            .map(|(t, q)| (t.clone(), *q))
            .collect())
    }

    async fn submit_market_order(
        &self,
        ticker: &str,
        quantity: Decimal,
    ) -> Result<String, EngineError> {
        let mut book = self.book()?;
        if quantity.is_zero() {
            return Err(EngineError::order_failed(ticker, quantity, "zero quantity"));
        }
        let mark = match book.marks.get(ticker) {
            Some(m) => *m,
            None => {
                return Err(EngineError::order_failed(ticker, quantity, "no mark price"));
            }
        };
        if self.fill_probability < 1.0 {
            let draw: f64 = book.rng.gen();
            if draw >= self.fill_probability {
                log::debug!(
                    "[ORDER] paper {} qty={} not filled (emulated, p={})",
                    ticker,
                    quantity,
                    self.fill_probability
                );
                return Err(EngineError::order_failed(
                    ticker,
                    quantity,
                    "not filled (emulated)",
                ));
            }
        }

        book.cash -= quantity * mark;
        let held = book.positions.entry(ticker.to_string()).or_insert(Decimal::ZERO);
        *held += quantity;
        if held.is_zero() {
            book.positions.remove(ticker);
        }
        let order_id = format!("paper-{}", book.next_order_id);
        book.next_order_id += 1;
        log::debug!(
            "[ORDER] paper fill {} qty={} @ {} id={}",
            ticker,
            quantity,
            mark,
            order_id
        );
        Ok(order_id)
    }

    async fn observe_prices(&self, prices: &BTreeMap<String, f64>) {
        let mut book = match self.book() {
            Ok(book) => book,
            Err(err) => {
                log::warn!("[ORDER] {}", err);
                return;
            }
        };
        for (ticker, price) in prices {
            if let Some(mark) = Decimal::from_f64(*price) {
                book.marks.insert(ticker.clone(), mark);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn marks() -> BTreeMap<String, f64> {
        [("KO".to_string(), 60.0), ("PEP".to_string(), 170.0)]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn fills_update_cash_positions_and_ids() {
        let broker = PaperBroker::new(dec!(100000)).with_fill_probability(1.0, 1);
        broker.observe_prices(&marks()).await;

        let first = broker.submit_market_order("KO", dec!(100)).await.unwrap();
        let second = broker.submit_market_order("PEP", dec!(-30)).await.unwrap();
        assert_eq!(first, "paper-1");
        assert_eq!(second, "paper-2");

        let positions = broker.get_positions().await.unwrap();
        assert_eq!(positions["KO"], dec!(100));
        assert_eq!(positions["PEP"], dec!(-30));

        let account = broker.get_account().await.unwrap();
        assert_eq!(account.cash, dec!(100000) - dec!(6000) + dec!(5100));
        assert_eq!(account.equity, dec!(100000));
    }

    #[tokio::test]
    async fn closing_a_position_removes_it() {
        let broker = PaperBroker::new(dec!(0)).with_fill_probability(1.0, 1);
        broker.observe_prices(&marks()).await;
        broker.submit_market_order("KO", dec!(5)).await.unwrap();
        broker.submit_market_order("KO", dec!(-5)).await.unwrap();
        assert!(broker.get_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn orders_without_a_mark_are_rejected() {
        let broker = PaperBroker::new(dec!(1000));
        let err = broker.submit_market_order("XOM", dec!(1)).await.unwrap_err();
        assert_eq!(err.kind(), "order_execution_failure");
    }

    #[tokio::test]
    async fn zero_fill_probability_never_fills() {
        let broker = PaperBroker::new(dec!(1000)).with_fill_probability(0.0, 9);
        broker.observe_prices(&marks()).await;
        assert!(broker.submit_market_order("KO", dec!(1)).await.is_err());
        assert!(broker.get_positions().await.unwrap().is_empty());
    }
}
