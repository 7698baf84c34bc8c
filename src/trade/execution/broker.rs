use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::alert_notifier::notify_alert;
use crate::config::StatArbConfig;
use crate::error::EngineError;
use crate::trade::execution::paper_broker::PaperBroker;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Account {
    pub cash: Decimal,
    pub equity: Decimal,
}

/// Order routing and account queries. Quantities are signed share counts.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_account(&self) -> Result<Account, EngineError>;

    /// Signed holdings per ticker; flat tickers may be omitted.
    async fn get_positions(&self) -> Result<BTreeMap<String, Decimal>, EngineError>;

    async fn submit_market_order(
        &self,
        ticker: &str,
        quantity: Decimal,
    ) -> Result<String, EngineError>;

    /// Latest marks from the price feed. Brokers with their own quotes ignore it.
    async fn observe_prices(&self, _prices: &BTreeMap<String, f64>) {}
}

pub struct BrokerBox {
    pub inner: Box<dyn Broker>,
}

impl BrokerBox {
    pub fn new(inner: Box<dyn Broker>) -> Self {
        Self { inner }
    }

    /// Paper account sized to the configured capital.
    pub fn paper(cfg: &StatArbConfig) -> Self {
        let cash = Decimal::from_f64_retain(cfg.total_capital).unwrap_or(Decimal::ZERO);
        log::info!("[ORDER] using paper broker with cash {}", cash);
        Self::new(Box::new(PaperBroker::new(cash)))
    }

    fn report_failure(&self, operation: &str, detail: &str, err: &EngineError) {
        let err_text = err.to_string();
        log::warn!("[ORDER] {} failed ({}): {}", operation, detail, err_text);
        if err_text.contains("429") || err_text.to_lowercase().contains("rate limit") {
            notify_alert(&format!("broker rate limit during {}", operation), &err_text);
        }
    }
}

#[async_trait]
impl Broker for BrokerBox {
    async fn get_account(&self) -> Result<Account, EngineError> {
        let result = self.inner.get_account().await;
        if let Err(ref err) = result {
            self.report_failure("get_account", "account", err);
        }
        result
    }

    async fn get_positions(&self) -> Result<BTreeMap<String, Decimal>, EngineError> {
        let result = self.inner.get_positions().await;
        if let Err(ref err) = result {
            self.report_failure("get_positions", "all", err);
        }
        result
    }

    async fn submit_market_order(
        &self,
        ticker: &str,
        quantity: Decimal,
    ) -> Result<String, EngineError> {
        let result = self.inner.submit_market_order(ticker, quantity).await;
        match &result {
            Ok(order_id) => {
                log::info!("[ORDER] {} qty={} accepted id={}", ticker, quantity, order_id)
            }
            Err(err) => {
                self.report_failure(
                    "submit_market_order",
                    &format!("{} | qty={}", ticker, quantity),
                    err,
                );
            }
        }
        result
    }

    async fn observe_prices(&self, prices: &BTreeMap<String, f64>) {
        self.inner.observe_prices(prices).await
    }
}
