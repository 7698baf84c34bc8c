use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::config::{ConfigError, StatArbConfig};
use crate::error::EngineError;
use crate::model::PriceSeries;
use crate::ports::replay::ReplayProvider;
use crate::ports::synthetic::SyntheticProvider;

/// Source of historical and polled prices.
///
/// Tickers the source does not know are left out of the returned map; a range
/// the source cannot serve at all is `DataUnavailable`.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    async fn get_prices(
        &self,
        tickers: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<String, PriceSeries>, EngineError>;

    /// Clock used by the live loop. Simulated feeds report their cursor.
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Step a simulated clock one bar. Returns false once the feed is exhausted.
    fn advance(&self) -> bool {
        true
    }

    /// First and last timestamps the feed can serve, when known up front.
    fn coverage(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Replay,
    Synthetic,
}

impl FromStr for ProviderKind {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "replay" => Ok(ProviderKind::Replay),
            "synthetic" => Ok(ProviderKind::Synthetic),
            other => Err(ConfigError::Invalid {
                key: "provider",
                reason: format!("unknown price provider '{}'", other),
            }),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Replay => f.write_str("replay"),
            ProviderKind::Synthetic => f.write_str("synthetic"),
        }
    }
}

pub struct ProviderBox {
    pub kind: ProviderKind,
    pub inner: Box<dyn PriceProvider>,
}

impl ProviderBox {
    pub fn create(cfg: &StatArbConfig) -> anyhow::Result<Self> {
        let inner: Box<dyn PriceProvider> = match cfg.provider {
            ProviderKind::Replay => {
                let path = cfg
                    .replay_file
                    .as_deref()
                    .ok_or(ConfigError::Missing("REPLAY_FILE"))?;
                Box::new(ReplayProvider::new(path, cfg.training_window)?)
            }
            ProviderKind::Synthetic => Box::new(SyntheticProvider::from_config(cfg)),
        };
        log::info!("[DATA] using {} price provider", cfg.provider);
        Ok(Self {
            kind: cfg.provider,
            inner,
        })
    }
}

#[async_trait]
impl PriceProvider for ProviderBox {
    async fn get_prices(
        &self,
        tickers: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<String, PriceSeries>, EngineError> {
        let result = self.inner.get_prices(tickers, start, end).await;
        match &result {
            Ok(series) => {
                let missing: Vec<&String> =
                    tickers.iter().filter(|t| !series.contains_key(*t)).collect();
                if !missing.is_empty() {
                    log::warn!(
                        "[DATA] {} provider has no data for {:?} in {}..{}, excluded",
                        self.kind,
                        missing,
                        start,
                        end
                    );
                }
            }
            Err(e) => log::warn!("[DATA] {} provider failed: {}", self.kind, e),
        }
        result
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.now()
    }

    fn advance(&self) -> bool {
        self.inner.advance()
    }

    fn coverage(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.inner.coverage()
    }
}
