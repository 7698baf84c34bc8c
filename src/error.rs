use rust_decimal::Decimal;
use serde::Serialize;
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineError {
    InsufficientHistory {
        pair: String,
        needed: usize,
        available: usize,
    },
    CointegrationTestFailure { pair: String, reason: String },
    /// Caps cannot be satisfied; the previous weights stay in force.
    LeverageInfeasible { reason: String },
    DataUnavailable { reason: String },
    OrderExecutionFailure {
        ticker: String,
        quantity: Decimal,
        reason: String,
    },
}

impl EngineError {
    pub fn insufficient(pair: &str, needed: usize, available: usize) -> Self {
        EngineError::InsufficientHistory {
            pair: pair.to_string(),
            needed,
            available,
        }
    }

    pub fn numerical(pair: &str, reason: impl Into<String>) -> Self {
        EngineError::CointegrationTestFailure {
            pair: pair.to_string(),
            reason: reason.into(),
        }
    }

    pub fn data_unavailable(reason: impl Into<String>) -> Self {
        EngineError::DataUnavailable {
            reason: reason.into(),
        }
    }

    pub fn infeasible(reason: impl Into<String>) -> Self {
        EngineError::LeverageInfeasible {
            reason: reason.into(),
        }
    }

    pub fn order_failed(ticker: &str, quantity: Decimal, reason: impl Into<String>) -> Self {
        EngineError::OrderExecutionFailure {
            ticker: ticker.to_string(),
            quantity,
            reason: reason.into(),
        }
    }

    /// Short label used in log lines and the backtest report.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InsufficientHistory { .. } => "insufficient_history",
            EngineError::CointegrationTestFailure { .. } => "cointegration_test_failure",
            EngineError::LeverageInfeasible { .. } => "leverage_infeasible",
            EngineError::DataUnavailable { .. } => "data_unavailable",
            EngineError::OrderExecutionFailure { .. } => "order_execution_failure",
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineError::InsufficientHistory {
                pair,
                needed,
                available,
            } => write!(
                f,
                "insufficient history for {}: need {} aligned bars, have {}",
                pair, needed, available
            ),
            EngineError::CointegrationTestFailure { pair, reason } => {
                write!(f, "cointegration test failed for {}: {}", pair, reason)
            }
            EngineError::LeverageInfeasible { reason } => {
                write!(f, "leverage infeasible: {}", reason)
            }
            EngineError::DataUnavailable { reason } => write!(f, "data unavailable: {}", reason),
            EngineError::OrderExecutionFailure {
                ticker,
                quantity,
                reason,
            } => write!(
                f,
                "order for {} {} failed: {}",
                quantity, ticker, reason
            ),
        }
    }
}

impl Error for EngineError {}
