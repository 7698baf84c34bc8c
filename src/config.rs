use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::env;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;

use crate::ports::price_provider::ProviderKind;

const DEFAULT_COINT_PVALUE: f64 = 0.05;
const DEFAULT_ZSCORE_ENTRY: f64 = 2.0;
const DEFAULT_ZSCORE_EXIT: f64 = 0.5;
const DEFAULT_ZSCORE_HARD_STOP: f64 = 3.25;
const DEFAULT_TRAINING_WINDOW: usize = 252;
const DEFAULT_MAX_POSITION_WEIGHT: f64 = 0.05;
const DEFAULT_MAX_GROSS_LEVERAGE: f64 = 4.0;
const DEFAULT_TIME_STOP_BARS: u32 = 390;
const DEFAULT_COOLDOWN_BARS: u32 = 78;
const DEFAULT_TICK_INTERVAL_SECS: u64 = 300;
const DEFAULT_TOTAL_CAPITAL: f64 = 1_000_000.0;
const DEFAULT_MAX_EXPOSURE_PER_PAIR: f64 = 100_000.0;
const DEFAULT_ADF_PVALUE: f64 = 0.05;
const DEFAULT_ADF_MAX_LAG: usize = 20;
const DEFAULT_HEDGE_RATIO_MIN: f64 = 0.1;
const DEFAULT_HEDGE_RATIO_MAX: f64 = 10.0;
const DEFAULT_MAX_PAIRS: usize = 10;
const DEFAULT_MAX_PAIRS_PER_SECTOR: usize = 2;
const DEFAULT_DISCOVERY_WORKERS: usize = 4;
const DEFAULT_SYNTHETIC_SEED: u64 = 7;
const DEFAULT_SYNTHETIC_BARS: usize = 1_000;
const DEFAULT_BAR_SECS: u64 = 86_400;
const DEFAULT_STATE_FILE: &str = "statarb_state.json";
const DEFAULT_MAX_EXIT_RETRIES: u32 = 3;
const DEFAULT_EXIT_RETRY_DELAY_MS: u64 = 500;
const DEFAULT_REBALANCE_THRESHOLD: f64 = 0.005;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Backtest,
    Live,
}

impl FromStr for RunMode {
    type Err = ConfigError;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "backtest" => Ok(RunMode::Backtest),
            "live" => Ok(RunMode::Live),
            other => Err(ConfigError::Invalid {
                key: "mode",
                reason: format!("unknown run mode '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid { key: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "{} must be set", key),
            ConfigError::Invalid { key, reason } => write!(f, "invalid {}: {}", key, reason),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    String(String),
    Vec(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        let items = match self {
            StringOrVec::String(value) => value.split(',').map(str::to_string).collect(),
            StringOrVec::Vec(values) => values,
        };
        items
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct StatArbYaml {
    mode: Option<String>,
    provider: Option<String>,
    replay_file: Option<String>,
    synthetic_seed: Option<u64>,
    synthetic_bars: Option<usize>,
    bar_secs: Option<u64>,
    universe: Option<StringOrVec>,
    sectors: Option<HashMap<String, String>>,
    sector_restricted: Option<bool>,
    coint_pvalue: Option<f64>,
    zscore_entry: Option<f64>,
    zscore_exit: Option<f64>,
    zscore_hard_stop: Option<f64>,
    training_window: Option<usize>,
    trading_window: Option<usize>,
    max_position_weight: Option<f64>,
    max_gross_leverage: Option<f64>,
    time_stop_bars: Option<u32>,
    cooldown_bars: Option<u32>,
    tick_interval: Option<u64>,
    total_capital: Option<f64>,
    max_exposure_per_pair: Option<f64>,
    adf_pvalue: Option<f64>,
    adf_max_lag: Option<usize>,
    hedge_ratio_min: Option<f64>,
    hedge_ratio_max: Option<f64>,
    max_half_life_bars: Option<f64>,
    max_pairs: Option<usize>,
    max_pairs_per_sector: Option<usize>,
    discovery_workers: Option<usize>,
    start: Option<String>,
    end: Option<String>,
    state_file: Option<String>,
    report_file: Option<String>,
    max_exit_retries: Option<u32>,
    exit_retry_delay_ms: Option<u64>,
    pair_refresh_secs: Option<u64>,
    rebalance_threshold: Option<f64>,
    observe_only: Option<bool>,
    max_ticks: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StatArbConfig {
    pub mode: RunMode,
    pub provider: ProviderKind,
    pub replay_file: Option<String>,
    pub synthetic_seed: u64,
    pub synthetic_bars: usize,
    /// Bar spacing of the price feed, used for warm-up spans and synthetic data.
    pub bar_secs: u64,
    pub universe: Vec<String>,
    pub sectors: HashMap<String, String>,
    pub sector_restricted: bool,
    pub coint_pvalue: f64,
    pub zscore_entry: f64,
    pub zscore_exit: f64,
    pub zscore_hard_stop: f64,
    pub training_window: usize,
    pub trading_window: usize,
    pub max_position_weight: f64,
    pub max_gross_leverage: f64,
    pub time_stop_bars: u32,
    pub cooldown_bars: u32,
    pub tick_interval_secs: u64,
    pub total_capital: f64,
    pub max_exposure_per_pair: f64,
    pub adf_pvalue: f64,
    pub adf_max_lag: usize,
    pub hedge_ratio_min: f64,
    pub hedge_ratio_max: f64,
    pub max_half_life_bars: Option<f64>,
    pub max_pairs: usize,
    pub max_pairs_per_sector: usize,
    pub discovery_workers: usize,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub state_file: String,
    pub report_file: Option<String>,
    pub max_exit_retries: u32,
    pub exit_retry_delay_ms: u64,
    pub pair_refresh_secs: Option<u64>,
    pub rebalance_threshold: f64,
    // Safety guard to avoid real orders while observing market data
    pub observe_only: bool,
    pub max_ticks: Option<u64>,
}

impl StatArbConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("STATARB_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty());
        if let Some(path) = config_path {
            return Self::from_yaml_path(path);
        }
        Self::from_env()
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open statarb config {}", path_ref.display()))?;
        let mut yaml: StatArbYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse statarb config {}", path_ref.display()))?;
        yaml.apply_env_overrides()?;
        Self::resolve(yaml)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let yaml: StatArbYaml =
            serde_yaml::from_str(raw).context("failed to parse statarb config")?;
        Self::resolve(yaml)
    }

    pub fn from_env() -> Result<Self> {
        let mut yaml = StatArbYaml::default();
        yaml.apply_env_overrides()?;
        Self::resolve(yaml)
    }

    /// Defaults everywhere except the trading window, which has none.
    pub fn with_trading_window(trading_window: usize) -> Self {
        let yaml = StatArbYaml::default();
        Self::assemble(
            yaml,
            trading_window,
            RunMode::Backtest,
            ProviderKind::Synthetic,
            None,
            None,
        )
    }

    fn resolve(yaml: StatArbYaml) -> Result<Self> {
        let trading_window = yaml
            .trading_window
            .ok_or(ConfigError::Missing("TRADING_WINDOW"))?;
        let mode = match yaml.mode.as_deref() {
            Some(raw) => raw.parse()?,
            None => RunMode::Backtest,
        };
        let provider = match yaml.provider.as_deref() {
            Some(raw) => raw.parse()?,
            None => ProviderKind::Synthetic,
        };
        let start = yaml.start.as_deref().map(parse_datetime).transpose()?;
        let end = yaml.end.as_deref().map(parse_datetime).transpose()?;
        Ok(Self::assemble(yaml, trading_window, mode, provider, start, end))
    }

    fn assemble(
        yaml: StatArbYaml,
        trading_window: usize,
        mode: RunMode,
        provider: ProviderKind,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        let sectors = yaml.sectors.unwrap_or_default();
        let universe = match yaml.universe {
            Some(list) => list.into_vec(),
            None => sectors
                .keys()
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        };

        StatArbConfig {
            mode,
            provider,
            replay_file: yaml.replay_file,
            synthetic_seed: yaml.synthetic_seed.unwrap_or(DEFAULT_SYNTHETIC_SEED),
            synthetic_bars: yaml.synthetic_bars.unwrap_or(DEFAULT_SYNTHETIC_BARS),
            bar_secs: yaml.bar_secs.unwrap_or(DEFAULT_BAR_SECS),
            universe,
            sectors,
            sector_restricted: yaml.sector_restricted.unwrap_or(true),
            coint_pvalue: yaml.coint_pvalue.unwrap_or(DEFAULT_COINT_PVALUE),
            zscore_entry: yaml.zscore_entry.unwrap_or(DEFAULT_ZSCORE_ENTRY),
            zscore_exit: yaml.zscore_exit.unwrap_or(DEFAULT_ZSCORE_EXIT),
            zscore_hard_stop: yaml.zscore_hard_stop.unwrap_or(DEFAULT_ZSCORE_HARD_STOP),
            training_window: yaml.training_window.unwrap_or(DEFAULT_TRAINING_WINDOW),
            trading_window,
            max_position_weight: yaml
                .max_position_weight
                .unwrap_or(DEFAULT_MAX_POSITION_WEIGHT),
            max_gross_leverage: yaml
                .max_gross_leverage
                .unwrap_or(DEFAULT_MAX_GROSS_LEVERAGE),
            time_stop_bars: yaml.time_stop_bars.unwrap_or(DEFAULT_TIME_STOP_BARS),
            cooldown_bars: yaml.cooldown_bars.unwrap_or(DEFAULT_COOLDOWN_BARS),
            tick_interval_secs: yaml.tick_interval.unwrap_or(DEFAULT_TICK_INTERVAL_SECS),
            total_capital: yaml.total_capital.unwrap_or(DEFAULT_TOTAL_CAPITAL),
            max_exposure_per_pair: yaml
                .max_exposure_per_pair
                .unwrap_or(DEFAULT_MAX_EXPOSURE_PER_PAIR),
            adf_pvalue: yaml.adf_pvalue.unwrap_or(DEFAULT_ADF_PVALUE),
            adf_max_lag: yaml.adf_max_lag.unwrap_or(DEFAULT_ADF_MAX_LAG),
            hedge_ratio_min: yaml.hedge_ratio_min.unwrap_or(DEFAULT_HEDGE_RATIO_MIN),
            hedge_ratio_max: yaml.hedge_ratio_max.unwrap_or(DEFAULT_HEDGE_RATIO_MAX),
            max_half_life_bars: yaml.max_half_life_bars,
            max_pairs: yaml.max_pairs.unwrap_or(DEFAULT_MAX_PAIRS),
            max_pairs_per_sector: yaml
                .max_pairs_per_sector
                .unwrap_or(DEFAULT_MAX_PAIRS_PER_SECTOR),
            discovery_workers: yaml
                .discovery_workers
                .unwrap_or(DEFAULT_DISCOVERY_WORKERS),
            start,
            end,
            state_file: yaml
                .state_file
                .unwrap_or_else(|| DEFAULT_STATE_FILE.to_string()),
            report_file: yaml.report_file,
            max_exit_retries: yaml.max_exit_retries.unwrap_or(DEFAULT_MAX_EXIT_RETRIES),
            exit_retry_delay_ms: yaml
                .exit_retry_delay_ms
                .unwrap_or(DEFAULT_EXIT_RETRY_DELAY_MS),
            pair_refresh_secs: yaml.pair_refresh_secs,
            rebalance_threshold: yaml
                .rebalance_threshold
                .unwrap_or(DEFAULT_REBALANCE_THRESHOLD),
            observe_only: yaml.observe_only.unwrap_or(false),
            max_ticks: yaml.max_ticks,
        }
    }

    /// Reject thresholds and sizes that cannot drive the engine.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let invalid = |key: &'static str, reason: String| ConfigError::Invalid { key, reason };
        if !(self.zscore_exit >= 0.0
            && self.zscore_exit < self.zscore_entry
            && self.zscore_entry < self.zscore_hard_stop)
        {
            return Err(invalid(
                "ZSCORE_*",
                format!(
                    "need 0 <= exit ({}) < entry ({}) < hard stop ({})",
                    self.zscore_exit, self.zscore_entry, self.zscore_hard_stop
                ),
            ));
        }
        if self.training_window < 20 {
            return Err(invalid(
                "TRAINING_WINDOW",
                format!("{} bars is too short for the unit-root tests", self.training_window),
            ));
        }
        if self.trading_window == 0 {
            return Err(invalid("TRADING_WINDOW", "must be positive".to_string()));
        }
        for (key, value) in [
            ("COINT_PVALUE", self.coint_pvalue),
            ("ADF_PVALUE", self.adf_pvalue),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(invalid(key, format!("{} is not a probability", value)));
            }
        }
        for (key, value) in [
            ("MAX_POSITION_WEIGHT", self.max_position_weight),
            ("MAX_GROSS_LEVERAGE", self.max_gross_leverage),
            ("TOTAL_CAPITAL", self.total_capital),
            ("MAX_EXPOSURE_PER_PAIR", self.max_exposure_per_pair),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(key, format!("{} must be positive", value)));
            }
        }
        if !(self.hedge_ratio_min > 0.0 && self.hedge_ratio_min < self.hedge_ratio_max) {
            return Err(invalid(
                "HEDGE_RATIO_MIN",
                format!(
                    "bounds [{}, {}] are empty",
                    self.hedge_ratio_min, self.hedge_ratio_max
                ),
            ));
        }
        if self.tick_interval_secs == 0 || self.bar_secs == 0 {
            return Err(invalid(
                "TICK_INTERVAL",
                "tick interval and bar spacing must be positive".to_string(),
            ));
        }
        if self.universe.len() < 2 {
            return Err(invalid(
                "UNIVERSE",
                format!("{} tickers cannot form a pair", self.universe.len()),
            ));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start >= end {
                return Err(invalid("BACKTEST_START", format!("{} is not before {}", start, end)));
            }
        }
        if self.provider == ProviderKind::Replay && self.replay_file.is_none() {
            return Err(ConfigError::Missing("REPLAY_FILE"));
        }
        Ok(())
    }
}

impl StatArbYaml {
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(value) = env_string("RUN_MODE") {
            self.mode = Some(value);
        }
        if let Some(value) = env_string("PRICE_PROVIDER") {
            self.provider = Some(value);
        }
        if let Some(value) = env_string("REPLAY_FILE") {
            self.replay_file = Some(value);
        }
        if let Some(value) = env_string("UNIVERSE") {
            self.universe = Some(StringOrVec::String(value));
        }
        if let Some(value) = env_string("SECTORS") {
            self.sectors = Some(parse_sectors(&value)?);
        }
        if let Some(value) = env_string("BACKTEST_START") {
            self.start = Some(value);
        }
        if let Some(value) = env_string("BACKTEST_END") {
            self.end = Some(value);
        }
        if let Some(value) = env_string("STATE_FILE") {
            self.state_file = Some(value);
        }
        if let Some(value) = env_string("REPORT_FILE") {
            self.report_file = Some(value);
        }

        macro_rules! overlay {
            ($($field:ident => $key:literal),* $(,)?) => {
                $(
                    if let Some(value) = env_parse($key)? {
                        self.$field = Some(value);
                    }
                )*
            };
        }
        overlay!(
            synthetic_seed => "SYNTHETIC_SEED",
            synthetic_bars => "SYNTHETIC_BARS",
            bar_secs => "BAR_SECS",
            sector_restricted => "SECTOR_RESTRICTED",
            coint_pvalue => "COINT_PVALUE",
            zscore_entry => "ZSCORE_ENTRY",
            zscore_exit => "ZSCORE_EXIT",
            zscore_hard_stop => "ZSCORE_HARD_STOP",
            training_window => "TRAINING_WINDOW",
            trading_window => "TRADING_WINDOW",
            max_position_weight => "MAX_POSITION_WEIGHT",
            max_gross_leverage => "MAX_GROSS_LEVERAGE",
            time_stop_bars => "TIME_STOP_BARS",
            cooldown_bars => "COOLDOWN_BARS",
            tick_interval => "TICK_INTERVAL",
            total_capital => "TOTAL_CAPITAL",
            max_exposure_per_pair => "MAX_EXPOSURE_PER_PAIR",
            adf_pvalue => "ADF_PVALUE",
            adf_max_lag => "ADF_MAX_LAG",
            hedge_ratio_min => "HEDGE_RATIO_MIN",
            hedge_ratio_max => "HEDGE_RATIO_MAX",
            max_half_life_bars => "MAX_HALF_LIFE_BARS",
            max_pairs => "MAX_PAIRS",
            max_pairs_per_sector => "MAX_PAIRS_PER_SECTOR",
            discovery_workers => "DISCOVERY_WORKERS",
            max_exit_retries => "MAX_EXIT_RETRIES",
            exit_retry_delay_ms => "EXIT_RETRY_DELAY_MS",
            pair_refresh_secs => "PAIR_REFRESH_SECS",
            rebalance_threshold => "REBALANCE_THRESHOLD",
            observe_only => "OBSERVE_ONLY",
            max_ticks => "MAX_TICKS",
        );
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("{}='{}': {}", key, raw, e)),
        None => Ok(None),
    }
}

/// `KO=Consumer Staples,PEP=Consumer Staples`
fn parse_sectors(raw: &str) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (ticker, sector) = part
            .split_once('=')
            .ok_or_else(|| anyhow!("SECTORS entry '{}' is not TICKER=SECTOR", part))?;
        out.insert(ticker.trim().to_string(), sector.trim().to_string());
    }
    Ok(out)
}

/// RFC 3339 timestamp or a plain `YYYY-MM-DD` date (midnight UTC).
pub fn parse_datetime(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("unrecognised date '{}'", raw))?;
    date.and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| anyhow!("invalid date '{}'", raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
mode: backtest
provider: synthetic
trading_window: 63
universe: KO, PEP, XOM, CVX
sectors:
  KO: Consumer Staples
  PEP: Consumer Staples
  XOM: Energy
  CVX: Energy
zscore_entry: 2.5
start: 2020-01-01
end: "2023-06-30T00:00:00Z"
"#;

    #[test]
    fn yaml_fills_defaults() {
        let cfg = StatArbConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(cfg.mode, RunMode::Backtest);
        assert_eq!(cfg.trading_window, 63);
        assert_eq!(cfg.training_window, 252);
        assert_eq!(cfg.zscore_entry, 2.5);
        assert_eq!(cfg.zscore_exit, 0.5);
        assert_eq!(cfg.universe, vec!["KO", "PEP", "XOM", "CVX"]);
        assert_eq!(cfg.sectors["XOM"], "Energy");
        assert_eq!(cfg.max_exit_retries, 3);
        assert!(cfg.start.unwrap() < cfg.end.unwrap());
        cfg.validate().unwrap();
    }

    #[test]
    fn trading_window_has_no_default() {
        let err = StatArbConfig::from_yaml_str("mode: live\n").unwrap_err();
        let config_err = err.downcast_ref::<ConfigError>().unwrap();
        assert_eq!(*config_err, ConfigError::Missing("TRADING_WINDOW"));
    }

    #[test]
    fn universe_defaults_to_sector_map() {
        let cfg = StatArbConfig::from_yaml_str(
            "trading_window: 21\nsectors:\n  PEP: Staples\n  KO: Staples\n",
        )
        .unwrap();
        assert_eq!(cfg.universe, vec!["KO", "PEP"]);
    }

    #[test]
    fn validate_rejects_inverted_thresholds() {
        let mut cfg = StatArbConfig::from_yaml_str(SAMPLE).unwrap();
        cfg.zscore_hard_stop = 1.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { key: "ZSCORE_*", .. })
        ));
    }

    #[test]
    fn replay_needs_a_file() {
        let mut cfg = StatArbConfig::from_yaml_str(SAMPLE).unwrap();
        cfg.provider = ProviderKind::Replay;
        assert_eq!(cfg.validate(), Err(ConfigError::Missing("REPLAY_FILE")));
    }

    #[test]
    fn sectors_env_format() {
        let sectors = parse_sectors("KO=Consumer Staples, XOM=Energy").unwrap();
        assert_eq!(sectors["KO"], "Consumer Staples");
        assert_eq!(sectors["XOM"], "Energy");
        assert!(parse_sectors("KO").is_err());
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let err = StatArbConfig::from_yaml_str("trading_window: 5\nmode: paper\n").unwrap_err();
        assert!(err.to_string().contains("unknown run mode"));
    }
}
