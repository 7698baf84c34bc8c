use statarb::config::StatArbConfig;
use statarb::ports::synthetic::SyntheticProvider;
use statarb::scheduler::Backtester;

const TRAINING: usize = 120;
const TRADING: usize = 30;
const BARS: usize = 330;

fn config() -> StatArbConfig {
    let mut cfg = StatArbConfig::with_trading_window(TRADING);
    cfg.training_window = TRAINING;
    cfg.synthetic_bars = BARS;
    cfg.synthetic_seed = 21;
    cfg.universe = ["KO", "PEP", "XOM", "CVX", "JPM"]
        .iter()
        .map(|t| t.to_string())
        .collect();
    cfg.sectors = [
        ("KO", "Staples"),
        ("PEP", "Staples"),
        ("XOM", "Energy"),
        ("CVX", "Energy"),
    ]
    .iter()
    .map(|(t, s)| (t.to_string(), s.to_string()))
    .collect();
    cfg.discovery_workers = 2;
    cfg
}

#[tokio::test]
async fn synthetic_history_is_walked_window_by_window() {
    let cfg = config();
    let provider = SyntheticProvider::from_config(&cfg);
    let report = Backtester::new(&cfg)
        .run_with_provider(&cfg, &provider)
        .await
        .unwrap();

    assert_eq!(report.windows.len(), (BARS - TRAINING) / TRADING);
    assert_eq!(report.bars.len(), BARS - TRAINING);
    let indices: Vec<usize> = report.bars.iter().map(|b| b.bar_index).collect();
    assert_eq!(indices, (TRAINING..BARS).collect::<Vec<_>>());

    for pair in report.windows.windows(2) {
        assert!(pair[0].trade_end < pair[1].trade_start);
        assert!(pair[0].train_end < pair[0].trade_start);
    }
    for window in &report.windows {
        for pair in &window.pairs {
            assert_ne!(pair.sector, "MIXED");
            assert!(pair.p_value < cfg.coint_pvalue);
        }
    }
    for bar in &report.bars {
        assert!(bar.gross_leverage <= cfg.max_gross_leverage + 1e-9);
        assert!(bar.open_pairs <= bar.selected_pairs);
    }
}

#[tokio::test]
async fn same_seed_gives_the_same_report() {
    let cfg = config();
    let first = Backtester::new(&cfg)
        .run_with_provider(&cfg, &SyntheticProvider::from_config(&cfg))
        .await
        .unwrap();
    let second = Backtester::new(&cfg)
        .run_with_provider(&cfg, &SyntheticProvider::from_config(&cfg))
        .await
        .unwrap();
    assert_eq!(first.events.len(), second.events.len());
    assert_eq!(first.cumulative_return(), second.cumulative_return());
}

#[tokio::test]
async fn report_is_written_as_json() {
    let cfg = config();
    let report = Backtester::new(&cfg)
        .run_with_provider(&cfg, &SyntheticProvider::from_config(&cfg))
        .await
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");
    report.write_json(path.to_str().unwrap()).unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed["bars"].as_array().unwrap().len(), BARS - TRAINING);
    assert_eq!(
        parsed["windows"].as_array().unwrap().len(),
        report.windows.len()
    );
}
