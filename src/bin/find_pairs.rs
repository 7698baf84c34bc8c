use anyhow::{Context, Result};
use chrono::Duration;
use statarb::config::StatArbConfig;
use statarb::discovery::{DiscoveryParams, PairDiscovery};
use statarb::logging;
use statarb::ports::price_provider::{PriceProvider, ProviderBox};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;

// One-shot scan over the trailing training window.
// Usage: find-pairs [--unrestricted]
#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let unrestricted = env::args().skip(1).any(|arg| arg == "--unrestricted");
    let mut cfg = StatArbConfig::from_env_or_yaml().context("invalid statarb config")?;
    if unrestricted {
        cfg.sector_restricted = false;
    }
    cfg.validate().context("invalid statarb config")?;

    let provider = ProviderBox::create(&cfg).context("failed to initialize price provider")?;
    let end = cfg
        .end
        .or_else(|| provider.coverage().map(|(_, last)| last))
        .unwrap_or_else(|| provider.now());
    let span = Duration::seconds(cfg.bar_secs as i64) * (cfg.training_window as i32 * 2);
    let prices = provider
        .get_prices(&cfg.universe, end - span, end)
        .await
        .context("training history unavailable")?;
    let training: HashMap<_, _> = prices
        .into_iter()
        .map(|(ticker, series)| {
            let tail = series.tail(cfg.training_window);
            (ticker, tail)
        })
        .collect();

    let discovery = PairDiscovery::new(DiscoveryParams::from(&cfg), cfg.sectors.clone());
    let outcome = discovery
        .scan_parallel(Arc::new(training), end, cfg.discovery_workers)
        .await;

    println!(
        "{:<14} {:<16} {:>8} {:>10} {:>10} {:>9}",
        "pair", "sector", "hedge", "coint_p", "adf_p", "half_life"
    );
    for pair in &outcome.pairs {
        println!(
            "{:<14} {:<16} {:>8.4} {:>10.5} {:>10.5} {:>9.1}",
            pair.label(),
            pair.sector,
            pair.hedge_ratio,
            pair.p_value,
            pair.adf_p_value,
            pair.half_life
        );
    }
    println!(
        "{} selected from {} candidates ({} tested, {} failed) at {}",
        outcome.pairs.len(),
        outcome.candidates,
        outcome.tested,
        outcome.failures.len(),
        end
    );
    Ok(())
}
