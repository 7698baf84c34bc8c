use anyhow::{Context, Result};
use statarb::config::{RunMode, StatArbConfig};
use statarb::live::LiveTrader;
use statarb::logging;
use statarb::ports::price_provider::ProviderBox;
use statarb::scheduler::Backtester;
use statarb::trade::execution::broker::BrokerBox;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let git_hash = option_env!("STATARB_GIT_HASH").unwrap_or("unknown");
    log::info!("statarb git: {}", git_hash);
    let cfg = StatArbConfig::from_env_or_yaml().context("invalid statarb config")?;
    cfg.validate().context("invalid statarb config")?;
    log::info!(
        "[CONFIG] mode={:?} provider={} universe={} training={} trading={} entry={} exit={} stop={}",
        cfg.mode,
        cfg.provider,
        cfg.universe.len(),
        cfg.training_window,
        cfg.trading_window,
        cfg.zscore_entry,
        cfg.zscore_exit,
        cfg.zscore_hard_stop
    );

    let provider = ProviderBox::create(&cfg).context("failed to initialize price provider")?;
    match cfg.mode {
        RunMode::Backtest => {
            log::info!("Starting walk-forward backtest...");
            let report = Backtester::new(&cfg)
                .run_with_provider(&cfg, &provider)
                .await?;
            if let Some(path) = &cfg.report_file {
                report.write_json(path)?;
            }
        }
        RunMode::Live => {
            log::info!("Starting live trading loop...");
            let broker = BrokerBox::paper(&cfg);
            let mut trader = LiveTrader::new(cfg, Box::new(provider), Box::new(broker));
            trader.run().await?;
        }
    }
    Ok(())
}
