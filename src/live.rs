use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, MissedTickBehavior};

use crate::alert_notifier::notify_alert;
use crate::config::StatArbConfig;
use crate::discovery::{DiscoveryParams, PairDiscovery};
use crate::error::EngineError;
use crate::model::{
    AlignedPrices, Pair, PairKey, PortfolioWeights, PositionState, PositionStatus, PriceSeries,
    SignalEvent, TransitionReason,
};
use crate::portfolio::{share_targets, OpenPair, PortfolioConstructor, PortfolioParams};
use crate::ports::price_provider::PriceProvider;
use crate::signal::{log_event, SignalEngine, SignalParams};
use crate::spread::{RollingSpread, SpreadModel};
use crate::state_store::{StateSnapshot, StateStore};
use crate::trade::execution::broker::Broker;

// Bars fetched on each poll; only the newest one per ticker is used.
const POLL_BARS: i64 = 5;

struct LivePair {
    pair: Pair,
    model: SpreadModel,
    state: PositionState,
    rolling: RollingSpread,
}

/// Reverse order for a leg that filled while its partner did not.
#[derive(Debug, Clone)]
struct Compensation {
    context: String,
    ticker: String,
    quantity: Decimal,
    attempts: u32,
}

#[derive(Debug)]
struct LegFailure {
    filled: Vec<(String, Decimal)>,
    error: EngineError,
}

/// Polling trader: the walk-forward cycle with one selection at startup
/// (optionally refreshed) and an open-ended tick loop.
pub struct LiveTrader {
    cfg: StatArbConfig,
    provider: Box<dyn PriceProvider>,
    broker: Box<dyn Broker>,
    store: StateStore,
    discovery: PairDiscovery,
    signals: SignalEngine,
    portfolio: PortfolioConstructor,
    book: BTreeMap<PairKey, LivePair>,
    history: HashMap<String, PriceSeries>,
    marks: BTreeMap<String, f64>,
    weights: PortfolioWeights,
    compensations: Vec<Compensation>,
    events: Vec<SignalEvent>,
    bar_index: u64,
    last_refresh: Option<DateTime<Utc>>,
}

impl LiveTrader {
    pub fn new(
        cfg: StatArbConfig,
        provider: Box<dyn PriceProvider>,
        broker: Box<dyn Broker>,
    ) -> Self {
        Self {
            store: StateStore::new(&cfg.state_file),
            discovery: PairDiscovery::new(DiscoveryParams::from(&cfg), cfg.sectors.clone()),
            signals: SignalEngine::new(SignalParams::from(&cfg)),
            portfolio: PortfolioConstructor::new(PortfolioParams::live(&cfg)),
            cfg,
            provider,
            broker,
            book: BTreeMap::new(),
            history: HashMap::new(),
            marks: BTreeMap::new(),
            weights: PortfolioWeights::default(),
            compensations: Vec::new(),
            events: Vec::new(),
            bar_index: 0,
            last_refresh: None,
        }
    }

    pub fn position(&self, key: &PairKey) -> Option<&PositionState> {
        self.book.get(key).map(|entry| &entry.state)
    }

    pub fn pairs(&self) -> impl Iterator<Item = &Pair> {
        self.book.values().map(|entry| &entry.pair)
    }

    pub fn events(&self) -> &[SignalEvent] {
        &self.events
    }

    /// Target weights of the last tick that reached portfolio construction.
    pub fn weights(&self) -> &PortfolioWeights {
        &self.weights
    }

    pub async fn run(&mut self) -> Result<()> {
        self.startup().await?;

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.cfg.tick_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::signal::ctrl_c() => {
                    log::info!("[LIVE] shutdown requested");
                    break;
                }
            }
            if !self.provider.advance() {
                log::info!("[LIVE] price feed exhausted at {}", self.provider.now());
                break;
            }
            if let Err(e) = self.tick().await {
                log::error!("[LIVE] tick failed: {:?}", e);
            }
            ticks += 1;
            if self.cfg.max_ticks.map_or(false, |max| ticks >= max) {
                log::info!("[LIVE] reached {} ticks, stopping", ticks);
                break;
            }
        }
        self.persist()
    }

    /// Warm-up, restore, reconcile against the broker, select pairs, persist.
    pub async fn startup(&mut self) -> Result<()> {
        let now = self.provider.now();
        log::info!(
            "[LIVE] starting at {} with {} tickers, observe_only={}",
            now,
            self.cfg.universe.len(),
            self.cfg.observe_only
        );
        self.warm_up(now).await?;
        self.restore()?;
        self.reconcile().await?;
        self.refresh_pairs(now).await;
        self.persist()
    }

    pub async fn warm_up(&mut self, now: DateTime<Utc>) -> Result<()> {
        let bar = ChronoDuration::seconds(self.cfg.bar_secs as i64);
        let span = bar * (self.cfg.training_window as i32).saturating_mul(2);
        let prices = self
            .provider
            .get_prices(&self.cfg.universe, now - span, now)
            .await
            .context("warm-up history unavailable")?;
        let window = self.cfg.training_window;
        self.history = prices
            .into_iter()
            .map(|(ticker, series)| (ticker, series.tail(window)))
            .collect();
        for (ticker, series) in &self.history {
            if let Some((_, price)) = series.last() {
                self.marks.insert(ticker.clone(), price);
            }
            if series.len() < self.cfg.training_window {
                log::warn!(
                    "[LIVE] {} has {} of {} warm-up bars at {}",
                    ticker,
                    series.len(),
                    self.cfg.training_window,
                    now
                );
            }
        }
        log::info!("[LIVE] warm-up loaded {} tickers at {}", self.history.len(), now);
        Ok(())
    }

    pub fn restore(&mut self) -> Result<()> {
        let snapshot = match self.store.load()? {
            Some(snapshot) => snapshot,
            None => return Ok(()),
        };
        self.bar_index = snapshot.bar_index;
        for pair in &snapshot.active_pairs {
            let state = snapshot.position(&pair.key()).cloned().unwrap_or_default();
            log::info!("[STATE] restored {} as {}", pair.label(), state.status);
            self.adopt_pair(pair.clone(), state);
        }
        Ok(())
    }

    /// Align every pair's state with the broker's holdings. The broker wins.
    pub async fn reconcile(&mut self) -> Result<Vec<SignalEvent>> {
        let held = self
            .broker
            .get_positions()
            .await
            .context("broker positions unavailable for reconciliation")?;
        let now = self.provider.now();
        let mut events = Vec::new();

        for entry in self.book.values_mut() {
            let label = entry.pair.label();
            let qty_a = held.get(&entry.pair.ticker_a).copied().unwrap_or(Decimal::ZERO);
            let qty_b = held.get(&entry.pair.ticker_b).copied().unwrap_or(Decimal::ZERO);
            let current = entry.state.status;
            let next = match implied_status(qty_a, qty_b) {
                Some(status) if status == current => continue,
                Some(PositionStatus::Flat) if !current.is_directional() => continue,
                Some(PositionStatus::Flat) => PositionState::flat(),
                Some(status) => PositionState::opened(
                    status,
                    self.bar_index,
                    now,
                    entry.rolling.z_score(),
                ),
                None => {
                    let detail = format!(
                        "{} holds {}={} {}={}, not a pair position",
                        label, entry.pair.ticker_a, qty_a, entry.pair.ticker_b, qty_b
                    );
                    notify_alert(&format!("reconcile {}", label), &detail);
                    PositionState {
                        needs_attention: true,
                        ..PositionState::flat()
                    }
                }
            };
            log::warn!(
                "[RECONCILE] {} persisted {} but broker holds {}={} {}={}, now {}",
                label,
                current,
                entry.pair.ticker_a,
                qty_a,
                entry.pair.ticker_b,
                qty_b,
                next.status
            );
            let event = SignalEvent {
                pair: label,
                from: current,
                to: next.status,
                reason: TransitionReason::Reconciled,
                timestamp: now,
                bar_index: self.bar_index,
                z_score: entry.rolling.z_score(),
            };
            entry.state = next;
            log_event(&event);
            events.push(event);
        }

        let attributed: BTreeSet<&str> = self
            .book
            .values()
            .flat_map(|e| [e.pair.ticker_a.as_str(), e.pair.ticker_b.as_str()])
            .collect();
        for (ticker, qty) in &held {
            if !qty.is_zero() && !attributed.contains(ticker.as_str()) {
                log::warn!(
                    "[RECONCILE] {} qty={} is not part of any restored pair",
                    ticker,
                    qty
                );
            }
        }

        self.events.extend(events.iter().cloned());
        Ok(events)
    }

    /// Re-run discovery on the warm-up history. Deselected open pairs are
    /// flattened; their legs are closed by the next tick's rebalance. Pairs
    /// flagged for attention stay in the book until resolved.
    pub async fn refresh_pairs(&mut self, now: DateTime<Utc>) {
        let training = Arc::new(self.history.clone());
        let outcome = self
            .discovery
            .scan_parallel(training, now, self.cfg.discovery_workers)
            .await;
        log::info!(
            "[DISCOVERY] live refresh at {}: {} pairs selected, {} failures",
            now,
            outcome.pairs.len(),
            outcome.failures.len()
        );
        let selected: BTreeMap<PairKey, Pair> =
            outcome.pairs.into_iter().map(|p| (p.key(), p)).collect();

        let dropped: Vec<PairKey> = self
            .book
            .iter()
            .filter(|(k, entry)| !selected.contains_key(*k) && !entry.state.needs_attention)
            .map(|(k, _)| k.clone())
            .collect();
        for (key, entry) in &self.book {
            if entry.state.needs_attention && !selected.contains_key(key) {
                log::warn!("[LIVE] {} deselected at {} but kept until resolved", key, now);
            }
        }
        for key in dropped {
            if let Some(mut entry) = self.book.remove(&key) {
                let z = entry.rolling.z_score();
                if let Some(ev) = self.signals.force_flatten(
                    &entry.pair.label(),
                    &mut entry.state,
                    TransitionReason::Deselected,
                    self.bar_index,
                    now,
                    z,
                ) {
                    self.events.push(ev);
                }
                log::info!("[LIVE] {} deselected at {}", key, now);
            }
        }

        for (key, pair) in selected {
            let state = self
                .book
                .remove(&key)
                .map(|entry| entry.state)
                .unwrap_or_default();
            self.adopt_pair(pair, state);
        }
        self.last_refresh = Some(now);
    }

    fn adopt_pair(&mut self, pair: Pair, state: PositionState) {
        let model = SpreadModel::for_pair(&pair, self.cfg.training_window);
        let rolling = match (self.history.get(&pair.ticker_a), self.history.get(&pair.ticker_b)) {
            (Some(a), Some(b)) => {
                let aligned = AlignedPrices::align(a, b);
                RollingSpread::seeded_until(
                    self.cfg.training_window,
                    &model.spread_series(&aligned),
                    aligned.timestamps.last().copied(),
                )
            }
            _ => RollingSpread::new(self.cfg.training_window),
        };
        self.book.insert(
            pair.key(),
            LivePair {
                pair,
                model,
                state,
                rolling,
            },
        );
    }

    fn refresh_due(&self, now: DateTime<Utc>) -> bool {
        match (self.cfg.pair_refresh_secs, self.last_refresh) {
            (Some(secs), Some(last)) => now - last >= ChronoDuration::seconds(secs as i64),
            _ => false,
        }
    }

    fn tracked_tickers(&self) -> Vec<String> {
        let mut tickers: BTreeSet<String> = self
            .book
            .values()
            .flat_map(|e| [e.pair.ticker_a.clone(), e.pair.ticker_b.clone()])
            .collect();
        tickers.extend(self.weights.tickers().cloned());
        tickers.into_iter().collect()
    }

    pub async fn tick(&mut self) -> Result<()> {
        let now = self.provider.now();
        self.retry_compensations().await;

        if self.refresh_due(now) {
            self.warm_up(now).await?;
            self.refresh_pairs(now).await;
        }

        let tickers = self.tracked_tickers();
        if tickers.is_empty() {
            log::debug!("[LIVE] no pairs selected at {}", now);
            return self.persist();
        }
        let span = ChronoDuration::seconds(self.cfg.bar_secs as i64 * POLL_BARS);
        let polled = self
            .provider
            .get_prices(&tickers, now - span, now)
            .await
            .with_context(|| format!("price refresh failed at {}", now))?;
        let latest: HashMap<String, (DateTime<Utc>, f64)> = polled
            .iter()
            .filter_map(|(t, s)| s.last().map(|p| (t.clone(), p)))
            .collect();
        for (ticker, (_, price)) in &latest {
            self.marks.insert(ticker.clone(), *price);
        }
        self.broker.observe_prices(&self.marks).await;
        let held = self
            .broker
            .get_positions()
            .await
            .context("broker positions unavailable")?;
        let held_back = self.attention_holds(&held, now);

        // evaluate without committing; execution decides what sticks
        let bar_index = self.bar_index + 1;
        let mut proposals: BTreeMap<PairKey, (PositionState, Option<SignalEvent>)> =
            BTreeMap::new();
        for (key, entry) in self.book.iter_mut() {
            let (ta, pa) = match latest.get(&entry.pair.ticker_a) {
                Some(v) => *v,
                None => continue,
            };
            let (tb, pb) = match latest.get(&entry.pair.ticker_b) {
                Some(v) => *v,
                None => continue,
            };
            let at = ta.max(tb);
            if entry.rolling.last_timestamp().map_or(false, |last| at <= last) {
                continue;
            }
            let z = entry.rolling.push_at(at, entry.model.spread(pa, pb));
            let mut proposal =
                self.signals
                    .evaluate(&entry.pair.label(), &entry.state, z, bar_index, at);
            let is_entry = proposal.1.as_ref().map_or(false, |ev| ev.to.is_directional());
            if entry.state.needs_attention && is_entry {
                log::warn!(
                    "[LIVE] {} entry at {} blocked until its holdings are resolved",
                    key,
                    at
                );
                proposal = (entry.state.clone(), None);
            }
            proposals.insert(key.clone(), proposal);
        }
        if proposals.is_empty() {
            log::debug!("[LIVE] no new bar at {}", now);
            return Ok(());
        }

        let mut open = Vec::new();
        for (key, entry) in &self.book {
            let status = proposals
                .get(key)
                .map(|(s, _)| s.status)
                .unwrap_or(entry.state.status);
            if !status.is_directional() {
                continue;
            }
            match (
                self.marks.get(&entry.pair.ticker_a),
                self.marks.get(&entry.pair.ticker_b),
            ) {
                (Some(pa), Some(pb)) => open.push(OpenPair {
                    ticker_a: entry.pair.ticker_a.clone(),
                    ticker_b: entry.pair.ticker_b.clone(),
                    hedge_ratio: entry.pair.hedge_ratio,
                    direction: status,
                    price_a: *pa,
                    price_b: *pb,
                }),
                _ => log::warn!("[LIVE] {} has no marks at {}", key, now),
            }
        }
        let target_weights = match self.portfolio.construct(&open) {
            Ok(w) => w,
            Err(err) => {
                log::warn!("[PORTFOLIO] {} at {}, tick abandoned, weights held", err, now);
                return Ok(());
            }
        };

        let targets = share_targets(&target_weights, self.cfg.total_capital, &self.marks);
        let mut deltas: BTreeMap<String, Decimal> = BTreeMap::new();
        let universe: BTreeSet<&String> = self.cfg.universe.iter().collect();
        for ticker in targets.keys().chain(held.keys().filter(|t| universe.contains(t))) {
            if held_back.contains(ticker) {
                continue;
            }
            let target = targets.get(ticker).copied().unwrap_or(Decimal::ZERO);
            let current = held.get(ticker).copied().unwrap_or(Decimal::ZERO);
            deltas.insert(ticker.clone(), target - current);
        }

        let mut traded: BTreeSet<String> = BTreeSet::new();
        let mut commits: BTreeMap<PairKey, PositionState> = BTreeMap::new();
        let mut committed_events = Vec::new();
        let (exits, rest): (Vec<_>, Vec<_>) = proposals.into_iter().partition(|(_, (_, ev))| {
            ev.as_ref().map_or(false, |e| e.from.is_directional())
        });
        let (entries, passive): (Vec<_>, Vec<_>) = rest
            .into_iter()
            .partition(|(_, (_, ev))| ev.as_ref().map_or(false, |e| e.to.is_directional()));

        for (key, (next, event)) in exits {
            let event = match event {
                Some(ev) => ev,
                None => continue,
            };
            let legs = self.pair_legs(&key, &deltas, &mut traded);
            match self
                .execute_legs(&event.pair, &legs, self.cfg.max_exit_retries)
                .await
            {
                Ok(()) => {
                    commits.insert(key, next);
                    committed_events.push(event);
                }
                Err(failure) if event.reason.is_forced_exit() => {
                    notify_alert(
                        &format!("unresolved forced exit {}", event.pair),
                        &format!(
                            "{:?} at {} could not be executed: {}; cooldown started, position needs attention",
                            event.reason, event.timestamp, failure.error
                        ),
                    );
                    commits.insert(
                        key,
                        PositionState {
                            needs_attention: true,
                            ..next
                        },
                    );
                    committed_events.push(event);
                }
                Err(failure) => {
                    notify_alert(
                        &format!("unresolved exit {}", event.pair),
                        &format!(
                            "soft exit at {} failed: {}; position kept",
                            event.timestamp, failure.error
                        ),
                    );
                    self.queue_reversals(&event.pair, failure.filled);
                    if let Some(entry) = self.book.get(&key) {
                        let mut kept = entry.state.clone();
                        kept.bars_held = kept.bars_held.saturating_add(1);
                        commits.insert(key, kept);
                    }
                }
            }
        }

        for (key, (next, event)) in entries {
            let event = match event {
                Some(ev) => ev,
                None => continue,
            };
            let legs = self.pair_legs(&key, &deltas, &mut traded);
            match self.execute_legs(&event.pair, &legs, 0).await {
                Ok(()) => {
                    commits.insert(key, next);
                    committed_events.push(event);
                }
                Err(failure) => {
                    log::warn!(
                        "[ORDER] {} entry at {} not executed: {}; re-evaluated next tick",
                        event.pair,
                        event.timestamp,
                        failure.error
                    );
                    self.queue_reversals(&event.pair, failure.filled);
                }
            }
        }

        for (key, (next, event)) in passive {
            commits.insert(key, next);
            if let Some(ev) = event {
                committed_events.push(ev);
            }
        }

        self.rebalance(&deltas, &targets, &traded).await;

        for (key, state) in commits {
            if let Some(entry) = self.book.get_mut(&key) {
                entry.state = state;
            }
        }
        for ev in &committed_events {
            log_event(ev);
        }
        self.events.extend(committed_events);
        self.weights = target_weights;
        self.bar_index = bar_index;
        self.persist()
    }

    /// Tickers of pairs flagged for manual attention, which are left untraded.
    /// A flag clears once the broker reports both legs flat.
    fn attention_holds(
        &mut self,
        held: &BTreeMap<String, Decimal>,
        now: DateTime<Utc>,
    ) -> BTreeSet<String> {
        let mut hold = BTreeSet::new();
        for entry in self.book.values_mut() {
            if !entry.state.needs_attention {
                continue;
            }
            let legs = [&entry.pair.ticker_a, &entry.pair.ticker_b];
            if legs.iter().all(|t| held.get(*t).map_or(true, |q| q.is_zero())) {
                log::info!(
                    "[RECONCILE] {} legs flat at {}, attention cleared",
                    entry.pair.label(),
                    now
                );
                entry.state.needs_attention = false;
            } else {
                hold.extend(legs.iter().map(|t| t.to_string()));
            }
        }
        hold
    }

    /// Non-zero deltas of a pair's legs that no earlier pair has traded this tick.
    fn pair_legs(
        &self,
        key: &PairKey,
        deltas: &BTreeMap<String, Decimal>,
        traded: &mut BTreeSet<String>,
    ) -> Vec<(String, Decimal)> {
        let (a, b) = key.tickers();
        let mut legs = Vec::new();
        for ticker in [a, b] {
            if !traded.insert(ticker.to_string()) {
                continue;
            }
            if let Some(delta) = deltas.get(ticker).filter(|d| !d.is_zero()) {
                legs.push((ticker.to_string(), *delta));
            }
        }
        legs
    }

    async fn execute_legs(
        &self,
        pair: &str,
        legs: &[(String, Decimal)],
        retries: u32,
    ) -> std::result::Result<(), LegFailure> {
        let mut filled = Vec::new();
        for (ticker, qty) in legs {
            match self.submit_with_retry(pair, ticker, *qty, retries).await {
                Ok(_) => filled.push((ticker.clone(), *qty)),
                Err(error) => return Err(LegFailure { filled, error }),
            }
        }
        Ok(())
    }

    async fn submit_with_retry(
        &self,
        pair: &str,
        ticker: &str,
        qty: Decimal,
        retries: u32,
    ) -> std::result::Result<String, EngineError> {
        if self.cfg.observe_only {
            log::info!("[ORDER] {} {} qty={} skipped (observe only)", pair, ticker, qty);
            return Ok("observe-only".to_string());
        }
        let attempts = retries + 1;
        let mut attempt = 1;
        loop {
            match self.broker.submit_market_order(ticker, qty).await {
                Ok(order_id) => return Ok(order_id),
                Err(err) if attempt < attempts => {
                    log::warn!(
                        "[ORDER] {} {} qty={} attempt {}/{} failed: {}",
                        pair,
                        ticker,
                        qty,
                        attempt,
                        attempts,
                        err
                    );
                    attempt += 1;
                    if self.cfg.exit_retry_delay_ms > 0 {
                        sleep(Duration::from_millis(self.cfg.exit_retry_delay_ms)).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn queue_reversals(&mut self, pair: &str, filled: Vec<(String, Decimal)>) {
        for (ticker, qty) in filled {
            log::warn!("[ORDER] {} queued reversal of {} qty={}", pair, ticker, -qty);
            self.compensations.push(Compensation {
                context: pair.to_string(),
                ticker,
                quantity: -qty,
                attempts: 0,
            });
        }
    }

    async fn retry_compensations(&mut self) {
        let pending = std::mem::take(&mut self.compensations);
        for mut comp in pending {
            match self.submit_with_retry(&comp.context, &comp.ticker, comp.quantity, 0).await {
                Ok(_) => log::info!(
                    "[ORDER] {} reversal of {} qty={} done",
                    comp.context,
                    comp.ticker,
                    comp.quantity
                ),
                Err(err) => {
                    comp.attempts += 1;
                    if comp.attempts >= self.cfg.max_exit_retries.max(1) {
                        notify_alert(
                            &format!("unresolved reversal {}", comp.context),
                            &format!(
                                "{} qty={} failed {} times: {}",
                                comp.ticker, comp.quantity, comp.attempts, err
                            ),
                        );
                    } else {
                        self.compensations.push(comp);
                    }
                }
            }
        }
    }

    /// Trade what the pair transitions left over. Closing a leg gets the exit
    /// retry budget; drift adjustments below the threshold are skipped.
    async fn rebalance(
        &self,
        deltas: &BTreeMap<String, Decimal>,
        targets: &BTreeMap<String, Decimal>,
        traded: &BTreeSet<String>,
    ) {
        let threshold = self.cfg.rebalance_threshold * self.cfg.total_capital;
        for (ticker, delta) in deltas {
            if delta.is_zero() || traded.contains(ticker) {
                continue;
            }
            let closing = targets.get(ticker).map_or(true, |t| t.is_zero());
            let notional = delta.abs().to_f64().unwrap_or(0.0)
                * self.marks.get(ticker).copied().unwrap_or(0.0);
            if !closing && notional < threshold {
                continue;
            }
            let retries = if closing { self.cfg.max_exit_retries } else { 0 };
            let context = if closing { "close" } else { "rebalance" };
            if let Err(err) = self.submit_with_retry(context, ticker, *delta, retries).await {
                if closing {
                    notify_alert(
                        &format!("unresolved close {}", ticker),
                        &format!("qty={} failed: {}", delta, err),
                    );
                } else {
                    log::warn!("[ORDER] rebalance {} qty={} failed: {}", ticker, delta, err);
                }
            }
        }
    }

    fn persist(&self) -> Result<()> {
        let mut snapshot = StateSnapshot::new(self.provider.now(), self.bar_index);
        for entry in self.book.values() {
            snapshot.insert(entry.pair.clone(), entry.state.clone());
        }
        self.store.save(&snapshot).context("failed to persist position state")
    }
}

/// Pair status implied by signed leg holdings; `None` when they do not form
/// a hedged pair position.
fn implied_status(qty_a: Decimal, qty_b: Decimal) -> Option<PositionStatus> {
    let zero = Decimal::ZERO;
    match (qty_a.cmp(&zero), qty_b.cmp(&zero)) {
        (std::cmp::Ordering::Equal, std::cmp::Ordering::Equal) => Some(PositionStatus::Flat),
        (std::cmp::Ordering::Greater, std::cmp::Ordering::Less) => Some(PositionStatus::LongSpread),
        (std::cmp::Ordering::Less, std::cmp::Ordering::Greater) => {
            Some(PositionStatus::ShortSpread)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::replay::ReplayProvider;
    use crate::trade::execution::broker::Account;
    use crate::trade::execution::paper_broker::PaperBroker;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::io::Cursor;
    use tempfile::TempDir;

    const TRAINING: usize = 20;
    const LIVE_BARS: usize = 6;

    type OrderLog = Arc<std::sync::Mutex<BTreeMap<String, usize>>>;

    /// Paper broker that rejects every order for the listed tickers and counts
    /// submissions per ticker.
    struct FlakyBroker {
        inner: PaperBroker,
        failing: BTreeSet<String>,
        orders: OrderLog,
    }

    impl FlakyBroker {
        fn new(positions: &[(&str, Decimal)], failing: &[&str]) -> Self {
            let positions = positions
                .iter()
                .map(|(t, q)| (t.to_string(), *q))
                .collect();
            Self {
                inner: PaperBroker::with_positions(dec!(1000000), positions)
                    .with_fill_probability(1.0, 3),
                failing: failing.iter().map(|t| t.to_string()).collect(),
                orders: OrderLog::default(),
            }
        }

        fn orders(&self) -> OrderLog {
            self.orders.clone()
        }
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn get_account(&self) -> std::result::Result<Account, EngineError> {
            self.inner.get_account().await
        }

        async fn get_positions(
            &self,
        ) -> std::result::Result<BTreeMap<String, Decimal>, EngineError> {
            self.inner.get_positions().await
        }

        async fn submit_market_order(
            &self,
            ticker: &str,
            quantity: Decimal,
        ) -> std::result::Result<String, EngineError> {
            *self
                .orders
                .lock()
                .unwrap()
                .entry(ticker.to_string())
                .or_insert(0) += 1;
            if self.failing.contains(ticker) {
                return Err(EngineError::order_failed(ticker, quantity, "rejected"));
            }
            self.inner.submit_market_order(ticker, quantity).await
        }

        async fn observe_prices(&self, prices: &BTreeMap<String, f64>) {
            self.inner.observe_prices(prices).await
        }
    }

    // KO = 1.5 * PEP plus an alternating +-0.2 spread; every bar after the
    // warm-up has spread `last_spread`.
    fn dump(last_spread: f64) -> String {
        let t0 = 1_704_067_200_000i64;
        (0..=TRAINING + LIVE_BARS)
            .map(|t| {
                let pep = 100.0 + 0.5 * t as f64;
                let spread = if t > TRAINING {
                    last_spread
                } else if t % 2 == 0 {
                    0.2
                } else {
                    -0.2
                };
                format!(
                    "{{\"timestamp\": {}, \"prices\": {{\"KO\": {}, \"PEP\": {}}}}}\n",
                    t0 + t as i64 * 86_400_000,
                    1.5 * pep + spread,
                    pep
                )
            })
            .collect()
    }

    fn config(dir: &TempDir) -> StatArbConfig {
        let mut cfg = StatArbConfig::with_trading_window(5);
        cfg.training_window = TRAINING;
        cfg.universe = vec!["KO".into(), "PEP".into()];
        cfg.sectors = [("KO", "Staples"), ("PEP", "Staples")]
            .iter()
            .map(|(t, s)| (t.to_string(), s.to_string()))
            .collect();
        cfg.state_file = dir.path().join("state.json").to_string_lossy().into_owned();
        cfg.discovery_workers = 1;
        cfg.max_exit_retries = 2;
        cfg.exit_retry_delay_ms = 0;
        cfg
    }

    fn ko_pep() -> Pair {
        Pair {
            ticker_a: "KO".into(),
            ticker_b: "PEP".into(),
            hedge_ratio: 1.5,
            p_value: 0.01,
            adf_p_value: 0.01,
            half_life: 2.0,
            sector: "Staples".into(),
            discovered_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    async fn trader(
        last_spread: f64,
        broker: Box<dyn Broker>,
        state: PositionState,
    ) -> (LiveTrader, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let provider =
            ReplayProvider::from_reader(Cursor::new(dump(last_spread)), TRAINING).unwrap();
        let mut trader = LiveTrader::new(config(&dir), Box::new(provider), broker);
        let now = trader.provider.now();
        trader.warm_up(now).await.unwrap();
        trader.adopt_pair(ko_pep(), state);
        (trader, dir)
    }

    fn key() -> PairKey {
        PairKey::new("KO", "PEP")
    }

    fn long_spread() -> PositionState {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        PositionState::opened(PositionStatus::LongSpread, 14, at, Some(-2.1))
    }

    #[tokio::test]
    async fn entry_buys_a_and_sells_b_then_persists() {
        let broker = PaperBroker::new(dec!(1000000)).with_fill_probability(1.0, 1);
        let (mut trader, dir) = trader(-2.0, Box::new(broker), PositionState::flat()).await;
        assert!(trader.provider.advance());
        trader.tick().await.unwrap();

        let state = trader.position(&key()).unwrap();
        assert_eq!(state.status, PositionStatus::LongSpread);
        assert!(state.entry_z_score.unwrap() <= -2.0);
        assert_eq!(trader.events().last().unwrap().reason, TransitionReason::Entry);

        let held = trader.broker.get_positions().await.unwrap();
        assert!(held["KO"] > Decimal::ZERO);
        assert!(held["PEP"] < Decimal::ZERO);
        assert!(trader.weights().gross() <= 0.1 + 1e-9);

        let saved = StateStore::new(dir.path().join("state.json"))
            .load()
            .unwrap()
            .unwrap();
        assert_eq!(
            saved.position(&key()).unwrap().status,
            PositionStatus::LongSpread
        );
    }

    #[tokio::test]
    async fn stale_bar_is_not_evaluated_twice() {
        let broker = PaperBroker::new(dec!(1000000));
        let (mut trader, _dir) = trader(-2.0, Box::new(broker), PositionState::flat()).await;
        // no advance: the polled bar is the last warm-up bar
        trader.tick().await.unwrap();
        assert_eq!(trader.position(&key()).unwrap().status, PositionStatus::Flat);
        assert!(trader.events().is_empty());
    }

    #[tokio::test]
    async fn failed_entry_leg_keeps_state_and_reverses_filled_leg() {
        let broker = FlakyBroker::new(&[], &["PEP"]);
        let orders = broker.orders();
        let (mut trader, _dir) = trader(-2.0, Box::new(broker), PositionState::flat()).await;
        assert!(trader.provider.advance());
        trader.tick().await.unwrap();

        // entries get a single attempt per leg
        assert_eq!(orders.lock().unwrap().get("KO"), Some(&1));
        assert_eq!(orders.lock().unwrap().get("PEP"), Some(&1));

        assert_eq!(trader.position(&key()).unwrap().status, PositionStatus::Flat);
        assert_eq!(trader.compensations.len(), 1);
        assert_eq!(trader.compensations[0].ticker, "KO");
        assert!(trader.compensations[0].quantity < Decimal::ZERO);
        let held = trader.broker.get_positions().await.unwrap();
        assert!(held["KO"] > Decimal::ZERO);

        // next poll has no new bar but still works the reversal queue
        trader.tick().await.unwrap();
        assert!(trader.compensations.is_empty());
        assert!(!trader.broker.get_positions().await.unwrap().contains_key("KO"));
    }

    #[tokio::test]
    async fn unresolved_forced_exit_still_starts_cooldown() {
        let broker = FlakyBroker::new(&[("KO", dec!(300)), ("PEP", dec!(-450))], &["KO", "PEP"]);
        let orders = broker.orders();
        let (mut trader, _dir) = trader(-2.0, Box::new(broker), long_spread()).await;
        assert!(trader.provider.advance());
        trader.tick().await.unwrap();

        let state = trader.position(&key()).unwrap();
        assert_eq!(state.status, PositionStatus::Cooldown);
        assert!(state.needs_attention);
        assert_eq!(trader.events().last().unwrap().reason, TransitionReason::HardStop);
        assert!(trader.compensations.is_empty());
        // max_exit_retries = 2: three attempts on the first leg, then give up
        assert_eq!(orders.lock().unwrap().get("KO"), Some(&3));
        assert_eq!(orders.lock().unwrap().get("PEP"), None);
    }

    #[tokio::test]
    async fn flagged_holdings_are_not_traded_on_later_ticks() {
        let broker = FlakyBroker::new(&[("KO", dec!(300)), ("PEP", dec!(-450))], &["KO", "PEP"]);
        let orders = broker.orders();
        let (mut trader, _dir) = trader(-2.0, Box::new(broker), long_spread()).await;
        assert!(trader.provider.advance());
        trader.tick().await.unwrap();
        let after_exit: usize = orders.lock().unwrap().values().sum();

        for _ in 0..4 {
            assert!(trader.provider.advance());
            trader.tick().await.unwrap();
        }

        assert_eq!(orders.lock().unwrap().values().sum::<usize>(), after_exit);
        let state = trader.position(&key()).unwrap();
        assert_eq!(state.status, PositionStatus::Cooldown);
        assert!(state.needs_attention);
        assert_eq!(trader.bar_index, 5);
    }

    #[tokio::test]
    async fn one_legged_flagged_pair_is_neither_closed_nor_entered() {
        let broker = FlakyBroker::new(&[("KO", dec!(100))], &[]);
        let orders = broker.orders();
        let flagged = PositionState {
            needs_attention: true,
            ..PositionState::flat()
        };
        let (mut trader, _dir) = trader(-2.0, Box::new(broker), flagged).await;
        assert!(trader.provider.advance());
        trader.tick().await.unwrap();

        assert!(orders.lock().unwrap().is_empty());
        let state = trader.position(&key()).unwrap();
        assert_eq!(state.status, PositionStatus::Flat);
        assert!(state.needs_attention);
        assert_eq!(trader.broker.get_positions().await.unwrap()["KO"], dec!(100));
    }

    #[tokio::test]
    async fn attention_clears_once_the_broker_is_flat() {
        let broker = FlakyBroker::new(&[], &[]);
        let flagged = PositionState {
            needs_attention: true,
            ..PositionState::flat()
        };
        let (mut trader, _dir) = trader(0.0, Box::new(broker), flagged).await;
        assert!(trader.provider.advance());
        trader.tick().await.unwrap();
        assert!(!trader.position(&key()).unwrap().needs_attention);
    }

    #[tokio::test]
    async fn unresolved_soft_exit_keeps_position_and_queues_reversal() {
        let broker = FlakyBroker::new(&[("KO", dec!(300)), ("PEP", dec!(-450))], &["PEP"]);
        let orders = broker.orders();
        let (mut trader, _dir) = trader(0.0, Box::new(broker), long_spread()).await;
        assert!(trader.provider.advance());
        trader.tick().await.unwrap();

        assert_eq!(orders.lock().unwrap().get("KO"), Some(&1));
        assert_eq!(orders.lock().unwrap().get("PEP"), Some(&3));

        let state = trader.position(&key()).unwrap();
        assert_eq!(state.status, PositionStatus::LongSpread);
        assert_eq!(state.bars_held, 1);
        assert_eq!(trader.compensations.len(), 1);
        assert_eq!(trader.compensations[0].quantity, dec!(300));
    }

    #[tokio::test]
    async fn reconcile_flattens_state_when_broker_is_flat() {
        let broker = FlakyBroker::new(&[], &[]);
        let (mut trader, _dir) = trader(0.0, Box::new(broker), long_spread()).await;
        let events = trader.reconcile().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, TransitionReason::Reconciled);
        assert_eq!(trader.position(&key()).unwrap().status, PositionStatus::Flat);
    }

    #[tokio::test]
    async fn reconcile_flags_one_legged_holdings() {
        let broker = FlakyBroker::new(&[("KO", dec!(100))], &[]);
        let (mut trader, _dir) = trader(0.0, Box::new(broker), PositionState::flat()).await;
        trader.reconcile().await.unwrap();
        let state = trader.position(&key()).unwrap();
        assert_eq!(state.status, PositionStatus::Flat);
        assert!(state.needs_attention);
    }

    #[tokio::test]
    async fn reconcile_keeps_matching_state() {
        let broker = FlakyBroker::new(&[("KO", dec!(-100)), ("PEP", dec!(150))], &[]);
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let short = PositionState::opened(PositionStatus::ShortSpread, 14, at, Some(2.4));
        let (mut trader, _dir) = trader(0.0, Box::new(broker), short.clone()).await;
        assert!(trader.reconcile().await.unwrap().is_empty());
        assert_eq!(trader.position(&key()).unwrap(), &short);
    }

    #[test]
    fn implied_status_needs_opposite_legs() {
        assert_eq!(implied_status(dec!(0), dec!(0)), Some(PositionStatus::Flat));
        assert_eq!(
            implied_status(dec!(10), dec!(-15)),
            Some(PositionStatus::LongSpread)
        );
        assert_eq!(
            implied_status(dec!(-10), dec!(15)),
            Some(PositionStatus::ShortSpread)
        );
        assert_eq!(implied_status(dec!(10), dec!(15)), None);
        assert_eq!(implied_status(dec!(0), dec!(-15)), None);
    }
}
