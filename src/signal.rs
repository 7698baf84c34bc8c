use chrono::{DateTime, Utc};

use crate::config::StatArbConfig;
use crate::model::{PositionState, PositionStatus, SignalEvent, TransitionReason};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalParams {
    pub zscore_entry: f64,
    pub zscore_exit: f64,
    pub zscore_hard_stop: f64,
    pub time_stop_bars: u32,
    pub cooldown_bars: u32,
}

impl From<&StatArbConfig> for SignalParams {
    fn from(cfg: &StatArbConfig) -> Self {
        Self {
            zscore_entry: cfg.zscore_entry,
            zscore_exit: cfg.zscore_exit,
            zscore_hard_stop: cfg.zscore_hard_stop,
            time_stop_bars: cfg.time_stop_bars,
            cooldown_bars: cfg.cooldown_bars,
        }
    }
}

/// Per-pair entry/exit/stop state machine. At most one transition per bar.
#[derive(Debug, Clone, Copy)]
pub struct SignalEngine {
    params: SignalParams,
}

impl SignalEngine {
    pub fn new(params: SignalParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &SignalParams {
        &self.params
    }

    /// Next state for one bar without touching `state`.
    ///
    /// A missing z-score still ages held positions and cooldowns, so the time
    /// stop and the cooldown clock keep running across data gaps.
    pub fn evaluate(
        &self,
        pair: &str,
        state: &PositionState,
        z: Option<f64>,
        bar_index: u64,
        at: DateTime<Utc>,
    ) -> (PositionState, Option<SignalEvent>) {
        let p = &self.params;
        let mut next = state.clone();
        let reason = match state.status {
            PositionStatus::Flat => match z {
                Some(z) if z <= -p.zscore_entry => {
                    next = PositionState::opened(PositionStatus::LongSpread, bar_index, at, Some(z));
                    Some(TransitionReason::Entry)
                }
                Some(z) if z >= p.zscore_entry => {
                    next =
                        PositionState::opened(PositionStatus::ShortSpread, bar_index, at, Some(z));
                    Some(TransitionReason::Entry)
                }
                _ => None,
            },
            PositionStatus::LongSpread | PositionStatus::ShortSpread => {
                next.bars_held = state.bars_held.saturating_add(1);
                let abs_z = z.map(f64::abs);
                let forced = if abs_z.map_or(false, |v| v >= p.zscore_hard_stop) {
                    Some(TransitionReason::HardStop)
                } else if next.bars_held >= p.time_stop_bars {
                    Some(TransitionReason::TimeStop)
                } else {
                    None
                };
                match forced {
                    Some(reason) => {
                        next = PositionState {
                            needs_attention: state.needs_attention,
                            ..PositionState::cooling(p.cooldown_bars)
                        };
                        Some(reason)
                    }
                    None if abs_z.map_or(false, |v| v <= p.zscore_exit) => {
                        next = PositionState {
                            needs_attention: state.needs_attention,
                            ..PositionState::flat()
                        };
                        Some(TransitionReason::SoftExit)
                    }
                    None => None,
                }
            }
            PositionStatus::Cooldown => {
                next.cooldown_remaining = state.cooldown_remaining.saturating_sub(1);
                if next.cooldown_remaining == 0 {
                    next = PositionState {
                        needs_attention: state.needs_attention,
                        ..PositionState::flat()
                    };
                    Some(TransitionReason::CooldownElapsed)
                } else {
                    None
                }
            }
        };

        let event = reason.map(|reason| SignalEvent {
            pair: pair.to_string(),
            from: state.status,
            to: next.status,
            reason,
            timestamp: at,
            bar_index,
            z_score: z,
        });
        (next, event)
    }

    /// Apply one bar to `state` in place.
    pub fn on_bar(
        &self,
        pair: &str,
        state: &mut PositionState,
        z: Option<f64>,
        bar_index: u64,
        at: DateTime<Utc>,
    ) -> Option<SignalEvent> {
        let (next, event) = self.evaluate(pair, state, z, bar_index, at);
        *state = next;
        if let Some(ev) = &event {
            log_event(ev);
        }
        event
    }

    /// Flatten a directional position for a reason outside the z-score rules
    /// (the pair dropped out of the selection).
    pub fn force_flatten(
        &self,
        pair: &str,
        state: &mut PositionState,
        reason: TransitionReason,
        bar_index: u64,
        at: DateTime<Utc>,
        z: Option<f64>,
    ) -> Option<SignalEvent> {
        if !state.is_open() {
            return None;
        }
        let event = SignalEvent {
            pair: pair.to_string(),
            from: state.status,
            to: PositionStatus::Flat,
            reason,
            timestamp: at,
            bar_index,
            z_score: z,
        };
        *state = PositionState::flat();
        log_event(&event);
        Some(event)
    }
}

pub fn log_event(ev: &SignalEvent) {
    let z = ev
        .z_score
        .map(|z| format!("{:.3}", z))
        .unwrap_or_else(|| "n/a".to_string());
    log::info!(
        "[SIGNAL] {} {} -> {} ({:?}) z={} bar={} at {}",
        ev.pair,
        ev.from,
        ev.to,
        ev.reason,
        z,
        ev.bar_index,
        ev.timestamp
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn params() -> SignalParams {
        SignalParams {
            zscore_entry: 2.0,
            zscore_exit: 0.5,
            zscore_hard_stop: 3.25,
            time_stop_bars: 50,
            cooldown_bars: 78,
        }
    }

    fn at(bar: u64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 13, 30, 0).unwrap() + Duration::minutes(5 * bar as i64)
    }

    #[test]
    fn long_entry_then_soft_exit() {
        let engine = SignalEngine::new(params());
        let mut state = PositionState::flat();
        for bar in 0..10 {
            assert!(engine.on_bar("A/B", &mut state, Some(-1.0), bar, at(bar)).is_none());
        }
        let entry = engine
            .on_bar("A/B", &mut state, Some(-2.1), 10, at(10))
            .unwrap();
        assert_eq!(entry.from, PositionStatus::Flat);
        assert_eq!(entry.to, PositionStatus::LongSpread);
        assert_eq!(state.entry_bar_index, Some(10));
        assert_eq!(state.entry_z_score, Some(-2.1));

        for bar in 11..15 {
            assert!(engine.on_bar("A/B", &mut state, Some(-1.5), bar, at(bar)).is_none());
        }
        let exit = engine
            .on_bar("A/B", &mut state, Some(-0.3), 15, at(15))
            .unwrap();
        assert_eq!(exit.reason, TransitionReason::SoftExit);
        assert_eq!(exit.to, PositionStatus::Flat);
        assert_eq!(state, PositionState::flat());
    }

    #[test]
    fn hard_stop_then_cooldown_elapses() {
        let engine = SignalEngine::new(params());
        let mut state = PositionState::flat();
        engine.on_bar("A/B", &mut state, Some(2.5), 0, at(0)).unwrap();
        assert_eq!(state.status, PositionStatus::ShortSpread);

        let stop = engine.on_bar("A/B", &mut state, Some(3.5), 1, at(1)).unwrap();
        assert_eq!(stop.reason, TransitionReason::HardStop);
        assert_eq!(state.status, PositionStatus::Cooldown);

        // z is ignored while cooling down
        for bar in 2..79 {
            let z = if bar % 2 == 0 { 5.0 } else { -5.0 };
            assert!(engine.on_bar("A/B", &mut state, Some(z), bar, at(bar)).is_none());
            assert_eq!(state.status, PositionStatus::Cooldown);
        }
        let done = engine.on_bar("A/B", &mut state, Some(0.0), 79, at(79)).unwrap();
        assert_eq!(done.reason, TransitionReason::CooldownElapsed);
        assert_eq!(done.bar_index - stop.bar_index, 78);
        assert_eq!(state.status, PositionStatus::Flat);
    }

    #[test]
    fn time_stop_forces_cooldown() {
        let mut p = params();
        p.time_stop_bars = 3;
        let engine = SignalEngine::new(p);
        let mut state = PositionState::flat();
        engine.on_bar("A/B", &mut state, Some(-2.0), 0, at(0)).unwrap();
        assert!(engine.on_bar("A/B", &mut state, Some(-1.9), 1, at(1)).is_none());
        assert!(engine.on_bar("A/B", &mut state, None, 2, at(2)).is_none());
        let ev = engine.on_bar("A/B", &mut state, Some(-1.9), 3, at(3)).unwrap();
        assert_eq!(ev.reason, TransitionReason::TimeStop);
        assert_eq!(state.cooldown_remaining, 78);
    }

    #[test]
    fn directional_state_ignores_opposite_entry() {
        let engine = SignalEngine::new(params());
        let mut state = PositionState::flat();
        engine.on_bar("A/B", &mut state, Some(-2.2), 0, at(0));
        assert!(engine.on_bar("A/B", &mut state, Some(2.4), 1, at(1)).is_none());
        assert_eq!(state.status, PositionStatus::LongSpread);
    }

    #[test]
    fn missing_z_never_enters() {
        let engine = SignalEngine::new(params());
        let state = PositionState::flat();
        let (next, ev) = engine.evaluate("A/B", &state, None, 0, at(0));
        assert_eq!(next, state);
        assert!(ev.is_none());
    }

    #[test]
    fn force_flatten_only_touches_open_positions() {
        let engine = SignalEngine::new(params());
        let mut cooling = PositionState::cooling(5);
        assert!(engine
            .force_flatten("A/B", &mut cooling, TransitionReason::Deselected, 3, at(3), None)
            .is_none());
        assert_eq!(cooling.status, PositionStatus::Cooldown);

        let mut open = PositionState::opened(PositionStatus::ShortSpread, 1, at(1), Some(2.3));
        let ev = engine
            .force_flatten("A/B", &mut open, TransitionReason::Deselected, 3, at(3), Some(1.0))
            .unwrap();
        assert_eq!(ev.to, PositionStatus::Flat);
        assert_eq!(open.status, PositionStatus::Flat);
    }

    proptest! {
        #[test]
        fn cooldown_only_follows_forced_exits(
            zs in prop::collection::vec(prop::option::weighted(0.9, -5.0f64..5.0), 1..400)
        ) {
            let mut p = params();
            p.time_stop_bars = 20;
            p.cooldown_bars = 7;
            let engine = SignalEngine::new(p);
            let mut state = PositionState::flat();
            for (bar, z) in zs.iter().enumerate() {
                let before = state.status;
                if let Some(ev) = engine.on_bar("A/B", &mut state, *z, bar as u64, at(bar as u64)) {
                    prop_assert_eq!(ev.from, before);
                    prop_assert_eq!(ev.to, state.status);
                    if ev.to == PositionStatus::Cooldown {
                        prop_assert!(ev.reason.is_forced_exit());
                    }
                    if ev.reason == TransitionReason::Entry {
                        prop_assert_eq!(before, PositionStatus::Flat);
                    }
                    if ev.from.is_directional() {
                        prop_assert!(!ev.to.is_directional());
                    }
                } else {
                    prop_assert_eq!(before, state.status);
                }
            }
        }
    }
}
