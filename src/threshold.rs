// ─────────────────────────────────────────────────────────────────────────────
// threshold.rs — Cumulative liquidation-volume threshold monitor
//
// Per symbol and side, keeps the liquidations inside a sliding window and
// decides when their summed USDT volume has crossed the configured threshold.
// A per-side cooldown stops one cascade from firing a burst of entries. The
// hunter owns an instance and drives it from its event loop; a housekeeping
// sweep lets idle observers see the window decay without flooding them.
// ─────────────────────────────────────────────────────────────────────────────
use crate::config::{Config, SymbolConfig};
use crate::exchange::Side;
use crate::ingest::LiquidationEvent;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Progress delta (percentage points) below which a housekeeping sweep stays
/// silent for a symbol.
const SWEEP_EMIT_DELTA: Decimal = dec!(1);

// ─── Status Snapshot ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdStatus {
    pub symbol: String,
    pub long_threshold: Decimal,
    pub short_threshold: Decimal,
    /// Σ volume of windowed SELL liquidations (long side).
    pub long_volume: Decimal,
    /// Σ volume of windowed BUY liquidations (short side).
    pub short_volume: Decimal,
    /// 0..=100.
    pub long_progress: Decimal,
    pub short_progress: Decimal,
    pub long_count: usize,
    pub short_count: usize,
    pub long_met: bool,
    pub short_met: bool,
    /// Entry side armed by this update, when the cooldown allowed it.
    pub triggered: Option<Side>,
    pub at_ms: i64,
}

// ─── Monitor ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SideWindow {
    events: VecDeque<LiquidationEvent>,
    last_trigger_ms: Option<i64>,
    last_progress: Decimal,
}

impl SideWindow {
    fn evict(&mut self, now_ms: i64, window_ms: i64) {
        while self
            .events
            .front()
            .map(|e| e.event_time <= now_ms - window_ms)
            .unwrap_or(false)
        {
            self.events.pop_front();
        }
    }

    fn volume(&self) -> Decimal {
        self.events.iter().map(|e| e.volume_usdt()).sum()
    }

    fn progress(&self, threshold: Decimal) -> Decimal {
        if threshold <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (dec!(100) * self.volume() / threshold).min(dec!(100))
    }

    fn in_cooldown(&self, now_ms: i64, cooldown_ms: i64) -> bool {
        self.last_trigger_ms
            .map(|t| now_ms - t < cooldown_ms)
            .unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct SymbolState {
    /// SELL liquidations: longs were closed, our long opportunity.
    long: SideWindow,
    /// BUY liquidations: shorts were closed, our short opportunity.
    short: SideWindow,
}

#[derive(Debug, Default)]
pub struct ThresholdMonitor {
    states: HashMap<String, SymbolState>,
}

impl ThresholdMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one liquidation and returns the resulting status. `triggered`
    /// is set only when the event's own side crossed its threshold outside
    /// the cooldown.
    pub fn observe(
        &mut self,
        event: &LiquidationEvent,
        sc: &SymbolConfig,
        now_ms: i64,
    ) -> ThresholdStatus {
        let state = self.states.entry(event.symbol.clone()).or_default();

        let window = match event.side {
            Side::Sell => &mut state.long,
            Side::Buy => &mut state.short,
        };
        window.events.push_back(event.clone());

        state.long.evict(now_ms, sc.threshold_window_ms);
        state.short.evict(now_ms, sc.threshold_window_ms);

        let (threshold, opportunity) = match event.side {
            Side::Sell => (sc.long_volume_threshold, Side::Buy),
            Side::Buy => (sc.short_volume_threshold, Side::Sell),
        };
        let active = match event.side {
            Side::Sell => &mut state.long,
            Side::Buy => &mut state.short,
        };

        let met = active.volume() >= threshold;
        let triggered = if met && !active.in_cooldown(now_ms, sc.cooldown_ms) {
            active.last_trigger_ms = Some(now_ms);
            Some(opportunity)
        } else {
            None
        };

        let status = Self::build_status(&event.symbol, state, sc, triggered, now_ms);
        state.long.last_progress = status.long_progress;
        state.short.last_progress = status.short_progress;
        status
    }

    /// Housekeeping: evict expired entries everywhere and report only the
    /// symbols whose progress moved more than one percentage point, so idle
    /// observers see decay without being flooded.
    pub fn sweep(&mut self, config: &Config, now_ms: i64) -> Vec<ThresholdStatus> {
        // Symbols that left the config (or opted out) drop their state.
        self.states.retain(|symbol, _| {
            config.symbol(symbol).map(|sc| sc.use_threshold).unwrap_or(false)
        });

        let mut updates = Vec::new();
        for (symbol, state) in &mut self.states {
            let sc = match config.symbol(symbol) {
                Some(sc) => sc,
                None => continue,
            };
            state.long.evict(now_ms, sc.threshold_window_ms);
            state.short.evict(now_ms, sc.threshold_window_ms);

            let long_progress = state.long.progress(sc.long_volume_threshold);
            let short_progress = state.short.progress(sc.short_volume_threshold);
            let moved = (long_progress - state.long.last_progress).abs() > SWEEP_EMIT_DELTA
                || (short_progress - state.short.last_progress).abs() > SWEEP_EMIT_DELTA;
            if !moved {
                continue;
            }
            let status = Self::build_status(symbol, state, sc, None, now_ms);
            state.long.last_progress = status.long_progress;
            state.short.last_progress = status.short_progress;
            updates.push(status);
        }
        updates
    }

    fn build_status(
        symbol: &str,
        state: &SymbolState,
        sc: &SymbolConfig,
        triggered: Option<Side>,
        now_ms: i64,
    ) -> ThresholdStatus {
        let long_volume = state.long.volume();
        let short_volume = state.short.volume();
        ThresholdStatus {
            symbol: symbol.to_string(),
            long_threshold: sc.long_volume_threshold,
            short_threshold: sc.short_volume_threshold,
            long_volume,
            short_volume,
            long_progress: state.long.progress(sc.long_volume_threshold),
            short_progress: state.short.progress(sc.short_volume_threshold),
            long_count: state.long.events.len(),
            short_count: state.short.events.len(),
            long_met: long_volume >= sc.long_volume_threshold,
            short_met: short_volume >= sc.short_volume_threshold,
            triggered,
            at_ms: now_ms,
        }
    }
}
