// ─────────────────────────────────────────────────────────────────────────────
// hunter.rs — Trade decision and order placement
//
// Consumes the liquidation stream and walks each event through the gates:
// configured symbol, cumulative-threshold (or instant volume), mark-price
// proximity, VWAP, then admission control (single in-flight per symbol, max
// positions, symbol margin cap). Survivors get priced off the order book,
// sized onto the precision grid, and placed; recoverable placement failures
// fall back to a market order exactly once.
// ─────────────────────────────────────────────────────────────────────────────
use crate::broadcaster::{Broadcaster, Event};
use crate::config::{Config, OrderMode, PositionMode};
use crate::error_log::ErrorLogger;
use crate::errors::{EngineError, ErrorKind};
use crate::exchange::{OrderBook, OrderRequest, OrderType, PositionSide, Side, VenueClient};
use crate::ingest::{now_ms, LiquidationArchive, LiquidationEvent};
use crate::manager::AccountSnapshot;
use crate::registry::PrecisionRegistry;
use crate::threshold::ThresholdMonitor;
use crate::vwap::{rest_vwap, VwapMap};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc, watch};

/// A pending order is stale after this long and evicted by housekeeping.
pub const PENDING_TTL_MS: i64 = 5 * 60 * 1_000;

const HOUSEKEEPING_SECS: u64 = 10;
const BOOK_DEPTH: u32 = 20;

// ─── Pending Orders ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PendingOrder {
    pub order_id: i64,
    pub symbol: String,
    pub side: Side,
    pub created_ms: i64,
}

/// One-way mode admits one pending order per symbol; hedge mode one per
/// (symbol, side), still counted as one unit toward max positions.
type PendingKey = (String, Option<Side>);

fn pending_key(symbol: &str, side: Side, mode: PositionMode) -> PendingKey {
    match mode {
        PositionMode::OneWay => (symbol.to_string(), None),
        PositionMode::Hedge => (symbol.to_string(), Some(side)),
    }
}

// ─── Pure Pricing & Sizing ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct LimitPlan {
    pub price: Decimal,
    /// Set when the walked book says a capped limit cannot fill sanely.
    pub downgrade_to_market: bool,
}

/// Walks the touched side of the book for the average fill price of `qty`
/// and returns the expected slippage past the touch, in basis points. None
/// when the visible depth cannot fill the quantity.
pub fn expected_slippage_bps(book: &OrderBook, side: Side, qty: Decimal) -> Option<Decimal> {
    let levels = match side {
        Side::Buy => &book.asks,
        Side::Sell => &book.bids,
    };
    let touch = levels.first().map(|(p, _)| *p)?;
    if qty <= Decimal::ZERO || touch <= Decimal::ZERO {
        return None;
    }
    let mut remaining = qty;
    let mut cost = Decimal::ZERO;
    for (price, size) in levels {
        let take = remaining.min(*size);
        cost += take * *price;
        remaining -= take;
        if remaining <= Decimal::ZERO {
            break;
        }
    }
    if remaining > Decimal::ZERO {
        return None;
    }
    let avg = cost / qty;
    let slip = match side {
        Side::Buy => (avg / touch - Decimal::ONE) * dec!(10000),
        Side::Sell => (Decimal::ONE - avg / touch) * dec!(10000),
    };
    Some(slip.max(Decimal::ZERO))
}

/// Limit price off the top of book. Post-only quotes rest on the passive
/// side; otherwise the order crosses the touch and the depth walk decides
/// whether the expected fill cost forces a market downgrade.
pub fn plan_limit_price(
    book: &OrderBook,
    side: Side,
    offset_bps: Decimal,
    post_only: bool,
    qty_estimate: Decimal,
    max_slippage_bps: Decimal,
) -> Option<LimitPlan> {
    let best_bid = book.best_bid()?;
    let best_ask = book.best_ask()?;

    if post_only {
        let touch = match side {
            Side::Buy => best_bid,
            Side::Sell => best_ask,
        };
        let offset = touch * offset_bps / dec!(10000);
        let price = match side {
            Side::Buy => touch - offset,
            Side::Sell => touch + offset,
        };
        return Some(LimitPlan { price, downgrade_to_market: false });
    }

    let touch = match side {
        Side::Buy => best_ask,
        Side::Sell => best_bid,
    };
    let offset = touch * offset_bps / dec!(10000);
    let price = match side {
        Side::Buy => touch + offset,
        Side::Sell => touch - offset,
    };
    let downgrade = match expected_slippage_bps(book, side, qty_estimate) {
        Some(slip) => slip > max_slippage_bps,
        // Not enough visible depth: a capped limit would strand.
        None => true,
    };
    Some(LimitPlan { price, downgrade_to_market: downgrade })
}

/// Sizes an entry: notional = margin × leverage floored at minNotional×1.01,
/// quantity snapped down to the step grid and then stepped back up if the
/// snap dropped it under the venue minimum. A grid whose single step already
/// dwarfs the intended size is rejected rather than silently oversized.
pub fn size_order(
    registry: &PrecisionRegistry,
    symbol: &str,
    price: Decimal,
    trade_size: Decimal,
    leverage: u32,
) -> Result<Decimal, EngineError> {
    if price <= Decimal::ZERO {
        return Err(EngineError::new(ErrorKind::Precision, "non-positive price").with_symbol(symbol));
    }
    let floor = registry.min_notional(symbol) * dec!(1.01);
    let notional = (trade_size * Decimal::from(leverage)).max(floor);
    let mut qty = registry.snap_qty(symbol, notional / price);
    let step = registry.step_size(symbol);
    let mut bumps = 0;
    while price * qty < registry.min_notional(symbol) && bumps < 10 {
        qty += step;
        bumps += 1;
    }
    if qty <= Decimal::ZERO || !registry.meets_min_notional(symbol, price, qty) {
        return Err(EngineError::new(
            ErrorKind::Notional,
            format!("sized order {}×{} below venue minimum", price, qty),
        )
        .with_symbol(symbol));
    }
    if price * qty > notional * dec!(3) {
        return Err(EngineError::new(
            ErrorKind::Notional,
            format!(
                "step grid forces notional {} against intended {}",
                price * qty,
                notional
            ),
        )
        .with_symbol(symbol));
    }
    Ok(qty)
}

// ─── Hunter ──────────────────────────────────────────────────────────────────

pub struct Hunter {
    venue: Arc<dyn VenueClient>,
    registry: Arc<RwLock<PrecisionRegistry>>,
    config_rx: watch::Receiver<Arc<Config>>,
    account_rx: watch::Receiver<AccountSnapshot>,
    vwap_map: VwapMap,
    position_mode: Arc<RwLock<PositionMode>>,
    broadcaster: Broadcaster,
    errors: ErrorLogger,
    archive: Arc<LiquidationArchive>,
    monitor: ThresholdMonitor,
    pending: HashMap<PendingKey, PendingOrder>,
    /// Last leverage we set per symbol, so the ensure call stays idempotent.
    leverage_set: HashMap<String, u32>,
}

impl Hunter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        venue: Arc<dyn VenueClient>,
        registry: Arc<RwLock<PrecisionRegistry>>,
        config_rx: watch::Receiver<Arc<Config>>,
        account_rx: watch::Receiver<AccountSnapshot>,
        vwap_map: VwapMap,
        position_mode: Arc<RwLock<PositionMode>>,
        broadcaster: Broadcaster,
        errors: ErrorLogger,
        archive: Arc<LiquidationArchive>,
    ) -> Self {
        Self {
            venue,
            registry,
            config_rx,
            account_rx,
            vwap_map,
            position_mode,
            broadcaster,
            errors,
            archive,
            monitor: ThresholdMonitor::new(),
            pending: HashMap::new(),
            leverage_set: HashMap::new(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Distinct symbols with in-flight orders; hedge legs count once.
    fn pending_units(&self) -> usize {
        let mut symbols: Vec<&str> = self.pending.keys().map(|(s, _)| s.as_str()).collect();
        symbols.sort_unstable();
        symbols.dedup();
        symbols.len()
    }

    pub async fn run(
        mut self,
        mut events_rx: mpsc::Receiver<LiquidationEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut order_events = self.broadcaster.subscribe();
        let mut housekeeping =
            tokio::time::interval(std::time::Duration::from_secs(HOUSEKEEPING_SECS));
        log::info!("[HUNTER] Running.");

        loop {
            tokio::select! {
                maybe = events_rx.recv() => {
                    match maybe {
                        Some(event) => self.handle_liquidation(event).await,
                        None => {
                            log::info!("[HUNTER] Liquidation channel closed, stopping.");
                            return;
                        }
                    }
                }
                received = order_events.recv() => {
                    match received {
                        Ok(Event::OrderFilled { order_id, symbol })
                        | Ok(Event::OrderCancelled { order_id, symbol }) => {
                            self.evict_order(&symbol, order_id);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("[HUNTER] Missed {} bus events; pending TTL covers eviction.", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {}
                    }
                }
                _ = housekeeping.tick() => {
                    self.housekeeping(now_ms());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("[HUNTER] Shutdown.");
                        return;
                    }
                }
            }
        }
    }

    fn evict_order(&mut self, symbol: &str, order_id: i64) {
        let before = self.pending.len();
        self.pending
            .retain(|_, p| !(p.symbol == symbol && p.order_id == order_id));
        if self.pending.len() != before {
            log::info!("[HUNTER] Pending order {} on {} resolved.", order_id, symbol);
        }
    }

    /// TTL sweep plus the threshold monitor's decay sweep.
    pub fn housekeeping(&mut self, now_ms: i64) {
        let expired: Vec<PendingOrder> = self
            .pending
            .values()
            .filter(|p| now_ms - p.created_ms >= PENDING_TTL_MS)
            .cloned()
            .collect();
        for stale in expired {
            log::warn!(
                "[HUNTER] Pending order {} on {} older than {}s, evicting.",
                stale.order_id,
                stale.symbol,
                PENDING_TTL_MS / 1_000
            );
            self.pending
                .retain(|_, p| p.order_id != stale.order_id || p.symbol != stale.symbol);
        }

        let config = self.config_rx.borrow().clone();
        for update in self.monitor.sweep(&config, now_ms) {
            self.broadcaster.publish(Event::Threshold(update));
        }
    }

    pub async fn handle_liquidation(&mut self, liq: LiquidationEvent) {
        let config = self.config_rx.borrow().clone();
        let now = now_ms();

        // Archive first: fire-and-forget, the ring buffer never blocks.
        self.archive.push(liq.clone());

        let sc = config.symbol(&liq.symbol).cloned();
        let threshold_enabled = config.global.use_threshold_system
            && sc.as_ref().map(|s| s.use_threshold).unwrap_or(false);

        let status = match (&sc, threshold_enabled) {
            (Some(sc), true) => Some(self.monitor.observe(&liq, sc, now)),
            _ => None,
        };
        self.broadcaster.publish(Event::Liquidation {
            event: liq.clone(),
            threshold: status.clone(),
        });
        if let Some(ref s) = status {
            self.broadcaster.publish(Event::Threshold(s.clone()));
        }

        let sc = match sc {
            Some(sc) => sc,
            None => return,
        };

        // Volume gate: threshold trigger, or instant per-event volume.
        let side = if threshold_enabled {
            match status.as_ref().and_then(|s| s.triggered) {
                Some(side) => side,
                None => return,
            }
        } else {
            let side = liq.opportunity();
            let required = match side {
                Side::Buy => sc.long_volume_threshold,
                Side::Sell => sc.short_volume_threshold,
            };
            if liq.volume_usdt() < required {
                return;
            }
            side
        };

        // Mark-price proximity gate.
        let mark = match self.venue.mark_price(&liq.symbol).await {
            Ok(mark) => mark,
            Err(e) => {
                self.errors.report(&e.with_component("HUNTER"), "HUNTER");
                return;
            }
        };
        self.broadcaster
            .publish(Event::MarkPrice { symbol: liq.symbol.clone(), price: mark });
        let near_mark = match side {
            Side::Buy => liq.price < mark * dec!(1.01),
            Side::Sell => liq.price > mark * dec!(0.99),
        };
        if !near_mark {
            log::debug!(
                "[HUNTER] {} liquidation at {} too far from mark {}, skipping.",
                liq.symbol,
                liq.price,
                mark
            );
            return;
        }

        // VWAP gate.
        if sc.vwap_protection {
            let vwap = self.current_vwap(&liq.symbol, &sc.vwap_timeframe, sc.vwap_lookback, now).await;
            let vwap = match vwap {
                Some(v) => v,
                None => {
                    self.block(&liq.symbol, side, "VWAP unavailable (stream stale, REST failed)");
                    return;
                }
            };
            let allowed = match side {
                Side::Buy => liq.price < vwap,
                Side::Sell => liq.price > vwap,
            };
            if !allowed {
                self.block(
                    &liq.symbol,
                    side,
                    &format!(
                        "VWAP protection: price {} not {} VWAP {}",
                        liq.price,
                        if side == Side::Buy { "below" } else { "above" },
                        vwap
                    ),
                );
                return;
            }
        }

        // Admission control.
        let mode = *self.position_mode.read().unwrap_or_else(|p| p.into_inner());
        let key = pending_key(&liq.symbol, side, mode);
        if self.pending.contains_key(&key) {
            log::debug!("[HUNTER] {} already has an in-flight order, skipping.", liq.symbol);
            return;
        }
        let account = self.account_rx.borrow().clone();
        let open_positions = account.positions.len();
        if open_positions + self.pending_units() >= config.global.max_open_positions {
            self.block(
                &liq.symbol,
                side,
                &format!(
                    "max positions: {} open + {} pending >= {}",
                    open_positions,
                    self.pending_units(),
                    config.global.max_open_positions
                ),
            );
            return;
        }
        let margin_used = account
            .margin_by_symbol
            .get(&liq.symbol)
            .copied()
            .unwrap_or(Decimal::ZERO);
        let trade_size = match side {
            Side::Buy => sc.long_trade_size,
            Side::Sell => sc.short_trade_size,
        };
        if margin_used + trade_size > sc.max_symbol_margin {
            self.block(
                &liq.symbol,
                side,
                &format!(
                    "symbol margin cap: {} used + {} new > {}",
                    margin_used, trade_size, sc.max_symbol_margin
                ),
            );
            return;
        }

        // Pricing.
        let (order_type, limit_price) = match sc.order_mode {
            OrderMode::Market => (OrderType::Market, None),
            OrderMode::Limit => {
                let book = match self.venue.order_book(&liq.symbol, BOOK_DEPTH).await {
                    Ok(book) => book,
                    Err(e) => {
                        self.errors.report(&e.with_component("HUNTER"), "HUNTER");
                        return;
                    }
                };
                let touch = match side {
                    Side::Buy => book.best_ask().unwrap_or(mark),
                    Side::Sell => book.best_bid().unwrap_or(mark),
                };
                let qty_estimate = if touch > Decimal::ZERO {
                    trade_size * Decimal::from(sc.leverage) / touch
                } else {
                    Decimal::ZERO
                };
                match plan_limit_price(
                    &book,
                    side,
                    sc.price_offset_bps,
                    sc.post_only,
                    qty_estimate,
                    sc.max_slippage_bps,
                ) {
                    Some(plan) if !plan.downgrade_to_market => (OrderType::Limit, Some(plan.price)),
                    Some(_) => {
                        log::info!(
                            "[HUNTER] {} expected slippage over {}bps, using market.",
                            liq.symbol,
                            sc.max_slippage_bps
                        );
                        (OrderType::Market, None)
                    }
                    None => (OrderType::Market, None),
                }
            }
        };

        // Sizing on the grid.
        let (qty, price_str, qty_str) = {
            let registry = self.registry.read().unwrap_or_else(|p| p.into_inner());
            let reference = limit_price.unwrap_or(mark);
            let snapped_price = limit_price.map(|p| registry.snap_price(&liq.symbol, p));
            let qty = match size_order(&registry, &liq.symbol, reference, trade_size, sc.leverage) {
                Ok(qty) => qty,
                Err(e) => {
                    self.errors.report(&e.with_component("HUNTER"), "HUNTER");
                    return;
                }
            };
            (
                qty,
                snapped_price.map(|p| registry.fmt_price(&liq.symbol, p)),
                registry.fmt_qty(&liq.symbol, qty),
            )
        };

        // Leverage, idempotent.
        if self.leverage_set.get(&liq.symbol) != Some(&sc.leverage) {
            match self.venue.set_leverage(&liq.symbol, sc.leverage).await {
                Ok(()) => {
                    self.leverage_set.insert(liq.symbol.clone(), sc.leverage);
                }
                Err(e) => {
                    self.errors.report(&e.with_component("HUNTER"), "HUNTER");
                    return;
                }
            }
        }

        // Placement, with a single market fallback on recoverable kinds.
        let position_side = match mode {
            PositionMode::OneWay => PositionSide::Both,
            PositionMode::Hedge => match side {
                Side::Buy => PositionSide::Long,
                Side::Sell => PositionSide::Short,
            },
        };
        let request = OrderRequest {
            symbol: liq.symbol.clone(),
            side,
            position_side,
            order_type,
            qty: qty_str.clone(),
            price: if order_type == OrderType::Limit { price_str.clone() } else { None },
            stop_price: None,
            reduce_only: false,
            time_in_force: if order_type == OrderType::Limit {
                Some(if sc.post_only { "GTX" } else { "GTC" })
            } else {
                None
            },
            client_order_id: Some(format!("lh-{}", uuid::Uuid::new_v4().simple())),
        };

        let paper = config.global.paper_mode;
        match self.venue.place_order(&request).await {
            Ok(placed) => self.record_placement(key, side, qty, &placed, paper),
            Err(e) => {
                self.errors.report(&e.clone().with_component("HUNTER"), "HUNTER");
                let can_fall_back = order_type == OrderType::Limit && e.market_fallback_eligible();
                if !can_fall_back {
                    return;
                }
                log::warn!("[HUNTER] {} limit rejected ({}), falling back to market.", liq.symbol, e);
                let fallback = OrderRequest {
                    order_type: OrderType::Market,
                    price: None,
                    time_in_force: None,
                    client_order_id: Some(format!("lh-{}", uuid::Uuid::new_v4().simple())),
                    ..request
                };
                match self.venue.place_order(&fallback).await {
                    Ok(placed) => self.record_placement(key, side, qty, &placed, paper),
                    Err(e2) => {
                        self.errors.report(&e2.with_component("HUNTER"), "HUNTER");
                    }
                }
            }
        }
    }

    fn record_placement(
        &mut self,
        key: PendingKey,
        side: Side,
        qty: Decimal,
        placed: &crate::exchange::OrderInfo,
        paper: bool,
    ) {
        log::info!(
            "[HUNTER] Placed {} {} {} qty {} (order {}).",
            placed.symbol,
            placed.order_type.as_str(),
            side,
            qty,
            placed.order_id
        );
        self.pending.insert(
            key,
            PendingOrder {
                order_id: placed.order_id,
                symbol: placed.symbol.clone(),
                side,
                created_ms: now_ms(),
            },
        );
        self.broadcaster.publish(Event::OrderPlaced {
            symbol: placed.symbol.clone(),
            order_id: placed.order_id,
            side,
            order_type: placed.order_type,
            qty,
            price: if placed.price > Decimal::ZERO { Some(placed.price) } else { None },
        });
        if placed.status == "FILLED" {
            // Paper markets fill instantly; the pending slot frees right away.
            self.pending.retain(|_, p| p.order_id != placed.order_id);
            self.broadcaster.publish(Event::PositionOpened {
                symbol: placed.symbol.clone(),
                side,
                qty,
                price: placed.price,
                paper,
            });
        }
    }

    async fn current_vwap(
        &self,
        symbol: &str,
        timeframe: &str,
        lookback: usize,
        now: i64,
    ) -> Option<Decimal> {
        let streamed = {
            let map = self.vwap_map.read().unwrap_or_else(|p| p.into_inner());
            map.get(symbol).cloned()
        };
        if let Some(update) = streamed {
            if update.is_fresh(now) {
                return Some(update.vwap);
            }
        }
        match rest_vwap(self.venue.as_ref(), symbol, timeframe, lookback).await {
            Ok(vwap) => Some(vwap),
            Err(e) => {
                self.errors.report(&e.with_component("HUNTER"), "HUNTER");
                None
            }
        }
    }

    fn block(&self, symbol: &str, side: Side, reason: &str) {
        log::info!("[HUNTER] Blocked {} {}: {}", symbol, side, reason);
        self.broadcaster.publish(Event::TradeBlocked {
            symbol: symbol.to_string(),
            side,
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SymbolConfig;
    use crate::error_log::spawn_error_sink;
    use crate::exchange::PaperVenue;
    use crate::registry::SymbolFilters;
    use crate::vwap::{new_vwap_map, VwapRelation, VwapUpdate};
    use std::sync::atomic::{AtomicBool, Ordering};

    // ── Pure helpers ─────────────────────────────────────────────────────────

    fn book(bid: Decimal, ask: Decimal, level_qty: Decimal) -> OrderBook {
        let spread = ask - bid;
        OrderBook {
            bids: (0..5).map(|i| (bid - spread * Decimal::from(i), level_qty)).collect(),
            asks: (0..5).map(|i| (ask + spread * Decimal::from(i), level_qty)).collect(),
        }
    }

    #[test]
    fn post_only_rests_on_the_passive_side() {
        let b = book(dec!(100), dec!(100.1), dec!(10));
        let buy = plan_limit_price(&b, Side::Buy, dec!(10), true, dec!(1), dec!(50)).unwrap();
        assert_eq!(buy.price, dec!(99.9));
        assert!(!buy.downgrade_to_market);

        let sell = plan_limit_price(&b, Side::Sell, dec!(10), true, dec!(1), dec!(50)).unwrap();
        assert_eq!(sell.price, dec!(100.2001));
    }

    #[test]
    fn crossing_limit_offsets_past_the_touch() {
        let b = book(dec!(100), dec!(100.1), dec!(10));
        let buy = plan_limit_price(&b, Side::Buy, dec!(10), false, dec!(1), dec!(50)).unwrap();
        assert_eq!(buy.price, dec!(100.2001));
        assert!(!buy.downgrade_to_market);
    }

    #[test]
    fn thin_book_downgrades_to_market() {
        // Only 0.5 at each of 5 ask levels; qty 10 cannot fill.
        let b = book(dec!(100), dec!(100.1), dec!(0.5));
        let plan = plan_limit_price(&b, Side::Buy, dec!(2), false, dec!(10), dec!(50)).unwrap();
        assert!(plan.downgrade_to_market);
    }

    #[test]
    fn deep_slippage_downgrades_to_market() {
        // Wide levels: filling 3 units walks far past the touch.
        let mut b = book(dec!(100), dec!(101), dec!(1));
        b.asks = vec![
            (dec!(101), dec!(1)),
            (dec!(105), dec!(1)),
            (dec!(110), dec!(1)),
        ];
        let plan = plan_limit_price(&b, Side::Buy, dec!(2), false, dec!(3), dec!(100)).unwrap();
        assert!(plan.downgrade_to_market);
        // With a generous cap the same walk is fine.
        let relaxed = plan_limit_price(&b, Side::Buy, dec!(2), false, dec!(3), dec!(10000)).unwrap();
        assert!(!relaxed.downgrade_to_market);
    }

    #[test]
    fn slippage_walk_matches_hand_computation() {
        let mut b = OrderBook::default();
        b.asks = vec![(dec!(100), dec!(1)), (dec!(102), dec!(1))];
        b.bids = vec![(dec!(99), dec!(5))];
        // Buy 2: avg (100+102)/2 = 101 → 100 bps past the 100 touch.
        assert_eq!(expected_slippage_bps(&b, Side::Buy, dec!(2)), Some(dec!(100)));
        // Sell 2 into a single deep bid: zero slippage.
        assert_eq!(expected_slippage_bps(&b, Side::Sell, dec!(2)), Some(dec!(0)));
    }

    /// Scenario S4: a tiny configured size still produces a venue-valid order.
    #[test]
    fn sizing_recovers_sub_minimum_notional() {
        let mut registry = PrecisionRegistry::new();
        registry.insert(
            "XRPUSDT",
            SymbolFilters {
                tick_size: dec!(0.0001),
                step_size: dec!(0.1),
                min_notional: dec!(5),
                price_precision: 4,
                quantity_precision: 1,
            },
        );
        // 0.5 USDT at 2x = 1 USDT notional, floored to 5.05.
        let qty = size_order(&registry, "XRPUSDT", dec!(0.5), dec!(0.5), 2).unwrap();
        assert!(qty * dec!(0.5) >= dec!(5));
        assert_eq!(qty % dec!(0.1), Decimal::ZERO);
    }

    #[test]
    fn sizing_rejects_a_grid_that_dwarfs_the_trade() {
        let mut registry = PrecisionRegistry::new();
        registry.insert(
            "BTCUSDT",
            SymbolFilters {
                tick_size: dec!(0.1),
                step_size: dec!(0.001),
                min_notional: dec!(5),
                price_precision: 1,
                quantity_precision: 3,
            },
        );
        // 0.5 USDT at 2x wants ~5 USDT of BTC, but one step is 50 USDT.
        let err = size_order(&registry, "BTCUSDT", dec!(50000), dec!(0.5), 2).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Notional);
    }

    // ── Pipeline against the paper venue ─────────────────────────────────────

    struct Rig {
        hunter: Hunter,
        venue: Arc<PaperVenue>,
        bus: Broadcaster,
        account_tx: watch::Sender<AccountSnapshot>,
        vwap_map: VwapMap,
    }

    async fn rig(config: Config) -> Rig {
        let venue = Arc::new(PaperVenue::new());
        let registry = Arc::new(RwLock::new(PrecisionRegistry::new()));
        {
            let mut reg = registry.write().unwrap();
            reg.insert(
                "BTCUSDT",
                SymbolFilters {
                    tick_size: dec!(0.1),
                    step_size: dec!(0.001),
                    min_notional: dec!(5),
                    price_precision: 1,
                    quantity_precision: 3,
                },
            );
            reg.insert(
                "ETHUSDT",
                SymbolFilters {
                    tick_size: dec!(0.01),
                    step_size: dec!(0.001),
                    min_notional: dec!(5),
                    price_precision: 2,
                    quantity_precision: 3,
                },
            );
        }
        let (config_tx, config_rx) = watch::channel(Arc::new(config));
        // Keep the sender alive for the lifetime of the rig.
        std::mem::forget(config_tx);
        let (account_tx, account_rx) = watch::channel(AccountSnapshot::default());
        let vwap_map = new_vwap_map();
        let bus = Broadcaster::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        std::mem::forget(_shutdown_tx);
        let (errors, _sink) = spawn_error_sink(
            Arc::new(crate::error_log::JsonlStore::new("/tmp/hunter-test-errors.jsonl")),
            "test".to_string(),
            shutdown_rx,
        );
        let hunter = Hunter::new(
            venue.clone(),
            registry,
            config_rx,
            account_rx,
            vwap_map.clone(),
            Arc::new(RwLock::new(PositionMode::OneWay)),
            bus.clone(),
            errors,
            Arc::new(LiquidationArchive::new(100)),
        );
        Rig { hunter, venue, bus, account_tx, vwap_map }
    }

    fn instant_config(symbol: &str, threshold: Decimal, vwap: bool, mode: OrderMode) -> Config {
        let mut config = Config::default();
        config.global.paper_mode = true;
        config.global.use_threshold_system = false;
        config.global.max_open_positions = 5;
        config.symbols.insert(
            symbol.to_string(),
            SymbolConfig {
                long_volume_threshold: threshold,
                short_volume_threshold: threshold,
                leverage: 10,
                long_trade_size: dec!(10),
                short_trade_size: dec!(10),
                use_threshold: false,
                vwap_protection: vwap,
                order_mode: mode,
                ..SymbolConfig::default()
            },
        );
        config
    }

    fn sell_liq(symbol: &str, volume: Decimal, price: Decimal) -> LiquidationEvent {
        LiquidationEvent {
            symbol: symbol.to_string(),
            side: Side::Sell,
            status: "FILLED".to_string(),
            qty: volume / price,
            filled_qty: volume / price,
            price,
            event_time: now_ms(),
        }
    }

    #[tokio::test]
    async fn instant_trigger_places_market_order() {
        let mut r = rig(instant_config("BTCUSDT", dec!(100000), false, OrderMode::Market)).await;
        r.venue.set_mark("BTCUSDT", dec!(50000)).await;
        let mut events = r.bus.subscribe();

        r.hunter
            .handle_liquidation(sell_liq("BTCUSDT", dec!(150000), dec!(49900)))
            .await;

        let (placed, _) = r.venue.call_counts().await;
        assert_eq!(placed, 1);
        // Market fill on paper: position exists and the pending slot is free.
        assert_eq!(r.venue.positions().await.unwrap().len(), 1);
        assert_eq!(r.hunter.pending_count(), 0);

        let mut saw_opened = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, Event::PositionOpened { paper: true, .. }) {
                saw_opened = true;
            }
        }
        assert!(saw_opened, "expected a synthesized positionOpened");
    }

    #[tokio::test]
    async fn limit_mode_records_pending_order() {
        let mut r = rig(instant_config("BTCUSDT", dec!(100000), false, OrderMode::Limit)).await;
        r.venue.set_mark("BTCUSDT", dec!(50000)).await;

        r.hunter
            .handle_liquidation(sell_liq("BTCUSDT", dec!(150000), dec!(49900)))
            .await;

        assert_eq!(r.hunter.pending_count(), 1);
        let resting = r.venue.open_orders(Some("BTCUSDT")).await.unwrap();
        assert_eq!(resting.len(), 1);
        assert_eq!(resting[0].side, Side::Buy);
        assert_eq!(resting[0].order_type, OrderType::Limit);

        // A second cascade on the same symbol is rejected by admission.
        r.hunter
            .handle_liquidation(sell_liq("BTCUSDT", dec!(150000), dec!(49900)))
            .await;
        let (placed, _) = r.venue.call_counts().await;
        assert_eq!(placed, 1);
    }

    /// Scenarios S1 and S2 wired end-to-end: three SELL liquidations sum
    /// past the threshold, the crossing event places exactly one BUY, and a
    /// fourth crossing inside the cooldown places nothing.
    #[tokio::test]
    async fn cumulative_threshold_places_one_buy() {
        let mut config = instant_config("BTCUSDT", dec!(100000), false, OrderMode::Limit);
        config.global.use_threshold_system = true;
        config.symbols.get_mut("BTCUSDT").unwrap().use_threshold = true;
        let mut r = rig(config).await;
        r.venue.set_mark("BTCUSDT", dec!(50000)).await;

        r.hunter.handle_liquidation(sell_liq("BTCUSDT", dec!(40000), dec!(49900))).await;
        r.hunter.handle_liquidation(sell_liq("BTCUSDT", dec!(30000), dec!(49900))).await;
        let (placed, _) = r.venue.call_counts().await;
        assert_eq!(placed, 0, "no placement before the threshold is crossed");

        r.hunter.handle_liquidation(sell_liq("BTCUSDT", dec!(40000), dec!(49900))).await;
        let (placed, _) = r.venue.call_counts().await;
        assert_eq!(placed, 1);
        assert_eq!(r.hunter.pending_count(), 1);
        let resting = r.venue.open_orders(Some("BTCUSDT")).await.unwrap();
        assert_eq!(resting[0].side, Side::Buy);

        // Another 60k crossing right after: met, but cooldown holds.
        r.hunter.handle_liquidation(sell_liq("BTCUSDT", dec!(60000), dec!(49900))).await;
        let (placed, _) = r.venue.call_counts().await;
        assert_eq!(placed, 1, "cooldown suppresses the second trigger");
    }

    #[tokio::test]
    async fn below_volume_does_nothing() {
        let mut r = rig(instant_config("BTCUSDT", dec!(100000), false, OrderMode::Market)).await;
        r.venue.set_mark("BTCUSDT", dec!(50000)).await;
        r.hunter
            .handle_liquidation(sell_liq("BTCUSDT", dec!(50000), dec!(49900)))
            .await;
        let (placed, _) = r.venue.call_counts().await;
        assert_eq!(placed, 0);
    }

    #[tokio::test]
    async fn unconfigured_symbol_is_archived_only() {
        let mut r = rig(instant_config("BTCUSDT", dec!(100000), false, OrderMode::Market)).await;
        r.venue.set_mark("DOGEUSDT", dec!(0.1)).await;
        r.hunter
            .handle_liquidation(sell_liq("DOGEUSDT", dec!(900000), dec!(0.1)))
            .await;
        let (placed, _) = r.venue.call_counts().await;
        assert_eq!(placed, 0);
        assert_eq!(r.hunter.archive.len(), 1);
    }

    /// Scenario S3: VWAP protection blocks a long when the liquidation
    /// printed above VWAP.
    #[tokio::test]
    async fn vwap_gate_blocks_and_reports() {
        let mut r = rig(instant_config("ETHUSDT", dec!(10000), true, OrderMode::Market)).await;
        r.venue.set_mark("ETHUSDT", dec!(3008)).await;
        r.vwap_map.write().unwrap().insert(
            "ETHUSDT".to_string(),
            VwapUpdate {
                symbol: "ETHUSDT".to_string(),
                vwap: dec!(3000),
                price: dec!(3010),
                position: VwapRelation::Above,
                at_ms: now_ms(),
            },
        );
        let mut events = r.bus.subscribe();

        r.hunter
            .handle_liquidation(sell_liq("ETHUSDT", dec!(15000), dec!(3010)))
            .await;

        let (placed, _) = r.venue.call_counts().await;
        assert_eq!(placed, 0);
        let mut blocked_reason = None;
        while let Ok(event) = events.try_recv() {
            if let Event::TradeBlocked { reason, .. } = event {
                blocked_reason = Some(reason);
            }
        }
        let reason = blocked_reason.expect("expected a tradeBlocked event");
        assert!(reason.contains("VWAP"));
    }

    #[tokio::test]
    async fn vwap_gate_admits_price_below_vwap() {
        let mut r = rig(instant_config("ETHUSDT", dec!(10000), true, OrderMode::Market)).await;
        r.venue.set_mark("ETHUSDT", dec!(2993)).await;
        r.vwap_map.write().unwrap().insert(
            "ETHUSDT".to_string(),
            VwapUpdate {
                symbol: "ETHUSDT".to_string(),
                vwap: dec!(3000),
                price: dec!(2990),
                position: VwapRelation::Below,
                at_ms: now_ms(),
            },
        );
        r.hunter
            .handle_liquidation(sell_liq("ETHUSDT", dec!(15000), dec!(2990)))
            .await;
        let (placed, _) = r.venue.call_counts().await;
        assert_eq!(placed, 1);
    }

    #[tokio::test]
    async fn mark_proximity_gate_rejects_far_prints() {
        let mut r = rig(instant_config("BTCUSDT", dec!(100000), false, OrderMode::Market)).await;
        r.venue.set_mark("BTCUSDT", dec!(50000)).await;
        // A long entry needs the print below 1.01×mark.
        r.hunter
            .handle_liquidation(sell_liq("BTCUSDT", dec!(150000), dec!(51000)))
            .await;
        let (placed, _) = r.venue.call_counts().await;
        assert_eq!(placed, 0);
    }

    #[tokio::test]
    async fn max_positions_counts_open_plus_pending() {
        let mut config = instant_config("BTCUSDT", dec!(100000), false, OrderMode::Market);
        config.global.max_open_positions = 1;
        let mut r = rig(config).await;
        r.venue.set_mark("BTCUSDT", dec!(50000)).await;
        let mut snapshot = AccountSnapshot::default();
        snapshot.positions.push(crate::exchange::Position {
            symbol: "ETHUSDT".to_string(),
            position_side: PositionSide::Both,
            amount: dec!(1),
            entry_price: dec!(3000),
            mark_price: dec!(3000),
            leverage: 10,
            unrealized_pnl: Decimal::ZERO,
            liquidation_price: Decimal::ZERO,
        });
        r.account_tx.send(snapshot).unwrap();

        r.hunter
            .handle_liquidation(sell_liq("BTCUSDT", dec!(150000), dec!(49900)))
            .await;
        let (placed, _) = r.venue.call_counts().await;
        assert_eq!(placed, 0);
    }

    #[tokio::test]
    async fn symbol_margin_cap_blocks_new_entries() {
        let mut config = instant_config("BTCUSDT", dec!(100000), false, OrderMode::Market);
        config.symbols.get_mut("BTCUSDT").unwrap().max_symbol_margin = dec!(15);
        let mut r = rig(config).await;
        r.venue.set_mark("BTCUSDT", dec!(50000)).await;
        let mut snapshot = AccountSnapshot::default();
        snapshot.margin_by_symbol.insert("BTCUSDT".to_string(), dec!(10));
        r.account_tx.send(snapshot).unwrap();

        // 10 used + 10 new > 15 cap.
        r.hunter
            .handle_liquidation(sell_liq("BTCUSDT", dec!(150000), dec!(49900)))
            .await;
        let (placed, _) = r.venue.call_counts().await;
        assert_eq!(placed, 0);
    }

    #[tokio::test]
    async fn pending_ttl_evicts_stale_orders() {
        let mut r = rig(instant_config("BTCUSDT", dec!(100000), false, OrderMode::Limit)).await;
        r.venue.set_mark("BTCUSDT", dec!(50000)).await;
        r.hunter
            .handle_liquidation(sell_liq("BTCUSDT", dec!(150000), dec!(49900)))
            .await;
        assert_eq!(r.hunter.pending_count(), 1);

        r.hunter.housekeeping(now_ms() + PENDING_TTL_MS + 1);
        assert_eq!(r.hunter.pending_count(), 0);
    }

    // ── Market fallback ──────────────────────────────────────────────────────

    /// Venue wrapper whose first placement fails with a precision reject.
    struct FlakyVenue {
        inner: PaperVenue,
        tripped: AtomicBool,
    }

    #[async_trait::async_trait]
    impl VenueClient for FlakyVenue {
        async fn exchange_info(&self) -> Result<Vec<crate::exchange::SymbolInfo>, EngineError> {
            self.inner.exchange_info().await
        }
        async fn mark_price(&self, symbol: &str) -> Result<Decimal, EngineError> {
            self.inner.mark_price(symbol).await
        }
        async fn order_book(&self, symbol: &str, depth: u32) -> Result<OrderBook, EngineError> {
            self.inner.order_book(symbol, depth).await
        }
        async fn klines(
            &self,
            symbol: &str,
            interval: &str,
            limit: u32,
        ) -> Result<Vec<crate::exchange::Kline>, EngineError> {
            self.inner.klines(symbol, interval, limit).await
        }
        async fn positions(&self) -> Result<Vec<crate::exchange::Position>, EngineError> {
            self.inner.positions().await
        }
        async fn open_orders(
            &self,
            symbol: Option<&str>,
        ) -> Result<Vec<crate::exchange::OrderInfo>, EngineError> {
            self.inner.open_orders(symbol).await
        }
        async fn place_order(
            &self,
            req: &OrderRequest,
        ) -> Result<crate::exchange::OrderInfo, EngineError> {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                return Err(EngineError::from_venue(-1111, "Precision is over the maximum"));
            }
            self.inner.place_order(req).await
        }
        async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), EngineError> {
            self.inner.cancel_order(symbol, order_id).await
        }
        async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), EngineError> {
            self.inner.set_leverage(symbol, leverage).await
        }
        async fn position_mode(&self) -> Result<PositionMode, EngineError> {
            self.inner.position_mode().await
        }
        async fn set_position_mode(&self, mode: PositionMode) -> Result<(), EngineError> {
            self.inner.set_position_mode(mode).await
        }
        async fn income(&self, since_ms: i64) -> Result<Vec<crate::exchange::IncomeRecord>, EngineError> {
            self.inner.income(since_ms).await
        }
        async fn server_time(&self) -> Result<i64, EngineError> {
            self.inner.server_time().await
        }
        async fn create_listen_key(&self) -> Result<String, EngineError> {
            self.inner.create_listen_key().await
        }
        async fn keepalive_listen_key(&self) -> Result<(), EngineError> {
            self.inner.keepalive_listen_key().await
        }
        async fn close_listen_key(&self) -> Result<(), EngineError> {
            self.inner.close_listen_key().await
        }
    }

    #[tokio::test]
    async fn precision_reject_falls_back_to_market_once() {
        let flaky = Arc::new(FlakyVenue { inner: PaperVenue::new(), tripped: AtomicBool::new(false) });
        flaky.inner.set_mark("BTCUSDT", dec!(50000)).await;

        let mut registry = PrecisionRegistry::new();
        registry.insert("BTCUSDT", SymbolFilters::default());
        let (config_tx, config_rx) =
            watch::channel(Arc::new(instant_config("BTCUSDT", dec!(100000), false, OrderMode::Limit)));
        std::mem::forget(config_tx);
        let (_account_tx, account_rx) = watch::channel(AccountSnapshot::default());
        std::mem::forget(_account_tx);
        let (_sd_tx, sd_rx) = watch::channel(false);
        std::mem::forget(_sd_tx);
        let (errors, _sink) = spawn_error_sink(
            Arc::new(crate::error_log::JsonlStore::new("/tmp/hunter-test-errors.jsonl")),
            "test".to_string(),
            sd_rx,
        );
        let mut hunter = Hunter::new(
            flaky.clone(),
            Arc::new(RwLock::new(registry)),
            config_rx,
            account_rx,
            new_vwap_map(),
            Arc::new(RwLock::new(PositionMode::OneWay)),
            Broadcaster::new(),
            errors,
            Arc::new(LiquidationArchive::new(16)),
        );

        hunter
            .handle_liquidation(sell_liq("BTCUSDT", dec!(150000), dec!(49900)))
            .await;

        // First limit attempt rejected, market fallback filled.
        let (placed, _) = flaky.inner.call_counts().await;
        assert_eq!(placed, 1, "only the fallback reaches the paper book");
        assert_eq!(flaky.inner.positions().await.unwrap().len(), 1);
    }
}
