// ─────────────────────────────────────────────────────────────────────────────
// manager.rs — Position manager / protective-order reconciler
//
// The invariant this loop maintains: every non-zero position on a configured
// symbol carries exactly one reduce-only stop-loss and one reduce-only
// take-profit, on the opposing side, sized to the position. Passes are
// serialized on one task; between passes the user-data stream patches the
// mirror so the next pass sees fresh state. Reduce-only orders with no
// position behind them are reaped. The engine never closes a position on its
// own; a position left unprotected for three passes only escalates.
// ─────────────────────────────────────────────────────────────────────────────
use crate::broadcaster::{Broadcaster, Event};
use crate::config::{Config, PositionMode, SymbolConfig};
use crate::error_log::ErrorLogger;
use crate::errors::{EngineError, ErrorKind};
use crate::exchange::{
    OrderInfo, OrderRequest, OrderType, Position, PositionSide, Side, VenueClient,
};
use crate::ingest::now_ms;
use crate::registry::PrecisionRegistry;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

/// Reconcile cadence.
const PASS_INTERVAL_SECS: u64 = 5;
/// Stream-patched mirror older than this falls back to REST.
const MIRROR_FRESH_MS: i64 = 10_000;
/// Passes a position may stay unprotected before the critical escalation.
const MISSING_PROTECTION_PASSES: u32 = 3;
/// Listen keys expire server-side at 60 minutes; refresh at half that.
const LISTEN_KEY_KEEPALIVE_SECS: u64 = 30 * 60;

// ─── Shared Snapshot ─────────────────────────────────────────────────────────

/// What the hunter sees of the account: the position mirror plus margin
/// committed per symbol. Published on a watch channel after every pass.
#[derive(Debug, Clone, Default)]
pub struct AccountSnapshot {
    pub positions: Vec<Position>,
    pub margin_by_symbol: HashMap<String, Decimal>,
    pub at_ms: i64,
}

// ─── Protective-Order Math ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProtectKind {
    StopLoss,
    TakeProfit,
}

/// Classifies a venue order as one of our protective kinds. Anything not
/// reduce-only is never protective.
pub fn classify_protective(order: &OrderInfo) -> Option<ProtectKind> {
    if !order.reduce_only {
        return None;
    }
    match order.order_type {
        OrderType::Stop | OrderType::StopMarket => Some(ProtectKind::StopLoss),
        OrderType::Limit | OrderType::TakeProfit | OrderType::TakeProfitMarket => {
            Some(ProtectKind::TakeProfit)
        }
        OrderType::Market => None,
    }
}

pub fn stop_loss_price(entry: Decimal, direction: PositionSide, pct: Decimal) -> Decimal {
    match direction {
        PositionSide::Short => entry * (Decimal::ONE + pct / dec!(100)),
        _ => entry * (Decimal::ONE - pct / dec!(100)),
    }
}

pub fn take_profit_price(entry: Decimal, direction: PositionSide, pct: Decimal) -> Decimal {
    match direction {
        PositionSide::Short => entry * (Decimal::ONE - pct / dec!(100)),
        _ => entry * (Decimal::ONE + pct / dec!(100)),
    }
}

/// Duplicate policy: keep the order whose quantity is closest to the
/// position size, oldest order id breaking ties.
pub fn pick_keeper<'a>(candidates: &[&'a OrderInfo], target_qty: Decimal) -> Option<&'a OrderInfo> {
    candidates
        .iter()
        .min_by(|a, b| {
            let da = (a.qty - target_qty).abs();
            let db = (b.qty - target_qty).abs();
            da.cmp(&db).then(a.order_id.cmp(&b.order_id))
        })
        .copied()
}

// ─── User-Data Stream Events ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum UserDataEvent {
    OrderUpdate(OrderInfo),
    AccountUpdate(Vec<MirrorPosition>),
    ListenKeyExpired,
}

/// Position delta carried by an account-update frame. The frame has no
/// leverage or mark, so it patches rather than replaces the mirror entry.
#[derive(Debug, Clone)]
pub struct MirrorPosition {
    pub symbol: String,
    pub position_side: PositionSide,
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
}

pub fn parse_user_data(text: &str) -> Result<Option<UserDataEvent>, EngineError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| EngineError::parse(format!("user-data frame: {}", e)))?;
    match value["e"].as_str() {
        Some("ORDER_TRADE_UPDATE") => {
            let o = &value["o"];
            let dec = |key: &str| {
                o[key]
                    .as_str()
                    .and_then(|s| s.parse::<Decimal>().ok())
                    .unwrap_or(Decimal::ZERO)
            };
            Ok(Some(UserDataEvent::OrderUpdate(OrderInfo {
                order_id: o["i"].as_i64().unwrap_or(0),
                client_order_id: o["c"].as_str().unwrap_or("").to_string(),
                symbol: o["s"].as_str().unwrap_or("").to_string(),
                side: if o["S"].as_str() == Some("SELL") { Side::Sell } else { Side::Buy },
                position_side: PositionSide::from_str_or_both(o["ps"].as_str().unwrap_or("BOTH")),
                order_type: OrderType::from_wire(o["o"].as_str().unwrap_or("LIMIT")),
                qty: dec("q"),
                price: dec("p"),
                stop_price: dec("sp"),
                reduce_only: o["R"].as_bool().unwrap_or(false),
                status: o["X"].as_str().unwrap_or("NEW").to_string(),
                time: value["E"].as_i64().unwrap_or(0),
            })))
        }
        Some("ACCOUNT_UPDATE") => {
            let mut positions = Vec::new();
            if let Some(rows) = value["a"]["P"].as_array() {
                for p in rows {
                    let dec = |key: &str| {
                        p[key]
                            .as_str()
                            .and_then(|s| s.parse::<Decimal>().ok())
                            .unwrap_or(Decimal::ZERO)
                    };
                    positions.push(MirrorPosition {
                        symbol: p["s"].as_str().unwrap_or("").to_string(),
                        position_side: PositionSide::from_str_or_both(
                            p["ps"].as_str().unwrap_or("BOTH"),
                        ),
                        amount: dec("pa"),
                        entry_price: dec("ep"),
                        unrealized_pnl: dec("up"),
                    });
                }
            }
            Ok(Some(UserDataEvent::AccountUpdate(positions)))
        }
        Some("listenKeyExpired") => Ok(Some(UserDataEvent::ListenKeyExpired)),
        _ => Ok(None),
    }
}

// ─── Pass Accounting ─────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq)]
pub struct PassStats {
    pub placed: u32,
    pub cancelled: u32,
    pub unprotected: u32,
}

impl PassStats {
    pub fn mutated(&self) -> bool {
        self.placed > 0 || self.cancelled > 0
    }
}

// ─── Position Manager ────────────────────────────────────────────────────────

pub struct PositionManager {
    venue: Arc<dyn VenueClient>,
    registry: Arc<RwLock<PrecisionRegistry>>,
    config_rx: watch::Receiver<Arc<Config>>,
    position_mode: Arc<RwLock<PositionMode>>,
    broadcaster: Broadcaster,
    errors: ErrorLogger,
    account_tx: watch::Sender<AccountSnapshot>,

    mirror_positions: HashMap<(String, PositionSide), Position>,
    mirror_orders: HashMap<i64, OrderInfo>,
    /// Last time the stream patched the mirror; 0 forces REST.
    stream_touch_ms: i64,
    /// Consecutive passes each position key has ended without full protection.
    unprotected_streak: HashMap<String, u32>,
}

impl PositionManager {
    pub fn new(
        venue: Arc<dyn VenueClient>,
        registry: Arc<RwLock<PrecisionRegistry>>,
        config_rx: watch::Receiver<Arc<Config>>,
        position_mode: Arc<RwLock<PositionMode>>,
        broadcaster: Broadcaster,
        errors: ErrorLogger,
        account_tx: watch::Sender<AccountSnapshot>,
    ) -> Self {
        Self {
            venue,
            registry,
            config_rx,
            position_mode,
            broadcaster,
            errors,
            account_tx,
            mirror_positions: HashMap::new(),
            mirror_orders: HashMap::new(),
            stream_touch_ms: 0,
            unprotected_streak: HashMap::new(),
        }
    }

    pub async fn run(
        mut self,
        mut user_rx: mpsc::Receiver<UserDataEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(PASS_INTERVAL_SECS));
        let mut stream_open = true;
        log::info!("[RECONCILE] Running every {}s.", PASS_INTERVAL_SECS);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.reconcile_pass().await {
                        self.errors.report(&e.with_component("RECONCILE"), "RECONCILE");
                    }
                }
                maybe = user_rx.recv(), if stream_open => {
                    match maybe {
                        Some(event) => {
                            let position_changed = matches!(event, UserDataEvent::AccountUpdate(_));
                            self.apply_user_event(event);
                            if position_changed {
                                // A position just changed: correct protection
                                // now instead of waiting out the timer.
                                if let Err(e) = self.reconcile_pass().await {
                                    self.errors.report(&e.with_component("RECONCILE"), "RECONCILE");
                                }
                            }
                        }
                        None => {
                            // Paper mode has no user stream; the timer alone
                            // drives reconciliation from here on.
                            stream_open = false;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("[RECONCILE] Shutdown.");
                        return;
                    }
                }
            }
        }
    }

    // ── Stream mirror ────────────────────────────────────────────────────────

    pub fn apply_user_event(&mut self, event: UserDataEvent) {
        match event {
            UserDataEvent::OrderUpdate(order) => {
                match order.status.as_str() {
                    "FILLED" => {
                        self.broadcaster.publish(Event::OrderFilled {
                            symbol: order.symbol.clone(),
                            order_id: order.order_id,
                        });
                        self.mirror_orders.remove(&order.order_id);
                    }
                    "CANCELED" | "EXPIRED" => {
                        self.broadcaster.publish(Event::OrderCancelled {
                            symbol: order.symbol.clone(),
                            order_id: order.order_id,
                        });
                        self.mirror_orders.remove(&order.order_id);
                    }
                    _ => {
                        self.mirror_orders.insert(order.order_id, order);
                    }
                }
                self.stream_touch_ms = now_ms();
            }
            UserDataEvent::AccountUpdate(rows) => {
                for row in rows {
                    let key = (row.symbol.clone(), row.position_side);
                    if row.amount == Decimal::ZERO {
                        self.mirror_positions.remove(&key);
                        continue;
                    }
                    let leverage = self
                        .mirror_positions
                        .get(&key)
                        .map(|p| p.leverage)
                        .or_else(|| {
                            self.config_rx.borrow().symbol(&row.symbol).map(|sc| sc.leverage)
                        })
                        .unwrap_or(1);
                    let previous_mark = self
                        .mirror_positions
                        .get(&key)
                        .map(|p| p.mark_price)
                        .unwrap_or(row.entry_price);
                    self.mirror_positions.insert(
                        key,
                        Position {
                            symbol: row.symbol,
                            position_side: row.position_side,
                            amount: row.amount,
                            entry_price: row.entry_price,
                            mark_price: previous_mark,
                            leverage,
                            unrealized_pnl: row.unrealized_pnl,
                            liquidation_price: Decimal::ZERO,
                        },
                    );
                }
                self.stream_touch_ms = now_ms();
            }
            UserDataEvent::ListenKeyExpired => {
                // The stream task reconnects; the mirror just goes stale so
                // the next pass fetches over REST.
                self.stream_touch_ms = 0;
            }
        }
    }

    // ── Reconcile ────────────────────────────────────────────────────────────

    async fn refresh_mirror(&mut self) -> Result<(), EngineError> {
        if self.stream_touch_ms > 0 && now_ms() - self.stream_touch_ms <= MIRROR_FRESH_MS {
            return Ok(());
        }
        let positions = self.venue.positions().await?;
        let orders = self.venue.open_orders(None).await?;
        self.mirror_positions = positions
            .into_iter()
            .map(|p| ((p.symbol.clone(), p.position_side), p))
            .collect();
        self.mirror_orders = orders.into_iter().map(|o| (o.order_id, o)).collect();
        Ok(())
    }

    /// One serialized pass over the whole account.
    pub async fn reconcile_pass(&mut self) -> Result<PassStats, EngineError> {
        self.refresh_mirror().await?;
        let config = self.config_rx.borrow().clone();
        let mut stats = PassStats::default();

        let positions: Vec<Position> =
            self.mirror_positions.values().filter(|p| !p.is_flat()).cloned().collect();
        let orders: Vec<OrderInfo> = self.mirror_orders.values().cloned().collect();

        let mut seen_keys = Vec::new();
        for position in &positions {
            let key = position_key(position);
            seen_keys.push(key.clone());
            let sc = match config.symbol(&position.symbol) {
                Some(sc) => sc.clone(),
                None => continue,
            };
            self.protect_position(position, &sc, &orders, &mut stats).await;
        }
        self.unprotected_streak.retain(|key, _| seen_keys.contains(key));

        // Orphan reaper: reduce-only orders with no position behind them.
        for order in &orders {
            if classify_protective(order).is_none() {
                continue;
            }
            let backed = positions.iter().any(|p| protects(order, p));
            if backed {
                continue;
            }
            log::warn!(
                "[RECONCILE] Orphan protective order {} on {} ({}), cancelling.",
                order.order_id,
                order.symbol,
                order.order_type.as_str()
            );
            self.cancel(order, &mut stats).await;
        }

        // Publish the account snapshot the hunter admits against.
        let mut margin_by_symbol: HashMap<String, Decimal> = HashMap::new();
        for position in &positions {
            *margin_by_symbol.entry(position.symbol.clone()).or_insert(Decimal::ZERO) +=
                position.margin();
        }
        let snapshot = AccountSnapshot {
            positions: positions.clone(),
            margin_by_symbol,
            at_ms: now_ms(),
        };
        let _ = self.account_tx.send(snapshot);
        self.broadcaster.publish(Event::Positions { positions });

        if stats.mutated() {
            log::info!(
                "[RECONCILE] Pass done: {} placed, {} cancelled.",
                stats.placed,
                stats.cancelled
            );
        }
        Ok(stats)
    }

    /// Ensures exactly one SL and one TP for one position.
    async fn protect_position(
        &mut self,
        position: &Position,
        sc: &SymbolConfig,
        orders: &[OrderInfo],
        stats: &mut PassStats,
    ) {
        let key = position_key(position);
        let target_qty = position.abs_amount();
        let step = {
            let registry = self.registry.read().unwrap_or_else(|p| p.into_inner());
            registry.step_size(&position.symbol)
        };

        let mut healthy = true;
        for kind in [ProtectKind::StopLoss, ProtectKind::TakeProfit] {
            let candidates: Vec<&OrderInfo> = orders
                .iter()
                .filter(|o| classify_protective(o) == Some(kind) && protects(o, position))
                .collect();

            match candidates.len() {
                0 => {
                    if !self.place_protective(position, sc, kind, target_qty, stats).await {
                        healthy = false;
                    }
                }
                1 => {
                    let keeper = candidates[0];
                    if (keeper.qty - target_qty).abs() > step {
                        log::info!(
                            "[RECONCILE] {} {} qty {} drifted from position {}, re-placing.",
                            position.symbol,
                            keeper.order_type.as_str(),
                            keeper.qty,
                            target_qty
                        );
                        self.cancel(keeper, stats).await;
                        if !self.place_protective(position, sc, kind, target_qty, stats).await {
                            healthy = false;
                        }
                    }
                }
                _ => {
                    let keeper = match pick_keeper(&candidates, target_qty) {
                        Some(k) => k,
                        None => continue,
                    };
                    for extra in candidates.iter().filter(|o| o.order_id != keeper.order_id) {
                        log::warn!(
                            "[RECONCILE] Duplicate {:?} {} on {}, cancelling.",
                            kind,
                            extra.order_id,
                            position.symbol
                        );
                        self.cancel(extra, stats).await;
                    }
                    if (keeper.qty - target_qty).abs() > step {
                        let keeper = keeper.clone();
                        self.cancel(&keeper, stats).await;
                        if !self.place_protective(position, sc, kind, target_qty, stats).await {
                            healthy = false;
                        }
                    }
                }
            }
        }

        if healthy {
            self.unprotected_streak.remove(&key);
        } else {
            let streak = self.unprotected_streak.entry(key.clone()).or_insert(0);
            *streak += 1;
            stats.unprotected += 1;
            if *streak == MISSING_PROTECTION_PASSES {
                let message = format!(
                    "{} unprotected for {} consecutive passes; manual intervention required",
                    key, MISSING_PROTECTION_PASSES
                );
                self.errors
                    .report_structural("RECONCILE", "MISSING_PROTECTION", Some(position.symbol.clone()), message.clone());
                self.broadcaster.publish(Event::EngineError {
                    severity: crate::errors::Severity::Critical,
                    kind: "MISSING_PROTECTION".to_string(),
                    message,
                    symbol: Some(position.symbol.clone()),
                });
            }
        }
    }

    /// Places one protective order; TP prefers a reduce-only limit and falls
    /// back to TAKE_PROFIT_MARKET when the limit would trigger immediately.
    /// Returns false when the order could not be placed.
    async fn place_protective(
        &mut self,
        position: &Position,
        sc: &SymbolConfig,
        kind: ProtectKind,
        target_qty: Decimal,
        stats: &mut PassStats,
    ) -> bool {
        let direction = position.direction();
        let exit_side = match direction {
            PositionSide::Short => Side::Buy,
            _ => Side::Sell,
        };
        let raw_price = match kind {
            ProtectKind::StopLoss => {
                stop_loss_price(position.entry_price, direction, sc.stop_loss_percent)
            }
            ProtectKind::TakeProfit => {
                take_profit_price(position.entry_price, direction, sc.take_profit_percent)
            }
        };
        let (price_str, qty_str) = {
            let registry = self.registry.read().unwrap_or_else(|p| p.into_inner());
            let snapped = registry.snap_price(&position.symbol, raw_price);
            (
                registry.fmt_price(&position.symbol, snapped),
                registry.fmt_qty(&position.symbol, target_qty),
            )
        };

        let request = match kind {
            ProtectKind::StopLoss => OrderRequest {
                symbol: position.symbol.clone(),
                side: exit_side,
                position_side: position.position_side,
                order_type: OrderType::StopMarket,
                qty: qty_str,
                price: None,
                stop_price: Some(price_str),
                reduce_only: true,
                time_in_force: None,
                client_order_id: Some(format!("lh-sl-{}", uuid::Uuid::new_v4().simple())),
            },
            ProtectKind::TakeProfit => OrderRequest {
                symbol: position.symbol.clone(),
                side: exit_side,
                position_side: position.position_side,
                order_type: OrderType::Limit,
                qty: qty_str,
                price: Some(price_str),
                stop_price: None,
                reduce_only: true,
                time_in_force: Some("GTC"),
                client_order_id: Some(format!("lh-tp-{}", uuid::Uuid::new_v4().simple())),
            },
        };

        match self.place_with_mode_retry(request.clone(), direction).await {
            Ok(placed) => {
                log::info!(
                    "[RECONCILE] Placed {:?} for {} {}: {} @ {}.",
                    kind,
                    position.symbol,
                    direction,
                    placed.order_id,
                    request.price.or(request.stop_price).unwrap_or_default()
                );
                stats.placed += 1;
                self.mirror_orders.insert(placed.order_id, placed);
                true
            }
            Err(e) if kind == ProtectKind::TakeProfit && e.kind == ErrorKind::OrderWouldTrigger => {
                // Mark already beyond the TP limit: take the market variant.
                let fallback = OrderRequest {
                    order_type: OrderType::TakeProfitMarket,
                    price: None,
                    stop_price: request.price.clone(),
                    time_in_force: None,
                    client_order_id: Some(format!("lh-tp-{}", uuid::Uuid::new_v4().simple())),
                    ..request
                };
                match self.place_with_mode_retry(fallback, direction).await {
                    Ok(placed) => {
                        stats.placed += 1;
                        self.mirror_orders.insert(placed.order_id, placed);
                        true
                    }
                    Err(e2) => {
                        self.errors.report(&e2.with_component("RECONCILE"), "RECONCILE");
                        false
                    }
                }
            }
            Err(e) => {
                self.errors.report(&e.with_component("RECONCILE"), "RECONCILE");
                false
            }
        }
    }

    /// One retry with the opposite positionSide when the venue disagrees
    /// about hedge/one-way; on success the discovered mode sticks.
    async fn place_with_mode_retry(
        &self,
        request: OrderRequest,
        direction: PositionSide,
    ) -> Result<OrderInfo, EngineError> {
        match self.venue.place_order(&request).await {
            Err(e) if e.kind == ErrorKind::PositionModeMismatch => {
                let (flipped_side, discovered_mode) = match request.position_side {
                    PositionSide::Both => (direction, PositionMode::Hedge),
                    _ => (PositionSide::Both, PositionMode::OneWay),
                };
                log::warn!(
                    "[RECONCILE] Position-mode mismatch on {}, retrying as {}.",
                    request.symbol,
                    flipped_side
                );
                let retry = OrderRequest { position_side: flipped_side, ..request };
                let placed = self.venue.place_order(&retry).await?;
                *self.position_mode.write().unwrap_or_else(|p| p.into_inner()) = discovered_mode;
                log::info!("[RECONCILE] Venue position mode is {}, adopted.", discovered_mode);
                Ok(placed)
            }
            other => other,
        }
    }

    async fn cancel(&mut self, order: &OrderInfo, stats: &mut PassStats) {
        match self.venue.cancel_order(&order.symbol, order.order_id).await {
            Ok(()) => {
                stats.cancelled += 1;
                self.mirror_orders.remove(&order.order_id);
                self.broadcaster.publish(Event::OrderCancelled {
                    symbol: order.symbol.clone(),
                    order_id: order.order_id,
                });
            }
            Err(e) => {
                self.errors.report(&e.with_component("RECONCILE"), "RECONCILE");
            }
        }
    }
}

/// Stable key for a position across passes.
fn position_key(position: &Position) -> String {
    match position.position_side {
        PositionSide::Both => format!("{}_{}", position.symbol, position.direction()),
        side => format!("{}_{}_HEDGE", position.symbol, side),
    }
}

/// True when a reduce-only order is the protective order of this position:
/// same symbol, opposing side, and in hedge mode the matching leg.
fn protects(order: &OrderInfo, position: &Position) -> bool {
    if order.symbol != position.symbol {
        return false;
    }
    let exit_side = match position.direction() {
        PositionSide::Short => Side::Buy,
        _ => Side::Sell,
    };
    if order.side != exit_side {
        return false;
    }
    match position.position_side {
        PositionSide::Both => order.position_side == PositionSide::Both,
        leg => order.position_side == leg || order.position_side == PositionSide::Both,
    }
}

// ─── User-Data Stream Task ───────────────────────────────────────────────────

/// Owns the authenticated stream: listen-key creation, 30-minute keepalive,
/// reconnect on drop or key expiry, frames decoded into UserDataEvents.
pub async fn run_user_stream(
    venue: Arc<dyn VenueClient>,
    ws_base: String,
    events_tx: mpsc::Sender<UserDataEvent>,
    errors: ErrorLogger,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut delay_secs: u64 = 5;
    loop {
        if *shutdown.borrow() {
            return;
        }
        let listen_key = match venue.create_listen_key().await {
            Ok(key) => key,
            Err(e) => {
                errors.report(&e.with_component("USERDATA"), "USERDATA");
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(delay_secs)) => {}
                    _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
                }
                delay_secs = crate::ingest::next_reconnect_delay(delay_secs);
                continue;
            }
        };

        let endpoint = format!("{}/ws/{}", ws_base, listen_key);
        let url = match Url::parse(&endpoint) {
            Ok(u) => u,
            Err(e) => {
                log::error!("[USERDATA] Bad stream URL: {}", e);
                return;
            }
        };

        match connect_async(url).await {
            Ok((mut ws_stream, _)) => {
                log::info!("[USERDATA] ✅ Connected to user-data stream.");
                delay_secs = 5;
                let mut keepalive = tokio::time::interval(std::time::Duration::from_secs(
                    LISTEN_KEY_KEEPALIVE_SECS,
                ));
                keepalive.tick().await; // immediate first tick

                loop {
                    tokio::select! {
                        maybe = futures_util::StreamExt::next(&mut ws_stream) => {
                            match maybe {
                                Some(Ok(Message::Text(text))) => {
                                    match parse_user_data(&text) {
                                        Ok(Some(UserDataEvent::ListenKeyExpired)) => {
                                            log::warn!("[USERDATA] Listen key expired, recreating.");
                                            let _ = events_tx.send(UserDataEvent::ListenKeyExpired).await;
                                            break;
                                        }
                                        Ok(Some(event)) => {
                                            if events_tx.send(event).await.is_err() {
                                                return;
                                            }
                                        }
                                        Ok(None) => {}
                                        Err(e) => errors.report(&e, "USERDATA"),
                                    }
                                }
                                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                                Some(Ok(Message::Close(_))) | None => {
                                    log::warn!("[USERDATA] Stream closed.");
                                    break;
                                }
                                Some(Err(e)) => {
                                    errors.report(&EngineError::network(format!("user stream: {}", e)), "USERDATA");
                                    break;
                                }
                                Some(Ok(_)) => {}
                            }
                        }
                        _ = keepalive.tick() => {
                            if let Err(e) = venue.keepalive_listen_key().await {
                                errors.report(&e.with_component("USERDATA"), "USERDATA");
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                let _ = ws_stream.close(None).await;
                                let _ = venue.close_listen_key().await;
                                return;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                errors.report(
                    &EngineError::network(format!("connect user stream: {}", e)),
                    "USERDATA",
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(delay_secs)) => {}
            _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
        }
        delay_secs = crate::ingest::next_reconnect_delay(delay_secs);
    }
}
