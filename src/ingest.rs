// ─────────────────────────────────────────────────────────────────────────────
// ingest.rs — Force-liquidation stream ingest
//
// Owns the venue's all-symbols forced-order WebSocket: connect, filter,
// normalize, publish. Reconnects with a capped doubling delay and never
// reconnects after a shutdown signal. In paper mode without credentials the
// socket is replaced by a synthetic generator over the configured symbols.
// ─────────────────────────────────────────────────────────────────────────────
use crate::broadcaster::{Broadcaster, Event};
use crate::config::Config;
use crate::error_log::ErrorLogger;
use crate::errors::EngineError;
use crate::exchange::{Side, VenueClient};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

/// First reconnect delay; doubles up to the cap, resets on a good open.
const RECONNECT_BASE_SECS: u64 = 5;
const RECONNECT_CAP_SECS: u64 = 60;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn next_reconnect_delay(current_secs: u64) -> u64 {
    (current_secs * 2).min(RECONNECT_CAP_SECS)
}

// ─── Wire Format ─────────────────────────────────────────────────────────────

/// Forced-order frame as the venue sends it.
#[derive(Debug, Deserialize)]
pub struct ForceOrderFrame {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "o")]
    pub order: ForceOrderDetail,
}

#[derive(Debug, Deserialize)]
pub struct ForceOrderDetail {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "X")]
    pub order_status: String,
    #[serde(rename = "q")]
    pub original_quantity: String,
    #[serde(rename = "z")]
    pub filled_quantity: String,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "T")]
    pub trade_time: i64,
}

// ─── Normalized Event ────────────────────────────────────────────────────────

/// A liquidation as the rest of the engine sees it. SELL means longs were
/// force-closed (a long opportunity for us); BUY means shorts were.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub symbol: String,
    pub side: Side,
    pub status: String,
    pub qty: Decimal,
    pub filled_qty: Decimal,
    pub price: Decimal,
    pub event_time: i64,
}

impl LiquidationEvent {
    pub fn volume_usdt(&self) -> Decimal {
        self.filled_qty * self.price
    }

    /// The contrarian entry side this event argues for.
    pub fn opportunity(&self) -> Side {
        match self.side {
            Side::Sell => Side::Buy,
            Side::Buy => Side::Sell,
        }
    }
}

pub fn parse_force_order(text: &str) -> Result<Option<LiquidationEvent>, EngineError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| EngineError::parse(format!("stream frame: {}", e)))?;
    if value["e"].as_str() != Some("forceOrder") {
        return Ok(None);
    }
    let frame: ForceOrderFrame = serde_json::from_value(value)
        .map_err(|e| EngineError::parse(format!("force-order frame: {}", e)))?;
    let o = frame.order;
    let side = if o.side == "SELL" { Side::Sell } else { Side::Buy };
    let parse = |s: &str, what: &str| {
        Decimal::from_str(s)
            .map_err(|_| EngineError::parse(format!("force-order {}: {:?}", what, s)))
    };
    Ok(Some(LiquidationEvent {
        symbol: o.symbol,
        side,
        status: o.order_status,
        qty: parse(&o.original_quantity, "qty")?,
        filled_qty: parse(&o.filled_quantity, "filled qty")?,
        price: parse(&o.price, "price")?,
        event_time: if o.trade_time > 0 { o.trade_time } else { frame.event_time },
    }))
}

// ─── Archive ─────────────────────────────────────────────────────────────────

/// Bounded in-memory archive backing `GET /liquidations`. The hunter appends
/// fire-and-forget; readers take snapshots.
pub struct LiquidationArchive {
    inner: Mutex<VecDeque<LiquidationEvent>>,
    capacity: usize,
}

impl LiquidationArchive {
    pub fn new(capacity: usize) -> Self {
        Self { inner: Mutex::new(VecDeque::with_capacity(capacity)), capacity }
    }

    pub fn push(&self, event: LiquidationEvent) {
        let mut buf = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(event);
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<LiquidationEvent> {
        let buf = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        buf.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

// ─── Live Stream Task ────────────────────────────────────────────────────────

/// Connects to the all-symbols forced-order stream and pushes normalized
/// events into the hunter's channel (backpressure applies) while also
/// broadcasting them for observers.
pub async fn run_liquidation_stream(
    ws_base: String,
    events_tx: mpsc::Sender<LiquidationEvent>,
    broadcaster: Broadcaster,
    errors: ErrorLogger,
    mut shutdown: watch::Receiver<bool>,
) {
    let endpoint = format!("{}/ws/!forceOrder@arr", ws_base);
    let mut delay_secs = RECONNECT_BASE_SECS;

    loop {
        if *shutdown.borrow() {
            return;
        }
        log::info!("[INGEST] Connecting to {}", endpoint);
        let url = match Url::parse(&endpoint) {
            Ok(u) => u,
            Err(e) => {
                log::error!("[INGEST] Bad stream URL {}: {}", endpoint, e);
                return;
            }
        };

        match connect_async(url).await {
            Ok((mut ws_stream, _)) => {
                log::info!("[INGEST] ✅ Connected to forced-order stream.");
                delay_secs = RECONNECT_BASE_SECS;
                broadcaster.publish(Event::Connectivity { stream: "liquidation", connected: true });

                loop {
                    tokio::select! {
                        maybe = ws_stream.next() => {
                            match maybe {
                                Some(Ok(Message::Text(text))) => {
                                    match parse_force_order(&text) {
                                        Ok(Some(event)) => {
                                            if events_tx.send(event).await.is_err() {
                                                log::warn!("[INGEST] Event channel closed, stopping.");
                                                return;
                                            }
                                        }
                                        Ok(None) => {}
                                        Err(e) => errors.report(&e, "INGEST"),
                                    }
                                }
                                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                                Some(Ok(Message::Close(_))) | None => {
                                    log::warn!("[INGEST] Stream closed by server.");
                                    break;
                                }
                                Some(Err(e)) => {
                                    errors.report(&EngineError::network(format!("stream read: {}", e)), "INGEST");
                                    break;
                                }
                                Some(Ok(_)) => {}
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                log::info!("[INGEST] Shutdown, closing stream.");
                                let _ = ws_stream.close(None).await;
                                return;
                            }
                        }
                    }
                }
                broadcaster.publish(Event::Connectivity { stream: "liquidation", connected: false });
            }
            Err(e) => {
                errors.report(
                    &EngineError::network(format!("connect {}: {}", endpoint, e)),
                    "INGEST",
                );
            }
        }

        log::warn!("[INGEST] Reconnecting in {}s", delay_secs);
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(delay_secs)) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() { return; }
            }
        }
        delay_secs = next_reconnect_delay(delay_secs);
    }
}

// ─── Simulation Feed ─────────────────────────────────────────────────────────

/// Paper-mode substitute for the socket: every 5–10 s emit one synthetic
/// liquidation on a random configured symbol, priced off the paper mark and
/// sized so symbol thresholds are crossed now and then.
pub async fn run_simulated_liquidations(
    venue: Arc<dyn VenueClient>,
    config_rx: watch::Receiver<Arc<Config>>,
    events_tx: mpsc::Sender<LiquidationEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!("[INGEST] Simulation feed active (paper mode, no credentials).");
    loop {
        let delay_ms = {
            use rand::Rng;
            rand::thread_rng().gen_range(5_000..=10_000)
        };
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(delay_ms)) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() { return; }
            }
        }

        let config = config_rx.borrow().clone();
        let symbols: Vec<String> = config.symbols.keys().cloned().collect();
        if symbols.is_empty() {
            continue;
        }
        let (symbol, side, volume_fraction, price_jitter) = {
            use rand::Rng;
            use rust_decimal::prelude::FromPrimitive;
            let mut rng = rand::thread_rng();
            let symbol = symbols[rng.gen_range(0..symbols.len())].clone();
            let side = if rng.gen_bool(0.5) { Side::Sell } else { Side::Buy };
            // Log-uniform over 10%..140% of the side threshold: most events
            // stay small, the occasional one crosses.
            let draw = rng.gen_range(0.10f64.ln()..=1.40f64.ln()).exp();
            let volume_fraction = Decimal::from_f64(draw).unwrap_or(dec!(0.5));
            let price_jitter = Decimal::from(rng.gen_range(-50i64..=50)) / dec!(10000);
            (symbol, side, volume_fraction, price_jitter)
        };

        let threshold = match config.symbol(&symbol) {
            Some(sc) if side == Side::Sell => sc.long_volume_threshold,
            Some(sc) => sc.short_volume_threshold,
            None => continue,
        };
        let mark = match venue.mark_price(&symbol).await {
            Ok(m) => m,
            Err(_) => continue,
        };
        let price = mark * (Decimal::ONE + price_jitter);
        let volume = threshold * volume_fraction;
        if price <= Decimal::ZERO {
            continue;
        }
        let qty = volume / price;

        let event = LiquidationEvent {
            symbol,
            side,
            status: "FILLED".to_string(),
            qty,
            filled_qty: qty,
            price,
            event_time: now_ms(),
        };
        log::debug!(
            "[INGEST] Synthetic liquidation {} {} vol≈{:.0} USDT",
            event.symbol,
            event.side,
            event.volume_usdt()
        );
        if events_tx.send(event).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: &str = r#"{
        "e": "forceOrder",
        "E": 1699999999999,
        "o": {
            "s": "BTCUSDT",
            "S": "SELL",
            "o": "LIMIT",
            "f": "IOC",
            "q": "0.500",
            "p": "42750.00",
            "ap": "42749.00",
            "X": "FILLED",
            "l": "0.500",
            "z": "0.400",
            "T": 1699999999998
        }
    }"#;

    #[test]
    fn parses_force_order_frame() {
        let event = parse_force_order(FRAME).unwrap().unwrap();
        assert_eq!(event.symbol, "BTCUSDT");
        assert_eq!(event.side, Side::Sell);
        assert_eq!(event.status, "FILLED");
        assert_eq!(event.qty, dec!(0.500));
        assert_eq!(event.filled_qty, dec!(0.400));
        assert_eq!(event.price, dec!(42750.00));
        assert_eq!(event.event_time, 1699999999998);
    }

    #[test]
    fn volume_is_filled_qty_times_price() {
        let event = parse_force_order(FRAME).unwrap().unwrap();
        assert_eq!(event.volume_usdt(), dec!(17100.0000));
    }

    #[test]
    fn sell_liquidation_is_long_opportunity() {
        let event = parse_force_order(FRAME).unwrap().unwrap();
        assert_eq!(event.opportunity(), Side::Buy);
        let flipped = LiquidationEvent { side: Side::Buy, ..event };
        assert_eq!(flipped.opportunity(), Side::Sell);
    }

    #[test]
    fn non_force_order_frames_are_dropped() {
        let other = FRAME.replace("forceOrder", "markPriceUpdate");
        assert!(parse_force_order(&other).unwrap().is_none());
    }

    #[test]
    fn malformed_frame_is_a_parse_error() {
        assert!(parse_force_order("{\"e\": \"forceOrder\"").is_err());
        assert!(parse_force_order("{\"e\": \"forceOrder\", \"E\": 1, \"o\": {}}").is_err());
    }

    #[test]
    fn reconnect_delay_doubles_to_cap() {
        let mut delay = RECONNECT_BASE_SECS;
        let mut schedule = vec![delay];
        for _ in 0..5 {
            delay = next_reconnect_delay(delay);
            schedule.push(delay);
        }
        assert_eq!(schedule, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn archive_is_bounded_and_newest_first() {
        let archive = LiquidationArchive::new(3);
        for i in 0..5 {
            archive.push(LiquidationEvent {
                symbol: format!("S{}", i),
                side: Side::Sell,
                status: "FILLED".to_string(),
                qty: dec!(1),
                filled_qty: dec!(1),
                price: dec!(10),
                event_time: i,
            });
        }
        assert_eq!(archive.len(), 3);
        let recent = archive.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].symbol, "S4");
        assert_eq!(recent[2].symbol, "S2");
    }
}
