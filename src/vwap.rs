// ─────────────────────────────────────────────────────────────────────────────
// vwap.rs — Rolling VWAP streamer
//
// One kline WebSocket serves every vwap-protected symbol. Closed bars roll
// into a bounded window and VWAP = Σ(typical × volume) / Σ volume with
// typical = (high + low + close) / 3. The latest snapshot per symbol lives in
// a shared map for the hunter and the façade; consumers that find it stale
// (> 5 s) fall back to the same computation over REST klines.
// ─────────────────────────────────────────────────────────────────────────────
use crate::broadcaster::{Broadcaster, Event};
use crate::config::Config;
use crate::error_log::ErrorLogger;
use crate::errors::EngineError;
use crate::exchange::{Kline, VenueClient};
use crate::ingest::{next_reconnect_delay, now_ms};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

/// A streamed snapshot older than this is stale; consumers go to REST.
pub const VWAP_FRESH_MS: i64 = 5_000;

// ─── Snapshot ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VwapRelation {
    Above,
    Below,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VwapUpdate {
    pub symbol: String,
    pub vwap: Decimal,
    /// Close of the bar that produced this value.
    pub price: Decimal,
    /// Where that close sits relative to the VWAP.
    pub position: VwapRelation,
    pub at_ms: i64,
}

impl VwapUpdate {
    pub fn is_fresh(&self, now_ms: i64) -> bool {
        now_ms - self.at_ms <= VWAP_FRESH_MS
    }
}

/// Latest snapshot per symbol, shared read-mostly.
pub type VwapMap = Arc<RwLock<HashMap<String, VwapUpdate>>>;

pub fn new_vwap_map() -> VwapMap {
    Arc::new(RwLock::new(HashMap::new()))
}

// ─── Computation ─────────────────────────────────────────────────────────────

pub fn typical_price(bar: &Kline) -> Decimal {
    (bar.high + bar.low + bar.close) / dec!(3)
}

pub fn compute_vwap(bars: &[Kline]) -> Option<Decimal> {
    let mut weighted = Decimal::ZERO;
    let mut volume = Decimal::ZERO;
    for bar in bars {
        weighted += typical_price(bar) * bar.volume;
        volume += bar.volume;
    }
    if volume <= Decimal::ZERO {
        return None;
    }
    Some(weighted / volume)
}

/// Rolling window of the last `lookback` closed bars for one symbol.
#[derive(Debug)]
pub struct VwapWindow {
    bars: VecDeque<Kline>,
    lookback: usize,
}

impl VwapWindow {
    pub fn new(lookback: usize) -> Self {
        Self { bars: VecDeque::with_capacity(lookback), lookback: lookback.max(1) }
    }

    /// Rolls a closed bar in and returns the fresh VWAP, if computable.
    pub fn push(&mut self, bar: Kline) -> Option<Decimal> {
        if self.bars.len() >= self.lookback {
            self.bars.pop_front();
        }
        self.bars.push_back(bar);
        let bars: Vec<Kline> = self.bars.iter().cloned().collect();
        compute_vwap(&bars)
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }
}

/// The REST fallback: same definition, venue klines.
pub async fn rest_vwap(
    venue: &dyn VenueClient,
    symbol: &str,
    timeframe: &str,
    lookback: usize,
) -> Result<Decimal, EngineError> {
    let bars = venue.klines(symbol, timeframe, lookback as u32).await?;
    compute_vwap(&bars)
        .ok_or_else(|| EngineError::parse(format!("no kline volume for {}", symbol)).with_symbol(symbol))
}

// ─── Wire Format ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct KlineFrame {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: KlineWire,
}

#[derive(Debug, Deserialize)]
struct KlineWire {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    /// True once the bar is final.
    #[serde(rename = "x")]
    closed: bool,
}

/// Returns the closed bar carried by a kline frame, or None for partials and
/// unrelated frames.
pub fn parse_closed_kline(text: &str) -> Result<Option<(String, Kline)>, EngineError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| EngineError::parse(format!("kline frame: {}", e)))?;
    if value["e"].as_str() != Some("kline") {
        return Ok(None);
    }
    let frame: KlineFrame = serde_json::from_value(value)
        .map_err(|e| EngineError::parse(format!("kline frame: {}", e)))?;
    debug_assert_eq!(frame.event_type, "kline");
    if !frame.kline.closed {
        return Ok(None);
    }
    let k = frame.kline;
    let parse = |s: &str, what: &str| {
        Decimal::from_str(s).map_err(|_| EngineError::parse(format!("kline {}: {:?}", what, s)))
    };
    Ok(Some((
        frame.symbol,
        Kline {
            open_time: k.open_time,
            open: parse(&k.open, "open")?,
            high: parse(&k.high, "high")?,
            low: parse(&k.low, "low")?,
            close: parse(&k.close, "close")?,
            volume: parse(&k.volume, "volume")?,
            close_time: k.close_time,
        },
    )))
}

// ─── Streamer Task ───────────────────────────────────────────────────────────

fn stream_names(config: &Config) -> Vec<String> {
    config
        .symbols
        .iter()
        .filter(|(_, sc)| sc.vwap_protection)
        .map(|(symbol, sc)| format!("{}@kline_{}", symbol.to_lowercase(), sc.vwap_timeframe))
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Owns the kline socket for every vwap-protected symbol. Reconnects with
/// the shared capped backoff and resubscribes when a hot reload changes the
/// symbol set.
pub async fn run_vwap_streamer(
    ws_base: String,
    config_rx: watch::Receiver<Arc<Config>>,
    map: VwapMap,
    broadcaster: Broadcaster,
    errors: ErrorLogger,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut delay_secs: u64 = 5;

    loop {
        if *shutdown.borrow() {
            return;
        }
        let config = config_rx.borrow().clone();
        let subscriptions = stream_names(&config);
        if subscriptions.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => continue,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return; }
                    continue;
                }
            }
        }

        let endpoint = format!("{}/ws", ws_base);
        let url = match Url::parse(&endpoint) {
            Ok(u) => u,
            Err(e) => {
                log::error!("[VWAP] Bad stream URL {}: {}", endpoint, e);
                return;
            }
        };

        match connect_async(url).await {
            Ok((ws_stream, _)) => {
                log::info!("[VWAP] Connected, subscribing {} kline streams.", subscriptions.len());
                delay_secs = 5;
                let (mut write, mut read) = ws_stream.split();
                let subscribe = serde_json::json!({
                    "method": "SUBSCRIBE",
                    "params": subscriptions,
                    "id": 1,
                });
                if let Err(e) = write.send(Message::Text(subscribe.to_string())).await {
                    errors.report(&EngineError::network(format!("kline subscribe: {}", e)), "VWAP");
                    continue;
                }
                broadcaster.publish(Event::Connectivity { stream: "vwap", connected: true });

                let mut windows: HashMap<String, VwapWindow> = HashMap::new();
                let mut config_tick =
                    tokio::time::interval(std::time::Duration::from_secs(5));

                loop {
                    tokio::select! {
                        maybe = read.next() => {
                            match maybe {
                                Some(Ok(Message::Text(text))) => {
                                    match parse_closed_kline(&text) {
                                        Ok(Some((symbol, bar))) => {
                                            let sc = match config.symbol(&symbol) {
                                                Some(sc) => sc,
                                                None => continue,
                                            };
                                            let close = bar.close;
                                            let window = windows
                                                .entry(symbol.clone())
                                                .or_insert_with(|| VwapWindow::new(sc.vwap_lookback));
                                            if let Some(vwap) = window.push(bar) {
                                                let update = VwapUpdate {
                                                    symbol: symbol.clone(),
                                                    vwap,
                                                    price: close,
                                                    position: if close < vwap {
                                                        VwapRelation::Below
                                                    } else {
                                                        VwapRelation::Above
                                                    },
                                                    at_ms: now_ms(),
                                                };
                                                map.write()
                                                    .unwrap_or_else(|p| p.into_inner())
                                                    .insert(symbol, update.clone());
                                                broadcaster.publish(Event::Vwap(update));
                                            }
                                        }
                                        Ok(None) => {}
                                        Err(e) => errors.report(&e, "VWAP"),
                                    }
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    let _ = write.send(Message::Pong(data)).await;
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    log::warn!("[VWAP] Stream closed by server.");
                                    break;
                                }
                                Some(Err(e)) => {
                                    errors.report(&EngineError::network(format!("kline read: {}", e)), "VWAP");
                                    break;
                                }
                                Some(Ok(_)) => {}
                            }
                        }
                        _ = config_tick.tick() => {
                            let latest = config_rx.borrow().clone();
                            if stream_names(&latest) != subscriptions {
                                log::info!("[VWAP] Symbol set changed, resubscribing.");
                                break;
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                log::info!("[VWAP] Shutdown, closing stream.");
                                let _ = write.send(Message::Close(None)).await;
                                return;
                            }
                        }
                    }
                }
                broadcaster.publish(Event::Connectivity { stream: "vwap", connected: false });
            }
            Err(e) => {
                errors.report(&EngineError::network(format!("connect {}: {}", endpoint, e)), "VWAP");
            }
        }

        log::warn!("[VWAP] Reconnecting in {}s", delay_secs);
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(delay_secs)) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() { return; }
            }
        }
        delay_secs = next_reconnect_delay(delay_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: Decimal, low: Decimal, close: Decimal, volume: Decimal) -> Kline {
        Kline {
            open_time: 0,
            open: close,
            high,
            low,
            close,
            volume,
            close_time: 0,
        }
    }

    #[test]
    fn vwap_weights_by_volume() {
        // typical prices 100 and 200 with volumes 1 and 3 → 175.
        let bars = vec![
            bar(dec!(110), dec!(95), dec!(95), dec!(1)),
            bar(dec!(210), dec!(195), dec!(195), dec!(3)),
        ];
        assert_eq!(compute_vwap(&bars), Some(dec!(175)));
    }

    #[test]
    fn vwap_of_zero_volume_is_none() {
        let bars = vec![bar(dec!(100), dec!(100), dec!(100), Decimal::ZERO)];
        assert_eq!(compute_vwap(&bars), None);
        assert_eq!(compute_vwap(&[]), None);
    }

    #[test]
    fn window_keeps_only_lookback_bars() {
        let mut window = VwapWindow::new(3);
        for i in 1..=5 {
            let price = Decimal::from(i * 100);
            window.push(bar(price, price, price, dec!(1)));
        }
        assert_eq!(window.len(), 3);
        // Bars 300/400/500 remain → mean 400.
        let bars: Vec<Kline> = window.bars.iter().cloned().collect();
        assert_eq!(compute_vwap(&bars), Some(dec!(400)));
    }

    #[test]
    fn parses_closed_kline_frames_only() {
        let closed = r#"{
            "e": "kline", "E": 1700000000123, "s": "ETHUSDT",
            "k": {
                "t": 1700000000000, "T": 1700000059999, "s": "ETHUSDT", "i": "1m",
                "o": "3000.00", "c": "3010.00", "h": "3015.00", "l": "2995.00",
                "v": "120.5", "x": true
            }
        }"#;
        let (symbol, bar) = parse_closed_kline(closed).unwrap().unwrap();
        assert_eq!(symbol, "ETHUSDT");
        assert_eq!(bar.close, dec!(3010.00));
        assert_eq!(bar.volume, dec!(120.5));

        let partial = closed.replace("\"x\": true", "\"x\": false");
        assert!(parse_closed_kline(&partial).unwrap().is_none());

        let unrelated = r#"{"e": "aggTrade", "s": "ETHUSDT"}"#;
        assert!(parse_closed_kline(unrelated).unwrap().is_none());
    }

    #[test]
    fn freshness_deadline() {
        let update = VwapUpdate {
            symbol: "ETHUSDT".to_string(),
            vwap: dec!(3000),
            price: dec!(3010),
            position: VwapRelation::Above,
            at_ms: 10_000,
        };
        assert!(update.is_fresh(14_000));
        assert!(!update.is_fresh(15_001));
    }

    #[test]
    fn stream_names_follow_config() {
        let mut config = Config::default();
        let mut sc = crate::config::SymbolConfig::default();
        sc.vwap_protection = true;
        sc.vwap_timeframe = "1m".to_string();
        config.symbols.insert("BTCUSDT".to_string(), sc.clone());
        let mut sc5 = sc;
        sc5.vwap_timeframe = "5m".to_string();
        config.symbols.insert("ETHUSDT".to_string(), sc5);
        config.symbols.insert("XRPUSDT".to_string(), crate::config::SymbolConfig::default());

        assert_eq!(
            stream_names(&config),
            vec!["btcusdt@kline_1m".to_string(), "ethusdt@kline_5m".to_string()]
        );
    }
}
