// ─────────────────────────────────────────────────────────────────────────────
// exchange.rs — Venue client
//
// One trait, two implementations. LiveVenue signs requests with HMAC-SHA256
// over the exact query string sent (timestamp + recvWindow included, server
// clock offset applied) and translates venue rejections into the typed error
// taxonomy. PaperVenue keeps the whole account in memory and is what paper
// mode and the scenario tests run against.
// ─────────────────────────────────────────────────────────────────────────────
use crate::config::PositionMode;
use crate::errors::{EngineError, ErrorKind};
use crate::registry::SymbolFilters;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;

type HmacSha256 = Hmac<Sha256>;

// ─── Shared Models ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    #[serde(rename = "BOTH")]
    Both,
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Both => "BOTH",
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    pub fn from_str_or_both(s: &str) -> PositionSide {
        match s {
            "LONG" => PositionSide::Long,
            "SHORT" => PositionSide::Short,
            _ => PositionSide::Both,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "STOP")]
    Stop,
    #[serde(rename = "STOP_MARKET")]
    StopMarket,
    #[serde(rename = "TAKE_PROFIT")]
    TakeProfit,
    #[serde(rename = "TAKE_PROFIT_MARKET")]
    TakeProfitMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
            OrderType::Stop => "STOP",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TakeProfit => "TAKE_PROFIT",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }

    pub fn from_wire(s: &str) -> OrderType {
        match s {
            "MARKET" => OrderType::Market,
            "STOP" => OrderType::Stop,
            "STOP_MARKET" => OrderType::StopMarket,
            "TAKE_PROFIT" => OrderType::TakeProfit,
            "TAKE_PROFIT_MARKET" => OrderType::TakeProfitMarket,
            _ => OrderType::Limit,
        }
    }
}

/// A position as the venue reports it. The venue is authoritative; this is a
/// cache entry refreshed by push and poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub position_side: PositionSide,
    /// Signed contract amount; negative means short in one-way mode.
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub leverage: u32,
    pub unrealized_pnl: Decimal,
    pub liquidation_price: Decimal,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.amount == Decimal::ZERO
    }

    pub fn abs_amount(&self) -> Decimal {
        self.amount.abs()
    }

    /// The directional side of this position, resolving one-way sign.
    pub fn direction(&self) -> PositionSide {
        match self.position_side {
            PositionSide::Both => {
                if self.amount >= Decimal::ZERO {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                }
            }
            other => other,
        }
    }

    /// Margin currently committed, at the position's leverage.
    pub fn margin(&self) -> Decimal {
        if self.leverage == 0 {
            return Decimal::ZERO;
        }
        self.abs_amount() * self.entry_price / Decimal::from(self.leverage)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderInfo {
    pub order_id: i64,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Decimal,
    pub stop_price: Decimal,
    pub reduce_only: bool,
    pub status: String,
    pub time: i64,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub order_type: OrderType,
    /// Rendered at venue precision by the caller (already snapped).
    pub qty: String,
    pub price: Option<String>,
    pub stop_price: Option<String>,
    pub reduce_only: bool,
    /// GTC for plain limits, GTX for post-only.
    pub time_in_force: Option<&'static str>,
    pub client_order_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    /// Sorted descending by price.
    pub bids: Vec<(Decimal, Decimal)>,
    /// Sorted ascending by price.
    pub asks: Vec<(Decimal, Decimal)>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|(p, _)| *p)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|(p, _)| *p)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomeRecord {
    pub symbol: String,
    pub income_type: String,
    pub income: Decimal,
    pub time: i64,
}

#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub symbol: String,
    pub filters: SymbolFilters,
}

// ─── Venue Trait ─────────────────────────────────────────────────────────────

#[async_trait]
pub trait VenueClient: Send + Sync {
    async fn exchange_info(&self) -> Result<Vec<SymbolInfo>, EngineError>;
    async fn mark_price(&self, symbol: &str) -> Result<Decimal, EngineError>;
    async fn order_book(&self, symbol: &str, depth: u32) -> Result<OrderBook, EngineError>;
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>, EngineError>;
    async fn positions(&self) -> Result<Vec<Position>, EngineError>;
    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderInfo>, EngineError>;
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderInfo, EngineError>;
    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), EngineError>;
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), EngineError>;
    async fn position_mode(&self) -> Result<PositionMode, EngineError>;
    async fn set_position_mode(&self, mode: PositionMode) -> Result<(), EngineError>;
    async fn income(&self, since_ms: i64) -> Result<Vec<IncomeRecord>, EngineError>;
    async fn server_time(&self) -> Result<i64, EngineError>;
    async fn create_listen_key(&self) -> Result<String, EngineError>;
    async fn keepalive_listen_key(&self) -> Result<(), EngineError>;
    async fn close_listen_key(&self) -> Result<(), EngineError>;
}

// ─── Rate Limiter ────────────────────────────────────────────────────────────

/// Token bucket sized to the venue's per-minute request weight. Every REST
/// call acquires its documented weight before going out; concurrent callers
/// queue on the sleep, not on the venue's 429s.
pub struct RateLimiter {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_per_sec: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(weight_per_minute: u32) -> Self {
        let capacity = weight_per_minute as f64;
        Self {
            state: Mutex::new(BucketState { tokens: capacity, last_refill: Instant::now() }),
            capacity,
            refill_per_sec: capacity / 60.0,
        }
    }

    pub async fn acquire(&self, weight: u32) {
        let weight = weight as f64;
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = Instant::now();
                if state.tokens >= weight {
                    state.tokens -= weight;
                    return;
                }
                (weight - state.tokens) / self.refill_per_sec
            };
            tokio::time::sleep(std::time::Duration::from_secs_f64(wait.max(0.01))).await;
        }
    }
}

// ─── Live Venue ──────────────────────────────────────────────────────────────

const RECV_WINDOW_MS: i64 = 5_000;
const MAX_REST_RETRIES: u32 = 3;

pub struct LiveVenue {
    base_url: String,
    api_key: String,
    secret_key: String,
    client: reqwest::Client,
    limiter: RateLimiter,
    /// Server minus local clock, milliseconds.
    time_offset_ms: AtomicI64,
    listen_key: Mutex<Option<String>>,
}

impl LiveVenue {
    pub fn new(base_url: String, api_key: String, secret_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self {
            base_url,
            api_key,
            secret_key,
            client,
            limiter: RateLimiter::new(2_400),
            time_offset_ms: AtomicI64::new(0),
            listen_key: Mutex::new(None),
        }
    }

    /// Aligns the signing clock with the venue. Called at startup and again
    /// when a timestamp-skew reject comes back.
    pub async fn sync_time(&self) -> Result<(), EngineError> {
        let server = self.server_time().await?;
        let local = chrono::Utc::now().timestamp_millis();
        let offset = server - local;
        self.time_offset_ms.store(offset, Ordering::SeqCst);
        log::info!("[VENUE] Clock synced, offset {}ms", offset);
        Ok(())
    }

    fn timestamp_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() + self.time_offset_ms.load(Ordering::SeqCst)
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret_key.as_bytes()).expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Builds the canonical query string and, for signed calls, appends
    /// timestamp, recvWindow and the signature over the exact string sent.
    fn build_query(&self, params: &[(String, String)], signed: bool) -> String {
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        if signed {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(&format!(
                "timestamp={}&recvWindow={}",
                self.timestamp_ms(),
                RECV_WINDOW_MS
            ));
            let signature = self.sign(&query);
            query.push_str(&format!("&signature={}", signature));
        }
        query
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: Vec<(String, String)>,
        signed: bool,
        weight: u32,
    ) -> Result<serde_json::Value, EngineError> {
        self.limiter.acquire(weight).await;

        let mut attempt: u32 = 0;
        let mut resynced = false;
        loop {
            let query = self.build_query(&params, signed);
            let url = if query.is_empty() {
                format!("{}{}", self.base_url, path)
            } else {
                format!("{}{}?{}", self.base_url, path, query)
            };

            let mut builder = self.client.request(method.clone(), &url);
            if signed || !self.api_key.is_empty() {
                builder = builder.header("X-MBX-APIKEY", &self.api_key);
            }

            let outcome = match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(|secs| secs * 1_000);
                    match resp.text().await {
                        Ok(text) => {
                            if status.is_success() {
                                return serde_json::from_str(&text)
                                    .map_err(|e| EngineError::parse(format!("{} body: {}", path, e)));
                            }

                            let err = match serde_json::from_str::<serde_json::Value>(&text) {
                                Ok(body) => {
                                    let code =
                                        body["code"].as_i64().unwrap_or(status.as_u16() as i64);
                                    let msg = body["msg"].as_str().unwrap_or(&text);
                                    EngineError::from_venue(code, msg)
                                }
                                Err(_) if status.as_u16() == 429 => EngineError::new(
                                    ErrorKind::RateLimited,
                                    format!("HTTP 429 on {}", path),
                                ),
                                Err(_) if status.is_server_error() => {
                                    EngineError::network(format!("HTTP {} on {}", status, path))
                                }
                                Err(_) => EngineError::new(
                                    ErrorKind::Protocol,
                                    format!("HTTP {} on {}: {}", status, path, text),
                                ),
                            };
                            let err = match retry_after {
                                Some(ms) if err.kind == ErrorKind::RateLimited => {
                                    err.with_retry_after(ms)
                                }
                                _ => err,
                            };
                            Err(err)
                        }
                        Err(e) => Err(EngineError::network(format!("read body: {}", e))),
                    }
                }
                Err(e) => {
                    let detail = if e.is_timeout() { "timeout" } else { "transport" };
                    Err(EngineError::network(format!("{} {}: {}", detail, path, e)))
                }
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) => {
                    // Skewed clocks reject as InvalidCredentials; one resync,
                    // then one more try before giving up.
                    if err.kind == ErrorKind::InvalidCredentials
                        && err.code == Some(-1021)
                        && !resynced
                    {
                        resynced = true;
                        if self.sync_time().await.is_ok() {
                            continue;
                        }
                    }
                    if err.is_transient() && attempt < MAX_REST_RETRIES {
                        let backoff = err.retry_after_ms.unwrap_or(250 * 2u64.pow(attempt));
                        log::warn!(
                            "[VENUE] {} attempt {}/{} failed ({}), retrying in {}ms",
                            path,
                            attempt + 1,
                            MAX_REST_RETRIES,
                            err,
                            backoff
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

fn dec_str(v: &serde_json::Value) -> Decimal {
    v.as_str()
        .and_then(|s| Decimal::from_str(s).ok())
        .unwrap_or(Decimal::ZERO)
}

fn dec_field(v: &serde_json::Value, key: &str) -> Decimal {
    dec_str(&v[key])
}

fn order_from_value(v: &serde_json::Value) -> OrderInfo {
    OrderInfo {
        order_id: v["orderId"].as_i64().unwrap_or(0),
        client_order_id: v["clientOrderId"].as_str().unwrap_or("").to_string(),
        symbol: v["symbol"].as_str().unwrap_or("").to_string(),
        side: if v["side"].as_str() == Some("SELL") { Side::Sell } else { Side::Buy },
        position_side: PositionSide::from_str_or_both(v["positionSide"].as_str().unwrap_or("BOTH")),
        order_type: OrderType::from_wire(v["type"].as_str().unwrap_or("LIMIT")),
        qty: dec_field(v, "origQty"),
        price: dec_field(v, "price"),
        stop_price: dec_field(v, "stopPrice"),
        reduce_only: v["reduceOnly"].as_bool().unwrap_or(false),
        status: v["status"].as_str().unwrap_or("NEW").to_string(),
        time: v["time"].as_i64().or_else(|| v["updateTime"].as_i64()).unwrap_or(0),
    }
}

#[async_trait]
impl VenueClient for LiveVenue {
    async fn exchange_info(&self) -> Result<Vec<SymbolInfo>, EngineError> {
        let data = self
            .request(reqwest::Method::GET, "/fapi/v1/exchangeInfo", vec![], false, 1)
            .await?;
        let mut out = Vec::new();
        if let Some(symbols) = data["symbols"].as_array() {
            for s in symbols {
                let symbol = match s["symbol"].as_str() {
                    Some(name) => name.to_string(),
                    None => continue,
                };
                let mut filters = SymbolFilters::default();
                filters.price_precision = s["pricePrecision"].as_u64().unwrap_or(4) as u32;
                filters.quantity_precision = s["quantityPrecision"].as_u64().unwrap_or(3) as u32;
                if let Some(filter_list) = s["filters"].as_array() {
                    for f in filter_list {
                        match f["filterType"].as_str() {
                            Some("PRICE_FILTER") => {
                                let tick = dec_field(f, "tickSize");
                                if tick > Decimal::ZERO {
                                    filters.tick_size = tick;
                                }
                            }
                            Some("LOT_SIZE") => {
                                let step = dec_field(f, "stepSize");
                                if step > Decimal::ZERO {
                                    filters.step_size = step;
                                }
                            }
                            Some("MIN_NOTIONAL") => {
                                let notional = dec_field(f, "notional");
                                if notional > Decimal::ZERO {
                                    filters.min_notional = notional;
                                }
                            }
                            _ => {}
                        }
                    }
                }
                out.push(SymbolInfo { symbol, filters });
            }
        }
        Ok(out)
    }

    async fn mark_price(&self, symbol: &str) -> Result<Decimal, EngineError> {
        let params = vec![("symbol".to_string(), symbol.to_string())];
        let data = self
            .request(reqwest::Method::GET, "/fapi/v1/premiumIndex", params, false, 1)
            .await
            .map_err(|e| e.with_symbol(symbol))?;
        let mark = dec_field(&data, "markPrice");
        if mark <= Decimal::ZERO {
            return Err(EngineError::parse(format!("no mark price for {}", symbol)).with_symbol(symbol));
        }
        Ok(mark)
    }

    async fn order_book(&self, symbol: &str, depth: u32) -> Result<OrderBook, EngineError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("limit".to_string(), depth.to_string()),
        ];
        let data = self
            .request(reqwest::Method::GET, "/fapi/v1/depth", params, false, 2)
            .await
            .map_err(|e| e.with_symbol(symbol))?;

        let parse_levels = |key: &str| -> Vec<(Decimal, Decimal)> {
            data[key]
                .as_array()
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| {
                            let level = row.as_array()?;
                            Some((dec_str(level.first()?), dec_str(level.get(1)?)))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        Ok(OrderBook { bids: parse_levels("bids"), asks: parse_levels("asks") })
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>, EngineError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), interval.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        let data = self
            .request(reqwest::Method::GET, "/fapi/v1/klines", params, false, 2)
            .await
            .map_err(|e| e.with_symbol(symbol))?;
        let rows = data
            .as_array()
            .ok_or_else(|| EngineError::parse("klines response is not an array"))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let cols = match row.as_array() {
                Some(c) if c.len() >= 7 => c,
                _ => continue,
            };
            out.push(Kline {
                open_time: cols[0].as_i64().unwrap_or(0),
                open: dec_str(&cols[1]),
                high: dec_str(&cols[2]),
                low: dec_str(&cols[3]),
                close: dec_str(&cols[4]),
                volume: dec_str(&cols[5]),
                close_time: cols[6].as_i64().unwrap_or(0),
            });
        }
        Ok(out)
    }

    async fn positions(&self) -> Result<Vec<Position>, EngineError> {
        let data = self
            .request(reqwest::Method::GET, "/fapi/v1/positionRisk", vec![], true, 5)
            .await?;
        let rows = data
            .as_array()
            .ok_or_else(|| EngineError::parse("positionRisk response is not an array"))?;
        let mut out = Vec::new();
        for row in rows {
            let amount = dec_field(row, "positionAmt");
            if amount == Decimal::ZERO {
                continue;
            }
            out.push(Position {
                symbol: row["symbol"].as_str().unwrap_or("").to_string(),
                position_side: PositionSide::from_str_or_both(
                    row["positionSide"].as_str().unwrap_or("BOTH"),
                ),
                amount,
                entry_price: dec_field(row, "entryPrice"),
                mark_price: dec_field(row, "markPrice"),
                leverage: row["leverage"]
                    .as_str()
                    .and_then(|s| s.parse::<u32>().ok())
                    .unwrap_or(1),
                unrealized_pnl: dec_field(row, "unRealizedProfit"),
                liquidation_price: dec_field(row, "liquidationPrice"),
            });
        }
        Ok(out)
    }

    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderInfo>, EngineError> {
        let mut params = Vec::new();
        if let Some(symbol) = symbol {
            params.push(("symbol".to_string(), symbol.to_string()));
        }
        let data = self
            .request(reqwest::Method::GET, "/fapi/v1/openOrders", params, true, 5)
            .await?;
        let rows = data
            .as_array()
            .ok_or_else(|| EngineError::parse("openOrders response is not an array"))?;
        Ok(rows.iter().map(order_from_value).collect())
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderInfo, EngineError> {
        let mut params = vec![
            ("symbol".to_string(), req.symbol.clone()),
            ("side".to_string(), req.side.as_str().to_string()),
            ("type".to_string(), req.order_type.as_str().to_string()),
            ("quantity".to_string(), req.qty.clone()),
        ];
        if req.position_side != PositionSide::Both {
            params.push(("positionSide".to_string(), req.position_side.as_str().to_string()));
        }
        if let Some(ref price) = req.price {
            params.push(("price".to_string(), price.clone()));
        }
        if let Some(ref stop) = req.stop_price {
            params.push(("stopPrice".to_string(), stop.clone()));
        }
        if let Some(tif) = req.time_in_force {
            params.push(("timeInForce".to_string(), tif.to_string()));
        }
        // In hedge mode the venue derives reduce-only from positionSide and
        // rejects the explicit flag.
        if req.reduce_only && req.position_side == PositionSide::Both {
            params.push(("reduceOnly".to_string(), "true".to_string()));
        }
        if let Some(ref id) = req.client_order_id {
            params.push(("newClientOrderId".to_string(), id.clone()));
        }

        let data = self
            .request(reqwest::Method::POST, "/fapi/v1/order", params, true, 1)
            .await
            .map_err(|e| e.with_symbol(req.symbol.clone()))?;
        Ok(order_from_value(&data))
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), EngineError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        self.request(reqwest::Method::DELETE, "/fapi/v1/order", params, true, 1)
            .await
            .map_err(|e| e.with_symbol(symbol))?;
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), EngineError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("leverage".to_string(), leverage.to_string()),
        ];
        self.request(reqwest::Method::POST, "/fapi/v1/leverage", params, true, 1)
            .await
            .map_err(|e| e.with_symbol(symbol))?;
        Ok(())
    }

    async fn position_mode(&self) -> Result<PositionMode, EngineError> {
        let data = self
            .request(reqwest::Method::GET, "/fapi/v1/positionSide/dual", vec![], true, 30)
            .await?;
        Ok(if data["dualSidePosition"].as_bool().unwrap_or(false) {
            PositionMode::Hedge
        } else {
            PositionMode::OneWay
        })
    }

    async fn set_position_mode(&self, mode: PositionMode) -> Result<(), EngineError> {
        let dual = matches!(mode, PositionMode::Hedge);
        let params = vec![("dualSidePosition".to_string(), dual.to_string())];
        self.request(reqwest::Method::POST, "/fapi/v1/positionSide/dual", params, true, 1)
            .await?;
        Ok(())
    }

    async fn income(&self, since_ms: i64) -> Result<Vec<IncomeRecord>, EngineError> {
        let params = vec![
            ("startTime".to_string(), since_ms.to_string()),
            ("limit".to_string(), "1000".to_string()),
        ];
        let data = self
            .request(reqwest::Method::GET, "/fapi/v1/income", params, true, 30)
            .await?;
        let rows = data
            .as_array()
            .ok_or_else(|| EngineError::parse("income response is not an array"))?;
        Ok(rows
            .iter()
            .map(|row| IncomeRecord {
                symbol: row["symbol"].as_str().unwrap_or("").to_string(),
                income_type: row["incomeType"].as_str().unwrap_or("").to_string(),
                income: dec_field(row, "income"),
                time: row["time"].as_i64().unwrap_or(0),
            })
            .collect())
    }

    async fn server_time(&self) -> Result<i64, EngineError> {
        let data = self
            .request(reqwest::Method::GET, "/fapi/v1/time", vec![], false, 1)
            .await?;
        data["serverTime"]
            .as_i64()
            .ok_or_else(|| EngineError::parse("serverTime missing"))
    }

    async fn create_listen_key(&self) -> Result<String, EngineError> {
        let data = self
            .request(reqwest::Method::POST, "/fapi/v1/listenKey", vec![], true, 1)
            .await?;
        let key = data["listenKey"]
            .as_str()
            .ok_or_else(|| EngineError::parse("listenKey missing"))?
            .to_string();
        *self.listen_key.lock().await = Some(key.clone());
        Ok(key)
    }

    async fn keepalive_listen_key(&self) -> Result<(), EngineError> {
        self.request(reqwest::Method::PUT, "/fapi/v1/listenKey", vec![], true, 1)
            .await?;
        Ok(())
    }

    async fn close_listen_key(&self) -> Result<(), EngineError> {
        self.request(reqwest::Method::DELETE, "/fapi/v1/listenKey", vec![], true, 1)
            .await?;
        *self.listen_key.lock().await = None;
        Ok(())
    }
}

// ─── Paper Venue ─────────────────────────────────────────────────────────────

/// In-memory venue. Market orders fill instantly at the seeded mark, limits
/// and protective orders rest in the book, and positions net or hedge per the
/// configured mode. Call counters back the reconcile-idempotence tests.
pub struct PaperVenue {
    state: Mutex<PaperState>,
}

struct PaperState {
    marks: HashMap<String, Decimal>,
    positions: HashMap<(String, PositionSide), Position>,
    open_orders: Vec<OrderInfo>,
    next_order_id: i64,
    position_mode: PositionMode,
    leverage: HashMap<String, u32>,
    place_count: u64,
    cancel_count: u64,
}

impl PaperVenue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PaperState {
                marks: HashMap::new(),
                positions: HashMap::new(),
                open_orders: Vec::new(),
                next_order_id: 1,
                position_mode: PositionMode::OneWay,
                leverage: HashMap::new(),
                place_count: 0,
                cancel_count: 0,
            }),
        }
    }

    pub async fn set_mark(&self, symbol: &str, mark: Decimal) {
        self.state.lock().await.marks.insert(symbol.to_string(), mark);
    }

    pub async fn seed_position(&self, position: Position) {
        let mut state = self.state.lock().await;
        let key = (position.symbol.clone(), position.position_side);
        state.marks.entry(position.symbol.clone()).or_insert(position.mark_price);
        state.positions.insert(key, position);
    }

    pub async fn seed_order(&self, order: OrderInfo) {
        let mut state = self.state.lock().await;
        state.next_order_id = state.next_order_id.max(order.order_id + 1);
        state.open_orders.push(order);
    }

    /// (placements, cancellations) issued so far.
    pub async fn call_counts(&self) -> (u64, u64) {
        let state = self.state.lock().await;
        (state.place_count, state.cancel_count)
    }

    fn apply_fill(state: &mut PaperState, req: &OrderRequest, qty: Decimal, price: Decimal) {
        let key_side = match state.position_mode {
            PositionMode::OneWay => PositionSide::Both,
            PositionMode::Hedge => req.position_side,
        };
        let key = (req.symbol.clone(), key_side);
        let signed = match (state.position_mode, req.side, req.position_side) {
            (PositionMode::OneWay, Side::Buy, _) => qty,
            (PositionMode::OneWay, Side::Sell, _) => -qty,
            // Hedge mode: the sign tracks the leg, not the order side.
            (PositionMode::Hedge, side, leg) => {
                let closing = matches!(
                    (side, leg),
                    (Side::Sell, PositionSide::Long) | (Side::Buy, PositionSide::Short)
                );
                let magnitude = if leg == PositionSide::Short { -qty } else { qty };
                if closing {
                    -magnitude
                } else {
                    magnitude
                }
            }
        };
        let leverage = state.leverage.get(&req.symbol).copied().unwrap_or(1);

        let entry = state.positions.entry(key).or_insert_with(|| Position {
            symbol: req.symbol.clone(),
            position_side: key_side,
            amount: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            mark_price: price,
            leverage,
            unrealized_pnl: Decimal::ZERO,
            liquidation_price: Decimal::ZERO,
        });

        let old_amount = entry.amount;
        if old_amount == Decimal::ZERO {
            entry.entry_price = price;
        } else if (old_amount > Decimal::ZERO) == (signed > Decimal::ZERO) {
            // Same direction: volume-weighted entry.
            let total = old_amount.abs() + signed.abs();
            if total > Decimal::ZERO {
                entry.entry_price =
                    (entry.entry_price * old_amount.abs() + price * signed.abs()) / total;
            }
        }
        entry.amount = old_amount + signed;
        entry.mark_price = price;
        entry.leverage = leverage;

        if entry.amount == Decimal::ZERO {
            state.positions.remove(&(req.symbol.clone(), key_side));
        }
    }
}

#[async_trait]
impl VenueClient for PaperVenue {
    async fn exchange_info(&self) -> Result<Vec<SymbolInfo>, EngineError> {
        let state = self.state.lock().await;
        Ok(state
            .marks
            .keys()
            .map(|symbol| SymbolInfo { symbol: symbol.clone(), filters: SymbolFilters::default() })
            .collect())
    }

    async fn mark_price(&self, symbol: &str) -> Result<Decimal, EngineError> {
        self.state.lock().await.marks.get(symbol).copied().ok_or_else(|| {
            EngineError::new(ErrorKind::SymbolUnknown, format!("no paper mark for {}", symbol))
                .with_symbol(symbol)
        })
    }

    async fn order_book(&self, symbol: &str, depth: u32) -> Result<OrderBook, EngineError> {
        let mark = self.mark_price(symbol).await?;
        let tick = mark * dec!(0.0005);
        let mut book = OrderBook::default();
        for i in 1..=depth.min(10) {
            let i = Decimal::from(i);
            // Plenty of size so paper fills never look slippage-constrained.
            book.bids.push((mark - tick * i, dec!(500)));
            book.asks.push((mark + tick * i, dec!(500)));
        }
        Ok(book)
    }

    async fn klines(&self, symbol: &str, _interval: &str, limit: u32) -> Result<Vec<Kline>, EngineError> {
        let mark = self.mark_price(symbol).await?;
        let now = chrono::Utc::now().timestamp_millis();
        Ok((0..limit as i64)
            .map(|i| Kline {
                open_time: now - (limit as i64 - i) * 60_000,
                open: mark,
                high: mark,
                low: mark,
                close: mark,
                volume: dec!(1),
                close_time: now - (limit as i64 - i - 1) * 60_000 - 1,
            })
            .collect())
    }

    async fn positions(&self) -> Result<Vec<Position>, EngineError> {
        let state = self.state.lock().await;
        Ok(state.positions.values().filter(|p| !p.is_flat()).cloned().collect())
    }

    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderInfo>, EngineError> {
        let state = self.state.lock().await;
        Ok(state
            .open_orders
            .iter()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderInfo, EngineError> {
        let mut state = self.state.lock().await;
        state.place_count += 1;

        let mark = state.marks.get(&req.symbol).copied().ok_or_else(|| {
            EngineError::new(ErrorKind::SymbolUnknown, format!("no paper mark for {}", req.symbol))
                .with_symbol(req.symbol.clone())
        })?;
        let qty = Decimal::from_str(&req.qty)
            .map_err(|_| EngineError::new(ErrorKind::Precision, format!("bad quantity {}", req.qty)))?;
        let price = req
            .price
            .as_deref()
            .and_then(|p| Decimal::from_str(p).ok())
            .unwrap_or(mark);
        let stop_price = req
            .stop_price
            .as_deref()
            .and_then(|p| Decimal::from_str(p).ok())
            .unwrap_or(Decimal::ZERO);

        let order_id = state.next_order_id;
        state.next_order_id += 1;

        let filled = req.order_type == OrderType::Market;
        if filled {
            Self::apply_fill(&mut state, req, qty, mark);
        }

        let info = OrderInfo {
            order_id,
            client_order_id: req.client_order_id.clone().unwrap_or_default(),
            symbol: req.symbol.clone(),
            side: req.side,
            position_side: req.position_side,
            order_type: req.order_type,
            qty,
            price,
            stop_price,
            reduce_only: req.reduce_only,
            status: if filled { "FILLED".to_string() } else { "NEW".to_string() },
            time: chrono::Utc::now().timestamp_millis(),
        };
        if !filled {
            state.open_orders.push(info.clone());
        }
        Ok(info)
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        state.cancel_count += 1;
        let before = state.open_orders.len();
        state
            .open_orders
            .retain(|o| !(o.symbol == symbol && o.order_id == order_id));
        if state.open_orders.len() == before {
            return Err(EngineError::new(
                ErrorKind::Protocol,
                format!("unknown order {} for {}", order_id, symbol),
            )
            .with_symbol(symbol));
        }
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), EngineError> {
        self.state.lock().await.leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn position_mode(&self) -> Result<PositionMode, EngineError> {
        Ok(self.state.lock().await.position_mode)
    }

    async fn set_position_mode(&self, mode: PositionMode) -> Result<(), EngineError> {
        self.state.lock().await.position_mode = mode;
        Ok(())
    }

    async fn income(&self, _since_ms: i64) -> Result<Vec<IncomeRecord>, EngineError> {
        Ok(Vec::new())
    }

    async fn server_time(&self) -> Result<i64, EngineError> {
        Ok(chrono::Utc::now().timestamp_millis())
    }

    async fn create_listen_key(&self) -> Result<String, EngineError> {
        Ok("paper-listen-key".to_string())
    }

    async fn keepalive_listen_key(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn close_listen_key(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market_buy(symbol: &str, qty: &str) -> OrderRequest {
        OrderRequest {
            symbol: symbol.to_string(),
            side: Side::Buy,
            position_side: PositionSide::Both,
            order_type: OrderType::Market,
            qty: qty.to_string(),
            price: None,
            stop_price: None,
            reduce_only: false,
            time_in_force: None,
            client_order_id: None,
        }
    }

    #[test]
    fn signature_matches_reference_vector() {
        // Reference vector from the venue API documentation.
        let venue = LiveVenue::new(
            "https://example.invalid".to_string(),
            "key".to_string(),
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j".to_string(),
        );
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            venue.sign(query),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn query_preserves_parameter_order() {
        let venue = LiveVenue::new("https://x".into(), String::new(), "s".into());
        let params = vec![
            ("symbol".to_string(), "BTCUSDT".to_string()),
            ("side".to_string(), "BUY".to_string()),
        ];
        assert_eq!(venue.build_query(&params, false), "symbol=BTCUSDT&side=BUY");
        let signed = venue.build_query(&params, true);
        assert!(signed.starts_with("symbol=BTCUSDT&side=BUY&timestamp="));
        assert!(signed.contains("&recvWindow=5000&signature="));
    }

    #[test]
    fn parses_order_wire_shape() {
        let v: serde_json::Value = serde_json::from_str(
            r#"{
                "orderId": 283194212,
                "clientOrderId": "x-abc",
                "symbol": "BTCUSDT",
                "side": "SELL",
                "positionSide": "BOTH",
                "type": "STOP_MARKET",
                "origQty": "0.010",
                "price": "0",
                "stopPrice": "49000.0",
                "reduceOnly": true,
                "status": "NEW",
                "time": 1700000000000
            }"#,
        )
        .unwrap();
        let order = order_from_value(&v);
        assert_eq!(order.order_id, 283194212);
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.order_type, OrderType::StopMarket);
        assert_eq!(order.qty, dec!(0.010));
        assert_eq!(order.stop_price, dec!(49000.0));
        assert!(order.reduce_only);
    }

    #[tokio::test]
    async fn paper_market_order_opens_and_extends_position() {
        let venue = PaperVenue::new();
        venue.set_mark("BTCUSDT", dec!(50000)).await;
        venue.set_leverage("BTCUSDT", 10).await.unwrap();

        venue.place_order(&market_buy("BTCUSDT", "0.010")).await.unwrap();
        let positions = venue.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].amount, dec!(0.010));
        assert_eq!(positions[0].entry_price, dec!(50000));

        venue.set_mark("BTCUSDT", dec!(51000)).await;
        venue.place_order(&market_buy("BTCUSDT", "0.010")).await.unwrap();
        let positions = venue.positions().await.unwrap();
        assert_eq!(positions[0].amount, dec!(0.020));
        assert_eq!(positions[0].entry_price, dec!(50500));
    }

    #[tokio::test]
    async fn paper_reduce_to_flat_removes_position() {
        let venue = PaperVenue::new();
        venue.set_mark("BTCUSDT", dec!(50000)).await;
        venue.place_order(&market_buy("BTCUSDT", "0.010")).await.unwrap();

        let mut close = market_buy("BTCUSDT", "0.010");
        close.side = Side::Sell;
        close.reduce_only = true;
        venue.place_order(&close).await.unwrap();

        assert!(venue.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn paper_hedge_mode_keeps_legs_separate() {
        let venue = PaperVenue::new();
        venue.set_position_mode(PositionMode::Hedge).await.unwrap();
        venue.set_mark("ETHUSDT", dec!(3000)).await;

        let mut long_leg = market_buy("ETHUSDT", "1");
        long_leg.position_side = PositionSide::Long;
        venue.place_order(&long_leg).await.unwrap();

        let mut short_leg = market_buy("ETHUSDT", "2");
        short_leg.side = Side::Sell;
        short_leg.position_side = PositionSide::Short;
        venue.place_order(&short_leg).await.unwrap();

        let mut positions = venue.positions().await.unwrap();
        positions.sort_by_key(|p| p.position_side.as_str());
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].position_side, PositionSide::Long);
        assert_eq!(positions[0].amount, dec!(1));
        assert_eq!(positions[1].position_side, PositionSide::Short);
        assert_eq!(positions[1].amount, dec!(-2));
    }

    #[tokio::test]
    async fn paper_limit_orders_rest_until_cancelled() {
        let venue = PaperVenue::new();
        venue.set_mark("BTCUSDT", dec!(50000)).await;
        let mut req = market_buy("BTCUSDT", "0.010");
        req.order_type = OrderType::Limit;
        req.price = Some("49000".to_string());
        req.time_in_force = Some("GTC");

        let placed = venue.place_order(&req).await.unwrap();
        assert_eq!(placed.status, "NEW");
        assert_eq!(venue.open_orders(Some("BTCUSDT")).await.unwrap().len(), 1);
        assert!(venue.positions().await.unwrap().is_empty());

        venue.cancel_order("BTCUSDT", placed.order_id).await.unwrap();
        assert!(venue.open_orders(None).await.unwrap().is_empty());
        let (placed_n, cancelled_n) = venue.call_counts().await;
        assert_eq!((placed_n, cancelled_n), (1, 1));
    }

    #[tokio::test]
    async fn rate_limiter_allows_burst_within_capacity() {
        let limiter = RateLimiter::new(1200);
        let start = Instant::now();
        for _ in 0..20 {
            limiter.acquire(5).await;
        }
        assert!(start.elapsed().as_millis() < 100);
    }

    #[test]
    fn position_margin_and_direction() {
        let position = Position {
            symbol: "BTCUSDT".to_string(),
            position_side: PositionSide::Both,
            amount: dec!(-0.020),
            entry_price: dec!(50000),
            mark_price: dec!(49500),
            leverage: 10,
            unrealized_pnl: dec!(10),
            liquidation_price: dec!(55000),
        };
        assert_eq!(position.direction(), PositionSide::Short);
        assert_eq!(position.margin(), dec!(100));
    }
}
