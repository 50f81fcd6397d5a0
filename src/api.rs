// ─────────────────────────────────────────────────────────────────────────────
// api.rs — Read-only HTTP façade
//
// A small hand-routed hyper server for the UI process: live position
// snapshot, recent liquidations, VWAP and filter lookups, income summary,
// and the two error-log maintenance verbs. Everything else about the UI
// (pages, push channel, auth) lives outside this engine.
// ─────────────────────────────────────────────────────────────────────────────
use crate::error_log::{ErrorLogger, ErrorStore};
use crate::errors::{EngineError, ErrorKind};
use crate::exchange::VenueClient;
use crate::ingest::{now_ms, LiquidationArchive};
use crate::registry::PrecisionRegistry;
use crate::vwap::VwapMap;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Clone)]
pub struct ApiState {
    pub venue: Arc<dyn VenueClient>,
    pub registry: Arc<RwLock<PrecisionRegistry>>,
    pub archive: Arc<LiquidationArchive>,
    pub vwap_map: VwapMap,
    pub errors: ErrorLogger,
    pub store: Arc<dyn ErrorStore>,
}

/// Serves until shutdown flips. Bind failure is returned so startup can
/// treat it as fatal.
pub async fn serve(
    state: ApiState,
    listen_addr: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), EngineError> {
    let listener = TcpListener::bind(&listen_addr)
        .await
        .map_err(|e| EngineError::config(format!("cannot bind façade on {}: {}", listen_addr, e)))?;
    log::info!("[API] Listening on http://{}", listen_addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _remote) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::warn!("[API] Accept failed: {}", e);
                        continue;
                    }
                };
                let state = state.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let state = state.clone();
                        async move {
                            let method = req.method().clone();
                            let path = req.uri().path().to_string();
                            let query = req.uri().query().map(|q| q.to_string());
                            let (status, body) = route(&state, &method, &path, query.as_deref()).await;
                            Ok::<_, hyper::Error>(
                                Response::builder()
                                    .status(status)
                                    .header("Content-Type", "application/json")
                                    .body(Full::new(Bytes::from(body)))
                                    .unwrap(),
                            )
                        }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        log::debug!("[API] Connection error: {}", e);
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    log::info!("[API] Shutdown.");
                    return Ok(());
                }
            }
        }
    }
}

fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

fn income_range_ms(range: &str) -> i64 {
    match range {
        "7d" => 7 * 24 * 3_600_000,
        "30d" => 30 * 24 * 3_600_000,
        _ => 24 * 3_600_000,
    }
}

fn json_ok<T: serde::Serialize>(value: &T) -> (StatusCode, String) {
    match serde_json::to_string(value) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{{\"error\": \"{}\"}}", e),
        ),
    }
}

fn json_error(status: StatusCode, message: &str) -> (StatusCode, String) {
    (status, format!("{{\"error\": \"{}\"}}", message))
}

async fn route(
    state: &ApiState,
    method: &Method,
    path: &str,
    query: Option<&str>,
) -> (StatusCode, String) {
    match (method.as_str(), path) {
        ("GET", "/health") => (StatusCode::OK, "{\"status\": \"ok\"}".to_string()),

        ("GET", "/positions") => match state.venue.positions().await {
            Ok(positions) => json_ok(&positions),
            Err(e) => json_error(StatusCode::BAD_GATEWAY, &e.to_string()),
        },

        ("GET", "/liquidations") => {
            let limit = query_param(query, "limit")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(100);
            json_ok(&state.archive.recent(limit))
        }

        ("GET", path) if path.starts_with("/vwap/") => {
            let symbol = path.trim_start_matches("/vwap/").to_uppercase();
            let snapshot = {
                let map = state.vwap_map.read().unwrap_or_else(|p| p.into_inner());
                map.get(&symbol).cloned()
            };
            match snapshot {
                Some(update) => json_ok(&update),
                None => json_error(StatusCode::NOT_FOUND, "no VWAP for symbol"),
            }
        }

        ("GET", path) if path.starts_with("/symbols/") => {
            let symbol = path.trim_start_matches("/symbols/").to_uppercase();
            let filters = {
                let registry = state.registry.read().unwrap_or_else(|p| p.into_inner());
                registry.filters(&symbol)
            };
            match state.venue.mark_price(&symbol).await {
                Ok(mark) => json_ok(&serde_json::json!({
                    "symbol": symbol,
                    "filters": filters,
                    "markPrice": mark,
                })),
                Err(e) if e.kind == ErrorKind::SymbolUnknown => {
                    json_error(StatusCode::NOT_FOUND, "unknown symbol")
                }
                Err(e) => json_error(StatusCode::BAD_GATEWAY, &e.to_string()),
            }
        }

        ("GET", "/income") => {
            let range = query_param(query, "range").unwrap_or("24h");
            let since = now_ms() - income_range_ms(range);
            match state.venue.income(since).await {
                Ok(records) => {
                    let total: rust_decimal::Decimal = records.iter().map(|r| r.income).sum();
                    json_ok(&serde_json::json!({
                        "range": range,
                        "total": total,
                        "records": records,
                    }))
                }
                Err(e) => json_error(StatusCode::BAD_GATEWAY, &e.to_string()),
            }
        }

        // Development helper: drive a synthetic error through the sink.
        ("POST", "/errors/test") => {
            state.errors.report(
                &EngineError::new(ErrorKind::Protocol, "synthetic test error")
                    .with_component("API"),
                "API",
            );
            (StatusCode::ACCEPTED, "{\"status\": \"reported\"}".to_string())
        }

        ("DELETE", "/errors") => {
            state.store.clear();
            (StatusCode::OK, "{\"status\": \"cleared\"}".to_string())
        }

        _ => json_error(StatusCode::NOT_FOUND, "not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_log::spawn_error_sink;
    use crate::exchange::PaperVenue;
    use crate::ingest::LiquidationEvent;
    use crate::vwap::{new_vwap_map, VwapRelation, VwapUpdate};
    use rust_decimal_macros::dec;

    async fn state() -> ApiState {
        let venue = Arc::new(PaperVenue::new());
        venue.set_mark("BTCUSDT", dec!(50000)).await;
        let (_sd_tx, sd_rx) = watch::channel(false);
        std::mem::forget(_sd_tx);
        let store = Arc::new(crate::error_log::JsonlStore::new("/tmp/api-test-errors.jsonl"));
        let (errors, _sink) = spawn_error_sink(store.clone(), "test".to_string(), sd_rx);
        ApiState {
            venue,
            registry: Arc::new(RwLock::new(PrecisionRegistry::new())),
            archive: Arc::new(LiquidationArchive::new(100)),
            vwap_map: new_vwap_map(),
            errors,
            store,
        }
    }

    #[tokio::test]
    async fn positions_endpoint_returns_live_snapshot() {
        let s = state().await;
        let (status, body) = route(&s, &Method::GET, "/positions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[]");
    }

    #[tokio::test]
    async fn liquidations_endpoint_honours_limit() {
        let s = state().await;
        for i in 0..5 {
            s.archive.push(LiquidationEvent {
                symbol: "BTCUSDT".to_string(),
                side: crate::exchange::Side::Sell,
                status: "FILLED".to_string(),
                qty: dec!(1),
                filled_qty: dec!(1),
                price: dec!(10),
                event_time: i,
            });
        }
        let (status, body) = route(&s, &Method::GET, "/liquidations", Some("limit=2")).await;
        assert_eq!(status, StatusCode::OK);
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[tokio::test]
    async fn vwap_endpoint_round_trips_the_snapshot() {
        let s = state().await;
        s.vwap_map.write().unwrap().insert(
            "ETHUSDT".to_string(),
            VwapUpdate {
                symbol: "ETHUSDT".to_string(),
                vwap: dec!(3000),
                price: dec!(3010),
                position: VwapRelation::Above,
                at_ms: 1,
            },
        );
        let (status, body) = route(&s, &Method::GET, "/vwap/ethusdt", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"above\""));

        let (missing, _) = route(&s, &Method::GET, "/vwap/XRPUSDT", None).await;
        assert_eq!(missing, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn symbols_endpoint_reports_filters_and_mark() {
        let s = state().await;
        let (status, body) = route(&s, &Method::GET, "/symbols/BTCUSDT", None).await;
        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["symbol"], "BTCUSDT");
        assert!(parsed["filters"]["tick_size"].is_string() || parsed["filters"]["tick_size"].is_number());

        let (missing, _) = route(&s, &Method::GET, "/symbols/NOPEUSDT", None).await;
        assert_eq!(missing, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn income_endpoint_defaults_to_24h() {
        let s = state().await;
        let (status, body) = route(&s, &Method::GET, "/income", None).await;
        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["range"], "24h");
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let s = state().await;
        let (status, _) = route(&s, &Method::GET, "/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = route(&s, &Method::POST, "/positions", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn range_parsing() {
        assert_eq!(income_range_ms("24h"), 86_400_000);
        assert_eq!(income_range_ms("7d"), 604_800_000);
        assert_eq!(income_range_ms("30d"), 2_592_000_000);
        assert_eq!(income_range_ms("bogus"), 86_400_000);
    }

    #[test]
    fn query_param_extraction() {
        assert_eq!(query_param(Some("limit=5&range=7d"), "range"), Some("7d"));
        assert_eq!(query_param(Some("limit=5"), "range"), None);
        assert_eq!(query_param(None, "range"), None);
    }
}
