// ─────────────────────────────────────────────────────────────────────────────
// hunter-engine-rs: liquidation-cascade hunting engine
//
// Ingests the venue's force-liquidation stream, detects exploitable cascades
// per symbol, enters contrarian positions, and keeps exactly one reduce-only
// stop-loss and one take-profit against every open position until it closes.
// Paper mode runs the whole pipeline against an in-memory venue.
// ─────────────────────────────────────────────────────────────────────────────
mod api;
mod broadcaster;
mod config;
mod error_log;
mod errors;
mod exchange;
mod hunter;
mod ingest;
mod manager;
mod registry;
mod threshold;
mod vwap;

use crate::broadcaster::Broadcaster;
use crate::config::Config;
use crate::error_log::JsonlStore;
use crate::exchange::{LiveVenue, PaperVenue, VenueClient};
use crate::hunter::Hunter;
use crate::ingest::LiquidationArchive;
use crate::manager::{AccountSnapshot, PositionManager};
use crate::registry::PrecisionRegistry;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, watch};

const SHUTDOWN_DRAIN_SECS: u64 = 5;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CONFIG_PATH").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config_path = PathBuf::from(config_path);

    log::info!("🏹 hunter-engine-rs starting (config {}).", config_path.display());

    // ─── Config ──────────────────────────────────────────────────────────────
    let initial_config = match Config::load(&config_path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            log::error!("Fatal: {}", e);
            std::process::exit(1);
        }
    };
    let paper_mode = initial_config.global.paper_mode;
    let session_id = uuid::Uuid::new_v4().to_string();
    log::info!(
        "  Mode:     {}",
        if paper_mode { "PAPER (no real orders)" } else { "⚠️  LIVE" }
    );
    log::info!("  Symbols:  {}", initial_config.symbols.len());
    log::info!("  Session:  {}", session_id);

    // ─── Shutdown plumbing ───────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let shutdown_tx = shutdown_tx.clone();
        let interrupted = Arc::new(AtomicBool::new(false));
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                if interrupted.swap(true, Ordering::SeqCst) {
                    log::error!("Second interrupt, exiting immediately.");
                    std::process::exit(130);
                }
                log::info!("Interrupt received, shutting down gracefully (Ctrl-C again to force).");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    // ─── Error sink ──────────────────────────────────────────────────────────
    let store: Arc<dyn error_log::ErrorStore> =
        Arc::new(JsonlStore::new(&initial_config.global.error_log_path));
    let (errors, sink_handle) =
        error_log::spawn_error_sink(store.clone(), session_id.clone(), shutdown_rx.clone());

    // ─── Venue client ────────────────────────────────────────────────────────
    let simulated_feed = paper_mode && !initial_config.api.has_credentials();
    let paper_venue: Option<Arc<PaperVenue>> = if paper_mode {
        let venue = Arc::new(PaperVenue::new());
        for symbol in initial_config.symbols.keys() {
            venue.set_mark(symbol, default_paper_mark(symbol)).await;
        }
        let _ = venue.set_position_mode(initial_config.global.position_mode).await;
        Some(venue)
    } else {
        None
    };
    let venue: Arc<dyn VenueClient> = match &paper_venue {
        Some(paper) => paper.clone(),
        None => {
            let live = LiveVenue::new(
                initial_config.global.rest_base.clone(),
                initial_config.api.api_key.clone(),
                initial_config.api.secret_key.clone(),
            );
            if let Err(e) = live.sync_time().await {
                log::error!("Fatal: cannot reach venue: {}", e);
                std::process::exit(1);
            }
            Arc::new(live)
        }
    };

    // ─── Precision registry ──────────────────────────────────────────────────
    let registry = Arc::new(RwLock::new(PrecisionRegistry::new()));
    match venue.exchange_info().await {
        Ok(symbols) => {
            let mut reg = registry.write().unwrap_or_else(|p| p.into_inner());
            for info in symbols {
                reg.insert(info.symbol, info.filters);
            }
            log::info!("  Filters:  {} symbols memoized.", reg.len());
        }
        Err(e) if paper_mode => {
            log::warn!("exchangeInfo unavailable in paper mode ({}), using defaults.", e);
        }
        Err(e) => {
            log::error!("Fatal: cannot load exchange info: {}", e);
            std::process::exit(1);
        }
    }

    // ─── Position mode: venue is the source of truth at startup ─────────────
    let position_mode = Arc::new(RwLock::new(initial_config.global.position_mode));
    match venue.position_mode().await {
        Ok(venue_mode) => {
            let wanted = initial_config.global.position_mode;
            if venue_mode != wanted {
                match venue.set_position_mode(wanted).await {
                    Ok(()) => log::info!("  PosMode:  switched venue to {}.", wanted),
                    Err(e) => {
                        log::warn!(
                            "  PosMode:  cannot switch venue to {} ({}), adopting {}.",
                            wanted,
                            e,
                            venue_mode
                        );
                        *position_mode.write().unwrap_or_else(|p| p.into_inner()) = venue_mode;
                    }
                }
            } else {
                log::info!("  PosMode:  {} (venue agrees).", venue_mode);
            }
        }
        Err(e) => {
            errors.report(&e.with_component("MAIN"), "MAIN");
        }
    }

    // ─── Shared state & channels ─────────────────────────────────────────────
    let bus = Broadcaster::new();
    let archive = Arc::new(LiquidationArchive::new(1_000));
    let vwap_map = vwap::new_vwap_map();
    let (config_tx, config_rx) = watch::channel(initial_config.clone());
    let (account_tx, account_rx) = watch::channel(AccountSnapshot::default());
    let (liq_tx, liq_rx) = mpsc::channel::<ingest::LiquidationEvent>(256);
    let (user_tx, user_rx) = mpsc::channel::<manager::UserDataEvent>(64);

    let mut tasks = Vec::new();

    // ─── Config hot-reload watcher ───────────────────────────────────────────
    tasks.push(tokio::spawn(config::watch_config(
        config_path.clone(),
        config_tx,
        shutdown_rx.clone(),
    )));

    // ─── Liquidation ingest ──────────────────────────────────────────────────
    if simulated_feed {
        tasks.push(tokio::spawn(ingest::run_simulated_liquidations(
            venue.clone(),
            config_rx.clone(),
            liq_tx,
            shutdown_rx.clone(),
        )));
    } else {
        tasks.push(tokio::spawn(ingest::run_liquidation_stream(
            initial_config.global.ws_base.clone(),
            liq_tx,
            bus.clone(),
            errors.clone(),
            shutdown_rx.clone(),
        )));
    }

    // Paper mode with a hot-reloaded symbol set: keep synthetic marks seeded.
    if let Some(paper) = &paper_venue {
        let paper = paper.clone();
        let config_rx = config_rx.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(10));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let config = config_rx.borrow().clone();
                        for symbol in config.symbols.keys() {
                            if paper.mark_price(symbol).await.is_err() {
                                paper.set_mark(symbol, default_paper_mark(symbol)).await;
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { return; }
                    }
                }
            }
        }));
    }

    // ─── VWAP streamer ───────────────────────────────────────────────────────
    if !simulated_feed {
        tasks.push(tokio::spawn(vwap::run_vwap_streamer(
            initial_config.global.ws_base.clone(),
            config_rx.clone(),
            vwap_map.clone(),
            bus.clone(),
            errors.clone(),
            shutdown_rx.clone(),
        )));
    }

    // ─── User-data stream (live only; paper has no push side) ────────────────
    if !paper_mode {
        tasks.push(tokio::spawn(manager::run_user_stream(
            venue.clone(),
            initial_config.global.ws_base.clone(),
            user_tx,
            errors.clone(),
            shutdown_rx.clone(),
        )));
    } else {
        drop(user_tx);
    }

    // ─── Position manager ────────────────────────────────────────────────────
    let manager = PositionManager::new(
        venue.clone(),
        registry.clone(),
        config_rx.clone(),
        position_mode.clone(),
        bus.clone(),
        errors.clone(),
        account_tx,
    );
    tasks.push(tokio::spawn(manager.run(user_rx, shutdown_rx.clone())));

    // ─── Hunter ──────────────────────────────────────────────────────────────
    let hunter = Hunter::new(
        venue.clone(),
        registry.clone(),
        config_rx.clone(),
        account_rx,
        vwap_map.clone(),
        position_mode.clone(),
        bus.clone(),
        errors.clone(),
        archive.clone(),
    );
    tasks.push(tokio::spawn(hunter.run(liq_rx, shutdown_rx.clone())));

    // ─── HTTP façade ─────────────────────────────────────────────────────────
    let api_state = api::ApiState {
        venue: venue.clone(),
        registry: registry.clone(),
        archive: archive.clone(),
        vwap_map: vwap_map.clone(),
        errors: errors.clone(),
        store: store.clone(),
    };
    let api_listen = initial_config.global.api_listen.clone();
    {
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = api::serve(api_state, api_listen, shutdown).await {
                log::error!("[API] {}", e);
            }
        }));
    }

    log::info!("✅ All subsystems running.");

    // ─── Wait for shutdown, then drain ───────────────────────────────────────
    let mut shutdown_watch = shutdown_rx.clone();
    while !*shutdown_watch.borrow() {
        if shutdown_watch.changed().await.is_err() {
            break;
        }
    }

    log::info!("Draining in-flight work ({}s max)...", SHUTDOWN_DRAIN_SECS);
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
        let _ = sink_handle.await;
    };
    if tokio::time::timeout(std::time::Duration::from_secs(SHUTDOWN_DRAIN_SECS), drain)
        .await
        .is_err()
    {
        log::warn!("Drain window exceeded, exiting anyway.");
    }
    log::info!("Bye.");
    std::process::exit(0);
}

/// Plausible synthetic marks so paper mode works out of the box.
fn default_paper_mark(symbol: &str) -> Decimal {
    let upper = symbol.to_uppercase();
    if upper.starts_with("BTC") {
        dec!(50000)
    } else if upper.starts_with("ETH") {
        dec!(3000)
    } else if upper.starts_with("BNB") {
        dec!(600)
    } else if upper.starts_with("SOL") {
        dec!(150)
    } else if upper.starts_with("XRP") {
        dec!(0.55)
    } else if upper.starts_with("DOGE") {
        dec!(0.12)
    } else {
        dec!(1)
    }
}
