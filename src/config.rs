// ─────────────────────────────────────────────────────────────────────────────
// config.rs — Engine configuration: JSON model, validation, hot reload
//
// One JSON document holds credentials, global trading switches, and the
// per-symbol tuning. A watcher task polls the file and publishes a fresh
// Arc<Config> on a tokio watch channel; subsystems pick up the latest
// snapshot on their next iteration, no restart needed.
// ─────────────────────────────────────────────────────────────────────────────
use crate::errors::EngineError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

// ─── Model ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub secret_key: String,
}

impl ApiConfig {
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret_key.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PositionMode {
    OneWay,
    Hedge,
}

impl std::fmt::Display for PositionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionMode::OneWay => write!(f, "one-way"),
            PositionMode::Hedge => write!(f, "hedge"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderMode {
    Limit,
    Market,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    #[serde(default = "default_true")]
    pub paper_mode: bool,
    #[serde(default = "default_risk_percent")]
    pub risk_percent: Decimal,
    #[serde(default = "default_position_mode")]
    pub position_mode: PositionMode,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    #[serde(default = "default_true")]
    pub use_threshold_system: bool,
    /// REST base, venue-compatible `/fapi` surface.
    #[serde(default = "default_rest_base")]
    pub rest_base: String,
    /// WebSocket base for the public streams and the user-data stream.
    #[serde(default = "default_ws_base")]
    pub ws_base: String,
    /// Bind address of the read-only HTTP façade.
    #[serde(default = "default_api_listen")]
    pub api_listen: String,
    /// Where the JSONL error store writes.
    #[serde(default = "default_error_log_path")]
    pub error_log_path: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            paper_mode: true,
            risk_percent: default_risk_percent(),
            position_mode: default_position_mode(),
            max_open_positions: default_max_open_positions(),
            use_threshold_system: true,
            rest_base: default_rest_base(),
            ws_base: default_ws_base(),
            api_listen: default_api_listen(),
            error_log_path: default_error_log_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolConfig {
    /// Cumulative SELL-liquidation volume (USDT) that arms a long entry.
    pub long_volume_threshold: Decimal,
    /// Cumulative BUY-liquidation volume (USDT) that arms a short entry.
    pub short_volume_threshold: Decimal,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    /// Margin committed per long entry, USDT.
    #[serde(default = "default_trade_size")]
    pub long_trade_size: Decimal,
    /// Margin committed per short entry, USDT.
    #[serde(default = "default_trade_size")]
    pub short_trade_size: Decimal,
    /// Cap on aggregate margin tied up in this symbol, USDT.
    #[serde(default = "default_max_symbol_margin")]
    pub max_symbol_margin: Decimal,
    #[serde(default = "default_sl_percent")]
    pub stop_loss_percent: Decimal,
    #[serde(default = "default_tp_percent")]
    pub take_profit_percent: Decimal,
    #[serde(default = "default_order_mode")]
    pub order_mode: OrderMode,
    /// Offset past the touch for limit pricing, basis points.
    #[serde(default = "default_price_offset_bps")]
    pub price_offset_bps: Decimal,
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: Decimal,
    #[serde(default)]
    pub post_only: bool,
    #[serde(default)]
    pub vwap_protection: bool,
    #[serde(default = "default_vwap_timeframe")]
    pub vwap_timeframe: String,
    #[serde(default = "default_vwap_lookback")]
    pub vwap_lookback: usize,
    /// Opt into the cumulative threshold system; off means instant mode.
    #[serde(default = "default_true")]
    pub use_threshold: bool,
    #[serde(default = "default_threshold_window_ms")]
    pub threshold_window_ms: i64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: i64,
}

impl Default for SymbolConfig {
    fn default() -> Self {
        Self {
            long_volume_threshold: dec!(100000),
            short_volume_threshold: dec!(100000),
            leverage: default_leverage(),
            long_trade_size: default_trade_size(),
            short_trade_size: default_trade_size(),
            max_symbol_margin: default_max_symbol_margin(),
            stop_loss_percent: default_sl_percent(),
            take_profit_percent: default_tp_percent(),
            order_mode: default_order_mode(),
            price_offset_bps: default_price_offset_bps(),
            max_slippage_bps: default_max_slippage_bps(),
            post_only: false,
            vwap_protection: false,
            vwap_timeframe: default_vwap_timeframe(),
            vwap_lookback: default_vwap_lookback(),
            use_threshold: true,
            threshold_window_ms: default_threshold_window_ms(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub symbols: HashMap<String, SymbolConfig>,
}

fn default_true() -> bool { true }
fn default_risk_percent() -> Decimal { dec!(2) }
fn default_position_mode() -> PositionMode { PositionMode::OneWay }
fn default_max_open_positions() -> usize { 5 }
fn default_rest_base() -> String { "https://fapi.asterdex.com".to_string() }
fn default_ws_base() -> String { "wss://fstream.asterdex.com".to_string() }
fn default_api_listen() -> String { "127.0.0.1:8089".to_string() }
fn default_error_log_path() -> String { "data/errors.jsonl".to_string() }
fn default_leverage() -> u32 { 10 }
fn default_trade_size() -> Decimal { dec!(10) }
fn default_max_symbol_margin() -> Decimal { dec!(250) }
fn default_sl_percent() -> Decimal { dec!(2) }
fn default_tp_percent() -> Decimal { dec!(5) }
fn default_order_mode() -> OrderMode { OrderMode::Limit }
fn default_price_offset_bps() -> Decimal { dec!(2) }
fn default_max_slippage_bps() -> Decimal { dec!(25) }
fn default_vwap_timeframe() -> String { "1m".to_string() }
fn default_vwap_lookback() -> usize { 100 }
fn default_threshold_window_ms() -> i64 { 60_000 }
fn default_cooldown_ms() -> i64 { 30_000 }

// ─── Load & Validate ─────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config: Config = serde_json::from_str(&raw)
            .map_err(|e| EngineError::config(format!("cannot parse {}: {}", path.display(), e)))?;

        // Env credentials win over the file so keys can stay out of it.
        if let Ok(key) = std::env::var("API_KEY") {
            config.api.api_key = key;
        }
        if let Ok(secret) = std::env::var("API_SECRET") {
            config.api.secret_key = secret;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.global.max_open_positions == 0 {
            return Err(EngineError::config("maxOpenPositions must be at least 1"));
        }
        if !self.global.paper_mode && !self.api.has_credentials() {
            return Err(EngineError::config("live mode requires api.apiKey and api.secretKey"));
        }
        for (symbol, sc) in &self.symbols {
            let ctx = |msg: String| EngineError::config(msg).with_symbol(symbol.clone());
            if symbol.trim().is_empty() {
                return Err(EngineError::config("symbol name must not be empty"));
            }
            if !(1..=125).contains(&sc.leverage) {
                return Err(ctx(format!("leverage {} outside 1..=125", sc.leverage)));
            }
            if sc.long_volume_threshold <= Decimal::ZERO || sc.short_volume_threshold <= Decimal::ZERO {
                return Err(ctx("volume thresholds must be positive".to_string()));
            }
            if sc.long_trade_size <= Decimal::ZERO || sc.short_trade_size <= Decimal::ZERO {
                return Err(ctx("trade sizes must be positive".to_string()));
            }
            if sc.stop_loss_percent <= Decimal::ZERO || sc.stop_loss_percent >= dec!(100) {
                return Err(ctx(format!("stopLossPercent {} outside (0, 100)", sc.stop_loss_percent)));
            }
            if sc.take_profit_percent <= Decimal::ZERO {
                return Err(ctx("takeProfitPercent must be positive".to_string()));
            }
            if sc.threshold_window_ms <= 0 || sc.cooldown_ms < 0 {
                return Err(ctx("threshold window/cooldown must be positive".to_string()));
            }
            if sc.vwap_lookback == 0 {
                return Err(ctx("vwapLookback must be at least 1".to_string()));
            }
        }
        Ok(())
    }

    pub fn symbol(&self, symbol: &str) -> Option<&SymbolConfig> {
        self.symbols.get(symbol)
    }

    /// Symbols that want a VWAP stream.
    pub fn vwap_symbols(&self) -> Vec<String> {
        let mut v: Vec<String> = self
            .symbols
            .iter()
            .filter(|(_, sc)| sc.vwap_protection)
            .map(|(s, _)| s.clone())
            .collect();
        v.sort();
        v
    }
}

// ─── Hot Reload ──────────────────────────────────────────────────────────────

/// Human-readable description of what changed between two configs, used for
/// the reload log line. Empty means nothing observable changed.
pub fn diff_configs(old: &Config, new: &Config) -> Vec<String> {
    let mut changes = Vec::new();
    if old.global.paper_mode != new.global.paper_mode {
        changes.push(format!("paperMode {} -> {}", old.global.paper_mode, new.global.paper_mode));
    }
    if old.global.position_mode != new.global.position_mode {
        changes.push(format!("positionMode {} -> {}", old.global.position_mode, new.global.position_mode));
    }
    if old.global.max_open_positions != new.global.max_open_positions {
        changes.push(format!(
            "maxOpenPositions {} -> {}",
            old.global.max_open_positions, new.global.max_open_positions
        ));
    }
    if old.global.use_threshold_system != new.global.use_threshold_system {
        changes.push(format!(
            "useThresholdSystem {} -> {}",
            old.global.use_threshold_system, new.global.use_threshold_system
        ));
    }
    for symbol in new.symbols.keys() {
        if !old.symbols.contains_key(symbol) {
            changes.push(format!("+{}", symbol));
        }
    }
    for (symbol, sc) in &old.symbols {
        match new.symbols.get(symbol) {
            None => changes.push(format!("-{}", symbol)),
            Some(new_sc) if new_sc != sc => changes.push(format!("~{}", symbol)),
            Some(_) => {}
        }
    }
    changes
}

/// Polls the config file's mtime and publishes validated reloads. A reload
/// that fails to parse or validate keeps the previous config in force.
pub async fn watch_config(
    path: PathBuf,
    tx: watch::Sender<Arc<Config>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_mtime = file_mtime(&path);
    let mut tick = tokio::time::interval(tokio::time::Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() { return; }
            }
        }

        let mtime = file_mtime(&path);
        if mtime == last_mtime {
            continue;
        }
        last_mtime = mtime;

        match Config::load(&path) {
            Ok(new_config) => {
                let old = tx.borrow().clone();
                let changes = diff_configs(&old, &new_config);
                if changes.is_empty() {
                    continue;
                }
                log::info!("[CONFIG] Reloaded {}: {}", path.display(), changes.join(", "));
                let _ = tx.send(Arc::new(new_config));
            }
            Err(e) => {
                log::error!("[CONFIG] Reload rejected, keeping previous config: {}", e);
            }
        }
    }
}

fn file_mtime(path: &Path) -> Option<std::time::SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config_json() -> &'static str {
        r#"{
            "api": {"apiKey": "k", "secretKey": "s"},
            "global": {"paperMode": true, "maxOpenPositions": 5, "positionMode": "one-way"},
            "symbols": {
                "BTCUSDT": {
                    "longVolumeThreshold": "100000",
                    "shortVolumeThreshold": "120000",
                    "leverage": 20,
                    "longTradeSize": "25",
                    "shortTradeSize": "25",
                    "stopLossPercent": "2",
                    "takeProfitPercent": "5",
                    "orderMode": "limit",
                    "vwapProtection": true
                }
            }
        }"#
    }

    #[test]
    fn parses_camel_case_document() {
        let config: Config = serde_json::from_str(sample_config_json()).unwrap();
        assert!(config.global.paper_mode);
        let sc = config.symbol("BTCUSDT").unwrap();
        assert_eq!(sc.leverage, 20);
        assert_eq!(sc.long_volume_threshold, dec!(100000));
        assert_eq!(sc.short_volume_threshold, dec!(120000));
        assert!(sc.vwap_protection);
        // Defaults filled for omitted fields.
        assert_eq!(sc.threshold_window_ms, 60_000);
        assert_eq!(sc.cooldown_ms, 30_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_leverage() {
        let mut config: Config = serde_json::from_str(sample_config_json()).unwrap();
        config.symbols.get_mut("BTCUSDT").unwrap().leverage = 200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_live_without_credentials() {
        let mut config: Config = serde_json::from_str(sample_config_json()).unwrap();
        config.global.paper_mode = false;
        config.api = ApiConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn diff_reports_symbol_changes() {
        let old: Config = serde_json::from_str(sample_config_json()).unwrap();
        let mut new = old.clone();
        new.symbols.insert("ETHUSDT".to_string(), SymbolConfig::default());
        new.symbols.get_mut("BTCUSDT").unwrap().leverage = 25;
        new.global.max_open_positions = 8;

        let changes = diff_configs(&old, &new);
        assert!(changes.iter().any(|c| c == "+ETHUSDT"));
        assert!(changes.iter().any(|c| c == "~BTCUSDT"));
        assert!(changes.iter().any(|c| c.contains("maxOpenPositions")));
    }

    #[test]
    fn diff_is_empty_for_identical_configs() {
        let config: Config = serde_json::from_str(sample_config_json()).unwrap();
        assert!(diff_configs(&config, &config.clone()).is_empty());
    }

    #[test]
    fn vwap_symbols_are_sorted_and_filtered() {
        let mut config: Config = serde_json::from_str(sample_config_json()).unwrap();
        let mut eth = SymbolConfig::default();
        eth.vwap_protection = true;
        config.symbols.insert("ETHUSDT".to_string(), eth);
        config.symbols.insert("XRPUSDT".to_string(), SymbolConfig::default());
        assert_eq!(config.vwap_symbols(), vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
    }
}
