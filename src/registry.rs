// ─────────────────────────────────────────────────────────────────────────────
// registry.rs — Symbol precision registry
//
// Memoizes tick size, step size, min-notional and display precisions per
// symbol from exchange metadata, and offers the pure snap-to-grid helpers
// every egress price and quantity goes through. Unknown symbols get
// conservative defaults so a newly listed contract never stalls the engine.
// ─────────────────────────────────────────────────────────────────────────────
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_notional: Decimal,
    pub price_precision: u32,
    pub quantity_precision: u32,
}

impl Default for SymbolFilters {
    fn default() -> Self {
        Self {
            tick_size: dec!(0.0001),
            step_size: dec!(0.001),
            min_notional: dec!(5),
            price_precision: 4,
            quantity_precision: 3,
        }
    }
}

#[derive(Debug, Default)]
pub struct PrecisionRegistry {
    filters: HashMap<String, SymbolFilters>,
}

impl PrecisionRegistry {
    pub fn new() -> Self {
        Self { filters: HashMap::new() }
    }

    pub fn insert(&mut self, symbol: impl Into<String>, filters: SymbolFilters) {
        self.filters.insert(symbol.into(), filters);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Filters for a symbol, falling back to conservative defaults so the
    /// engine keeps working for contracts listed after the last refresh.
    pub fn filters(&self, symbol: &str) -> SymbolFilters {
        self.filters.get(symbol).cloned().unwrap_or_default()
    }

    /// Floors a price onto the symbol's tick grid.
    pub fn snap_price(&self, symbol: &str, price: Decimal) -> Decimal {
        let f = self.filters(symbol);
        snap_down(price, f.tick_size)
    }

    /// Floors a quantity onto the symbol's step grid.
    pub fn snap_qty(&self, symbol: &str, qty: Decimal) -> Decimal {
        let f = self.filters(symbol);
        snap_down(qty, f.step_size)
    }

    pub fn meets_min_notional(&self, symbol: &str, price: Decimal, qty: Decimal) -> bool {
        price * qty >= self.filters(symbol).min_notional
    }

    pub fn min_notional(&self, symbol: &str) -> Decimal {
        self.filters(symbol).min_notional
    }

    pub fn step_size(&self, symbol: &str) -> Decimal {
        self.filters(symbol).step_size
    }

    /// Renders a snapped price at the venue's display precision.
    pub fn fmt_price(&self, symbol: &str, price: Decimal) -> String {
        render(price, self.filters(symbol).price_precision)
    }

    pub fn fmt_qty(&self, symbol: &str, qty: Decimal) -> String {
        render(qty, self.filters(symbol).quantity_precision)
    }
}

/// Floor onto a positive grid; a zero/negative grid passes the value through.
pub fn snap_down(value: Decimal, grid: Decimal) -> Decimal {
    if grid <= Decimal::ZERO {
        return value;
    }
    (value / grid).floor() * grid
}

fn render(value: Decimal, precision: u32) -> String {
    value
        .round_dp_with_strategy(precision, rust_decimal::RoundingStrategy::ToZero)
        .normalize()
        .to_string()
}
