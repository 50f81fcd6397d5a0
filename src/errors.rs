// ─────────────────────────────────────────────────────────────────────────────
// errors.rs — Engine error taxonomy and venue error-code classifier
//
// Every fallible path in the engine returns EngineError. The kind decides the
// propagation policy: what the REST client retries, what the hunter recovers
// with a market fallback, and what is only reported.
// ─────────────────────────────────────────────────────────────────────────────
use serde::{Deserialize, Serialize};

// ─── Error Kinds ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Order below the minimum notional even after adjustment.
    Notional,
    /// Price or quantity off the tick/step grid.
    Precision,
    /// Margin insufficient for the requested order.
    InsufficientBalance,
    /// Symbol not listed on the venue.
    SymbolUnknown,
    /// Venue throttled us; may carry a retry hint.
    RateLimited,
    /// Hedge/one-way flag disagrees with the venue account setting.
    PositionModeMismatch,
    /// Reduce-only order placed without a matching position.
    ReduceOnlyReject,
    /// Limit price too aggressive, would trade immediately.
    OrderWouldTrigger,
    /// Signature, API key, or timestamp skew rejected.
    InvalidCredentials,
    /// Connect, read, write, or timeout failure.
    Network,
    /// Malformed stream frame or response body.
    Parse,
    /// Venue returned a code we do not know.
    Protocol,
    /// Invalid configuration at load or hot-reload.
    Configuration,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Notional => "NOTIONAL",
            ErrorKind::Precision => "PRECISION",
            ErrorKind::InsufficientBalance => "INSUFFICIENT_BALANCE",
            ErrorKind::SymbolUnknown => "SYMBOL_UNKNOWN",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::PositionModeMismatch => "POSITION_MODE_MISMATCH",
            ErrorKind::ReduceOnlyReject => "REDUCE_ONLY_REJECT",
            ErrorKind::OrderWouldTrigger => "ORDER_WOULD_TRIGGER",
            ErrorKind::InvalidCredentials => "INVALID_CREDENTIALS",
            ErrorKind::Network => "NETWORK",
            ErrorKind::Parse => "PARSE",
            ErrorKind::Protocol => "PROTOCOL",
            ErrorKind::Configuration => "CONFIGURATION",
        }
    }
}

// ─── Severity ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

// ─── Engine Error ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineError {
    pub kind: ErrorKind,
    /// Raw venue error code, when the error came out of a REST response.
    pub code: Option<i64>,
    pub message: String,
    pub symbol: Option<String>,
    pub component: Option<&'static str>,
    /// Retry hint in milliseconds, currently only set for RateLimited.
    pub retry_after_ms: Option<u64>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
            symbol: None,
            component: None,
            retry_after_ms: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// Builds a typed error from a venue `{code, msg}` rejection body.
    pub fn from_venue(code: i64, msg: &str) -> Self {
        Self {
            kind: classify_venue_code(code, msg),
            code: Some(code),
            message: msg.to_string(),
            symbol: None,
            component: None,
            retry_after_ms: None,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_component(mut self, component: &'static str) -> Self {
        self.component = Some(component);
        self
    }

    pub fn with_retry_after(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    /// Severity used by the error sink. Structural failures are critical,
    /// trading rejects high, retry-class issues medium, parse noise low.
    pub fn severity(&self) -> Severity {
        match self.kind {
            ErrorKind::InvalidCredentials | ErrorKind::Configuration => Severity::Critical,
            ErrorKind::Notional
            | ErrorKind::InsufficientBalance
            | ErrorKind::ReduceOnlyReject
            | ErrorKind::SymbolUnknown
            | ErrorKind::PositionModeMismatch
            | ErrorKind::Protocol => Severity::High,
            ErrorKind::RateLimited
            | ErrorKind::Network
            | ErrorKind::Precision
            | ErrorKind::OrderWouldTrigger => Severity::Medium,
            ErrorKind::Parse => Severity::Low,
        }
    }

    /// True for the kinds the REST client retries with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::Network | ErrorKind::RateLimited)
    }

    /// True for placement failures the hunter may recover from by re-snapping
    /// and submitting a market order once. Notional and balance failures are
    /// final by policy.
    pub fn market_fallback_eligible(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Precision
                | ErrorKind::OrderWouldTrigger
                | ErrorKind::Network
                | ErrorKind::Protocol
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(component) = self.component {
            write!(f, "[{}] ", component)?;
        }
        write!(f, "{}: {}", self.kind.as_str(), self.message)?;
        if let Some(code) = self.code {
            write!(f, " (code {})", code)?;
        }
        if let Some(ref symbol) = self.symbol {
            write!(f, " [{}]", symbol)?;
        }
        Ok(())
    }
}

impl std::error::Error for EngineError {}

// ─── Venue Code Classifier ───────────────────────────────────────────────────

/// Maps the venue's numeric error codes onto the engine taxonomy. The venue
/// speaks the Binance futures error dialect; unknown codes land in Protocol
/// so they surface instead of being silently retried.
pub fn classify_venue_code(code: i64, msg: &str) -> ErrorKind {
    match code {
        -1003 | -1015 => ErrorKind::RateLimited,
        -1013 => {
            // Generic filter failure; the message names the offending filter.
            let upper = msg.to_uppercase();
            if upper.contains("NOTIONAL") {
                ErrorKind::Notional
            } else {
                ErrorKind::Precision
            }
        }
        -1021 | -1022 | -2014 | -2015 => ErrorKind::InvalidCredentials,
        -1111 => ErrorKind::Precision,
        -1121 => ErrorKind::SymbolUnknown,
        -2019 => ErrorKind::InsufficientBalance,
        -2021 => ErrorKind::OrderWouldTrigger,
        -2022 => ErrorKind::ReduceOnlyReject,
        -4061 => ErrorKind::PositionModeMismatch,
        -4164 => ErrorKind::Notional,
        _ => ErrorKind::Protocol,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_codes() {
        assert_eq!(classify_venue_code(-1111, "Precision is over the maximum"), ErrorKind::Precision);
        assert_eq!(classify_venue_code(-2019, "Margin is insufficient."), ErrorKind::InsufficientBalance);
        assert_eq!(classify_venue_code(-2021, "Order would immediately trigger."), ErrorKind::OrderWouldTrigger);
        assert_eq!(classify_venue_code(-4061, "Order's position side does not match"), ErrorKind::PositionModeMismatch);
        assert_eq!(classify_venue_code(-4164, "Order's notional must be no smaller than 5.0"), ErrorKind::Notional);
        assert_eq!(classify_venue_code(-1003, "Too many requests"), ErrorKind::RateLimited);
        assert_eq!(classify_venue_code(-1021, "Timestamp for this request is outside of the recvWindow"), ErrorKind::InvalidCredentials);
        assert_eq!(classify_venue_code(-1121, "Invalid symbol."), ErrorKind::SymbolUnknown);
        assert_eq!(classify_venue_code(-2022, "ReduceOnly Order is rejected."), ErrorKind::ReduceOnlyReject);
    }

    #[test]
    fn filter_failure_splits_on_message() {
        assert_eq!(classify_venue_code(-1013, "Filter failure: MIN_NOTIONAL"), ErrorKind::Notional);
        assert_eq!(classify_venue_code(-1013, "Filter failure: PRICE_FILTER"), ErrorKind::Precision);
        assert_eq!(classify_venue_code(-1013, "Filter failure: LOT_SIZE"), ErrorKind::Precision);
    }

    #[test]
    fn unknown_code_is_protocol() {
        assert_eq!(classify_venue_code(-9999, "???"), ErrorKind::Protocol);
    }

    #[test]
    fn severity_policy() {
        assert_eq!(EngineError::new(ErrorKind::InvalidCredentials, "sig").severity(), Severity::Critical);
        assert_eq!(EngineError::config("bad leverage").severity(), Severity::Critical);
        assert_eq!(EngineError::new(ErrorKind::Notional, "too small").severity(), Severity::High);
        assert_eq!(EngineError::network("timeout").severity(), Severity::Medium);
        assert_eq!(EngineError::parse("bad frame").severity(), Severity::Low);
    }

    #[test]
    fn fallback_eligibility() {
        assert!(EngineError::from_venue(-1111, "precision").market_fallback_eligible());
        assert!(EngineError::from_venue(-2021, "would trigger").market_fallback_eligible());
        assert!(!EngineError::from_venue(-4164, "notional").market_fallback_eligible());
        assert!(!EngineError::from_venue(-2019, "margin").market_fallback_eligible());
    }

    #[test]
    fn display_carries_context() {
        let err = EngineError::from_venue(-2019, "Margin is insufficient.")
            .with_symbol("BTCUSDT")
            .with_component("HUNTER");
        let text = err.to_string();
        assert!(text.contains("[HUNTER]"));
        assert!(text.contains("INSUFFICIENT_BALANCE"));
        assert!(text.contains("-2019"));
        assert!(text.contains("BTCUSDT"));
    }
}
