// ─────────────────────────────────────────────────────────────────────────────
// broadcaster.rs — In-process status pub/sub
//
// One broadcast channel carries every engine event; the variant decides the
// topic. Delivery is best-effort at-most-once: publishing never blocks, and
// a subscriber that lags simply loses the overwritten messages (it can
// re-sync from the REST snapshots).
// ─────────────────────────────────────────────────────────────────────────────
use crate::errors::Severity;
use crate::exchange::{OrderType, Position, Side};
use crate::ingest::LiquidationEvent;
use crate::threshold::ThresholdStatus;
use crate::vwap::VwapUpdate;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    Liquidation {
        event: LiquidationEvent,
        threshold: Option<ThresholdStatus>,
    },
    Threshold(ThresholdStatus),
    Vwap(VwapUpdate),
    MarkPrice {
        symbol: String,
        price: Decimal,
    },
    Positions {
        positions: Vec<Position>,
    },
    PositionOpened {
        symbol: String,
        side: Side,
        qty: Decimal,
        price: Decimal,
        paper: bool,
    },
    OrderPlaced {
        symbol: String,
        order_id: i64,
        side: Side,
        order_type: OrderType,
        qty: Decimal,
        price: Option<Decimal>,
    },
    OrderFilled {
        symbol: String,
        order_id: i64,
    },
    OrderCancelled {
        symbol: String,
        order_id: i64,
    },
    TradeBlocked {
        symbol: String,
        side: Side,
        reason: String,
    },
    EngineError {
        severity: Severity,
        kind: String,
        message: String,
        symbol: Option<String>,
    },
    Connectivity {
        stream: &'static str,
        connected: bool,
    },
}

impl Event {
    pub fn topic(&self) -> &'static str {
        match self {
            Event::Liquidation { .. } => "liquidation",
            Event::Threshold(_) => "threshold",
            Event::Vwap(_) | Event::MarkPrice { .. } => "vwap",
            Event::Positions { .. } | Event::PositionOpened { .. } => "position",
            Event::OrderPlaced { .. }
            | Event::OrderFilled { .. }
            | Event::OrderCancelled { .. }
            | Event::TradeBlocked { .. } => "order",
            Event::EngineError { .. } => "error",
            Event::Connectivity { .. } => "connectivity",
        }
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Event>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Non-blocking; a send with no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn subscribers_receive_in_publication_order() {
        let bus = Broadcaster::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::MarkPrice { symbol: "BTCUSDT".to_string(), price: dec!(50000) });
        bus.publish(Event::OrderFilled { symbol: "BTCUSDT".to_string(), order_id: 7 });

        match rx.recv().await.unwrap() {
            Event::MarkPrice { price, .. } => assert_eq!(price, dec!(50000)),
            other => panic!("unexpected event {:?}", other),
        }
        match rx.recv().await.unwrap() {
            Event::OrderFilled { order_id, .. } => assert_eq!(order_id, 7),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = Broadcaster::new();
        bus.publish(Event::Connectivity { stream: "liquidation", connected: true });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn topics_map_to_variants() {
        let blocked = Event::TradeBlocked {
            symbol: "ETHUSDT".to_string(),
            side: Side::Buy,
            reason: "below VWAP required".to_string(),
        };
        assert_eq!(blocked.topic(), "order");
        assert_eq!(
            Event::Connectivity { stream: "vwap", connected: false }.topic(),
            "connectivity"
        );
        assert_eq!(
            Event::EngineError {
                severity: Severity::High,
                kind: "NOTIONAL".to_string(),
                message: "too small".to_string(),
                symbol: None
            }
            .topic(),
            "error"
        );
    }
}
