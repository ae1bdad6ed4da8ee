use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single market data print. Immutable once constructed; monotonic per
/// symbol on a live feed, but may arrive out of order across symbols during
/// backtest replay (§3 non-goal: cross-symbol reordering correctness).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub volume: f64,
}

/// A [`Tick`] bound to the symbol it was observed on — the shape published
/// on the `market.price_update` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTick {
    pub session_id: String,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub volume: f64,
}

impl MarketTick {
    pub fn new(session_id: impl Into<String>, symbol: impl Into<String>, tick: Tick) -> Self {
        Self {
            session_id: session_id.into(),
            symbol: symbol.into(),
            timestamp: tick.timestamp,
            price: tick.price,
            volume: tick.volume,
        }
    }
}
