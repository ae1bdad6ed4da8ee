use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Buy,
    Sell,
}

/// Emitted when a strategy instance's `s1_signal` section matches. Carries
/// a snapshot of the indicator values that triggered it, for audit and for
/// the dashboard's "why did this fire" view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub session_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub kind: SignalKind,
    pub confidence: f64,
    pub price: f64,
    pub indicator_snapshot: HashMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn new(
        session_id: impl Into<String>,
        strategy_id: impl Into<String>,
        symbol: impl Into<String>,
        kind: SignalKind,
        confidence: f64,
        price: f64,
        indicator_snapshot: HashMap<String, f64>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            signal_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            kind,
            confidence: confidence.clamp(0.0, 1.0),
            price,
            indicator_snapshot,
            timestamp,
        }
    }
}
