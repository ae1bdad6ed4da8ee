use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{EmergencyActions, IndicatorValue, MarketTick, Order, Position, Session, Signal};

/// The payload carried on every topic. One enum keeps the bus itself
/// free of generics — subscribers match on variant rather than on topic
/// string alone, since a handful of topics (e.g. `execution.*`) carry more
/// than one variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusEvent {
    MarketTick(MarketTick),
    IndicatorValue(IndicatorValue),
    Signal(Signal),
    OrderUpdate(Order),
    PositionUpdate(Position),
    SessionStatusChanged(Session),
    SystemHealth(SystemHealthEvent),
    EmergencyAction(EmergencyActionEvent),
    MemoryPressure(MemoryPressureEvent),
    PersistenceDegraded(PersistenceDegradedEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealthEvent {
    pub subscriber_name: String,
    pub topic: String,
    pub healthy: bool,
    pub consecutive_errors: u32,
    pub at: DateTime<Utc>,
}

/// Emitted by the strategy manager the moment an instance's
/// `emergency_exit` section matches, carrying the configured action set
/// and whatever pending order/position ids the instance was holding at
/// the time so the execution side doesn't have to look them up again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyActionEvent {
    pub session_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub pending_order_id: Option<String>,
    pub actions: EmergencyActions,
    pub at: DateTime<Utc>,
}

/// Emitted by the indicator engine when aggregate lane memory crosses the
/// configured pressure threshold (80% of budget), after it has already
/// trimmed the least-recently-accessed lanes back down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPressureEvent {
    pub used_bytes: usize,
    pub budget_bytes: usize,
    pub trimmed_lanes: usize,
    pub at: DateTime<Utc>,
}

/// Emitted by the store once a batch exhausts its retry budget and falls
/// back to the in-memory overflow ring rather than reaching the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceDegradedEvent {
    pub table: String,
    pub rows_overflowed: usize,
    pub overflow_ring_len: usize,
    pub at: DateTime<Utc>,
}

impl BusEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            BusEvent::MarketTick(_) => "market.price_update",
            BusEvent::IndicatorValue(_) => "indicator.value",
            BusEvent::Signal(_) => "strategy.signal",
            BusEvent::OrderUpdate(_) => "execution.order_update",
            BusEvent::PositionUpdate(_) => "execution.position_update",
            BusEvent::SessionStatusChanged(_) => "session.status",
            BusEvent::SystemHealth(_) => "system.health",
            BusEvent::EmergencyAction(_) => "emergency.action",
            BusEvent::MemoryPressure(_) => "memory.pressure",
            BusEvent::PersistenceDegraded(_) => "persistence.degraded",
        }
    }
}
