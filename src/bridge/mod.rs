//! Event Bridge: samples and filters internal bus events down to the wire
//! messages the dashboard actually wants. Indicator values are high-volume
//! and get throttled per `(symbol, variant_id)`; everything trading-related
//! passes straight through.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::bus::event::{EmergencyActionEvent, MemoryPressureEvent, PersistenceDegradedEvent, SystemHealthEvent};
use crate::bus::{BusEvent, EventBus};
use crate::models::{IndicatorValue, MarketTick, Order, Position, PositionStatus, Session, Signal};

/// Minimum gap between forwarded indicator samples for the same
/// `(symbol, variant_id)` pair, so a fast-ticking TWPA lane doesn't flood
/// every connected dashboard client.
const INDICATOR_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    MarketTick(MarketTick),
    IndicatorValue(IndicatorValue),
    Signal(Signal),
    OrderUpdate(Order),
    PositionUpdate(Position),
    PositionClosed(Position),
    SessionStatus(Session),
    RiskAlert(RiskAlert),
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskAlert {
    pub severity: AlertSeverity,
    pub message: String,
    pub related_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl From<&SystemHealthEvent> for RiskAlert {
    fn from(e: &SystemHealthEvent) -> Self {
        RiskAlert {
            severity: AlertSeverity::Warning,
            message: format!("subscriber '{}' on '{}' marked unhealthy after {} errors", e.subscriber_name, e.topic, e.consecutive_errors),
            related_ids: vec![e.subscriber_name.clone()],
            timestamp: e.at,
        }
    }
}

impl From<&EmergencyActionEvent> for RiskAlert {
    fn from(e: &EmergencyActionEvent) -> Self {
        RiskAlert {
            severity: AlertSeverity::Critical,
            message: format!("emergency exit triggered for strategy '{}' on {}", e.strategy_id, e.symbol),
            related_ids: e.pending_order_id.clone().into_iter().collect(),
            timestamp: e.at,
        }
    }
}

impl From<&MemoryPressureEvent> for RiskAlert {
    fn from(e: &MemoryPressureEvent) -> Self {
        RiskAlert {
            severity: AlertSeverity::Warning,
            message: format!("indicator memory at {}/{} bytes, trimmed {} lanes", e.used_bytes, e.budget_bytes, e.trimmed_lanes),
            related_ids: vec![],
            timestamp: e.at,
        }
    }
}

impl From<&PersistenceDegradedEvent> for RiskAlert {
    fn from(e: &PersistenceDegradedEvent) -> Self {
        RiskAlert {
            severity: AlertSeverity::Warning,
            message: format!(
                "persistence degraded: {} rows overflowed writing '{}' ({} buffered in memory)",
                e.rows_overflowed, e.table, e.overflow_ring_len
            ),
            related_ids: vec![e.table.clone()],
            timestamp: e.at,
        }
    }
}

pub struct EventBridge {
    bus: Arc<EventBus>,
    out: broadcast::Sender<WireMessage>,
}

impl EventBridge {
    pub fn new(bus: Arc<EventBus>, capacity: usize) -> Self {
        let (out, _) = broadcast::channel(capacity);
        Self { bus, out }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WireMessage> {
        self.out.subscribe()
    }

    pub async fn run(self: Arc<Self>, mut stop: tokio::sync::watch::Receiver<bool>) {
        let mut ticks = self.bus.subscribe("market.price_update", "bridge.ticks", false, None);
        let mut indicators = self.bus.subscribe("indicator.value", "bridge.indicators", false, None);
        let mut signals = self.bus.subscribe("strategy.signal", "bridge.signals", true, None);
        let mut orders = self.bus.subscribe("execution.order_update", "bridge.orders", true, None);
        let mut positions = self.bus.subscribe("execution.position_update", "bridge.positions", true, None);
        let mut sessions = self.bus.subscribe("session.status", "bridge.sessions", true, None);
        let mut health = self.bus.subscribe("system.health", "bridge.health", false, None);
        let mut emergencies = self.bus.subscribe("emergency.action", "bridge.emergencies", true, None);
        let mut memory = self.bus.subscribe("memory.pressure", "bridge.memory", false, None);
        let mut persistence = self.bus.subscribe("persistence.degraded", "bridge.persistence", false, None);

        let mut last_sample: HashMap<(String, String), Instant> = HashMap::new();

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        self.bus.unsubscribe("market.price_update", ticks.id);
                        self.bus.unsubscribe("indicator.value", indicators.id);
                        self.bus.unsubscribe("strategy.signal", signals.id);
                        self.bus.unsubscribe("execution.order_update", orders.id);
                        self.bus.unsubscribe("execution.position_update", positions.id);
                        self.bus.unsubscribe("session.status", sessions.id);
                        self.bus.unsubscribe("system.health", health.id);
                        self.bus.unsubscribe("emergency.action", emergencies.id);
                        self.bus.unsubscribe("memory.pressure", memory.id);
                        self.bus.unsubscribe("persistence.degraded", persistence.id);
                        return;
                    }
                }
                event = health.receiver.recv() => {
                    if let Some(BusEvent::SystemHealth(e)) = event {
                        if !e.healthy {
                            let _ = self.out.send(WireMessage::RiskAlert(RiskAlert::from(&e)));
                        }
                    } else if event.is_none() { return; }
                }
                event = emergencies.receiver.recv() => {
                    if let Some(BusEvent::EmergencyAction(e)) = event {
                        let _ = self.out.send(WireMessage::RiskAlert(RiskAlert::from(&e)));
                    } else if event.is_none() { return; }
                }
                event = memory.receiver.recv() => {
                    if let Some(BusEvent::MemoryPressure(e)) = event {
                        let _ = self.out.send(WireMessage::RiskAlert(RiskAlert::from(&e)));
                    } else if event.is_none() { return; }
                }
                event = persistence.receiver.recv() => {
                    if let Some(BusEvent::PersistenceDegraded(e)) = event {
                        let _ = self.out.send(WireMessage::RiskAlert(RiskAlert::from(&e)));
                    } else if event.is_none() { return; }
                }
                event = ticks.receiver.recv() => {
                    if let Some(BusEvent::MarketTick(tick)) = event {
                        let _ = self.out.send(WireMessage::MarketTick(tick));
                    } else if event.is_none() { return; }
                }
                event = indicators.receiver.recv() => {
                    if let Some(BusEvent::IndicatorValue(value)) = event {
                        let key = (value.symbol.clone(), value.variant_id.clone());
                        let now = Instant::now();
                        let should_forward = last_sample
                            .get(&key)
                            .map(|t| now.duration_since(*t) >= INDICATOR_SAMPLE_INTERVAL)
                            .unwrap_or(true);
                        if should_forward {
                            last_sample.insert(key, now);
                            let _ = self.out.send(WireMessage::IndicatorValue(value));
                        }
                    } else if event.is_none() { return; }
                }
                event = signals.receiver.recv() => {
                    if let Some(BusEvent::Signal(signal)) = event {
                        let _ = self.out.send(WireMessage::Signal(signal));
                    } else if event.is_none() { return; }
                }
                event = orders.receiver.recv() => {
                    if let Some(BusEvent::OrderUpdate(order)) = event {
                        let _ = self.out.send(WireMessage::OrderUpdate(order));
                    } else if event.is_none() { return; }
                }
                event = positions.receiver.recv() => {
                    if let Some(BusEvent::PositionUpdate(position)) = event {
                        let message = if position.status == PositionStatus::Closed {
                            WireMessage::PositionClosed(position)
                        } else {
                            WireMessage::PositionUpdate(position)
                        };
                        let _ = self.out.send(message);
                    } else if event.is_none() { return; }
                }
                event = sessions.receiver.recv() => {
                    if let Some(BusEvent::SessionStatusChanged(session)) = event {
                        let _ = self.out.send(WireMessage::SessionStatus(session));
                    } else if event.is_none() { return; }
                }
            }
        }
    }
}
