//! Persists order, position and session state changes as they happen.
//! Unlike the indicator sink this subscribes as trading-critical: every
//! state transition must land in the store before the engine can consider
//! the session durable, so the bus never drops these under back-pressure.

use std::sync::Arc;

use tracing::{error, warn};

use crate::bus::{BusEvent, EventBus};
use crate::persistence::Store;

pub async fn run(bus: Arc<EventBus>, store: Arc<dyn Store>, mut stop: tokio::sync::watch::Receiver<bool>) {
    let mut orders = bus.subscribe("execution.order_update", "trading_sink.orders", true, None);
    let mut positions = bus.subscribe("execution.position_update", "trading_sink.positions", true, None);
    let mut sessions = bus.subscribe("session.status", "trading_sink.sessions", true, None);
    let mut signals = bus.subscribe("strategy.signal", "trading_sink.signals", true, None);

    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    bus.unsubscribe("execution.order_update", orders.id);
                    bus.unsubscribe("execution.position_update", positions.id);
                    bus.unsubscribe("session.status", sessions.id);
                    bus.unsubscribe("strategy.signal", signals.id);
                    return;
                }
            }
            event = orders.receiver.recv() => {
                if let Some(BusEvent::OrderUpdate(order)) = event {
                    if let Err(e) = store.upsert_order(&order).await {
                        error!(error = %e, order_id = %order.order_id, "failed to persist order update");
                    }
                } else if event.is_none() {
                    return;
                }
            }
            event = positions.receiver.recv() => {
                if let Some(BusEvent::PositionUpdate(position)) = event {
                    if let Err(e) = store.upsert_position(&position).await {
                        error!(error = %e, position_id = %position.position_id, "failed to persist position update");
                    }
                } else if event.is_none() {
                    return;
                }
            }
            event = sessions.receiver.recv() => {
                if let Some(BusEvent::SessionStatusChanged(session)) = event {
                    if let Err(e) = store.upsert_session(&session).await {
                        error!(error = %e, session_id = %session.session_id, "failed to persist session status");
                    }
                } else if event.is_none() {
                    return;
                }
            }
            event = signals.receiver.recv() => {
                if let Some(BusEvent::Signal(signal)) = event {
                    match store.insert_signal(&signal).await {
                        Ok(inserted) if !inserted => {
                            warn!(signal_id = %signal.signal_id, "duplicate signal rejected at the sink");
                        }
                        Err(e) => {
                            error!(error = %e, signal_id = %signal.signal_id, "failed to persist signal");
                        }
                        _ => {}
                    }
                } else if event.is_none() {
                    return;
                }
            }
        }
    }
}
