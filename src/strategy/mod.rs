//! Strategy Manager: owns one [`StrategyInstance`] per `(strategy_id,
//! symbol)` pair and drives its five-section state machine off the
//! indicator and execution event streams.
//!
//! `emergency_exit` is evaluated before anything else on every indicator
//! update, regardless of the instance's current state — a hard stop always
//! takes priority over whatever section would otherwise run.

pub mod condition;
pub mod risk_scale;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use tracing::warn;

use crate::bus::{BusEvent, EventBus};
use crate::models::{
    Direction, Order, OrderSide, OrderStatus, Position, Signal, SignalKind, StrategyConfig, StrategyInstance,
    StrategyState,
};

type InstanceKey = (String, String);

pub struct StrategyManager {
    session_id: String,
    strategies: HashMap<String, StrategyConfig>,
    instances: RwLock<HashMap<InstanceKey, StrategyInstance>>,
    epsilon: f64,
    bus: Arc<EventBus>,
}

impl StrategyManager {
    pub fn new(
        session_id: impl Into<String>,
        strategies: HashMap<String, StrategyConfig>,
        symbols: &[String],
        epsilon: f64,
        bus: Arc<EventBus>,
    ) -> Self {
        let now = Utc::now();
        let mut instances = HashMap::new();
        for (strategy_id, _) in &strategies {
            for symbol in symbols {
                instances.insert(
                    (strategy_id.clone(), symbol.clone()),
                    StrategyInstance::new(strategy_id.clone(), symbol.clone(), now),
                );
            }
        }
        Self {
            session_id: session_id.into(),
            strategies,
            instances: RwLock::new(instances),
            epsilon,
            bus,
        }
    }

    pub async fn run(self: Arc<Self>, mut stop: tokio::sync::watch::Receiver<bool>) {
        let mut indicators = self.bus.subscribe("indicator.value", "strategy_manager.indicators", true, None);
        let mut orders = self.bus.subscribe("execution.order_update", "strategy_manager.orders", true, None);
        let mut positions = self.bus.subscribe("execution.position_update", "strategy_manager.positions", true, None);

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        self.bus.unsubscribe("indicator.value", indicators.id);
                        self.bus.unsubscribe("execution.order_update", orders.id);
                        self.bus.unsubscribe("execution.position_update", positions.id);
                        return;
                    }
                }
                event = indicators.receiver.recv() => {
                    match event {
                        Some(BusEvent::IndicatorValue(value)) => self.on_indicator_value(value).await,
                        Some(_) => {}
                        None => return,
                    }
                }
                event = orders.receiver.recv() => {
                    match event {
                        Some(BusEvent::OrderUpdate(order)) => self.on_order_update(order),
                        Some(_) => {}
                        None => return,
                    }
                }
                event = positions.receiver.recv() => {
                    match event {
                        Some(BusEvent::PositionUpdate(position)) => self.on_position_update(position),
                        Some(_) => {}
                        None => return,
                    }
                }
            }
        }
    }

    async fn on_indicator_value(&self, value: crate::models::IndicatorValue) {
        let strategy_ids: Vec<String> = self.strategies.keys().cloned().collect();
        for strategy_id in strategy_ids {
            let key = (strategy_id.clone(), value.symbol.clone());
            let (signal, emergency) = {
                let mut guard = self.instances.write();
                let Some(instance) = guard.get_mut(&key) else { continue };
                instance.indicator_values.insert(value.variant_id.clone(), value.value);
                self.advance(&strategy_id, instance, value.timestamp)
            };
            if let Some(signal) = signal {
                self.bus.publish(BusEvent::Signal(signal)).await.ok();
            }
            if let Some(emergency) = emergency {
                self.bus.publish(BusEvent::EmergencyAction(emergency)).await.ok();
            }
        }
    }

    /// Evaluate the instance's state machine for one tick of new
    /// information. Returns a [`Signal`] to publish when a transition
    /// produces one (arming or entry) and an [`EmergencyActionEvent`] when
    /// the hard-stop section fires.
    fn advance(
        &self,
        strategy_id: &str,
        instance: &mut StrategyInstance,
        now: DateTime<Utc>,
    ) -> (Option<Signal>, Option<crate::bus::event::EmergencyActionEvent>) {
        let Some(config) = self.strategies.get(strategy_id) else { return (None, None) };

        if instance.state != StrategyState::Cooldown
            && condition::evaluate(&config.emergency_exit.conditions, &instance.indicator_values, self.epsilon)
        {
            warn!(strategy_id, symbol = %instance.symbol, "emergency exit triggered");
            let pending_order_id = instance.open_order_id.take();
            instance.state = StrategyState::Cooldown;
            instance.since = now;
            instance.cooldown_until = Some(now + ChronoDuration::minutes(config.emergency_exit.cooldown_minutes as i64));
            let event = crate::bus::event::EmergencyActionEvent {
                session_id: self.session_id.clone(),
                strategy_id: strategy_id.to_string(),
                symbol: instance.symbol.clone(),
                pending_order_id,
                actions: config.emergency_exit.actions.clone(),
                at: now,
            };
            return (None, Some(event));
        }

        let signal = match instance.state {
            StrategyState::Monitoring => {
                if condition::evaluate(&config.s1_signal.conditions, &instance.indicator_values, self.epsilon) {
                    instance.state = StrategyState::S1Armed;
                    instance.since = now;
                }
                None
            }
            StrategyState::S1Armed => {
                let timed_out =
                    now.signed_duration_since(instance.since).num_seconds() >= config.o1_cancel.timeout_seconds as i64;
                let cancelled = condition::evaluate(&config.o1_cancel.conditions, &instance.indicator_values, self.epsilon);
                if timed_out || cancelled {
                    instance.state = StrategyState::Cooldown;
                    instance.since = now;
                    instance.cooldown_until = Some(now + ChronoDuration::minutes(config.o1_cancel.cooldown_minutes as i64));
                    None
                } else if condition::evaluate(&config.z1_entry.conditions, &instance.indicator_values, self.epsilon) {
                    instance.state = StrategyState::Z1Pending;
                    instance.since = now;
                    let kind = opening_signal_kind(config.direction);
                    let signal = Signal::new(
                        self.session_id.clone(),
                        strategy_id.to_string(),
                        instance.symbol.clone(),
                        kind,
                        1.0,
                        instance
                            .indicator_values
                            .get(&config.z1_entry.price_source)
                            .copied()
                            .unwrap_or(f64::NAN),
                        instance.indicator_values.clone(),
                        now,
                    );
                    instance.last_signal_id = Some(signal.signal_id.clone());
                    Some(signal)
                } else {
                    None
                }
            }
            StrategyState::Z1Pending => {
                if let Some(timeout_secs) = config.z1_entry.timeout_seconds {
                    if now.signed_duration_since(instance.since).num_seconds() >= timeout_secs as i64 {
                        instance.state = StrategyState::Cooldown;
                        instance.since = now;
                        instance.cooldown_until = Some(now + ChronoDuration::minutes(config.o1_cancel.cooldown_minutes as i64));
                    }
                }
                None
            }
            StrategyState::PositionActive => {
                if let Some(ze1) = &config.ze1_close {
                    if condition::evaluate(&ze1.conditions, &instance.indicator_values, self.epsilon) {
                        instance.state = StrategyState::Ze1Pending;
                        instance.since = now;
                        let kind = closing_signal_kind(config.direction);
                        let signal = Signal::new(
                            self.session_id.clone(),
                            strategy_id.to_string(),
                            instance.symbol.clone(),
                            kind,
                            1.0,
                            instance
                                .indicator_values
                                .get(&ze1.close_price_source)
                                .copied()
                                .unwrap_or(f64::NAN),
                            instance.indicator_values.clone(),
                            now,
                        );
                        instance.last_signal_id = Some(signal.signal_id.clone());
                        Some(signal)
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
            StrategyState::Ze1Pending | StrategyState::Error => None,
            StrategyState::Cooldown => {
                if let Some(until) = instance.cooldown_until {
                    if now >= until {
                        instance.state = StrategyState::Monitoring;
                        instance.since = now;
                        instance.cooldown_until = None;
                        instance.open_order_id = None;
                        instance.open_position_id = None;
                    }
                }
                None
            }
        };
        (signal, None)
    }

    fn on_order_update(&self, order: Order) {
        let key = (order.strategy_id.clone(), order.symbol.clone());
        let mut guard = self.instances.write();
        let Some(instance) = guard.get_mut(&key) else { return };
        if instance.open_order_id.as_deref() != Some(order.order_id.as_str()) && instance.state == StrategyState::Z1Pending {
            instance.open_order_id = Some(order.order_id.clone());
        }
        match order.status {
            OrderStatus::Filled if instance.state == StrategyState::Z1Pending => {
                instance.state = StrategyState::PositionActive;
                instance.since = Utc::now();
            }
            OrderStatus::Filled if instance.state == StrategyState::Ze1Pending => {
                instance.state = StrategyState::Cooldown;
                instance.since = Utc::now();
                instance.cooldown_until = Some(Utc::now());
                instance.open_order_id = None;
                instance.open_position_id = None;
            }
            OrderStatus::Rejected | OrderStatus::Cancelled | OrderStatus::Expired
                if instance.state == StrategyState::Z1Pending =>
            {
                instance.state = StrategyState::Monitoring;
                instance.since = Utc::now();
                instance.open_order_id = None;
            }
            _ => {}
        }
    }

    fn on_position_update(&self, position: Position) {
        let key = (position.strategy_id.clone(), position.symbol.clone());
        let mut guard = self.instances.write();
        let Some(instance) = guard.get_mut(&key) else { return };
        instance.open_position_id = Some(position.position_id.clone());
        if position.quantity <= 1e-12 && instance.state == StrategyState::Ze1Pending {
            instance.state = StrategyState::Cooldown;
            instance.since = Utc::now();
            instance.open_position_id = None;
        }
    }

    pub fn instance_snapshot(&self, strategy_id: &str, symbol: &str) -> Option<StrategyInstance> {
        self.instances.read().get(&(strategy_id.to_string(), symbol.to_string())).cloned()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }
}

fn opening_signal_kind(direction: Direction) -> SignalKind {
    match direction {
        Direction::Short => SignalKind::Sell,
        Direction::Long | Direction::Both => SignalKind::Buy,
    }
}

/// A close is always the opposite side of the open: a long position is
/// closed by selling, a short by buying.
fn closing_signal_kind(direction: Direction) -> SignalKind {
    match opening_signal_kind(direction) {
        SignalKind::Buy => SignalKind::Sell,
        SignalKind::Sell => SignalKind::Buy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::models::{
        Condition, EmergencyActions, EmergencyExit, Logic, O1Cancel, Operator, PositionSizing, S1Signal, SizingType,
        Z1Entry,
    };

    fn sample_strategy() -> StrategyConfig {
        StrategyConfig {
            strategy_id: "strat_1".to_string(),
            direction: Direction::Long,
            s1_signal: S1Signal {
                conditions: vec![Condition {
                    indicator_id: "pump_magnitude_60s".to_string(),
                    operator: Operator::Gte,
                    value: 5.0,
                    logic: Logic::And,
                }],
            },
            o1_cancel: O1Cancel {
                conditions: vec![],
                timeout_seconds: 30,
                cooldown_minutes: 5,
            },
            z1_entry: Z1Entry {
                conditions: vec![Condition {
                    indicator_id: "velocity_10s".to_string(),
                    operator: Operator::Gt,
                    value: 0.0,
                    logic: Logic::And,
                }],
                price_source: "twpa_10s".to_string(),
                timeout_seconds: Some(20),
                stop_loss_pct: None,
                take_profit_pct: None,
                position_size: PositionSizing {
                    sizing_type: SizingType::Fixed,
                    value: 100.0,
                    risk_scaling: None,
                },
                leverage: 1.0,
            },
            ze1_close: None,
            emergency_exit: EmergencyExit {
                conditions: vec![Condition {
                    indicator_id: "pump_magnitude_60s".to_string(),
                    operator: Operator::Lte,
                    value: -20.0,
                    logic: Logic::And,
                }],
                cooldown_minutes: 15,
                actions: EmergencyActions {
                    cancel_pending: true,
                    close_position: true,
                    log_event: true,
                },
            },
        }
    }

    #[tokio::test]
    async fn s1_match_arms_the_instance_without_emitting_a_signal() {
        let bus = Arc::new(EventBus::new(16, 50));
        let mut subscription = bus.subscribe("strategy.signal", "test", true, None);
        let mut strategies = HashMap::new();
        strategies.insert("strat_1".to_string(), sample_strategy());
        let manager = StrategyManager::new("sess_1", strategies, &["BTCUSDT".to_string()], 1e-9, bus);

        let now = Utc::now();
        manager
            .on_indicator_value(crate::models::IndicatorValue {
                session_id: "sess_1".to_string(),
                symbol: "BTCUSDT".to_string(),
                variant_id: "pump_magnitude_60s".to_string(),
                timestamp: now,
                value: 6.0,
            })
            .await;

        let instance = manager.instance_snapshot("strat_1", "BTCUSDT").unwrap();
        assert_eq!(instance.state, StrategyState::S1Armed);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), subscription.receiver.recv())
                .await
                .is_err(),
            "arming alone must not emit a signal"
        );
    }

    #[tokio::test]
    async fn z1_match_after_arming_emits_a_signal_and_moves_to_z1_pending() {
        let bus = Arc::new(EventBus::new(16, 50));
        let mut subscription = bus.subscribe("strategy.signal", "test", true, None);
        let mut strategies = HashMap::new();
        strategies.insert("strat_1".to_string(), sample_strategy());
        let manager = StrategyManager::new("sess_1", strategies, &["BTCUSDT".to_string()], 1e-9, bus);

        let now = Utc::now();
        manager
            .on_indicator_value(crate::models::IndicatorValue {
                session_id: "sess_1".to_string(),
                symbol: "BTCUSDT".to_string(),
                variant_id: "pump_magnitude_60s".to_string(),
                timestamp: now,
                value: 6.0,
            })
            .await;
        manager
            .on_indicator_value(crate::models::IndicatorValue {
                session_id: "sess_1".to_string(),
                symbol: "BTCUSDT".to_string(),
                variant_id: "velocity_10s".to_string(),
                timestamp: now,
                value: 1.5,
            })
            .await;

        let instance = manager.instance_snapshot("strat_1", "BTCUSDT").unwrap();
        assert_eq!(instance.state, StrategyState::Z1Pending);

        let event = subscription.receiver.recv().await.expect("z1 match should have emitted a signal");
        match event {
            BusEvent::Signal(signal) => assert_eq!(signal.strategy_id, "strat_1"),
            other => panic!("expected Signal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn emergency_exit_overrides_any_state() {
        let bus = Arc::new(EventBus::new(16, 50));
        let mut strategies = HashMap::new();
        strategies.insert("strat_1".to_string(), sample_strategy());
        let manager = StrategyManager::new("sess_1", strategies, &["BTCUSDT".to_string()], 1e-9, bus);

        let now = Utc::now();
        manager
            .on_indicator_value(crate::models::IndicatorValue {
                session_id: "sess_1".to_string(),
                symbol: "BTCUSDT".to_string(),
                variant_id: "pump_magnitude_60s".to_string(),
                timestamp: now,
                value: -25.0,
            })
            .await;

        let instance = manager.instance_snapshot("strat_1", "BTCUSDT").unwrap();
        assert_eq!(instance.state, StrategyState::Cooldown);
    }

    #[tokio::test]
    async fn emergency_exit_publishes_an_emergency_action_event() {
        let bus = Arc::new(EventBus::new(16, 50));
        let mut subscription = bus.subscribe("emergency.action", "test", true, None);
        let mut strategies = HashMap::new();
        strategies.insert("strat_1".to_string(), sample_strategy());
        let manager = StrategyManager::new("sess_1", strategies, &["BTCUSDT".to_string()], 1e-9, bus);

        manager
            .on_indicator_value(crate::models::IndicatorValue {
                session_id: "sess_1".to_string(),
                symbol: "BTCUSDT".to_string(),
                variant_id: "pump_magnitude_60s".to_string(),
                timestamp: Utc::now(),
                value: -25.0,
            })
            .await;

        let event = subscription.receiver.recv().await.expect("emergency.action should have been published");
        match event {
            BusEvent::EmergencyAction(e) => {
                assert_eq!(e.strategy_id, "strat_1");
                assert!(e.actions.close_position);
            }
            other => panic!("expected EmergencyAction, got {:?}", other),
        }
    }
}
