use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pumpwatch_engine::bus::{BusEvent, EventBus};
use pumpwatch_engine::models::{
    Condition, Direction, EmergencyActions, EmergencyExit, IndicatorValue, Logic, O1Cancel, Operator, Order,
    OrderSide, OrderType, PositionSizing, S1Signal, SizingType, StrategyConfig, StrategyState, Z1Entry,
};
use pumpwatch_engine::strategy::StrategyManager;

fn pump_and_dump_strategy() -> StrategyConfig {
    StrategyConfig {
        strategy_id: "pump_watch_1".to_string(),
        direction: Direction::Long,
        s1_signal: S1Signal {
            conditions: vec![Condition {
                indicator_id: "pump_magnitude_60s".to_string(),
                operator: Operator::Gte,
                value: 8.0,
                logic: Logic::And,
            }],
        },
        o1_cancel: O1Cancel {
            conditions: vec![Condition {
                indicator_id: "velocity_10s".to_string(),
                operator: Operator::Lt,
                value: 0.0,
                logic: Logic::And,
            }],
            timeout_seconds: 60,
            cooldown_minutes: 5,
        },
        z1_entry: Z1Entry {
            conditions: vec![Condition {
                indicator_id: "volume_surge_ratio_10s".to_string(),
                operator: Operator::Gte,
                value: 2.0,
                logic: Logic::And,
            }],
            price_source: "twpa_10s".to_string(),
            timeout_seconds: Some(30),
            stop_loss_pct: None,
            take_profit_pct: None,
            position_size: PositionSizing {
                sizing_type: SizingType::Fixed,
                value: 250.0,
                risk_scaling: None,
            },
            leverage: 1.0,
        },
        ze1_close: None,
        emergency_exit: EmergencyExit {
            conditions: vec![Condition {
                indicator_id: "pump_magnitude_60s".to_string(),
                operator: Operator::Lte,
                value: -30.0,
                logic: Logic::And,
            }],
            cooldown_minutes: 30,
            actions: EmergencyActions {
                cancel_pending: true,
                close_position: true,
                log_event: true,
            },
        },
    }
}

fn feed(now: chrono::DateTime<Utc>, symbol: &str, variant_id: &str, value: f64) -> BusEvent {
    BusEvent::IndicatorValue(IndicatorValue {
        session_id: "sess_1".to_string(),
        symbol: symbol.to_string(),
        variant_id: variant_id.to_string(),
        timestamp: now,
        value,
    })
}

async fn wait_for_state(manager: &StrategyManager, strategy_id: &str, symbol: &str, expected: StrategyState) {
    for _ in 0..100 {
        if let Some(instance) = manager.instance_snapshot(strategy_id, symbol) {
            if instance.state == expected {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("state {:?} never reached", expected);
}

#[tokio::test]
async fn walks_monitoring_through_armed_to_z1_pending_on_confirming_conditions() {
    let bus = Arc::new(EventBus::new(64, 100));
    let mut strategies = HashMap::new();
    strategies.insert("pump_watch_1".to_string(), pump_and_dump_strategy());
    let manager = Arc::new(StrategyManager::new(
        "sess_1",
        strategies,
        &["BTCUSDT".to_string()],
        1e-9,
        bus.clone(),
    ));

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let run_handle = tokio::spawn(manager.clone().run(stop_rx));

    let now = Utc::now();
    bus.publish(feed(now, "BTCUSDT", "twpa_10s", 100.0)).await.unwrap();
    bus.publish(feed(now, "BTCUSDT", "pump_magnitude_60s", 9.0)).await.unwrap();
    wait_for_state(&manager, "pump_watch_1", "BTCUSDT", StrategyState::S1Armed).await;

    bus.publish(feed(now, "BTCUSDT", "volume_surge_ratio_10s", 3.0)).await.unwrap();
    wait_for_state(&manager, "pump_watch_1", "BTCUSDT", StrategyState::Z1Pending).await;

    let mut order = Order::new(
        "sess_1",
        "pump_watch_1",
        "BTCUSDT",
        OrderSide::Buy,
        OrderType::Market,
        2.5,
        Some(100.0),
        "sig_1",
        0,
        now,
    );
    order.mark_filled(100.2, 2.5, now);
    bus.publish(BusEvent::OrderUpdate(order)).await.unwrap();
    wait_for_state(&manager, "pump_watch_1", "BTCUSDT", StrategyState::PositionActive).await;

    stop_tx.send(true).unwrap();
    run_handle.await.unwrap();
}

#[tokio::test]
async fn o1_cancel_returns_an_armed_instance_to_cooldown() {
    let bus = Arc::new(EventBus::new(64, 100));
    let mut strategies = HashMap::new();
    strategies.insert("pump_watch_1".to_string(), pump_and_dump_strategy());
    let manager = Arc::new(StrategyManager::new(
        "sess_1",
        strategies,
        &["BTCUSDT".to_string()],
        1e-9,
        bus.clone(),
    ));

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let run_handle = tokio::spawn(manager.clone().run(stop_rx));

    let now = Utc::now();
    bus.publish(feed(now, "BTCUSDT", "pump_magnitude_60s", 9.0)).await.unwrap();
    wait_for_state(&manager, "pump_watch_1", "BTCUSDT", StrategyState::S1Armed).await;

    bus.publish(feed(now, "BTCUSDT", "velocity_10s", -1.0)).await.unwrap();
    wait_for_state(&manager, "pump_watch_1", "BTCUSDT", StrategyState::Cooldown).await;

    stop_tx.send(true).unwrap();
    run_handle.await.unwrap();
}

#[tokio::test]
async fn emergency_exit_overrides_an_armed_instance_regardless_of_o1_and_z1() {
    let bus = Arc::new(EventBus::new(64, 100));
    let mut strategies = HashMap::new();
    strategies.insert("pump_watch_1".to_string(), pump_and_dump_strategy());
    let manager = Arc::new(StrategyManager::new(
        "sess_1",
        strategies,
        &["BTCUSDT".to_string()],
        1e-9,
        bus.clone(),
    ));

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let run_handle = tokio::spawn(manager.clone().run(stop_rx));

    let now = Utc::now();
    bus.publish(feed(now, "BTCUSDT", "pump_magnitude_60s", 9.0)).await.unwrap();
    wait_for_state(&manager, "pump_watch_1", "BTCUSDT", StrategyState::S1Armed).await;

    // A magnitude collapse below the emergency threshold must pull the
    // instance into cooldown even though it's only S1-armed, not positioned.
    bus.publish(feed(now, "BTCUSDT", "pump_magnitude_60s", -31.0)).await.unwrap();
    wait_for_state(&manager, "pump_watch_1", "BTCUSDT", StrategyState::Cooldown).await;

    stop_tx.send(true).unwrap();
    run_handle.await.unwrap();
}
