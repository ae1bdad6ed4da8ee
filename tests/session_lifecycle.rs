use std::collections::HashMap;
use std::time::Duration;

use pumpwatch_engine::bus::BusEvent;
use pumpwatch_engine::config::BootConfig;
use pumpwatch_engine::controller::{ControllerStatus, ExecutionController};
use pumpwatch_engine::models::{
    BudgetConfig, Condition, Direction, EmergencyActions, EmergencyExit, IndicatorValue, Logic, MarketTick, O1Cancel,
    Operator, PositionSizing, PositionStatus, S1Signal, SessionConfig, SessionMode, SizingType, StrategyConfig, Tick,
    Z1Entry,
};

fn boot_config_at(database_path: String) -> BootConfig {
    BootConfig {
        database_path,
        port: 0,
        event_bus_default_queue_size: 64,
        event_bus_publish_timeout_ms: 100,
        memory_budget_mb: 64,
    }
}

#[tokio::test]
async fn starting_and_stopping_a_backtest_session_walks_the_full_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("pumpwatch.db").to_string_lossy().to_string();
    let controller = ExecutionController::new(boot_config_at(db_path));

    assert_eq!(controller.status(), ControllerStatus::Idle);

    let session = controller
        .start_session(
            SessionMode::Backtest,
            vec!["BTCUSDT".to_string()],
            HashMap::new(),
            SessionConfig::default(),
            None,
        )
        .await
        .expect("backtest session should start without exchange credentials");

    assert_eq!(controller.status(), ControllerStatus::Running);
    assert_eq!(controller.active_session().unwrap().session_id, session.session_id);

    controller.stop_session().await.unwrap();
    assert_eq!(controller.status(), ControllerStatus::Stopped);
    assert!(controller.active_session().is_none());

    // Idempotent: stopping again with nothing active is a no-op, not an error.
    controller.stop_session().await.unwrap();
}

#[tokio::test]
async fn starting_a_second_session_while_one_is_active_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("pumpwatch.db").to_string_lossy().to_string();
    let controller = ExecutionController::new(boot_config_at(db_path));

    controller
        .start_session(
            SessionMode::Backtest,
            vec!["BTCUSDT".to_string()],
            HashMap::new(),
            SessionConfig::default(),
            None,
        )
        .await
        .unwrap();

    let result = controller
        .start_session(
            SessionMode::Backtest,
            vec!["ETHUSDT".to_string()],
            HashMap::new(),
            SessionConfig::default(),
            None,
        )
        .await;

    assert!(result.is_err());

    controller.stop_session().await.unwrap();
}

#[tokio::test]
async fn idempotent_restart_with_the_same_config_returns_the_existing_session() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("pumpwatch.db").to_string_lossy().to_string();
    let controller = ExecutionController::new(boot_config_at(db_path));

    let first = controller
        .start_session_idempotent(
            SessionMode::Backtest,
            vec!["BTCUSDT".to_string()],
            HashMap::new(),
            SessionConfig::default(),
            None,
        )
        .await
        .unwrap();

    let second = controller
        .start_session_idempotent(
            SessionMode::Backtest,
            vec!["BTCUSDT".to_string()],
            HashMap::new(),
            SessionConfig::default(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(first.session_id, second.session_id);

    let different = controller
        .start_session_idempotent(
            SessionMode::Backtest,
            vec!["ETHUSDT".to_string()],
            HashMap::new(),
            SessionConfig::default(),
            None,
        )
        .await;
    assert!(different.is_err());

    controller.stop_session().await.unwrap();
}

fn pump_and_dump_strategy() -> StrategyConfig {
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

fn indicator(session_id: &str, symbol: &str, variant_id: &str, value: f64) -> IndicatorValue {
    IndicatorValue {
        session_id: session_id.to_string(),
        symbol: symbol.to_string(),
        variant_id: variant_id.to_string(),
        timestamp: chrono::Utc::now(),
        value,
    }
}

/// Drives a backtest session's whole trading loop end to end: arming and
/// entry signals feed a real order manager, which opens a position, and
/// an emergency-exit indicator reading then forces that position closed
/// through the same cancel/close path a live session would take.
#[tokio::test]
async fn emergency_exit_closes_a_position_opened_through_the_full_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("pumpwatch.db").to_string_lossy().to_string();
    let controller = ExecutionController::new(boot_config_at(db_path));

    let mut strategies = HashMap::new();
    strategies.insert("strat_1".to_string(), pump_and_dump_strategy());

    let config = SessionConfig {
        budget: BudgetConfig {
            global_cap: 10_000.0,
            allocations: vec![],
        },
        ..SessionConfig::default()
    };

    let session = controller
        .start_session(SessionMode::Backtest, vec!["BTCUSDT".to_string()], strategies, config, None)
        .await
        .expect("backtest session should start without exchange credentials");

    let bus = controller.bus();
    let mut positions = bus.subscribe("execution.position_update", "test.positions", true, None);

    // Seed the entry price before arming S1 so the snapshot taken at arm
    // time already has a price to resolve the entry against.
    bus.publish(BusEvent::IndicatorValue(indicator(&session.session_id, "BTCUSDT", "twpa_10s", 100.0)))
        .await
        .ok();
    bus.publish(BusEvent::IndicatorValue(indicator(&session.session_id, "BTCUSDT", "pump_magnitude_60s", 6.0)))
        .await
        .ok();
    bus.publish(BusEvent::IndicatorValue(indicator(&session.session_id, "BTCUSDT", "velocity_10s", 1.0)))
        .await
        .ok();

    // The entry order now sits PENDING until the next tick for its symbol
    // arrives — paper/backtest fills are always sourced from the next
    // tick, never the reference price the order was created with.
    bus.publish(BusEvent::MarketTick(MarketTick::new(
        &session.session_id,
        "BTCUSDT",
        Tick { timestamp: chrono::Utc::now(), price: 100.0, volume: 1.0 },
    )))
    .await
    .ok();

    let opened = tokio::time::timeout(Duration::from_secs(2), positions.receiver.recv())
        .await
        .expect("a position update should have been published")
        .expect("subscription should still be open");
    match opened {
        BusEvent::PositionUpdate(position) => {
            assert_eq!(position.status, PositionStatus::Open);
            assert!(position.quantity > 0.0);
        }
        other => panic!("expected PositionUpdate, got {:?}", other),
    }

    bus.publish(BusEvent::IndicatorValue(indicator(&session.session_id, "BTCUSDT", "pump_magnitude_60s", -25.0)))
        .await
        .ok();

    // Same for the emergency close order the strategy manager's
    // emergency.action triggers — it fills on the next tick too.
    bus.publish(BusEvent::MarketTick(MarketTick::new(
        &session.session_id,
        "BTCUSDT",
        Tick { timestamp: chrono::Utc::now(), price: 90.0, volume: 1.0 },
    )))
    .await
    .ok();

    let closed = tokio::time::timeout(Duration::from_secs(2), positions.receiver.recv())
        .await
        .expect("the emergency exit should close the position")
        .expect("subscription should still be open");
    match closed {
        BusEvent::PositionUpdate(position) => {
            assert_eq!(position.status, PositionStatus::Closed);
            assert_eq!(position.quantity, 0.0);
        }
        other => panic!("expected PositionUpdate, got {:?}", other),
    }

    controller.stop_session().await.unwrap();
}
