//! Execution Controller: the only component allowed to start or stop a
//! session. Enforces the single-session rule (one active session at a
//! time) and the strict `IDLE -> STARTING -> RUNNING -> STOPPING ->
//! STOPPED`/`FAILED` sequencing — nothing downstream is spawned until the
//! controller has committed to `STARTING`, and nothing is torn down until
//! it has committed to `STOPPING`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bus::{BusEvent, EventBus};
use crate::config::BootConfig;
use crate::error::{EngineError, EngineResult};
use crate::execution::backtest::BacktestOrderManager;
use crate::execution::live::LiveOrderManager;
use crate::execution::paper::PaperOrderManager;
use crate::execution::OrderManager;
use crate::indicators::IndicatorEngine;
use crate::market::live::LiveMarketSource;
use crate::market::replay::ReplayMarketSource;
use crate::market::MarketDataSource;
use crate::models::{IndicatorVariant, Session, SessionConfig, SessionMode, SessionStatus, StrategyConfig};
use crate::persistence::sqlite::SqliteStore;
use crate::persistence::{indicator_sink, trading_sink, Store};
use crate::strategy::StrategyManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

pub struct LiveCredentials {
    pub api_base: String,
    pub api_key: String,
    pub api_secret: String,
    pub ws_endpoint: String,
}

struct ActiveSession {
    session: Session,
    stop_tx: tokio::sync::watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct ExecutionController {
    boot: BootConfig,
    /// Long-lived for the process's entire life, not per-session — the
    /// API layer's websocket bridge subscribes to it once at startup and
    /// keeps working across session restarts.
    bus: Arc<EventBus>,
    status: Arc<RwLock<ControllerStatus>>,
    active: RwLock<Option<ActiveSession>>,
}

impl ExecutionController {
    pub fn new(boot: BootConfig) -> Self {
        let bus = Arc::new(EventBus::new(
            boot.event_bus_default_queue_size,
            boot.event_bus_publish_timeout_ms,
        ));
        Self {
            boot,
            bus,
            status: Arc::new(RwLock::new(ControllerStatus::Idle)),
            active: RwLock::new(None),
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn status(&self) -> ControllerStatus {
        *self.status.read()
    }

    pub fn active_session(&self) -> Option<Session> {
        self.active.read().as_ref().map(|a| a.session.clone())
    }

    /// Start a session. Idempotent: calling this again with the same
    /// `session_id` while that session is already running is a no-op that
    /// returns the existing session rather than erroring. Starting a
    /// *different* session while one is active violates the single-session
    /// rule and is rejected.
    pub async fn start_session(
        &self,
        mode: SessionMode,
        symbols: Vec<String>,
        strategies: HashMap<String, StrategyConfig>,
        config: SessionConfig,
        live_credentials: Option<LiveCredentials>,
    ) -> EngineResult<Session> {
        self.start_session_inner(mode, symbols, strategies, config, live_credentials, false).await
    }

    /// Same as [`Self::start_session`] but honours the idempotent-restart
    /// contract: if a session with the identical `(mode, symbols,
    /// strategy_config)` is already running, returns it instead of
    /// rejecting the request as `SessionExists`.
    pub async fn start_session_idempotent(
        &self,
        mode: SessionMode,
        symbols: Vec<String>,
        strategies: HashMap<String, StrategyConfig>,
        config: SessionConfig,
        live_credentials: Option<LiveCredentials>,
    ) -> EngineResult<Session> {
        self.start_session_inner(mode, symbols, strategies, config, live_credentials, true).await
    }

    async fn start_session_inner(
        &self,
        mode: SessionMode,
        symbols: Vec<String>,
        strategies: HashMap<String, StrategyConfig>,
        config: SessionConfig,
        live_credentials: Option<LiveCredentials>,
        idempotent: bool,
    ) -> EngineResult<Session> {
        {
            let guard = self.active.read();
            if let Some(active) = guard.as_ref() {
                let same_request = active.session.mode == mode
                    && active.session.symbols == symbols
                    && strategy_configs_match(&active.session.strategy_config, &strategies);
                if idempotent && same_request {
                    return Ok(active.session.clone());
                }
                return Err(EngineError::invariant(format!(
                    "session {} already active, stop it before starting a new one",
                    active.session.session_id
                )));
            }
        }

        *self.status.write() = ControllerStatus::Starting;
        let now = Utc::now();
        let session_id = Session::generate_id(mode, now);
        let session = Session {
            session_id: session_id.clone(),
            mode,
            symbols: symbols.clone(),
            strategy_config: strategies.clone(),
            config: config.clone(),
            status: SessionStatus::Starting,
            started_at: now,
            ended_at: None,
        };

        match self.spawn_session(&session, &strategies, live_credentials).await {
            Ok(active) => {
                *self.status.write() = ControllerStatus::Running;
                let mut running_session = session.clone();
                running_session.status = SessionStatus::Running;
                *self.active.write() = Some(ActiveSession {
                    session: running_session.clone(),
                    ..active
                });
                info!(session_id = %session_id, mode = mode.as_str(), "session started");
                Ok(running_session)
            }
            Err(e) => {
                error!(error = %e, session_id = %session_id, "session failed to start");
                *self.status.write() = ControllerStatus::Failed;
                Err(e)
            }
        }
    }

    async fn spawn_session(
        &self,
        session: &Session,
        strategies: &HashMap<String, StrategyConfig>,
        live_credentials: Option<LiveCredentials>,
    ) -> EngineResult<ActiveSession> {
        let bus = self.bus.clone();
        let store: Arc<dyn Store> = Arc::new(
            SqliteStore::open(&self.boot.database_path)
                .map_err(|e| EngineError::fatal(format!("store open failed: {}", e)))?
                .with_event_bus(bus.clone()),
        );
        store.init_schema().await?;

        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let mut tasks = Vec::new();

        let indicator_engine = self.build_indicator_engine(strategies)?;
        tasks.push(self.spawn_indicator_task(
            indicator_engine,
            session.session_id.clone(),
            bus.clone(),
            stop_rx.clone(),
            stop_tx.clone(),
            self.status.clone(),
        ));

        tasks.push(tokio::spawn(indicator_sink::run(bus.clone(), store.clone(), stop_rx.clone())));
        tasks.push(tokio::spawn(trading_sink::run(bus.clone(), store.clone(), stop_rx.clone())));

        // Collect sessions run the data pipeline only — no strategy manager,
        // no order manager, nothing is ever traded.
        if session.mode != SessionMode::Collect {
            let strategy_manager = Arc::new(StrategyManager::new(
                session.session_id.clone(),
                strategies.clone(),
                &session.symbols,
                session.config.comparison_epsilon,
                bus.clone(),
            ));
            tasks.push(tokio::spawn(strategy_manager.run(stop_rx.clone())));

            let order_manager: Arc<dyn OrderManager> = match session.mode {
                SessionMode::Paper => {
                    let paper = Arc::new(PaperOrderManager::new(
                        session.session_id.clone(),
                        session.config.budget.clone(),
                        session.config.slippage,
                        bus.clone(),
                    ));
                    tasks.push(tokio::spawn(paper.clone().run(stop_rx.clone())));
                    paper
                }
                SessionMode::Backtest => {
                    let backtest = Arc::new(BacktestOrderManager::new(
                        session.session_id.clone(),
                        session.config.budget.clone(),
                        session.config.slippage,
                        bus.clone(),
                    ));
                    tasks.push(tokio::spawn(backtest.clone().run(stop_rx.clone())));
                    backtest
                }
                SessionMode::Live => {
                    let creds = live_credentials
                        .as_ref()
                        .ok_or_else(|| EngineError::invariant("live session requires exchange credentials"))?;
                    Arc::new(LiveOrderManager::new(
                        session.session_id.clone(),
                        creds.api_base.clone(),
                        creds.api_key.clone(),
                        creds.api_secret.clone(),
                        session.config.budget.clone(),
                        bus.clone(),
                    ))
                }
                SessionMode::Collect => unreachable!("Collect mode has no order manager"),
            };
            tasks.push(self.spawn_signal_listener(order_manager.clone(), strategies.clone(), bus.clone(), stop_rx.clone()));
            tasks.push(self.spawn_emergency_listener(order_manager.clone(), bus.clone(), stop_rx.clone()));
            tasks.push(self.spawn_order_expiry_sweep(order_manager, stop_rx.clone()));
        }

        match session.mode {
            SessionMode::Live | SessionMode::Collect | SessionMode::Paper => {
                let creds = live_credentials
                    .ok_or_else(|| EngineError::invariant("this session mode requires a feed endpoint"))?;
                let live_source =
                    LiveMarketSource::new(session.session_id.clone(), creds.ws_endpoint, session.symbols.clone());
                tasks.push(self.spawn_market_task(Arc::new(live_source), bus.clone(), stop_rx.clone()));
            }
            SessionMode::Backtest => {
                let replay = ReplayMarketSource::new(
                    session.session_id.clone(),
                    session.symbols.clone(),
                    session.config.acceleration_factor,
                    store.clone(),
                );
                tasks.push(self.spawn_market_task(Arc::new(replay), bus.clone(), stop_rx.clone()));
            }
        }

        let _ = bus.publish(BusEvent::SessionStatusChanged(session.clone())).await;

        Ok(ActiveSession {
            session: session.clone(),
            stop_tx,
            tasks,
        })
    }

    fn build_indicator_engine(&self, strategies: &HashMap<String, StrategyConfig>) -> EngineResult<IndicatorEngine> {
        let mut engine = IndicatorEngine::new(self.boot.memory_budget_mb);
        for config in strategies.values() {
            for indicator_id in config.referenced_indicator_ids() {
                let mut parameters = std::collections::BTreeMap::new();
                parameters.insert("window_seconds".to_string(), parse_window_seconds(&indicator_id));
                let variant = IndicatorVariant {
                    variant_id: indicator_id.clone(),
                    base_type: base_type_for(&indicator_id),
                    parameters,
                    scope: crate::models::IndicatorScope::PerSymbol,
                };
                engine.register(&variant)?;
            }
        }
        Ok(engine)
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_indicator_task(
        &self,
        mut engine: IndicatorEngine,
        session_id: String,
        bus: Arc<EventBus>,
        mut stop: tokio::sync::watch::Receiver<bool>,
        stop_tx: tokio::sync::watch::Sender<bool>,
        status: Arc<RwLock<ControllerStatus>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut subscription = bus.subscribe("market.price_update", "indicator_engine", true, None);
            loop {
                tokio::select! {
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            bus.unsubscribe("market.price_update", subscription.id);
                            return;
                        }
                    }
                    event = subscription.receiver.recv() => {
                        match event {
                            Some(BusEvent::MarketTick(tick)) => {
                                match engine.on_tick(&session_id, &tick) {
                                    Ok((values, pressure)) => {
                                        for value in values {
                                            bus.publish(BusEvent::IndicatorValue(value)).await.ok();
                                        }
                                        if let Some(pressure) = pressure {
                                            bus.publish(BusEvent::MemoryPressure(pressure)).await.ok();
                                        }
                                    }
                                    Err(e) => {
                                        error!(error = %e, session_id = %session_id, "indicator memory budget overrun, failing session");
                                        *status.write() = ControllerStatus::Failed;
                                        let _ = stop_tx.send(true);
                                        bus.unsubscribe("market.price_update", subscription.id);
                                        return;
                                    }
                                }
                            }
                            Some(_) => {}
                            None => return,
                        }
                    }
                }
            }
        })
    }

    fn spawn_market_task(
        &self,
        source: Arc<dyn MarketDataSource>,
        bus: Arc<EventBus>,
        stop: tokio::sync::watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = source.run(bus, stop).await {
                error!(error = %e, "market data source exited with an error");
            }
        })
    }

    fn spawn_signal_listener(
        &self,
        order_manager: Arc<dyn OrderManager>,
        strategies: HashMap<String, StrategyConfig>,
        bus: Arc<EventBus>,
        mut stop: tokio::sync::watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut subscription = bus.subscribe("strategy.signal", "execution.signal_listener", true, None);
            loop {
                tokio::select! {
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            bus.unsubscribe("strategy.signal", subscription.id);
                            return;
                        }
                    }
                    event = subscription.receiver.recv() => {
                        match event {
                            Some(BusEvent::Signal(signal)) => {
                                let Some(config) = strategies.get(&signal.strategy_id) else { continue };
                                let resolved = crate::strategy::risk_scale::resolve_entry(
                                    &config.z1_entry,
                                    &signal.indicator_snapshot,
                                    f64::MAX,
                                );
                                let Some(resolved) = resolved else { continue };
                                let side = match signal.kind {
                                    crate::models::SignalKind::Buy => crate::models::OrderSide::Buy,
                                    crate::models::SignalKind::Sell => crate::models::OrderSide::Sell,
                                };
                                if let Err(e) = order_manager
                                    .submit_order(
                                        &signal.strategy_id,
                                        &signal.symbol,
                                        side,
                                        crate::models::OrderType::Market,
                                        resolved.notional / resolved.entry_price.max(1e-9),
                                        Some(resolved.entry_price),
                                        resolved.leverage,
                                        &signal.signal_id,
                                        config.z1_entry.timeout_seconds,
                                    )
                                    .await
                                {
                                    error!(error = %e, signal_id = %signal.signal_id, "order submission rejected");
                                }
                            }
                            Some(_) => {}
                            None => return,
                        }
                    }
                }
            }
        })
    }

    /// Reacts to `emergency.action` events published by the strategy
    /// manager: cancels whatever entry order was still pending and, if
    /// the instance holds an open position, submits an opposite-direction
    /// market order sized to the position's full quantity to flatten it.
    fn spawn_emergency_listener(
        &self,
        order_manager: Arc<dyn OrderManager>,
        bus: Arc<EventBus>,
        mut stop: tokio::sync::watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut subscription = bus.subscribe("emergency.action", "execution.emergency_listener", true, None);
            loop {
                tokio::select! {
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            bus.unsubscribe("emergency.action", subscription.id);
                            return;
                        }
                    }
                    event = subscription.receiver.recv() => {
                        match event {
                            Some(BusEvent::EmergencyAction(action)) => {
                                if action.actions.log_event {
                                    error!(
                                        strategy_id = %action.strategy_id,
                                        symbol = %action.symbol,
                                        "emergency exit: executing configured action set"
                                    );
                                }
                                if action.actions.cancel_pending {
                                    if let Some(order_id) = &action.pending_order_id {
                                        if let Err(e) = order_manager.cancel_order(order_id).await {
                                            error!(error = %e, order_id = %order_id, "emergency cancel failed");
                                        }
                                    }
                                }
                                if action.actions.close_position {
                                    if let Some(position) = order_manager.open_position(&action.strategy_id, &action.symbol) {
                                        if position.quantity > 1e-12 {
                                            let close_side = position.side.opposite();
                                            if let Err(e) = order_manager
                                                .submit_order(
                                                    &action.strategy_id,
                                                    &action.symbol,
                                                    close_side,
                                                    crate::models::OrderType::Market,
                                                    position.quantity,
                                                    Some(position.current_price),
                                                    position.leverage,
                                                    &format!("emergency_{}", action.strategy_id),
                                                    None,
                                                )
                                                .await
                                            {
                                                error!(error = %e, strategy_id = %action.strategy_id, "emergency close order rejected");
                                            }
                                        }
                                    }
                                }
                            }
                            Some(_) => {}
                            None => return,
                        }
                    }
                }
            }
        })
    }

    /// Marks `PENDING` orders that outlived their timeout as `EXPIRED`, a
    /// single sweep every 250 ms instead of a timer per order.
    fn spawn_order_expiry_sweep(
        &self,
        order_manager: Arc<dyn OrderManager>,
        mut stop: tokio::sync::watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(250));
            loop {
                tokio::select! {
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        order_manager.expire_stale_orders(Utc::now()).await;
                    }
                }
            }
        })
    }

    /// Stop the active session, if any. Tearing down takes the controller
    /// through `STOPPING` before `STOPPED`; calling this when there's no
    /// active session is a no-op, matching the idempotent-restart contract.
    pub async fn stop_session(&self) -> EngineResult<()> {
        let active = self.active.write().take();
        let Some(active) = active else {
            return Ok(());
        };

        *self.status.write() = ControllerStatus::Stopping;
        let _ = active.stop_tx.send(true);
        for task in active.tasks {
            let _ = task.await;
        }

        *self.status.write() = ControllerStatus::Stopped;
        info!(session_id = %active.session.session_id, "session stopped");
        Ok(())
    }
}

/// Indicator ids follow a `{base}_{window}s` naming convention (e.g.
/// `pump_magnitude_60s`); this recovers the window so the engine doesn't
/// need a second configuration channel just for buffer sizing.
fn parse_window_seconds(indicator_id: &str) -> f64 {
    let lower = indicator_id.to_ascii_lowercase();
    if let Some(stripped) = lower.strip_suffix('s') {
        if let Some(digits_start) = stripped.rfind(|c: char| !c.is_ascii_digit()) {
            if let Ok(value) = stripped[digits_start + 1..].parse::<f64>() {
                return value;
            }
        } else if let Ok(value) = stripped.parse::<f64>() {
            return value;
        }
    }
    60.0
}

/// Structural equality for idempotent-restart comparisons. `StrategyConfig`
/// doesn't derive `PartialEq` (several nested `f64` fields), so this
/// compares the serialised form instead — good enough for "is this the
/// exact same request" rather than numeric tolerance.
fn strategy_configs_match(a: &HashMap<String, StrategyConfig>, b: &HashMap<String, StrategyConfig>) -> bool {
    serde_json::to_value(a).ok() == serde_json::to_value(b).ok()
}

fn base_type_for(indicator_id: &str) -> String {
    let lower = indicator_id.to_ascii_lowercase();
    if lower.contains("velocity") {
        "VELOCITY".to_string()
    } else if lower.contains("volume") {
        "VOLUME_SURGE_RATIO".to_string()
    } else if lower.contains("pump") {
        "PUMP_MAGNITUDE".to_string()
    } else {
        "TWPA".to_string()
    }
}
