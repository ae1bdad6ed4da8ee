use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::strategy::StrategyConfig;

/// One of the four session modes. `Collect` runs the market data source and
/// indicator/persistence pipeline without a strategy manager or order
/// manager attached — used to build up a replay-able tick history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Paper,
    Live,
    Backtest,
    Collect,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Paper => "paper",
            SessionMode::Live => "live",
            SessionMode::Backtest => "backtest",
            SessionMode::Collect => "collect",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Per-strategy budget allocation out of the session-wide cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyAllocation {
    pub strategy_id: String,
    pub max_margin: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub global_cap: f64,
    #[serde(default)]
    pub allocations: Vec<StrategyAllocation>,
}

impl BudgetConfig {
    pub fn allocation_for(&self, strategy_id: &str) -> Option<f64> {
        self.allocations
            .iter()
            .find(|a| a.strategy_id == strategy_id)
            .map(|a| a.max_margin)
    }
}

/// Immutable configuration handed to the Execution Controller at
/// `start_session` time. Never mutated for the lifetime of the session;
/// every component downstream receives it (or the slice it needs) through
/// constructor arguments rather than reading globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub budget: BudgetConfig,
    /// Replay speed-up for backtest mode; ignored otherwise. Hard-capped at 100x.
    #[serde(default = "default_acceleration_factor")]
    pub acceleration_factor: f64,
    /// Symmetric slippage applied to paper/backtest synthetic fills.
    #[serde(default = "default_slippage")]
    pub slippage: f64,
    /// Whether `stop_session` should close open positions before shutting down.
    #[serde(default)]
    pub close_on_stop: bool,
    /// Numeric comparison epsilon for `==`/`!=` condition operators.
    #[serde(default = "default_epsilon")]
    pub comparison_epsilon: f64,
}

fn default_acceleration_factor() -> f64 {
    1.0
}

fn default_slippage() -> f64 {
    0.0005
}

fn default_epsilon() -> f64 {
    1e-9
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            budget: BudgetConfig {
                global_cap: 0.0,
                allocations: Vec::new(),
            },
            acceleration_factor: default_acceleration_factor(),
            slippage: default_slippage(),
            close_on_stop: false,
            comparison_epsilon: default_epsilon(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub mode: SessionMode,
    pub symbols: Vec<String>,
    pub strategy_config: HashMap<String, StrategyConfig>,
    pub config: SessionConfig,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    /// `{mode}_{YYYYMMDD_HHMMSS}_{rand}` per the pinned session id format.
    pub fn generate_id(mode: SessionMode, now: DateTime<Utc>) -> String {
        let rand_suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
        format!(
            "{}_{}_{:06}",
            mode.as_str(),
            now.format("%Y%m%d_%H%M%S"),
            rand_suffix
        )
    }
}
