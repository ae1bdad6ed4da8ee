//! Order execution. `OrderManager` is implemented three ways — paper,
//! live, backtest — sharing the same risk checks and position bookkeeping
//! so the only thing that differs between modes is how a fill is sourced.

pub mod backtest;
pub mod live;
pub mod paper;
pub mod position;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{EngineError, EngineResult};
use crate::models::{BudgetConfig, Order, OrderSide, OrderType};

use position::PositionBook;

/// Order managers accept a signal-derived entry/close request and return
/// the created order; fills are reported back asynchronously onto the bus
/// by whichever variant produced them.
#[async_trait]
pub trait OrderManager: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn submit_order(
        &self,
        strategy_id: &str,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
        leverage: f64,
        signal_id: &str,
        timeout_seconds: Option<u64>,
    ) -> EngineResult<Order>;

    async fn cancel_order(&self, order_id: &str) -> EngineResult<()>;

    /// Current open (filled) position for `(strategy_id, symbol)`, if any.
    /// Used by the emergency-close path to size an opposite-direction
    /// market order without the caller needing its own copy of the book.
    fn open_position(&self, strategy_id: &str, symbol: &str) -> Option<crate::models::Position>;

    /// Mark any order still `PENDING` past its timeout as `EXPIRED` and
    /// return the updated orders. Called by a single periodic sweep
    /// instead of a per-order timer. Paper and backtest fills are
    /// synchronous, so this is a no-op for them; live orders can sit
    /// `PENDING` while an exchange works a limit order.
    async fn expire_stale_orders(&self, _now: chrono::DateTime<Utc>) -> Vec<Order> {
        Vec::new()
    }
}

/// Checked before every entry order: the session-wide budget cap, the
/// strategy's own allocation (if one is configured), and total exposure
/// across all open positions.
pub fn check_risk(
    budget: &BudgetConfig,
    strategy_id: &str,
    requested_margin: f64,
    book: &PositionBook,
) -> EngineResult<()> {
    let total_margin_in_use = book.total_margin_in_use();
    if total_margin_in_use + requested_margin > budget.global_cap {
        return Err(EngineError::invariant(format!(
            "global budget cap {} exceeded: {} in use + {} requested",
            budget.global_cap, total_margin_in_use, requested_margin
        )));
    }

    if let Some(max_margin) = budget.allocation_for(strategy_id) {
        let strategy_margin_in_use: f64 = book
            .open_positions()
            .iter()
            .filter(|p| p.strategy_id == strategy_id)
            .map(|p| p.margin)
            .sum();
        if strategy_margin_in_use + requested_margin > max_margin {
            return Err(EngineError::invariant(format!(
                "strategy {} allocation {} exceeded: {} in use + {} requested",
                strategy_id, max_margin, strategy_margin_in_use, requested_margin
            )));
        }
    }

    Ok(())
}

pub fn next_attempt_number(previous_attempts: u32) -> u32 {
    previous_attempts + 1
}

pub fn now_order_timestamp() -> chrono::DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StrategyAllocation;

    #[test]
    fn rejects_when_global_cap_would_be_exceeded() {
        let budget = BudgetConfig {
            global_cap: 100.0,
            allocations: vec![],
        };
        let book = PositionBook::new();
        assert!(check_risk(&budget, "strat_1", 150.0, &book).is_err());
    }

    #[test]
    fn rejects_when_strategy_allocation_would_be_exceeded() {
        let budget = BudgetConfig {
            global_cap: 1000.0,
            allocations: vec![StrategyAllocation {
                strategy_id: "strat_1".to_string(),
                max_margin: 50.0,
            }],
        };
        let book = PositionBook::new();
        assert!(check_risk(&budget, "strat_1", 75.0, &book).is_err());
        assert!(check_risk(&budget, "strat_1", 25.0, &book).is_ok());
    }
}
