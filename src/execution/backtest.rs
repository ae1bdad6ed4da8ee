//! Backtest order manager. Fill semantics are identical to the paper
//! manager — same slippage model, same synchronous fills — the only
//! difference is that ticks come from [`crate::market::replay`] instead of
//! a live feed, which the controller wires up rather than this type.

use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::EventBus;
use crate::error::EngineResult;
use crate::models::{BudgetConfig, Order, OrderSide, OrderType};

use super::paper::PaperOrderManager;
use super::OrderManager;

pub struct BacktestOrderManager {
    inner: Arc<PaperOrderManager>,
}

impl BacktestOrderManager {
    pub fn new(session_id: impl Into<String>, budget: BudgetConfig, slippage: f64, bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(PaperOrderManager::new(session_id, budget, slippage, bus)),
        }
    }

    /// Fills are sourced from the replayed tick stream the same way paper
    /// mode sources them from the live feed — same listener, same
    /// next-tick fill semantics, just fed by [`crate::market::replay`].
    pub async fn run(self: Arc<Self>, stop: tokio::sync::watch::Receiver<bool>) {
        self.inner.clone().run(stop).await
    }
}

#[async_trait]
impl OrderManager for BacktestOrderManager {
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
    ) -> EngineResult<Order> {
        self.inner
            .submit_order(strategy_id, symbol, side, order_type, quantity, price, leverage, signal_id, timeout_seconds)
            .await
    }

    async fn cancel_order(&self, order_id: &str) -> EngineResult<()> {
        self.inner.cancel_order(order_id).await
    }

    fn open_position(&self, strategy_id: &str, symbol: &str) -> Option<crate::models::Position> {
        self.inner.open_position(strategy_id, symbol)
    }
}
