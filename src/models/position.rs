use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order::OrderSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Bookkeeping for an open (or closed) position in one symbol under one
/// strategy instance. Entry price is a running weighted average across
/// partial fills; realised P&L accumulates on every reduction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub session_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub realised_pnl: f64,
    pub leverage: f64,
    pub margin: f64,
    pub liquidation_price: Option<f64>,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn open(
        session_id: impl Into<String>,
        strategy_id: impl Into<String>,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: f64,
        entry_price: f64,
        leverage: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let margin = quantity * entry_price / leverage.max(1.0);
        Self {
            position_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            side,
            quantity,
            avg_entry_price: entry_price,
            current_price: entry_price,
            realised_pnl: 0.0,
            leverage,
            margin,
            liquidation_price: None,
            status: PositionStatus::Open,
            opened_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    /// Fold an additional same-direction fill into the running weighted
    /// average entry price.
    pub fn add_fill(&mut self, fill_price: f64, fill_quantity: f64, now: DateTime<Utc>) {
        let new_quantity = self.quantity + fill_quantity;
        if new_quantity > 0.0 {
            self.avg_entry_price = (self.avg_entry_price * self.quantity + fill_price * fill_quantity) / new_quantity;
        }
        self.quantity = new_quantity;
        self.margin = self.quantity * self.avg_entry_price / self.leverage.max(1.0);
        self.updated_at = now;
    }

    pub fn unrealised_pnl(&self) -> f64 {
        let direction = match self.side {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        };
        direction * (self.current_price - self.avg_entry_price) * self.quantity
    }

    pub fn mark_price(&mut self, price: f64, now: DateTime<Utc>) {
        self.current_price = price;
        self.updated_at = now;
    }

    /// Reduce the position by `close_quantity` at `exit_price`, realising
    /// P&L proportionally. Closes the position outright when the reduction
    /// exhausts the remaining quantity.
    pub fn reduce(&mut self, exit_price: f64, close_quantity: f64, now: DateTime<Utc>) {
        let direction = match self.side {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        };
        let closed = close_quantity.min(self.quantity);
        self.realised_pnl += direction * (exit_price - self.avg_entry_price) * closed;
        self.quantity -= closed;
        self.margin = self.quantity * self.avg_entry_price / self.leverage.max(1.0);
        self.updated_at = now;
        if self.quantity <= 1e-12 {
            self.status = PositionStatus::Closed;
            self.closed_at = Some(now);
        }
    }
}
