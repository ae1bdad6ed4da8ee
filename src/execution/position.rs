//! In-memory position book shared by every order manager variant. Entry
//! price is a running weighted average across fills; realised P&L
//! accumulates on every reduction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::{OrderSide, Position};

#[derive(Default)]
pub struct PositionBook {
    positions: HashMap<(String, String), Position>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, strategy_id: &str, symbol: &str) -> Option<&Position> {
        self.positions.get(&(strategy_id.to_string(), symbol.to_string()))
    }

    /// Apply a fill on the open side: opens a new position or folds into
    /// the existing one's weighted-average entry price.
    pub fn apply_open_fill(
        &mut self,
        session_id: &str,
        strategy_id: &str,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        leverage: f64,
        now: DateTime<Utc>,
    ) -> Position {
        let key = (strategy_id.to_string(), symbol.to_string());
        let position = self.positions.entry(key).or_insert_with(|| {
            Position::open(session_id, strategy_id, symbol, side, 0.0, price, leverage, now)
        });
        position.add_fill(price, quantity, now);
        position.clone()
    }

    /// Apply a fill that reduces (or fully closes) the open position.
    pub fn apply_close_fill(&mut self, strategy_id: &str, symbol: &str, price: f64, quantity: f64, now: DateTime<Utc>) -> Option<Position> {
        let key = (strategy_id.to_string(), symbol.to_string());
        let position = self.positions.get_mut(&key)?;
        position.reduce(price, quantity, now);
        Some(position.clone())
    }

    pub fn mark_to_market(&mut self, symbol: &str, price: f64, now: DateTime<Utc>) {
        for position in self.positions.values_mut().filter(|p| p.symbol == symbol) {
            position.mark_price(price, now);
        }
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.positions.values().filter(|p| p.quantity > 1e-12).cloned().collect()
    }

    pub fn total_margin_in_use(&self) -> f64 {
        self.open_positions().iter().map(|p| p.margin).sum()
    }
}
