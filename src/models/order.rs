use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Filled,
    PartiallyFilled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

/// One request submitted to an order manager. `client_order_id` is the
/// idempotency key handed to live exchanges: `{signal_id}:{attempt}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub client_order_id: String,
    pub session_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub filled_quantity: f64,
    pub avg_fill_price: Option<f64>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub realised_pnl: Option<f64>,
    /// Enforced by a periodic sweep in the order manager rather than a
    /// per-order timer. `None` means the order never expires on its own
    /// (e.g. emergency-close orders, which must land or be retried).
    pub timeout_seconds: Option<u64>,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        strategy_id: impl Into<String>,
        symbol: impl Into<String>,
        side: OrderSide,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
        signal_id: &str,
        attempt: u32,
        now: DateTime<Utc>,
        timeout_seconds: Option<u64>,
    ) -> Self {
        Self {
            order_id: Uuid::new_v4().to_string(),
            client_order_id: format!("{}:{}", signal_id, attempt),
            session_id: session_id.into(),
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            side,
            order_type,
            quantity,
            price,
            filled_quantity: 0.0,
            avg_fill_price: None,
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
            realised_pnl: None,
            timeout_seconds,
        }
    }

    /// Whether this order has sat `PENDING` past its configured timeout.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.timeout_seconds) {
            (OrderStatus::Pending, Some(timeout)) => {
                now.signed_duration_since(self.created_at).num_seconds() >= timeout as i64
            }
            _ => false,
        }
    }

    pub fn mark_filled(&mut self, fill_price: f64, fill_quantity: f64, now: DateTime<Utc>) {
        let prior_notional = self.avg_fill_price.unwrap_or(0.0) * self.filled_quantity;
        let new_notional = prior_notional + fill_price * fill_quantity;
        self.filled_quantity += fill_quantity;
        if self.filled_quantity > 0.0 {
            self.avg_fill_price = Some(new_notional / self.filled_quantity);
        }
        self.status = if self.filled_quantity + 1e-12 >= self.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.updated_at = now;
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = OrderStatus::Cancelled;
        self.updated_at = now;
    }

    pub fn mark_rejected(&mut self, now: DateTime<Utc>) {
        self.status = OrderStatus::Rejected;
        self.updated_at = now;
    }

    pub fn mark_expired(&mut self, now: DateTime<Utc>) {
        self.status = OrderStatus::Expired;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn order_with_timeout(timeout_seconds: Option<u64>, created_at: DateTime<Utc>) -> Order {
        Order::new(
            "sess_1",
            "strat_1",
            "BTCUSDT",
            OrderSide::Buy,
            OrderType::Market,
            1.0,
            Some(100.0),
            "sig_1",
            0,
            created_at,
            timeout_seconds,
        )
    }

    #[test]
    fn order_without_a_timeout_never_goes_stale() {
        let order = order_with_timeout(None, Utc::now() - Duration::days(1));
        assert!(!order.is_stale(Utc::now()));
    }

    #[test]
    fn pending_order_is_stale_once_its_timeout_elapses() {
        let created_at = Utc::now() - Duration::seconds(61);
        let order = order_with_timeout(Some(60), created_at);
        assert!(order.is_stale(Utc::now()));
    }

    #[test]
    fn filled_order_is_never_stale_regardless_of_age() {
        let created_at = Utc::now() - Duration::seconds(61);
        let mut order = order_with_timeout(Some(60), created_at);
        order.mark_filled(100.0, 1.0, Utc::now());
        assert!(!order.is_stale(Utc::now()));
    }
}
