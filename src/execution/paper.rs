//! Paper order manager: orders sit `PENDING` until the *next* tick for
//! their symbol arrives, then fill against that tick's price with
//! symmetric slippage. No network calls, no partial fills.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::bus::{BusEvent, EventBus};
use crate::error::{EngineError, EngineResult};
use crate::models::{BudgetConfig, MarketTick, Order, OrderSide, OrderType};

use super::position::PositionBook;
use super::{check_risk, OrderManager};

#[derive(Default)]
pub struct PaperExecutionStats {
    pub orders_filled: AtomicU64,
    pub orders_rejected: AtomicU64,
    pub attempt_counter: AtomicU32,
}

/// An order waiting for the next tick on its symbol, plus the bookkeeping
/// the eventual fill needs that [`Order`] itself doesn't carry.
struct PendingPaperOrder {
    order: Order,
    leverage: f64,
    closing: bool,
}

pub struct PaperOrderManager {
    session_id: String,
    budget: BudgetConfig,
    slippage: f64,
    book: RwLock<PositionBook>,
    bus: Arc<EventBus>,
    stats: PaperExecutionStats,
    pending: RwLock<Vec<PendingPaperOrder>>,
}

impl PaperOrderManager {
    pub fn new(session_id: impl Into<String>, budget: BudgetConfig, slippage: f64, bus: Arc<EventBus>) -> Self {
        Self {
            session_id: session_id.into(),
            budget,
            slippage,
            book: RwLock::new(PositionBook::new()),
            bus,
            stats: PaperExecutionStats::default(),
            pending: RwLock::new(Vec::new()),
        }
    }

    fn slipped_price(&self, side: OrderSide, reference_price: f64) -> f64 {
        match side {
            OrderSide::Buy => reference_price * (1.0 + self.slippage),
            OrderSide::Sell => reference_price * (1.0 - self.slippage),
        }
    }

    fn is_closing_side(&self, strategy_id: &str, symbol: &str, side: OrderSide) -> bool {
        self.book
            .read()
            .get(strategy_id, symbol)
            .map(|p| p.side != side)
            .unwrap_or(false)
    }

    /// Subscribes to `market.price_update` and fills every order pending
    /// on a symbol the moment a tick for that symbol arrives — the paper
    /// fill source is the next tick, never the reference price the order
    /// was created with.
    pub async fn run(self: Arc<Self>, mut stop: tokio::sync::watch::Receiver<bool>) {
        let mut ticks = self.bus.subscribe("market.price_update", "paper_order_manager.ticks", true, None);
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        self.bus.unsubscribe("market.price_update", ticks.id);
                        return;
                    }
                }
                event = ticks.receiver.recv() => {
                    match event {
                        Some(BusEvent::MarketTick(tick)) => self.fill_pending_on_tick(&tick).await,
                        Some(_) => {}
                        None => return,
                    }
                }
            }
        }
    }

    async fn fill_pending_on_tick(&self, tick: &MarketTick) {
        let due: Vec<PendingPaperOrder> = {
            let mut pending = self.pending.write();
            let (due, rest): (Vec<_>, Vec<_>) = pending.drain(..).partition(|p| p.order.symbol == tick.symbol);
            *pending = rest;
            due
        };

        for mut pending in due {
            let fill_price = self.slipped_price(pending.order.side, tick.price);
            pending.order.mark_filled(fill_price, pending.order.quantity, tick.timestamp);
            self.stats.orders_filled.fetch_add(1, Ordering::Relaxed);
            self.bus.publish(BusEvent::OrderUpdate(pending.order.clone())).await.ok();

            let position = if pending.closing {
                let mut book = self.book.write();
                book.apply_close_fill(
                    &pending.order.strategy_id,
                    &pending.order.symbol,
                    fill_price,
                    pending.order.quantity,
                    tick.timestamp,
                )
            } else {
                let mut book = self.book.write();
                Some(book.apply_open_fill(
                    &self.session_id,
                    &pending.order.strategy_id,
                    &pending.order.symbol,
                    pending.order.side,
                    pending.order.quantity,
                    fill_price,
                    pending.leverage,
                    tick.timestamp,
                ))
            };
            if let Some(position) = position {
                self.bus.publish(BusEvent::PositionUpdate(position)).await.ok();
            }
        }
    }
}

#[async_trait]
impl OrderManager for PaperOrderManager {
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
        let reference_price = price.ok_or_else(|| EngineError::invariant("paper order requires a reference price"))?;
        if reference_price <= 0.0 || reference_price.is_nan() {
            return Err(EngineError::invariant("paper order reference price must be positive"));
        }

        let closing = self.is_closing_side(strategy_id, symbol, side);

        if !closing {
            let requested_margin = quantity * reference_price / leverage.max(1.0);
            if let Err(e) = check_risk(&self.budget, strategy_id, requested_margin, &self.book.read()) {
                self.stats.orders_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        }

        let attempt = self.stats.attempt_counter.fetch_add(1, Ordering::Relaxed);
        let now = super::now_order_timestamp();
        let order = Order::new(
            self.session_id.clone(),
            strategy_id,
            symbol,
            side,
            order_type,
            quantity,
            Some(reference_price),
            signal_id,
            attempt,
            now,
            timeout_seconds,
        );

        self.bus.publish(BusEvent::OrderUpdate(order.clone())).await.ok();
        self.pending.write().push(PendingPaperOrder { order: order.clone(), leverage, closing });

        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str) -> EngineResult<()> {
        self.pending.write().retain(|p| p.order.order_id != order_id);
        Ok(())
    }

    fn open_position(&self, strategy_id: &str, symbol: &str) -> Option<crate::models::Position> {
        self.book.read().get(strategy_id, symbol).cloned()
    }

    async fn expire_stale_orders(&self, now: DateTime<Utc>) -> Vec<Order> {
        let mut pending = self.pending.write();
        let (stale, still_pending): (Vec<_>, Vec<_>) = pending.drain(..).partition(|p| p.order.is_stale(now));
        *pending = still_pending;
        drop(pending);

        let mut expired = Vec::with_capacity(stale.len());
        for mut p in stale {
            p.order.mark_expired(now);
            self.bus.publish(BusEvent::OrderUpdate(p.order.clone())).await.ok();
            expired.push(p.order);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tick;

    #[tokio::test]
    async fn opening_order_stays_pending_until_the_next_tick_fills_it() {
        let bus = Arc::new(EventBus::new(16, 50));
        let budget = BudgetConfig {
            global_cap: 10_000.0,
            allocations: vec![],
        };
        let manager = Arc::new(PaperOrderManager::new("sess_1", budget, 0.001, bus.clone()));

        let order = manager
            .submit_order("strat_1", "BTCUSDT", OrderSide::Buy, OrderType::Market, 1.0, Some(100.0), 1.0, "sig_1", None)
            .await
            .unwrap();
        assert_eq!(order.status, crate::models::OrderStatus::Pending);
        assert!(manager.open_position("strat_1", "BTCUSDT").is_none());

        let tick = MarketTick::new("sess_1", "BTCUSDT", Tick { timestamp: Utc::now(), price: 105.0, volume: 1.0 });
        manager.fill_pending_on_tick(&tick).await;

        let position = manager.open_position("strat_1", "BTCUSDT").expect("fill should have opened a position");
        assert!((position.avg_entry_price - 105.0 * 1.001).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rejects_order_that_exceeds_budget() {
        let bus = Arc::new(EventBus::new(16, 50));
        let budget = BudgetConfig {
            global_cap: 50.0,
            allocations: vec![],
        };
        let manager = PaperOrderManager::new("sess_1", budget, 0.0, bus);

        let result = manager
            .submit_order("strat_1", "BTCUSDT", OrderSide::Buy, OrderType::Market, 1.0, Some(100.0), 1.0, "sig_1", None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn order_past_its_timeout_expires_without_ever_filling() {
        let bus = Arc::new(EventBus::new(16, 50));
        let budget = BudgetConfig {
            global_cap: 10_000.0,
            allocations: vec![],
        };
        let manager = PaperOrderManager::new("sess_1", budget, 0.0, bus);

        manager
            .submit_order("strat_1", "BTCUSDT", OrderSide::Buy, OrderType::Market, 1.0, Some(100.0), 1.0, "sig_1", Some(30))
            .await
            .unwrap();

        let expired = manager.expire_stale_orders(Utc::now() + chrono::Duration::seconds(31)).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, crate::models::OrderStatus::Expired);
        assert!(manager.open_position("strat_1", "BTCUSDT").is_none());
    }
}
