//! Live order manager. Talks to the exchange's REST order endpoint over
//! HMAC-signed requests and reports fills back onto the bus once the
//! exchange acknowledges them. Retries are safe because every attempt of
//! the same order reuses `client_order_id = "{signal_id}:{attempt}"` —
//! the exchange treats a resubmission with the same id as a no-op.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{error, warn};

use crate::bus::{BusEvent, EventBus};
use crate::error::{EngineError, EngineResult};
use crate::models::{BudgetConfig, Order, OrderSide, OrderStatus, OrderType};

use super::position::PositionBook;
use super::{check_risk, OrderManager};

type HmacSha256 = Hmac<Sha256>;

const MAX_SUBMIT_ATTEMPTS: u32 = 3;

pub struct LiveOrderManager {
    session_id: String,
    api_base: String,
    api_key: String,
    api_secret: String,
    budget: BudgetConfig,
    book: RwLock<PositionBook>,
    bus: Arc<EventBus>,
    http: reqwest::Client,
    attempt_counter: AtomicU32,
    /// Orders the exchange acknowledged but hasn't filled yet, checked by
    /// the periodic expiry sweep instead of a per-order timer.
    pending: RwLock<Vec<Order>>,
}

impl LiveOrderManager {
    pub fn new(
        session_id: impl Into<String>,
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        budget: BudgetConfig,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            api_base: api_base.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            budget,
            book: RwLock::new(PositionBook::new()),
            bus,
            http: reqwest::Client::new(),
            attempt_counter: AtomicU32::new(0),
            pending: RwLock::new(Vec::new()),
        }
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn place_order_request(&self, order: &Order) -> EngineResult<ExchangeAck> {
        let payload = format!(
            "symbol={}&side={:?}&quantity={}&price={}&clientOrderId={}",
            order.symbol,
            order.side,
            order.quantity,
            order.price.unwrap_or_default(),
            order.client_order_id,
        );
        let signature = self.sign(&payload);
        let url = format!("{}/order?{}&signature={}", self.api_base, payload, signature);

        let mut last_err = None;
        for attempt in 0..MAX_SUBMIT_ATTEMPTS {
            match self
                .http
                .post(&url)
                .header("X-API-KEY", &self.api_key)
                .timeout(Duration::from_secs(5))
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<ExchangeAck>()
                        .await
                        .map_err(|e| EngineError::transient("live_order_manager", e.to_string()));
                }
                Ok(response) => {
                    warn!(attempt, status = %response.status(), "order submission rejected by exchange");
                    last_err = Some(format!("http status {}", response.status()));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "order submission request failed");
                    last_err = Some(e.to_string());
                }
            }
        }
        Err(EngineError::transient(
            "live_order_manager",
            last_err.unwrap_or_else(|| "exhausted retries".to_string()),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct ExchangeAck {
    #[serde(rename = "orderId")]
    #[allow(dead_code)]
    order_id: String,
    status: String,
    #[serde(rename = "avgPrice")]
    avg_price: Option<f64>,
    #[serde(rename = "executedQty")]
    executed_qty: Option<f64>,
}

#[async_trait]
impl OrderManager for LiveOrderManager {
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
        let closing = self
            .book
            .read()
            .get(strategy_id, symbol)
            .map(|p| p.side != side)
            .unwrap_or(false);

        if !closing {
            let reference_price = price.unwrap_or(0.0);
            let requested_margin = quantity * reference_price / leverage.max(1.0);
            check_risk(&self.budget, strategy_id, requested_margin, &self.book.read())?;
        }

        let attempt = self.attempt_counter.fetch_add(1, Ordering::Relaxed);
        let now = super::now_order_timestamp();
        let mut order = Order::new(
            self.session_id.clone(),
            strategy_id,
            symbol,
            side,
            order_type,
            quantity,
            price,
            signal_id,
            attempt,
            now,
            timeout_seconds,
        );

        match self.place_order_request(&order).await {
            Ok(ack) => {
                if ack.status.eq_ignore_ascii_case("filled") {
                    let fill_price = ack.avg_price.or(price).unwrap_or(0.0);
                    let fill_qty = ack.executed_qty.unwrap_or(quantity);
                    order.mark_filled(fill_price, fill_qty, now);

                    let position = if closing {
                        self.book.write().apply_close_fill(strategy_id, symbol, fill_price, fill_qty, now)
                    } else {
                        Some(self.book.write().apply_open_fill(
                            &self.session_id,
                            strategy_id,
                            symbol,
                            side,
                            fill_qty,
                            fill_price,
                            leverage,
                            now,
                        ))
                    };
                    if let Some(position) = position {
                        self.bus.publish(BusEvent::PositionUpdate(position)).await.ok();
                    }
                } else {
                    order.status = OrderStatus::Pending;
                    self.pending.write().push(order.clone());
                }
            }
            Err(e) => {
                error!(error = %e, order_id = %order.order_id, "order submission failed after retries");
                order.mark_rejected(now);
            }
        }

        self.bus.publish(BusEvent::OrderUpdate(order.clone())).await.ok();
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str) -> EngineResult<()> {
        self.pending.write().retain(|o| o.order_id != order_id);
        let url = format!("{}/order/{}/cancel", self.api_base, order_id);
        self.http
            .post(&url)
            .header("X-API-KEY", &self.api_key)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| EngineError::transient("live_order_manager", e.to_string()))?;
        Ok(())
    }

    fn open_position(&self, strategy_id: &str, symbol: &str) -> Option<crate::models::Position> {
        self.book.read().get(strategy_id, symbol).cloned()
    }

    async fn expire_stale_orders(&self, now: DateTime<Utc>) -> Vec<Order> {
        let mut pending = self.pending.write();
        let (stale, still_pending): (Vec<Order>, Vec<Order>) = pending.drain(..).partition(|o| o.is_stale(now));
        *pending = still_pending;
        drop(pending);

        let mut expired = Vec::with_capacity(stale.len());
        for mut order in stale {
            order.mark_expired(now);
            warn!(order_id = %order.order_id, "order expired after exceeding its timeout unfilled");
            self.bus.publish(BusEvent::OrderUpdate(order.clone())).await.ok();
            expired.push(order);
        }
        expired
    }
}
