//! In-process publish/subscribe event bus.
//!
//! Every component in the engine talks to every other component through
//! this bus rather than by holding direct references to one another. Each
//! subscriber gets its own bounded `tokio::mpsc` queue so a slow consumer
//! cannot starve the others' ordering; delivery to any one subscriber is
//! strictly FIFO.

pub mod event;

pub use event::BusEvent;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::EngineResult;

const UNHEALTHY_ERROR_THRESHOLD: u32 = 3;
const UNHEALTHY_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberHealth {
    Healthy,
    Unhealthy,
}

pub type SubscriptionId = u64;

struct Subscriber {
    id: SubscriptionId,
    name: String,
    /// Trading-critical subscribers (order manager, persistence sinks) are
    /// never dropped: `publish` awaits their queue instead of timing out.
    critical: bool,
    sender: mpsc::Sender<BusEvent>,
    recent_error_times: Vec<std::time::Instant>,
    health: SubscriberHealth,
}

pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<String, Vec<Subscriber>>>>,
    next_id: AtomicU64,
    default_queue_size: usize,
    publish_timeout: Duration,
}

pub struct Subscription {
    pub id: SubscriptionId,
    pub topic: String,
    pub receiver: mpsc::Receiver<BusEvent>,
}

impl EventBus {
    pub fn new(default_queue_size: usize, publish_timeout_ms: u64) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            default_queue_size,
            publish_timeout: Duration::from_millis(publish_timeout_ms),
        }
    }

    /// Register a new subscriber for `topic`. `queue_size` overrides the
    /// bus default; `critical` subscribers are never dropped under
    /// back-pressure — `publish` blocks for them instead of timing out.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        name: impl Into<String>,
        critical: bool,
        queue_size: Option<usize>,
    ) -> Subscription {
        let topic = topic.into();
        let (tx, rx) = mpsc::channel(queue_size.unwrap_or(self.default_queue_size));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let sub = Subscriber {
            id,
            name: name.into(),
            critical,
            sender: tx,
            recent_error_times: Vec::new(),
            health: SubscriberHealth::Healthy,
        };
        self.subscribers
            .write()
            .entry(topic.clone())
            .or_insert_with(Vec::new)
            .push(sub);
        Subscription {
            id,
            topic,
            receiver: rx,
        }
    }

    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        if let Some(subs) = self.subscribers.write().get_mut(topic) {
            subs.retain(|s| s.id != id);
        }
    }

    /// Deliver `event` to every subscriber of its topic. Critical
    /// subscribers are awaited without a timeout; non-critical subscribers
    /// are given up to the bus's configured publish timeout and dropped
    /// (counted as an error) if they don't drain in time.
    pub async fn publish(&self, event: BusEvent) -> EngineResult<()> {
        let topic = event.topic();
        let senders: Vec<(SubscriptionId, bool, mpsc::Sender<BusEvent>)> = {
            let guard = self.subscribers.read();
            match guard.get(topic) {
                Some(subs) => subs
                    .iter()
                    .map(|s| (s.id, s.critical, s.sender.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };

        for (id, critical, sender) in senders {
            let outcome = if critical {
                sender.send(event.clone()).await.map_err(|_| ())
            } else {
                tokio::time::timeout(self.publish_timeout, sender.send(event.clone()))
                    .await
                    .map_err(|_| ())
                    .and_then(|inner| inner.map_err(|_| ()))
            };
            if outcome.is_err() {
                if let Some((name, errors)) = self.record_error(topic, id) {
                    let event = health_event(name, topic.to_string(), false, errors);
                    // New topic, no risk of looping back into this same
                    // delivery pass; subscribers of "system.health" (if
                    // any) see it on their own next poll.
                    Box::pin(self.publish(event)).await.ok();
                }
            } else {
                self.record_success(topic, id);
            }
        }
        Ok(())
    }

    /// Returns `Some((subscriber_name, consecutive_errors))` the moment a
    /// subscriber crosses the unhealthy threshold, so the caller can
    /// surface exactly one `system.health` event per transition rather
    /// than one per subsequent error.
    fn record_error(&self, topic: &str, id: SubscriptionId) -> Option<(String, u32)> {
        let mut guard = self.subscribers.write();
        if let Some(subs) = guard.get_mut(topic) {
            if let Some(sub) = subs.iter_mut().find(|s| s.id == id) {
                let now = std::time::Instant::now();
                sub.recent_error_times.push(now);
                sub.recent_error_times
                    .retain(|t| now.duration_since(*t) <= UNHEALTHY_WINDOW);
                if sub.recent_error_times.len() as u32 >= UNHEALTHY_ERROR_THRESHOLD
                    && sub.health == SubscriberHealth::Healthy
                {
                    sub.health = SubscriberHealth::Unhealthy;
                    let errors = sub.recent_error_times.len() as u32;
                    warn!(
                        subscriber = %sub.name,
                        topic = %topic,
                        "subscriber marked unhealthy after {} errors in {}s",
                        errors,
                        UNHEALTHY_WINDOW.as_secs()
                    );
                    return Some((sub.name.clone(), errors));
                }
            }
        }
        None
    }

    fn record_success(&self, topic: &str, id: SubscriptionId) {
        let mut guard = self.subscribers.write();
        if let Some(subs) = guard.get_mut(topic) {
            if let Some(sub) = subs.iter_mut().find(|s| s.id == id) {
                sub.recent_error_times.clear();
                sub.health = SubscriberHealth::Healthy;
            }
        }
    }

    pub fn health_of(&self, topic: &str, id: SubscriptionId) -> Option<SubscriberHealth> {
        self.subscribers
            .read()
            .get(topic)
            .and_then(|subs| subs.iter().find(|s| s.id == id))
            .map(|s| s.health)
    }

    /// Drop every subscriber across every topic. Called once by the
    /// controller during session teardown; subsequent `publish` calls
    /// become no-ops since there's nobody left to deliver to.
    pub fn shutdown(&self) {
        self.subscribers.write().clear();
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.read().get(topic).map(|s| s.len()).unwrap_or(0)
    }
}

pub fn health_event(subscriber_name: impl Into<String>, topic: impl Into<String>, healthy: bool, consecutive_errors: u32) -> BusEvent {
    BusEvent::SystemHealth(event::SystemHealthEvent {
        subscriber_name: subscriber_name.into(),
        topic: topic.into(),
        healthy,
        consecutive_errors,
        at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MarketTick, Tick};

    fn sample_tick() -> BusEvent {
        BusEvent::MarketTick(MarketTick::new(
            "sess_1",
            "BTCUSDT",
            Tick {
                timestamp: Utc::now(),
                price: 100.0,
                volume: 1.0,
            },
        ))
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers_of_a_topic() {
        let bus = EventBus::new(16, 50);
        let mut sub_a = bus.subscribe("market.price_update", "a", false, None);
        let mut sub_b = bus.subscribe("market.price_update", "b", false, None);

        bus.publish(sample_tick()).await.unwrap();

        assert!(sub_a.receiver.recv().await.is_some());
        assert!(sub_b.receiver.recv().await.is_some());
    }

    #[tokio::test]
    async fn non_critical_subscriber_is_marked_unhealthy_after_three_drops() {
        let bus = EventBus::new(1, 1);
        let sub = bus.subscribe("market.price_update", "slow", false, Some(1));

        // Fill the queue, then force three timeouts without draining it.
        bus.publish(sample_tick()).await.unwrap();
        bus.publish(sample_tick()).await.unwrap();
        bus.publish(sample_tick()).await.unwrap();
        bus.publish(sample_tick()).await.unwrap();

        assert_eq!(bus.health_of("market.price_update", sub.id), Some(SubscriberHealth::Unhealthy));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(16, 50);
        let sub = bus.subscribe("market.price_update", "a", false, None);
        bus.unsubscribe("market.price_update", sub.id);
        assert_eq!(bus.subscriber_count("market.price_update"), 0);
    }
}
