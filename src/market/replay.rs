//! Backtest replay source: re-plays previously captured ticks from the
//! persistence store at a configurable speed-up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::bus::{BusEvent, EventBus};
use crate::error::{EngineError, EngineResult};
use crate::persistence::Store;

use super::MarketDataSource;

/// Replay speed is hard-capped at 100x regardless of what a session
/// config requests, so a careless operator can't starve the rest of the
/// engine's async runtime with a tight tick-publish loop.
pub const MAX_ACCELERATION_FACTOR: f64 = 100.0;

pub struct ReplayMarketSource {
    session_id: String,
    symbols: Vec<String>,
    acceleration_factor: f64,
    store: Arc<dyn Store>,
}

impl ReplayMarketSource {
    pub fn new(
        session_id: impl Into<String>,
        symbols: Vec<String>,
        acceleration_factor: f64,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            symbols,
            acceleration_factor: acceleration_factor.clamp(0.01, MAX_ACCELERATION_FACTOR),
            store,
        }
    }
}

#[async_trait]
impl MarketDataSource for ReplayMarketSource {
    async fn run(&self, bus: Arc<EventBus>, mut stop: tokio::sync::watch::Receiver<bool>) -> EngineResult<()> {
        let ticks = self
            .store
            .load_ticks(&self.session_id, &self.symbols)
            .await
            .map_err(|e| EngineError::transient("replay_source", e.to_string()))?;

        info!(count = ticks.len(), factor = self.acceleration_factor, "replay starting");

        let mut previous_timestamp = None;
        for tick in ticks {
            if *stop.borrow() {
                return Ok(());
            }
            if let Some(prev) = previous_timestamp {
                let real_gap = tick.timestamp.signed_duration_since(prev).num_milliseconds().max(0) as f64;
                let sped_up = real_gap / self.acceleration_factor;
                if sped_up > 0.0 {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(sped_up as u64)) => {}
                        _ = stop.changed() => {
                            if *stop.borrow() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
            previous_timestamp = Some(tick.timestamp);
            bus.publish(BusEvent::MarketTick(tick)).await.ok();
        }
        Ok(())
    }
}
