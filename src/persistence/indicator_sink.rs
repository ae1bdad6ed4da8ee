//! Batches indicator values off the bus before writing them to the store.
//! Indicator values are high-volume and not trading-critical, so this
//! sink subscribes non-critically and accepts occasional drops under
//! back-pressure rather than blocking the publisher.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::bus::{BusEvent, EventBus};
use crate::persistence::Store;

const FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const FLUSH_BATCH_SIZE: usize = 200;

pub async fn run(bus: Arc<EventBus>, store: Arc<dyn Store>, mut stop: tokio::sync::watch::Receiver<bool>) {
    let mut subscription = bus.subscribe("indicator.value", "indicator_sink", false, Some(4096));
    let mut buffer = Vec::with_capacity(FLUSH_BATCH_SIZE);
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    if !buffer.is_empty() {
                        flush(&store, &mut buffer).await;
                    }
                    bus.unsubscribe("indicator.value", subscription.id);
                    return;
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&store, &mut buffer).await;
                }
            }
            event = subscription.receiver.recv() => {
                match event {
                    Some(BusEvent::IndicatorValue(value)) => {
                        buffer.push(value);
                        if buffer.len() >= FLUSH_BATCH_SIZE {
                            flush(&store, &mut buffer).await;
                        }
                    }
                    Some(_) => {}
                    None => return,
                }
            }
        }
    }
}

async fn flush(store: &Arc<dyn Store>, buffer: &mut Vec<crate::models::IndicatorValue>) {
    if let Err(e) = store.insert_indicator_values_batch(buffer).await {
        warn!(error = %e, count = buffer.len(), "indicator sink flush failed");
    }
    buffer.clear();
}
