//! Live exchange websocket source. Reconnects with exponential backoff and
//! tracks per-symbol sequence gaps so a dropped connection is visible in
//! the engine's own health signal rather than silently losing ticks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::bus::{BusEvent, EventBus};
use crate::error::EngineResult;
use crate::models::{MarketTick, Tick};

use super::MarketDataSource;

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Default)]
struct SymbolState {
    last_sequence: Option<u64>,
    gaps_detected: u64,
}

#[derive(Debug, Default)]
pub struct LiveSourceStats {
    pub messages_received: AtomicU64,
    pub reconnects: AtomicU64,
    pub parse_errors: AtomicU64,
}

pub struct LiveMarketSource {
    session_id: String,
    endpoint: String,
    symbols: Vec<String>,
    state: RwLock<HashMap<String, SymbolState>>,
    stats: LiveSourceStats,
}

impl LiveMarketSource {
    pub fn new(session_id: impl Into<String>, endpoint: impl Into<String>, symbols: Vec<String>) -> Self {
        Self {
            session_id: session_id.into(),
            endpoint: endpoint.into(),
            symbols,
            state: RwLock::new(HashMap::new()),
            stats: LiveSourceStats::default(),
        }
    }

    fn note_sequence(&self, symbol: &str, sequence: u64) {
        let mut guard = self.state.write();
        let entry = guard.entry(symbol.to_string()).or_default();
        if let Some(last) = entry.last_sequence {
            if sequence > last + 1 {
                entry.gaps_detected += 1;
                warn!(symbol, last, sequence, "sequence gap detected on live feed");
            }
        }
        entry.last_sequence = Some(sequence);
    }
}

#[async_trait]
impl MarketDataSource for LiveMarketSource {
    async fn run(&self, bus: Arc<EventBus>, mut stop: tokio::sync::watch::Receiver<bool>) -> EngineResult<()> {
        let mut reconnect_delay = Duration::from_secs(1);

        loop {
            if *stop.borrow() {
                return Ok(());
            }

            match self.connect_and_stream(&bus, &mut stop).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    error!(error = %err, "live market source disconnected, reconnecting");
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    tokio::select! {
                        _ = tokio::time::sleep(reconnect_delay) => {}
                        _ = stop.changed() => {
                            if *stop.borrow() {
                                return Ok(());
                            }
                        }
                    }
                    reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
                }
            }
        }
    }
}

impl LiveMarketSource {
    async fn connect_and_stream(
        &self,
        bus: &Arc<EventBus>,
        stop: &mut tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.endpoint).await?;
        info!(endpoint = %self.endpoint, "live market source connected");
        let (mut write, mut read) = ws_stream.split();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                _ = heartbeat.tick() => {
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        return Err(anyhow::anyhow!("heartbeat ping failed"));
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                            match parse_trade_message(&text) {
                                Some(parsed) => {
                                    self.note_sequence(&parsed.symbol, parsed.sequence);
                                    let tick = Tick {
                                        timestamp: Utc::now(),
                                        price: parsed.price,
                                        volume: parsed.volume,
                                    };
                                    let market_tick = MarketTick::new(self.session_id.clone(), parsed.symbol, tick);
                                    bus.publish(BusEvent::MarketTick(market_tick)).await.ok();
                                }
                                None => {
                                    self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(anyhow::anyhow!("connection closed by peer"));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(err.into()),
                    }
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTradeMessage {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    volume: String,
    #[serde(rename = "E")]
    sequence: u64,
}

struct ParsedTrade {
    symbol: String,
    price: f64,
    volume: f64,
    sequence: u64,
}

fn parse_trade_message(text: &str) -> Option<ParsedTrade> {
    let raw: RawTradeMessage = serde_json::from_str(text).ok()?;
    Some(ParsedTrade {
        symbol: raw.symbol,
        price: raw.price.parse().ok()?,
        volume: raw.volume.parse().ok()?,
        sequence: raw.sequence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_trade_message() {
        let text = r#"{"s":"BTCUSDT","p":"65000.50","q":"0.013","E":42}"#;
        let parsed = parse_trade_message(text).expect("should parse");
        assert_eq!(parsed.symbol, "BTCUSDT");
        assert!((parsed.price - 65000.50).abs() < 1e-9);
        assert_eq!(parsed.sequence, 42);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(parse_trade_message("not json").is_none());
    }
}
