//! Time-series persistence. `sqlite` is the only `Store` implementation;
//! `indicator_sink` and `trading_sink` are bus subscribers that batch
//! writes into it so a slow disk never blocks the hot publish path.

pub mod indicator_sink;
pub mod sqlite;
pub mod trading_sink;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::models::{IndicatorValue, MarketTick, Order, Position, Session, Signal};

/// Storage seam between the engine and whatever backs it. The only
/// production implementation is [`sqlite::SqliteStore`]; the trait exists
/// so sinks and replay can be exercised against an in-memory fixture.
#[async_trait]
pub trait Store: Send + Sync {
    async fn init_schema(&self) -> EngineResult<()>;

    async fn insert_ticks_batch(&self, ticks: &[MarketTick]) -> EngineResult<()>;
    async fn load_ticks(&self, session_id: &str, symbols: &[String]) -> EngineResult<Vec<MarketTick>>;

    async fn insert_indicator_values_batch(&self, values: &[IndicatorValue]) -> EngineResult<()>;

    /// Inserts a signal keyed by `(timestamp, signal_id)`. Returns `false`
    /// without error when that key already exists — the dedup the spec
    /// requires at the sink, not an upsert (a signal is an immutable event,
    /// not a mutable row like an order or position).
    async fn insert_signal(&self, signal: &Signal) -> EngineResult<bool>;

    async fn upsert_order(&self, order: &Order) -> EngineResult<()>;
    async fn upsert_position(&self, position: &Position) -> EngineResult<()>;
    async fn upsert_session(&self, session: &Session) -> EngineResult<()>;
}
