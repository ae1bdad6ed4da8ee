//! Market data sources. `live` streams ticks from an exchange websocket;
//! `replay` re-plays ticks previously captured by the persistence layer,
//! sped up by a session's `acceleration_factor`.

pub mod live;
pub mod replay;

use async_trait::async_trait;

use crate::bus::EventBus;
use crate::error::EngineResult;

/// Common shape for anything that can feed the engine a tick stream. The
/// controller starts exactly one of these per session and stops it as part
/// of `stop_session` teardown.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn run(&self, bus: std::sync::Arc<EventBus>, stop: tokio::sync::watch::Receiver<bool>) -> EngineResult<()>;
}
