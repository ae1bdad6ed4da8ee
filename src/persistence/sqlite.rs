//! SQLite-backed store. Schema is created once at startup and never
//! migrated in place — a breaking schema change ships as a new database
//! file, not an `ALTER TABLE` against a running engine.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use tracing::{error, warn};

use crate::bus::event::PersistenceDegradedEvent;
use crate::bus::{BusEvent, EventBus};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    IndicatorValue, MarketTick, Order, OrderSide, OrderStatus, OrderType, Position, PositionStatus, Session,
    SessionMode, SessionStatus, Signal, SignalKind,
};

use super::Store;

const OVERFLOW_RING_CAPACITY: usize = 10_000;
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Ticks that failed to persist are held here rather than dropped, and
/// retried on the next batch flush. Capped so a persistent outage degrades
/// to data loss on the oldest rows instead of unbounded memory growth.
#[derive(Default)]
struct OverflowRing {
    ticks: VecDeque<MarketTick>,
    indicator_values: VecDeque<IndicatorValue>,
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    overflow: Arc<Mutex<OverflowRing>>,
    bus: Option<Arc<EventBus>>,
}

impl SqliteStore {
    pub fn open(path: &str) -> EngineResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| EngineError::fatal(format!("failed to open database at {}: {}", path, e)))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            overflow: Arc::new(Mutex::new(OverflowRing::default())),
            bus: None,
        })
    }

    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::fatal(format!("failed to open in-memory database: {}", e)))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            overflow: Arc::new(Mutex::new(OverflowRing::default())),
            bus: None,
        })
    }

    /// Attaches the session's event bus so overflow transitions can surface
    /// a `persistence.degraded` event instead of only a log line.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    fn publish_degraded(&self, table: &str, rows_overflowed: usize, overflow_ring_len: usize) {
        let Some(bus) = self.bus.clone() else { return };
        let event = BusEvent::PersistenceDegraded(PersistenceDegradedEvent {
            table: table.to_string(),
            rows_overflowed,
            overflow_ring_len,
            at: Utc::now(),
        });
        tokio::spawn(async move {
            bus.publish(event).await.ok();
        });
    }

    fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ticks (
                session_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timestamp_millis INTEGER NOT NULL,
                price REAL NOT NULL,
                volume REAL NOT NULL,
                PRIMARY KEY (session_id, symbol, timestamp_millis)
            );
            CREATE INDEX IF NOT EXISTS idx_ticks_session_symbol ON ticks (session_id, symbol, timestamp_millis);

            CREATE TABLE IF NOT EXISTS indicator_values (
                session_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                variant_id TEXT NOT NULL,
                timestamp_millis INTEGER NOT NULL,
                value REAL NOT NULL,
                PRIMARY KEY (session_id, symbol, variant_id, timestamp_millis)
            );

            CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                client_order_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                quantity REAL NOT NULL,
                price REAL,
                filled_quantity REAL NOT NULL,
                avg_fill_price REAL,
                status TEXT NOT NULL,
                created_at_millis INTEGER NOT NULL,
                updated_at_millis INTEGER NOT NULL,
                realised_pnl REAL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_session ON orders (session_id);

            CREATE TABLE IF NOT EXISTS positions (
                position_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                avg_entry_price REAL NOT NULL,
                current_price REAL NOT NULL,
                realised_pnl REAL NOT NULL,
                leverage REAL NOT NULL,
                margin REAL NOT NULL,
                status TEXT NOT NULL,
                opened_at_millis INTEGER NOT NULL,
                updated_at_millis INTEGER NOT NULL,
                closed_at_millis INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_positions_session ON positions (session_id);

            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                mode TEXT NOT NULL,
                symbols TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at_millis INTEGER NOT NULL,
                ended_at_millis INTEGER
            );

            CREATE TABLE IF NOT EXISTS strategy_signals (
                signal_id TEXT NOT NULL,
                timestamp_millis INTEGER NOT NULL,
                session_id TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                kind TEXT NOT NULL,
                price REAL NOT NULL,
                confidence REAL NOT NULL,
                snapshot_json TEXT NOT NULL,
                PRIMARY KEY (timestamp_millis, signal_id)
            );
            CREATE INDEX IF NOT EXISTS idx_signals_session ON strategy_signals (session_id);
            "#,
        )
    }

    fn flush_overflow(&self) {
        let mut overflow = self.overflow.lock();
        if overflow.ticks.is_empty() && overflow.indicator_values.is_empty() {
            return;
        }
        let ticks: Vec<MarketTick> = overflow.ticks.drain(..).collect();
        let values: Vec<IndicatorValue> = overflow.indicator_values.drain(..).collect();
        drop(overflow);

        if !ticks.is_empty() {
            if let Err(e) = self.insert_ticks_sync(&ticks) {
                warn!(error = %e, "overflow flush of ticks failed again, re-queuing");
                let mut overflow = self.overflow.lock();
                for t in ticks {
                    push_capped(&mut overflow.ticks, t, OVERFLOW_RING_CAPACITY);
                }
            }
        }
        if !values.is_empty() {
            if let Err(e) = self.insert_values_sync(&values) {
                warn!(error = %e, "overflow flush of indicator values failed again, re-queuing");
                let mut overflow = self.overflow.lock();
                for v in values {
                    push_capped(&mut overflow.indicator_values, v, OVERFLOW_RING_CAPACITY);
                }
            }
        }
    }

    fn insert_ticks_sync(&self, ticks: &[MarketTick]) -> rusqlite::Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for t in ticks {
            tx.execute(
                "INSERT OR REPLACE INTO ticks (session_id, symbol, timestamp_millis, price, volume) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![t.session_id, t.symbol, t.timestamp.timestamp_millis(), t.price, t.volume],
            )?;
        }
        tx.commit()
    }

    fn insert_values_sync(&self, values: &[IndicatorValue]) -> rusqlite::Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for v in values {
            tx.execute(
                "INSERT OR REPLACE INTO indicator_values (session_id, symbol, variant_id, timestamp_millis, value) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![v.session_id, v.symbol, v.variant_id, v.timestamp.timestamp_millis(), v.value],
            )?;
        }
        tx.commit()
    }

    fn with_retry<F, T>(component: &'static str, mut op: F) -> EngineResult<T>
    where
        F: FnMut() -> rusqlite::Result<T>,
    {
        let mut last_err = None;
        for attempt in 0..MAX_RETRY_ATTEMPTS {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!(attempt, error = %e, "sqlite operation failed, retrying");
                    last_err = Some(e);
                }
            }
        }
        Err(EngineError::transient(
            component,
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }
}

fn push_capped<T>(ring: &mut VecDeque<T>, item: T, capacity: usize) {
    if ring.len() >= capacity {
        ring.pop_front();
    }
    ring.push_back(item);
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}

#[async_trait]
impl Store for SqliteStore {
    async fn init_schema(&self) -> EngineResult<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || Self::create_schema(&conn.lock()))
            .await
            .map_err(|e| EngineError::fatal(e.to_string()))?
            .map_err(|e| EngineError::fatal(format!("schema creation failed: {}", e)))
    }

    async fn insert_ticks_batch(&self, ticks: &[MarketTick]) -> EngineResult<()> {
        let ticks = ticks.to_vec();
        let handle = SqliteStoreHandle { conn: self.conn.clone() };
        let to_retry = ticks.clone();
        let result = tokio::task::spawn_blocking(move || handle.insert_ticks(&to_retry))
            .await
            .map_err(|e| EngineError::transient("sqlite_store", e.to_string()))?;
        if let Err(e) = result {
            error!(error = %e, "tick batch insert failed after retries, overflowing to memory");
            let rows_overflowed = ticks.len();
            let overflow_ring_len = {
                let mut overflow = self.overflow.lock();
                for t in ticks {
                    push_capped(&mut overflow.ticks, t, OVERFLOW_RING_CAPACITY);
                }
                overflow.ticks.len()
            };
            self.publish_degraded("ticks", rows_overflowed, overflow_ring_len);
        }
        self.flush_overflow();
        Ok(())
    }

    async fn load_ticks(&self, session_id: &str, symbols: &[String]) -> EngineResult<Vec<MarketTick>> {
        let conn = self.conn.clone();
        let session_id = session_id.to_string();
        let symbols = symbols.to_vec();
        tokio::task::spawn_blocking(move || -> rusqlite::Result<Vec<MarketTick>> {
            let conn = conn.lock();
            let placeholders = symbols.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "SELECT symbol, timestamp_millis, price, volume FROM ticks WHERE session_id = ?1 AND symbol IN ({}) ORDER BY timestamp_millis ASC, symbol ASC",
                placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut query_params: Vec<&dyn rusqlite::ToSql> = vec![&session_id];
            for s in &symbols {
                query_params.push(s);
            }
            let rows = stmt.query_map(query_params.as_slice(), |row| {
                Ok(MarketTick {
                    session_id: session_id.clone(),
                    symbol: row.get(0)?,
                    timestamp: millis_to_datetime(row.get(1)?),
                    price: row.get(2)?,
                    volume: row.get(3)?,
                })
            })?;
            rows.collect()
        })
        .await
        .map_err(|e| EngineError::transient("sqlite_store", e.to_string()))?
        .map_err(|e| EngineError::transient("sqlite_store", e.to_string()))
    }

    async fn insert_indicator_values_batch(&self, values: &[IndicatorValue]) -> EngineResult<()> {
        let values = values.to_vec();
        let handle = SqliteStoreHandle { conn: self.conn.clone() };
        let to_retry = values.clone();
        let result = tokio::task::spawn_blocking(move || handle.insert_values(&to_retry))
            .await
            .map_err(|e| EngineError::transient("sqlite_store", e.to_string()))?;
        if let Err(e) = result {
            error!(error = %e, "indicator value batch insert failed after retries, overflowing to memory");
            let rows_overflowed = values.len();
            let overflow_ring_len = {
                let mut overflow = self.overflow.lock();
                for v in values {
                    push_capped(&mut overflow.indicator_values, v, OVERFLOW_RING_CAPACITY);
                }
                overflow.indicator_values.len()
            };
            self.publish_degraded("indicator_values", rows_overflowed, overflow_ring_len);
        }
        self.flush_overflow();
        Ok(())
    }

    async fn upsert_order(&self, order: &Order) -> EngineResult<()> {
        let order = order.clone();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> rusqlite::Result<()> {
            conn.lock().execute(
                "INSERT INTO orders (order_id, client_order_id, session_id, strategy_id, symbol, side, order_type, quantity, price, filled_quantity, avg_fill_price, status, created_at_millis, updated_at_millis, realised_pnl)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(order_id) DO UPDATE SET
                    filled_quantity = excluded.filled_quantity,
                    avg_fill_price = excluded.avg_fill_price,
                    status = excluded.status,
                    updated_at_millis = excluded.updated_at_millis,
                    realised_pnl = excluded.realised_pnl",
                params![
                    order.order_id,
                    order.client_order_id,
                    order.session_id,
                    order.strategy_id,
                    order.symbol,
                    order_side_str(order.side),
                    order_type_str(order.order_type),
                    order.quantity,
                    order.price,
                    order.filled_quantity,
                    order.avg_fill_price,
                    order_status_str(order.status),
                    order.created_at.timestamp_millis(),
                    order.updated_at.timestamp_millis(),
                    order.realised_pnl,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::transient("sqlite_store", e.to_string()))?
        .map_err(|e| EngineError::transient("sqlite_store", e.to_string()))
    }

    async fn upsert_position(&self, position: &Position) -> EngineResult<()> {
        let position = position.clone();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> rusqlite::Result<()> {
            conn.lock().execute(
                "INSERT INTO positions (position_id, session_id, strategy_id, symbol, side, quantity, avg_entry_price, current_price, realised_pnl, leverage, margin, status, opened_at_millis, updated_at_millis, closed_at_millis)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(position_id) DO UPDATE SET
                    quantity = excluded.quantity,
                    avg_entry_price = excluded.avg_entry_price,
                    current_price = excluded.current_price,
                    realised_pnl = excluded.realised_pnl,
                    margin = excluded.margin,
                    status = excluded.status,
                    updated_at_millis = excluded.updated_at_millis,
                    closed_at_millis = excluded.closed_at_millis",
                params![
                    position.position_id,
                    position.session_id,
                    position.strategy_id,
                    position.symbol,
                    order_side_str(position.side),
                    position.quantity,
                    position.avg_entry_price,
                    position.current_price,
                    position.realised_pnl,
                    position.leverage,
                    position.margin,
                    position_status_str(position.status),
                    position.opened_at.timestamp_millis(),
                    position.updated_at.timestamp_millis(),
                    position.closed_at.map(|t| t.timestamp_millis()),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::transient("sqlite_store", e.to_string()))?
        .map_err(|e| EngineError::transient("sqlite_store", e.to_string()))
    }

    async fn insert_signal(&self, signal: &Signal) -> EngineResult<bool> {
        let signal = signal.clone();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> rusqlite::Result<bool> {
            let snapshot_json = serde_json::to_string(&signal.indicator_snapshot).unwrap_or_default();
            let rows = conn.lock().execute(
                "INSERT OR IGNORE INTO strategy_signals (signal_id, timestamp_millis, session_id, strategy_id, symbol, kind, price, confidence, snapshot_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    signal.signal_id,
                    signal.timestamp.timestamp_millis(),
                    signal.session_id,
                    signal.strategy_id,
                    signal.symbol,
                    signal_kind_str(signal.kind),
                    signal.price,
                    signal.confidence,
                    snapshot_json,
                ],
            )?;
            Ok(rows > 0)
        })
        .await
        .map_err(|e| EngineError::transient("sqlite_store", e.to_string()))?
        .map_err(|e| EngineError::transient("sqlite_store", e.to_string()))
    }

    async fn upsert_session(&self, session: &Session) -> EngineResult<()> {
        let session = session.clone();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> rusqlite::Result<()> {
            let symbols_json = serde_json::to_string(&session.symbols).unwrap_or_default();
            conn.lock().execute(
                "INSERT INTO sessions (session_id, mode, symbols, status, started_at_millis, ended_at_millis)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(session_id) DO UPDATE SET
                    status = excluded.status,
                    ended_at_millis = excluded.ended_at_millis",
                params![
                    session.session_id,
                    session_mode_str(session.mode),
                    symbols_json,
                    session_status_str(session.status),
                    session.started_at.timestamp_millis(),
                    session.ended_at.map(|t| t.timestamp_millis()),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::transient("sqlite_store", e.to_string()))?
        .map_err(|e| EngineError::transient("sqlite_store", e.to_string()))
    }
}

/// Thin handle so blocking closures can call the retrying insert helpers
/// without capturing `&SqliteStore` across the `spawn_blocking` boundary.
struct SqliteStoreHandle {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStoreHandle {
    fn insert_ticks(&self, ticks: &[MarketTick]) -> EngineResult<()> {
        SqliteStore::with_retry("sqlite_store", || {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            for t in ticks {
                tx.execute(
                    "INSERT OR REPLACE INTO ticks (session_id, symbol, timestamp_millis, price, volume) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![t.session_id, t.symbol, t.timestamp.timestamp_millis(), t.price, t.volume],
                )?;
            }
            tx.commit()
        })
    }

    fn insert_values(&self, values: &[IndicatorValue]) -> EngineResult<()> {
        SqliteStore::with_retry("sqlite_store", || {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            for v in values {
                tx.execute(
                    "INSERT OR REPLACE INTO indicator_values (session_id, symbol, variant_id, timestamp_millis, value) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![v.session_id, v.symbol, v.variant_id, v.timestamp.timestamp_millis(), v.value],
                )?;
            }
            tx.commit()
        })
    }
}

fn order_side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "buy",
        OrderSide::Sell => "sell",
    }
}

fn order_type_str(t: OrderType) -> &'static str {
    match t {
        OrderType::Market => "market",
        OrderType::Limit => "limit",
    }
}

fn order_status_str(s: OrderStatus) -> &'static str {
    match s {
        OrderStatus::Pending => "pending",
        OrderStatus::Filled => "filled",
        OrderStatus::PartiallyFilled => "partially_filled",
        OrderStatus::Cancelled => "cancelled",
        OrderStatus::Rejected => "rejected",
        OrderStatus::Expired => "expired",
    }
}

fn signal_kind_str(k: SignalKind) -> &'static str {
    match k {
        SignalKind::Buy => "buy",
        SignalKind::Sell => "sell",
    }
}

fn position_status_str(s: PositionStatus) -> &'static str {
    match s {
        PositionStatus::Open => "open",
        PositionStatus::Closed => "closed",
    }
}

fn session_mode_str(m: SessionMode) -> &'static str {
    m.as_str()
}

fn session_status_str(s: SessionStatus) -> &'static str {
    match s {
        SessionStatus::Starting => "starting",
        SessionStatus::Running => "running",
        SessionStatus::Stopping => "stopping",
        SessionStatus::Stopped => "stopped",
        SessionStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tick;

    #[tokio::test]
    async fn failed_insert_surfaces_a_persistence_degraded_event() {
        let bus = Arc::new(EventBus::new(16, 50));
        // Schema is never created, so every insert fails and overflows.
        let store = SqliteStore::in_memory().unwrap().with_event_bus(bus.clone());
        let mut sub = bus.subscribe("persistence.degraded", "test", true, None);

        let tick = MarketTick::new(
            "sess_1",
            "BTCUSDT",
            Tick { timestamp: Utc::now(), price: 100.0, volume: 1.0 },
        );
        store.insert_ticks_batch(&[tick]).await.unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_millis(500), sub.receiver.recv())
            .await
            .expect("persistence.degraded should be published")
            .expect("subscription should still be open");
        match event {
            BusEvent::PersistenceDegraded(e) => {
                assert_eq!(e.table, "ticks");
                assert_eq!(e.rows_overflowed, 1);
            }
            other => panic!("expected PersistenceDegraded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn round_trips_ticks_through_sqlite() {
        let store = SqliteStore::in_memory().unwrap();
        store.init_schema().await.unwrap();

        let tick = MarketTick::new(
            "sess_1",
            "BTCUSDT",
            Tick {
                timestamp: Utc::now(),
                price: 100.0,
                volume: 1.0,
            },
        );
        store.insert_ticks_batch(&[tick.clone()]).await.unwrap();

        let loaded = store.load_ticks("sess_1", &["BTCUSDT".to_string()]).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!((loaded[0].price - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn upsert_order_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        store.init_schema().await.unwrap();

        let order = Order::new(
            "sess_1",
            "strat_1",
            "BTCUSDT",
            OrderSide::Buy,
            OrderType::Market,
            1.0,
            None,
            "sig_1",
            0,
            Utc::now(),
            None,
        );
        store.upsert_order(&order).await.unwrap();
        store.upsert_order(&order).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_signal_is_rejected_not_double_inserted() {
        let store = SqliteStore::in_memory().unwrap();
        store.init_schema().await.unwrap();

        let signal = Signal {
            signal_id: "sig_dup".to_string(),
            session_id: "sess_1".to_string(),
            strategy_id: "strat_1".to_string(),
            symbol: "BTCUSDT".to_string(),
            kind: SignalKind::Buy,
            confidence: 1.0,
            price: 100.0,
            indicator_snapshot: Default::default(),
            timestamp: Utc::now(),
        };

        assert!(store.insert_signal(&signal).await.unwrap());
        assert!(!store.insert_signal(&signal).await.unwrap());

        let conn = store.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM strategy_signals WHERE signal_id = ?1", params![signal.signal_id], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
