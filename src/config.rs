//! Process bootstrap configuration.
//!
//! This is the one place the core reads environment variables — at
//! process start, before any session exists. Once a session is
//! running, every component receives its configuration through
//! constructor arguments (see `models::SessionConfig`), never by
//! reading `std::env` itself.

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct BootConfig {
    pub database_path: String,
    pub port: u16,
    pub event_bus_default_queue_size: usize,
    pub event_bus_publish_timeout_ms: u64,
    pub memory_budget_mb: u64,
}

impl BootConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./pumpwatch.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let event_bus_default_queue_size = std::env::var("EVENT_BUS_QUEUE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1024);

        let event_bus_publish_timeout_ms = std::env::var("EVENT_BUS_PUBLISH_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);

        let memory_budget_mb = std::env::var("INDICATOR_MEMORY_BUDGET_MB")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(500);

        Ok(Self {
            database_path,
            port,
            event_bus_default_queue_size,
            event_bus_publish_timeout_ms,
            memory_budget_mb,
        })
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            database_path: "./pumpwatch.db".to_string(),
            port: 8080,
            event_bus_default_queue_size: 1024,
            event_bus_publish_timeout_ms: 100,
            memory_budget_mb: 500,
        }
    }
}
