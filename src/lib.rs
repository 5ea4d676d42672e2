//! Spread monitoring server infrastructure
//!
//! This library provides:
//! - Continuous CEX/DEX price ingestion over a proxy-rotating client pool
//! - Spread computation with per-DEX anomaly filtering
//! - WebSocket fan-out of per-token observations to subscribers
//! - A rolling spread history persisted to SQLite

use anyhow::Result;
use std::env;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod connection_manager;
pub mod dexscreener_client;
pub mod history_writer;
pub mod http_client;
pub mod jupiter_client;
pub mod latest_snapshot;
pub mod matcha_client;
pub mod mexc_client;
pub mod price_source;
pub mod price_worker;
pub mod proxy_pool;
pub mod quote_cache;
pub mod spread_engine;
pub mod store;
pub mod ws_server;

// Re-export main types for convenience
pub use connection_manager::{ClientId, ConnectionManager};
pub use dexscreener_client::DexScreenerClient;
pub use history_writer::HistoryWriter;
pub use http_client::{BrowserImpersonationClient, ChallengeSolvingClient};
pub use jupiter_client::JupiterClient;
pub use latest_snapshot::LatestSnapshot;
pub use matcha_client::MatchaClient;
pub use mexc_client::MexcClient;
pub use price_source::{PriceSource, QuoteError, QuoteResult};
pub use price_worker::PriceWorker;
pub use proxy_pool::{ProbeReport, ProbeResult, ProxyPool};
pub use spread_engine::{build_observation, calc_spread, DexSpread, Observation};
pub use store::{HistoryRow, ProxyEntry, Store, TokenConfig};
pub use ws_server::WsServer;

/// Current time as unix seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Process configuration, environment-driven with sane defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: String,
    pub ws_bind: String,
    /// Maximum concurrent per-token fetch tasks.
    pub max_workers: usize,
    /// Minimum delay between scheduler cycles, seconds.
    pub poll_interval: f64,
    /// Health-probe failures before a proxy is deactivated.
    pub proxy_fail_threshold: u32,
    /// IP-echo endpoint the health probe calls through each proxy.
    pub proxy_probe_url: String,
    pub history_retention_hours: u64,
    pub history_flush_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: "data/spreadwatch.db".to_string(),
            ws_bind: "0.0.0.0:8000".to_string(),
            max_workers: 50,
            poll_interval: 0.0,
            proxy_fail_threshold: 5,
            proxy_probe_url: "https://ipinfo.io/json".to_string(),
            history_retention_hours: 48,
            history_flush_secs: 5,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            db_path: env::var("SPREADWATCH_DB").unwrap_or(defaults.db_path),
            ws_bind: env::var("SPREADWATCH_WS_BIND").unwrap_or(defaults.ws_bind),
            max_workers: parsed_env("SPREADWATCH_MAX_WORKERS", defaults.max_workers),
            poll_interval: parsed_env("SPREADWATCH_POLL_INTERVAL", defaults.poll_interval),
            proxy_fail_threshold: parsed_env(
                "SPREADWATCH_PROXY_FAIL_THRESHOLD",
                defaults.proxy_fail_threshold,
            ),
            proxy_probe_url: env::var("SPREADWATCH_PROBE_URL").unwrap_or(defaults.proxy_probe_url),
            history_retention_hours: parsed_env(
                "SPREADWATCH_HISTORY_RETENTION_HOURS",
                defaults.history_retention_hours,
            ),
            history_flush_secs: parsed_env(
                "SPREADWATCH_HISTORY_FLUSH_SECS",
                defaults.history_flush_secs,
            ),
        })
    }
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_workers, 50);
        assert_eq!(config.poll_interval, 0.0);
        assert_eq!(config.proxy_fail_threshold, 5);
        assert_eq!(config.history_retention_hours, 48);
        assert_eq!(config.history_flush_secs, 5);
    }

    #[test]
    fn test_unix_now_is_sane() {
        // After 2020, before 2100.
        let now = unix_now();
        assert!(now > 1_577_836_800.0);
        assert!(now < 4_102_444_800.0);
    }
}
