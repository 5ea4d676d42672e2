// MEXC futures client. One batch ticker request covers every symbol, so the
// scheduler refreshes the snapshot once per cycle and per-token tasks read
// their sides from the cache without touching the network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::http_client::proxied_client;
use crate::price_source::QuoteError;
use crate::proxy_pool::ProxyPool;
use crate::quote_cache::{ContractMeta, SnapshotCache, TickerSides};
use crate::store::TokenConfig;

pub const MEXC_FUTURES_BASE: &str = "https://contract.mexc.com";
const TICKER_PATH: &str = "/api/v1/contract/ticker";
const CONTRACT_DETAIL_PATH: &str = "/api/v1/contract/detail";
const JSON_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 2;
const TICKER_TTL: Duration = Duration::from_secs(1);
const CONTRACT_TTL: Duration = Duration::from_secs(60);

/// Characters stripped from a base symbol before building the futures
/// contract symbol.
const SYMBOL_STRIP: &[char] = &[' ', '-', '_', '.', '/'];

pub struct MexcClient {
    base_url: String,
    proxy_pool: Arc<ProxyPool>,
    ticker_cache: SnapshotCache<TickerSides>,
    contract_cache: SnapshotCache<ContractMeta>,
}

impl MexcClient {
    pub fn new(proxy_pool: Arc<ProxyPool>) -> Self {
        Self::with_base_url(proxy_pool, MEXC_FUTURES_BASE.to_string())
    }

    pub fn with_base_url(proxy_pool: Arc<ProxyPool>, base_url: String) -> Self {
        Self {
            base_url,
            proxy_pool,
            ticker_cache: SnapshotCache::new(TICKER_TTL),
            contract_cache: SnapshotCache::new(CONTRACT_TTL),
        }
    }

    /// Futures symbol for a token: explicit override, else the base with
    /// special characters stripped, joined `BASE_QUOTE`.
    pub fn resolve_symbol(token: &TokenConfig) -> String {
        let base = match &token.mexc_symbol {
            Some(sym) if !sym.trim().is_empty() => sym.trim().to_string(),
            _ => token
                .base
                .chars()
                .filter(|c| !SYMBOL_STRIP.contains(c))
                .collect(),
        };
        format!(
            "{}_{}",
            base.to_uppercase(),
            token.quote.trim().to_uppercase()
        )
    }

    /// Refresh the batch ticker snapshot (and, on its own 60 s cadence, the
    /// contract metadata). Called once per scheduler cycle; the 1 s TTL
    /// makes back-to-back cycles reuse the previous snapshot.
    pub async fn refresh_batch(&self) {
        if self.ticker_cache.fresh().is_none() {
            match self.fetch_data_array(TICKER_PATH).await {
                Ok(data) => {
                    let map = Self::parse_ticker_payload(&data);
                    debug!("MEXC ticker snapshot: {} symbols", map.len());
                    self.ticker_cache.store(map);
                }
                Err(e) => warn!("MEXC batch ticker refresh failed: {}", e),
            }
        }

        if self.contract_cache.fresh().is_none() {
            match self.fetch_data_array(CONTRACT_DETAIL_PATH).await {
                Ok(data) => {
                    let map = Self::parse_contract_payload(&data);
                    debug!("MEXC contract metadata: {} symbols", map.len());
                    self.contract_cache.store(map);
                }
                Err(e) => warn!("MEXC contract detail refresh failed: {}", e),
            }
        }
    }

    /// Bid/ask sides for a token from the current snapshot, rounded to the
    /// token's price scale when configured. No network.
    pub fn ticker_sides(&self, token: &TokenConfig) -> TickerSides {
        let symbol = Self::resolve_symbol(token);
        let snapshot = match self.ticker_cache.latest() {
            Some(snapshot) => snapshot,
            None => return (None, None),
        };
        let (bid, ask) = match snapshot.get(&symbol) {
            Some(sides) => *sides,
            None => {
                debug!("MEXC: symbol {} absent from batch snapshot", symbol);
                return (None, None);
            }
        };
        match token.mexc_price_scale {
            Some(scale) if scale >= 0 => (
                bid.map(|v| round_to(v, scale as u32)),
                ask.map(|v| round_to(v, scale as u32)),
            ),
            _ => (bid, ask),
        }
    }

    /// Minimum order notional for a token at the given reference price:
    /// `minVol × contractSize × price`.
    pub fn min_order_notional(&self, token: &TokenConfig, reference_price: f64) -> Option<f64> {
        if reference_price <= 0.0 {
            return None;
        }
        let symbol = Self::resolve_symbol(token);
        let snapshot = self.contract_cache.latest()?;
        let meta = snapshot.get(&symbol)?;
        Some(meta.min_vol * meta.contract_size * reference_price)
    }

    async fn fetch_data_array(&self, path: &str) -> Result<serde_json::Value, QuoteError> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_err = QuoteError::Transport;

        for attempt in 0..MAX_RETRIES {
            let proxy = self.proxy_pool.pick();
            let proxy_url = proxy.as_ref().map(|p| p.url());
            let client = match proxied_client(proxy_url.as_deref(), JSON_TIMEOUT) {
                Ok(client) => client,
                Err(_) => {
                    last_err = QuoteError::Transport;
                    continue;
                }
            };

            let response = match client.get(&url).send().await {
                Ok(response) => response,
                Err(e) => {
                    last_err = if e.is_timeout() {
                        QuoteError::Deadline
                    } else {
                        QuoteError::Transport
                    };
                    debug!("MEXC {} attempt {} failed: {}", path, attempt + 1, e);
                    continue;
                }
            };

            let status = response.status().as_u16();
            if !(200..300).contains(&status) {
                warn!("MEXC: HTTP {} for {} (attempt {})", status, path, attempt + 1);
                last_err = QuoteError::Status(status);
                continue;
            }

            let body: serde_json::Value = match response.json().await {
                Ok(body) => body,
                Err(_) => {
                    last_err = QuoteError::Schema;
                    continue;
                }
            };

            let success = body.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
            let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(-1);
            if !success || code != 0 {
                warn!("MEXC: unsuccessful envelope for {}: code={}", path, code);
                last_err = QuoteError::Schema;
                continue;
            }

            match body.get("data") {
                Some(data) => return Ok(data.clone()),
                None => {
                    last_err = QuoteError::Schema;
                    continue;
                }
            }
        }
        Err(last_err)
    }

    fn parse_ticker_payload(data: &serde_json::Value) -> HashMap<String, TickerSides> {
        let mut map = HashMap::new();
        let Some(entries) = data.as_array() else {
            return map;
        };
        for entry in entries {
            let Some(symbol) = entry.get("symbol").and_then(|v| v.as_str()) else {
                continue;
            };
            let bid = entry.get("bid1").and_then(json_number);
            let ask = entry.get("ask1").and_then(json_number);
            map.insert(symbol.to_string(), (bid, ask));
        }
        map
    }

    fn parse_contract_payload(data: &serde_json::Value) -> HashMap<String, ContractMeta> {
        let mut map = HashMap::new();
        let Some(entries) = data.as_array() else {
            return map;
        };
        for entry in entries {
            let Some(symbol) = entry.get("symbol").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(contract_size) = entry.get("contractSize").and_then(json_number) else {
                continue;
            };
            let Some(min_vol) = entry.get("minVol").and_then(json_number) else {
                continue;
            };
            let max_vol = entry.get("maxVol").and_then(json_number).unwrap_or(0.0);
            map.insert(
                symbol.to_string(),
                ContractMeta {
                    contract_size,
                    min_vol,
                    max_vol,
                },
            );
        }
        map
    }

    #[cfg(test)]
    pub fn prime_ticker(&self, map: HashMap<String, TickerSides>) {
        self.ticker_cache.store(map);
    }

    #[cfg(test)]
    pub fn prime_contracts(&self, map: HashMap<String, ContractMeta>) {
        self.contract_cache.store(map);
    }
}

/// Numbers arrive both as JSON numbers and as quoted strings.
fn json_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}
