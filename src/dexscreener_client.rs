// PancakeSwap price via the DexScreener token-pairs aggregator. The
// aggregator lists every venue trading the token; we prefer the deepest
// PancakeSwap pair and fall back to the deepest plausible pair overall.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::http_client::proxied_client;
use crate::price_source::{PriceSource, QuoteError, QuoteResult};
use crate::proxy_pool::ProxyPool;
use crate::store::TokenConfig;

pub const DEXSCREENER_TOKENS_URL: &str = "https://api.dexscreener.com/latest/dex/tokens";
const JSON_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 2;

/// Upper plausibility bound for a USD price coming out of the aggregator.
const MAX_PLAUSIBLE_PRICE: f64 = 1_000_000.0;

pub struct DexScreenerClient {
    tokens_url: String,
    proxy_pool: Arc<ProxyPool>,
}

impl DexScreenerClient {
    pub fn new(proxy_pool: Arc<ProxyPool>) -> Self {
        Self::with_tokens_url(proxy_pool, DEXSCREENER_TOKENS_URL.to_string())
    }

    pub fn with_tokens_url(proxy_pool: Arc<ProxyPool>, tokens_url: String) -> Self {
        Self {
            tokens_url,
            proxy_pool,
        }
    }

    /// Pick the USD price from a pairs payload: among pairs with positive
    /// USD liquidity and a plausible price, the deepest pair whose exchange
    /// id names PancakeSwap, else the deepest pair of any venue.
    fn select_price(body: &serde_json::Value) -> Option<f64> {
        let pairs = body.get("pairs")?.as_array()?;

        let mut best_pancake: Option<(f64, f64)> = None; // (liquidity, price)
        let mut best_any: Option<(f64, f64)> = None;

        for pair in pairs {
            let Some(price) = pair.get("priceUsd").and_then(json_number) else {
                continue;
            };
            if price <= 0.0 || price > MAX_PLAUSIBLE_PRICE {
                continue;
            }
            let liquidity = pair
                .get("liquidity")
                .and_then(|l| l.get("usd"))
                .and_then(json_number)
                .unwrap_or(0.0);
            if liquidity <= 0.0 {
                continue;
            }

            let dex_id = pair
                .get("dexId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_lowercase();

            if dex_id.contains("pancake")
                && best_pancake.map_or(true, |(best_liq, _)| liquidity > best_liq)
            {
                best_pancake = Some((liquidity, price));
            }
            if best_any.map_or(true, |(best_liq, _)| liquidity > best_liq) {
                best_any = Some((liquidity, price));
            }
        }

        best_pancake.or(best_any).map(|(_, price)| price)
    }
}

#[async_trait]
impl PriceSource for DexScreenerClient {
    fn name(&self) -> &'static str {
        "pancake"
    }

    async fn fetch_price(&self, token: &TokenConfig) -> QuoteResult {
        let address = token
            .bsc_address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or(QuoteError::Schema)?;
        let url = format!("{}/{}", self.tokens_url, address);

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
                    debug!(
                        "Pancake: attempt {} failed for {}: {}",
                        attempt + 1,
                        address,
                        e
                    );
                    continue;
                }
            };

            let status = response.status().as_u16();
            if !(200..300).contains(&status) {
                warn!(
                    "Pancake: HTTP {} for {}, switching proxy (attempt {})",
                    status,
                    address,
                    attempt + 1
                );
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

            return match Self::select_price(&body) {
                Some(price) => Ok(price),
                None => {
                    debug!("Pancake: no usable market for token {}", address);
                    Err(QuoteError::Schema)
                }
            };
        }
        Err(last_err)
    }
}

fn json_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
