// Jupiter quote client (Solana router). Sells 100 USDT into the token,
// ExactIn, and derives the USDT price from the raw out-amount. Carries the
// DEX's own plausibility rules: a per-mint cache backs both the 1 s speed
// path and the fallback when a fresh quote is rejected.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::http_client::proxied_client;
use crate::price_source::{PriceSource, QuoteError, QuoteResult};
use crate::proxy_pool::ProxyPool;
use crate::quote_cache::MintQuoteCache;
use crate::store::TokenConfig;

pub const JUPITER_QUOTE_URL: &str = "https://ultra-api.jup.ag/order";
pub const USDT_MINT: &str = "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB";
const USDT_DECIMALS: u32 = 6;
const QUOTE_USDT_AMOUNT: f64 = 100.0;
const JSON_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 2;
const QUOTE_TTL: Duration = Duration::from_secs(1);

/// Absolute price floor; anything below is a liquidity artifact.
const MIN_PLAUSIBLE_PRICE: f64 = 1e-7;
/// Quotes whose own price impact exceeds this are rejected outright.
const MAX_PRICE_IMPACT_PCT: f64 = 100.0;
/// Relative distance from the CEX mid beyond which a quote is suspect.
const MAX_MID_DEVIATION: f64 = 0.5;

pub struct JupiterClient {
    quote_url: String,
    proxy_pool: Arc<ProxyPool>,
    cache: MintQuoteCache,
}

impl JupiterClient {
    pub fn new(proxy_pool: Arc<ProxyPool>) -> Self {
        Self::with_quote_url(proxy_pool, JUPITER_QUOTE_URL.to_string())
    }

    pub fn with_quote_url(proxy_pool: Arc<ProxyPool>, quote_url: String) -> Self {
        Self {
            quote_url,
            proxy_pool,
            cache: MintQuoteCache::new(QUOTE_TTL),
        }
    }

    /// Cross-check a quote against the CEX mid-price. When both CEX sides
    /// are known and the quote sits further than 50% from the mid, prefer
    /// the cached prior quote if it is closer, otherwise drop the price
    /// for this cycle. Rejection never surfaces to subscribers; the DEX
    /// block is simply absent or substituted.
    ///
    /// Only the surviving price enters the cache, so an outlier never
    /// displaces the prior good quote it would be judged against.
    pub fn validate_against_mid(
        &self,
        mint: &str,
        price: f64,
        cex_bid: Option<f64>,
        cex_ask: Option<f64>,
    ) -> Option<f64> {
        let (bid, ask) = match (cex_bid, cex_ask) {
            (Some(bid), Some(ask)) if bid > 0.0 && ask > 0.0 => (bid, ask),
            _ => {
                self.cache.store(mint, price);
                return Some(price);
            }
        };
        let mid = (bid + ask) / 2.0;
        let delta = (price - mid).abs() / mid;
        if delta <= MAX_MID_DEVIATION {
            self.cache.store(mint, price);
            return Some(price);
        }

        match self.cache.last_good(mint) {
            Some(prev) if (prev - mid).abs() / mid < delta => {
                warn!(
                    "Jupiter: quote {:.8} deviates {:.1}% from CEX mid {:.8}, \
                     substituting cached {:.8}",
                    price,
                    delta * 100.0,
                    mid,
                    prev
                );
                Some(prev)
            }
            _ => {
                warn!(
                    "Jupiter: quote {:.8} deviates {:.1}% from CEX mid {:.8}, dropping",
                    price,
                    delta * 100.0,
                    mid
                );
                None
            }
        }
    }

    async fn fetch_quote(&self, mint: &str, decimals: u32) -> QuoteResult {
        let amount_raw = (QUOTE_USDT_AMOUNT as u64) * 10u64.pow(USDT_DECIMALS);
        let params = [
            ("inputMint", USDT_MINT.to_string()),
            ("outputMint", mint.to_string()),
            ("amount", amount_raw.to_string()),
            ("swapMode", "ExactIn".to_string()),
        ];

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

            let response = match client.get(&self.quote_url).query(&params).send().await {
                Ok(response) => response,
                Err(e) => {
                    last_err = if e.is_timeout() {
                        QuoteError::Deadline
                    } else {
                        QuoteError::Transport
                    };
                    debug!(
                        "Jupiter: attempt {} failed for mint={}: {}",
                        attempt + 1,
                        mint,
                        e
                    );
                    continue;
                }
            };

            let status = response.status().as_u16();
            if !(200..300).contains(&status) {
                warn!(
                    "Jupiter: HTTP {} for mint={} (attempt {})",
                    status,
                    mint,
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
            return self.quote_from_body(mint, decimals, &body);
        }
        Err(last_err)
    }

    /// Convert a quote body into a price, applying the impact and floor
    /// rules with cache fallback.
    fn quote_from_body(
        &self,
        mint: &str,
        decimals: u32,
        body: &serde_json::Value,
    ) -> QuoteResult {
        if let Some(impact) = body.get("priceImpactPct").and_then(json_number) {
            if impact > MAX_PRICE_IMPACT_PCT {
                debug!("Jupiter: price impact {:.1}% for mint={}", impact, mint);
                return self.anomaly_fallback(mint);
            }
        }

        let out_amount_str = body
            .get("outAmount")
            .and_then(|v| v.as_str())
            .ok_or(QuoteError::Schema)?;
        let out_amount_raw: u128 = out_amount_str.parse().map_err(|_| QuoteError::Schema)?;
        if out_amount_raw == 0 {
            return Err(QuoteError::Schema);
        }

        let token_amount = out_amount_raw as f64 / 10f64.powi(decimals as i32);
        if token_amount <= 0.0 {
            return Err(QuoteError::Schema);
        }
        let price = QUOTE_USDT_AMOUNT / token_amount;

        if price < MIN_PLAUSIBLE_PRICE {
            debug!(
                "Jupiter: price {:.3e} below plausibility floor for mint={}",
                price, mint
            );
            return self.anomaly_fallback(mint);
        }

        debug!("Jupiter: 1 TOKEN ({}) = {:.8} USDT", mint, price);
        Ok(price)
    }

    fn anomaly_fallback(&self, mint: &str) -> QuoteResult {
        match self.cache.last_good(mint) {
            Some(prev) if prev >= MIN_PLAUSIBLE_PRICE => Ok(prev),
            _ => Err(QuoteError::Anomaly),
        }
    }

    #[cfg(test)]
    pub fn seed_cache(&self, mint: &str, price: f64) {
        self.cache.store(mint, price);
    }
}

#[async_trait]
impl PriceSource for JupiterClient {
    fn name(&self) -> &'static str {
        "jupiter"
    }

    async fn fetch_price(&self, token: &TokenConfig) -> QuoteResult {
        let mint = token
            .jupiter_mint
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or(QuoteError::Schema)?;
        let decimals = token.jupiter_decimals.ok_or(QuoteError::Schema)?;

        if let Some(price) = self.cache.fresh(mint) {
            return Ok(price);
        }
        self.fetch_quote(mint, decimals).await
    }
}

fn json_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
