// Matcha gasless-router client (Base). Two-step: a short-lived JWT from the
// challenge-protected issuer, then a gasless sell-quote of 100 USDT for the
// target token. The JWT is process-wide; every concurrent call shares it.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::http_client::ChallengeSolvingClient;
use crate::price_source::{PriceSource, QuoteError, QuoteResult};
use crate::proxy_pool::ProxyPool;
use crate::quote_cache::CredentialCache;
use crate::store::TokenConfig;
use crate::unix_now;

pub const MATCHA_JWT_URL: &str = "https://matcha.xyz/api/jwt";
pub const MATCHA_PRICE_URL: &str = "https://matcha.xyz/api/gasless/price";
pub const MATCHA_USDT: &str = "0xfde4c96c8593536e31f229ea8f37b2ada2699bb2";
const MATCHA_CHAIN_ID: u64 = 8453;
const USDT_DECIMALS: u32 = 6;
const QUOTE_USDT_AMOUNT: f64 = 100.0;
pub const DEFAULT_SELL_DECIMALS: u32 = 18;

const PRICE_TIMEOUT: Duration = Duration::from_secs(15);
const JWT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 3;
/// Refresh this many seconds before the declared expiry.
const REFRESH_MARGIN_SECS: f64 = 10.0;

pub struct MatchaClient {
    jwt_url: String,
    price_url: String,
    proxy_pool: Arc<ProxyPool>,
    http: Arc<dyn ChallengeSolvingClient>,
    credential: CredentialCache,
}

impl MatchaClient {
    pub fn new(proxy_pool: Arc<ProxyPool>, http: Arc<dyn ChallengeSolvingClient>) -> Self {
        Self::with_urls(
            proxy_pool,
            http,
            MATCHA_JWT_URL.to_string(),
            MATCHA_PRICE_URL.to_string(),
        )
    }

    pub fn with_urls(
        proxy_pool: Arc<ProxyPool>,
        http: Arc<dyn ChallengeSolvingClient>,
        jwt_url: String,
        price_url: String,
    ) -> Self {
        Self {
            jwt_url,
            price_url,
            proxy_pool,
            http,
            credential: CredentialCache::new(REFRESH_MARGIN_SECS),
        }
    }

    /// Cached JWT, or a fresh one. Concurrent callers share one issuance.
    async fn jwt(&self) -> Option<String> {
        self.credential
            .get_or_issue(unix_now(), || self.issue_jwt())
            .await
    }

    async fn issue_jwt(&self) -> Option<(String, f64)> {
        let proxy = self.proxy_pool.pick();
        let proxy_url = proxy.as_ref().map(|p| p.url());

        let (status, body) = match self
            .http
            .get(&self.jwt_url, &[], &[], proxy_url.as_deref(), JWT_TIMEOUT)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!("Matcha JWT: request error: {}", e);
                return None;
            }
        };

        if status != 200 {
            warn!("Matcha JWT: HTTP {}", status);
            return None;
        }

        let parsed: serde_json::Value = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Matcha JWT: non-JSON body");
                return None;
            }
        };
        let token = parsed.get("token").and_then(|v| v.as_str())?;
        let exp = parsed.get("exp").and_then(|v| v.as_f64()).unwrap_or(0.0);
        info!(
            "Matcha JWT: obtained new token (valid for ~{:.0}s)",
            (exp - unix_now()).max(0.0)
        );
        Some((token.to_string(), exp))
    }

    fn price_from_body(body: &str, decimals: u32) -> Result<f64, QuoteError> {
        let parsed: serde_json::Value =
            serde_json::from_str(body).map_err(|_| QuoteError::Schema)?;
        let buy_amount_str = parsed
            .get("buyAmount")
            .and_then(|v| v.as_str())
            .ok_or(QuoteError::Schema)?;
        let buy_amount_raw: u128 = buy_amount_str.parse().map_err(|_| QuoteError::Schema)?;
        if buy_amount_raw == 0 {
            return Err(QuoteError::Schema);
        }
        let token_amount = buy_amount_raw as f64 / 10f64.powi(decimals as i32);
        if token_amount <= 0.0 {
            return Err(QuoteError::Schema);
        }
        Ok(QUOTE_USDT_AMOUNT / token_amount)
    }
}

#[async_trait]
impl PriceSource for MatchaClient {
    fn name(&self) -> &'static str {
        "matcha"
    }

    async fn fetch_price(&self, token: &TokenConfig) -> QuoteResult {
        let address = token
            .matcha_address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or(QuoteError::Schema)?;
        let decimals = token.matcha_decimals.unwrap_or(DEFAULT_SELL_DECIMALS);

        let sell_amount_raw = (QUOTE_USDT_AMOUNT as u64) * 10u64.pow(USDT_DECIMALS);
        let query = vec![
            ("chainId".to_string(), MATCHA_CHAIN_ID.to_string()),
            ("sellToken".to_string(), MATCHA_USDT.to_string()),
            ("buyToken".to_string(), address.to_string()),
            ("sellAmount".to_string(), sell_amount_raw.to_string()),
        ];

        let mut last_err = QuoteError::Transport;
        for attempt in 0..MAX_RETRIES {
            let jwt = match self.jwt().await {
                Some(jwt) => jwt,
                None => {
                    warn!(
                        "Matcha: failed to get JWT (attempt {}/{})",
                        attempt + 1,
                        MAX_RETRIES
                    );
                    last_err = QuoteError::Transport;
                    sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let proxy = self.proxy_pool.pick();
            let proxy_url = proxy.as_ref().map(|p| p.url());
            let headers = vec![("X-Matcha-Jwt".to_string(), jwt)];

            let (status, body) = match self
                .http
                .get(
                    &self.price_url,
                    &query,
                    &headers,
                    proxy_url.as_deref(),
                    PRICE_TIMEOUT,
                )
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    debug!(
                        "Matcha: attempt {} failed for {}: {}",
                        attempt + 1,
                        address,
                        e
                    );
                    last_err = QuoteError::Transport;
                    sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            // Credential rejected: drop it and reissue on the next attempt.
            if status == 401 || status == 403 {
                warn!("Matcha: HTTP {} - forcing JWT refresh", status);
                self.credential.invalidate().await;
                last_err = QuoteError::Status(status);
                sleep(Duration::from_millis(500)).await;
                continue;
            }

            if status != 200 {
                warn!(
                    "Matcha: HTTP {} for {} (attempt {}/{})",
                    status,
                    address,
                    attempt + 1,
                    MAX_RETRIES
                );
                last_err = QuoteError::Status(status);
                sleep(Duration::from_secs(1)).await;
                continue;
            }

            let price = Self::price_from_body(&body, decimals)?;
            info!("Matcha: {} price = {:.8} USDT", address, price);
            return Ok(price);
        }
        Err(last_err)
    }
}
