// Streaming price scheduler. Each cycle reads the active token set, primes
// the CEX batch snapshot with one network call, then fans out per-token
// fetch tasks over a bounded pool and handles each completion immediately:
// latest-snapshot update, subscriber fan-out, history enqueue. There is no
// barrier at the end of a cycle and no inter-cycle sleep beyond the
// configured poll interval.

use anyhow::Result;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::connection_manager::ConnectionManager;
use crate::history_writer::HistoryWriter;
use crate::jupiter_client::JupiterClient;
use crate::latest_snapshot::LatestSnapshot;
use crate::mexc_client::MexcClient;
use crate::price_source::PriceSource;
use crate::spread_engine::{build_observation, reference_price, Observation};
use crate::store::{Store, TokenConfig};
use crate::unix_now;

/// Deadline for one token's whole fan-out; partial results are used.
const TASK_DEADLINE: Duration = Duration::from_secs(15);
/// How often the history prune runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
/// Grace period for joining the loop on stop.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct PriceWorker {
    store: Store,
    mexc: Arc<MexcClient>,
    jupiter: Arc<JupiterClient>,
    sources: Vec<Arc<dyn PriceSource>>,
    manager: Arc<ConnectionManager>,
    snapshot: Arc<LatestSnapshot>,
    history: HistoryWriter,
    max_workers: usize,
    default_poll_interval: f64,
    running: Arc<AtomicBool>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PriceWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        mexc: Arc<MexcClient>,
        jupiter: Arc<JupiterClient>,
        sources: Vec<Arc<dyn PriceSource>>,
        manager: Arc<ConnectionManager>,
        snapshot: Arc<LatestSnapshot>,
        history: HistoryWriter,
        max_workers: usize,
        default_poll_interval: f64,
    ) -> Self {
        Self {
            store,
            mexc,
            jupiter,
            sources,
            manager,
            snapshot,
            history,
            max_workers,
            default_poll_interval,
            running: Arc::new(AtomicBool::new(false)),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let worker = self.clone();
        let handle = tokio::spawn(async move {
            worker.run_loop().await;
        });
        *self.handle.lock() = Some(handle);
        info!("Price worker started ({} workers)", self.max_workers);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if timeout(STOP_GRACE, handle).await.is_err() {
                warn!("Price worker did not stop within grace period");
            }
        }
        info!("Price worker stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn run_loop(&self) {
        let mut last_cleanup = Instant::now();
        while self.running.load(Ordering::SeqCst) {
            let cycle_started = Instant::now();
            match self.run_cycle().await {
                Ok(0) => sleep(Duration::from_secs(1)).await,
                Ok(count) => debug!(
                    "Cycle completed: {} tokens in {:?}",
                    count,
                    cycle_started.elapsed()
                ),
                Err(e) => {
                    error!("Worker error: {}", e);
                    sleep(Duration::from_secs(1)).await;
                }
            }

            if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
                last_cleanup = Instant::now();
                let history = self.history.clone();
                tokio::spawn(async move {
                    history.prune();
                });
            }

            let interval = self.poll_interval();
            let elapsed = cycle_started.elapsed().as_secs_f64();
            if interval > elapsed {
                sleep(Duration::from_secs_f64(interval - elapsed)).await;
            }
        }
    }

    /// Minimum delay between cycles, runtime-tunable through the settings
    /// table. Falls back to the configured default.
    fn poll_interval(&self) -> f64 {
        match self.store.setting("poll_interval") {
            Ok(Some(value)) => value.parse().unwrap_or(self.default_poll_interval),
            _ => self.default_poll_interval,
        }
    }

    async fn run_cycle(&self) -> Result<usize> {
        // Store handle is released before any network work starts.
        let tokens = self.store.active_tokens()?;
        if tokens.is_empty() {
            return Ok(0);
        }

        // One network call populates every token's CEX sides.
        self.mexc.refresh_batch().await;

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = FuturesUnordered::new();
        for token in tokens {
            let worker = self.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return None;
                };
                Some(worker.fetch_token(token).await)
            }));
        }

        // Stream completions: each observation flows out the moment its
        // task finishes, in completion order.
        let mut completed = 0usize;
        while let Some(joined) = tasks.next().await {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match joined {
                Ok(Some(observation)) => {
                    self.publish(observation);
                    completed += 1;
                }
                Ok(None) => {}
                Err(e) => error!("Token task failed: {}", e),
            }
        }
        Ok(completed)
    }

    fn publish(&self, observation: Observation) {
        self.snapshot.insert(observation.clone());
        self.manager
            .deliver(&observation.token_name, &observation);
        self.history.enqueue(observation);
    }

    /// One token's fan-out: CEX lookup from the primed batch cache plus the
    /// allowed DEX clients concurrently, bounded by the task deadline.
    /// Whatever completed in time is used.
    async fn fetch_token(&self, token: TokenConfig) -> Observation {
        let (cex_bid, cex_ask) = self.mexc.ticker_sides(&token);

        let allowed = token.allowed_dexes();
        let fetches = self
            .sources
            .iter()
            .filter(|source| allowed.contains(&source.name()))
            .map(|source| {
                let source = Arc::clone(source);
                let token = token.clone();
                async move {
                    let result = timeout(TASK_DEADLINE, source.fetch_price(&token)).await;
                    (source.name(), result)
                }
            });

        let mut dex_prices: Vec<(&str, f64)> = Vec::new();
        for (name, result) in join_all(fetches).await {
            match result {
                Ok(Ok(price)) => dex_prices.push((name, price)),
                Ok(Err(e)) => debug!("{}: no price for {}: {}", name, token.name, e),
                Err(_) => debug!("{}: deadline expired for {}", name, token.name),
            }
        }

        // The router quote gets cross-checked against the CEX mid; a
        // transient outlier is substituted from cache or dropped.
        if let Some(pos) = dex_prices.iter().position(|(name, _)| *name == "jupiter") {
            let mint = token.jupiter_mint.as_deref().unwrap_or_default();
            match self
                .jupiter
                .validate_against_mid(mint, dex_prices[pos].1, cex_bid, cex_ask)
            {
                Some(price) => dex_prices[pos].1 = price,
                None => {
                    dex_prices.remove(pos);
                }
            }
        }

        let mexc_limit = reference_price(cex_bid, cex_ask)
            .and_then(|reference| self.mexc.min_order_notional(&token, reference));

        build_observation(
            &token.name,
            cex_bid,
            cex_ask,
            mexc_limit,
            &dex_prices,
            unix_now(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price_source::{QuoteError, QuoteResult};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FixedSource {
        name: &'static str,
        result: QuoteResult,
    }

    #[async_trait]
    impl PriceSource for FixedSource {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn fetch_price(&self, _token: &TokenConfig) -> QuoteResult {
            self.result.clone()
        }
    }

    fn worker_with(
        sources: Vec<Arc<dyn PriceSource>>,
        ticker: HashMap<String, (Option<f64>, Option<f64>)>,
    ) -> PriceWorker {
        let store = Store::open_in_memory().unwrap();
        let pool = Arc::new(crate::proxy_pool::ProxyPool::new(
            store.clone(),
            "http://127.0.0.1:9".to_string(),
            5,
        ));
        let mexc = Arc::new(MexcClient::new(Arc::clone(&pool)));
        mexc.prime_ticker(ticker);
        let jupiter = Arc::new(JupiterClient::new(Arc::clone(&pool)));
        let manager = Arc::new(ConnectionManager::new());
        let snapshot = Arc::new(LatestSnapshot::new());
        let history = HistoryWriter::new(store.clone(), 48, Duration::from_secs(5));
        PriceWorker::new(
            store, mexc, jupiter, sources, manager, snapshot, history, 50, 0.0,
        )
    }

    fn token_with_jupiter() -> TokenConfig {
        TokenConfig {
            name: "FOO-USDT".to_string(),
            base: "FOO".to_string(),
            quote: "USDT".to_string(),
            jupiter_mint: Some("MintF".to_string()),
            jupiter_decimals: Some(6),
            is_active: true,
            ..Default::default()
        }
    }

    fn ticker(bid: f64, ask: f64) -> HashMap<String, (Option<f64>, Option<f64>)> {
        let mut map = HashMap::new();
        map.insert("FOO_USDT".to_string(), (Some(bid), Some(ask)));
        map
    }

    #[tokio::test]
    async fn test_fetch_token_rejects_outlier_router_quote() {
        // Router quote 2.0 against mid 1.01: dropped, CEX sides kept.
        let sources: Vec<Arc<dyn PriceSource>> = vec![Arc::new(FixedSource {
            name: "jupiter",
            result: Ok(2.0),
        })];
        let worker = worker_with(sources, ticker(1.00, 1.02));

        let observation = worker.fetch_token(token_with_jupiter()).await;
        assert!(observation.spreads.is_empty());
        assert_eq!(observation.mexc_price, (Some(1.00), Some(1.02)));
    }

    #[tokio::test]
    async fn test_fetch_token_substitutes_cached_router_quote() {
        let sources: Vec<Arc<dyn PriceSource>> = vec![Arc::new(FixedSource {
            name: "jupiter",
            result: Ok(2.0),
        })];
        let worker = worker_with(sources, ticker(1.00, 1.02));
        worker.jupiter.seed_cache("MintF", 1.015);

        let observation = worker.fetch_token(token_with_jupiter()).await;
        let block = &observation.spreads["jupiter"];
        assert!((block.dex_price - 1.015).abs() < 1e-12);
        let direct = block.direct.unwrap();
        assert!((direct - (1.00 - 1.015) / 1.015 * 100.0).abs() < 1e-9);
        let reverse = block.reverse.unwrap();
        assert!((reverse - (1.015 - 1.02) / 1.02 * 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fetch_token_empty_allow_list_yields_cex_only() {
        let sources: Vec<Arc<dyn PriceSource>> = vec![Arc::new(FixedSource {
            name: "pancake",
            result: Ok(1.0),
        })];
        let worker = worker_with(sources, ticker(1.00, 1.02));

        // Routing fields absent: no DEX runs even though a source exists.
        let token = TokenConfig {
            name: "FOO-USDT".to_string(),
            base: "FOO".to_string(),
            quote: "USDT".to_string(),
            is_active: true,
            ..Default::default()
        };
        let observation = worker.fetch_token(token).await;
        assert!(observation.spreads.is_empty());
        assert_eq!(observation.mexc_price, (Some(1.00), Some(1.02)));
    }

    #[tokio::test]
    async fn test_fetch_token_upstream_error_leaves_block_missing() {
        let sources: Vec<Arc<dyn PriceSource>> = vec![Arc::new(FixedSource {
            name: "jupiter",
            result: Err(QuoteError::Status(502)),
        })];
        let worker = worker_with(sources, ticker(1.00, 1.02));

        let observation = worker.fetch_token(token_with_jupiter()).await;
        assert!(observation.spreads.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_token_missing_cex_symbol_gives_null_sides() {
        let sources: Vec<Arc<dyn PriceSource>> = vec![Arc::new(FixedSource {
            name: "jupiter",
            result: Ok(1.5),
        })];
        let worker = worker_with(sources, HashMap::new());

        let observation = worker.fetch_token(token_with_jupiter()).await;
        assert_eq!(observation.mexc_price, (None, None));
        let block = &observation.spreads["jupiter"];
        assert_eq!(block.direct, None);
        assert_eq!(block.reverse, None);
    }
}
