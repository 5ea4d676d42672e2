// Outbound proxy pool. Upstream calls pick a random active proxy from an
// in-process cache; only the periodic health probe mutates proxy state.
// Per-call failures inside the price clients are deliberately not counted:
// upstreams return plenty of transient errors that are not proxy faults,
// and attributing them would starve the pool.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::http_client::proxied_client;
use crate::store::{ProxyEntry, Store};

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const PROBE_START_DELAY: Duration = Duration::from_secs(60);
const PROBE_INTERVAL: Duration = Duration::from_secs(300);
const CACHE_TTL: Duration = Duration::from_secs(60);

/// Outcome of probing one proxy, kept for admin inspection.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub id: i64,
    pub working: bool,
    pub response_time_ms: Option<u64>,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeReport {
    pub results: Vec<ProbeResult>,
    pub last_check: Option<DateTime<Utc>>,
}

struct ActiveCache {
    proxies: Vec<ProxyEntry>,
    refreshed_at: Option<Instant>,
}

pub struct ProxyPool {
    store: Store,
    probe_url: String,
    fail_threshold: u32,
    cache: RwLock<ActiveCache>,
    last_probe: Mutex<ProbeReport>,
}

impl ProxyPool {
    pub fn new(store: Store, probe_url: String, fail_threshold: u32) -> Self {
        Self {
            store,
            probe_url,
            fail_threshold,
            cache: RwLock::new(ActiveCache {
                proxies: Vec::new(),
                refreshed_at: None,
            }),
            last_probe: Mutex::new(ProbeReport::default()),
        }
    }

    /// Uniform random pick from the active cache, refreshing from the store
    /// when the snapshot is older than 60 s. Once primed, picks within the
    /// TTL window touch no store handle.
    pub fn pick(&self) -> Option<ProxyEntry> {
        if self.cache_stale() {
            if let Err(e) = self.prime() {
                warn!("Proxy cache refresh failed: {}", e);
            }
        }
        let cache = self.cache.read();
        if cache.proxies.is_empty() {
            debug!("No active proxies available, requests go direct");
            return None;
        }
        let idx = fastrand::usize(..cache.proxies.len());
        Some(cache.proxies[idx].clone())
    }

    fn cache_stale(&self) -> bool {
        let cache = self.cache.read();
        match cache.refreshed_at {
            Some(at) => at.elapsed() > CACHE_TTL,
            None => true,
        }
    }

    /// Force a reload of the active set from the store.
    pub fn prime(&self) -> Result<()> {
        let proxies = self.store.active_proxies()?;
        let mut cache = self.cache.write();
        info!("Proxy cache refreshed: {} active proxies", proxies.len());
        cache.proxies = proxies;
        cache.refreshed_at = Some(Instant::now());
        Ok(())
    }

    fn invalidate_cache(&self) {
        self.cache.write().refreshed_at = None;
    }

    /// Results and time of the last completed probe pass.
    pub fn last_results(&self) -> ProbeReport {
        self.last_probe.lock().clone()
    }

    /// Probe every proxy, active or not, through one IP-echo request each.
    /// Success resets the fail counter and reactivates the proxy; failure
    /// increments it, deactivating at the threshold. Deactivated proxies
    /// that recover come back on their next successful probe.
    pub async fn probe_all(&self) -> Result<Vec<ProbeResult>> {
        let proxies = self.store.all_proxies()?;
        let mut results = Vec::with_capacity(proxies.len());

        for proxy in &proxies {
            let result = self.probe_one(proxy).await;
            self.store
                .record_probe_outcome(proxy.id, result.working, self.fail_threshold)?;
            if result.working {
                if !proxy.is_active {
                    info!("Proxy {} reactivated: health check passed", proxy.id);
                }
            } else if proxy.fail_count + 1 >= self.fail_threshold {
                if proxy.is_active {
                    warn!(
                        "Proxy {} disabled: fail_count reached {}",
                        proxy.id, self.fail_threshold
                    );
                }
            } else {
                info!(
                    "Proxy {} check failed, fail_count: {}/{}",
                    proxy.id,
                    proxy.fail_count + 1,
                    self.fail_threshold
                );
            }
            results.push(result);
        }

        // Next pick sees the committed state.
        self.invalidate_cache();

        let working = results.iter().filter(|r| r.working).count();
        info!(
            "Proxy health check completed: {}/{} working",
            working,
            results.len()
        );

        let mut report = self.last_probe.lock();
        report.results = results.clone();
        report.last_check = Some(Utc::now());
        Ok(results)
    }

    async fn probe_one(&self, proxy: &ProxyEntry) -> ProbeResult {
        let mut result = ProbeResult {
            id: proxy.id,
            working: false,
            response_time_ms: None,
            ip: None,
            country: None,
            error: None,
            checked_at: Utc::now(),
        };

        let client = match proxied_client(Some(&proxy.url()), PROBE_TIMEOUT) {
            Ok(client) => client,
            Err(e) => {
                result.error = Some(format!("client build: {}", e));
                return result;
            }
        };

        let started = Instant::now();
        match client.get(&self.probe_url).send().await {
            Ok(response) if response.status().is_success() => {
                result.working = true;
                result.response_time_ms = Some(started.elapsed().as_millis() as u64);
                if let Ok(body) = response.json::<serde_json::Value>().await {
                    result.ip = body
                        .get("ip")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string());
                    result.country = body
                        .get("country")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string());
                }
                debug!(
                    "Proxy {} OK: {}ms via {}",
                    proxy.id,
                    result.response_time_ms.unwrap_or(0),
                    proxy.safe_host()
                );
            }
            Ok(response) => {
                result.error = Some(format!("HTTP {}", response.status().as_u16()));
            }
            Err(e) if e.is_timeout() => {
                result.error = Some("Timeout".to_string());
            }
            Err(e) => {
                let msg = e.to_string();
                result.error = Some(msg.chars().take(100).collect());
            }
        }
        result
    }

    /// Background probe loop: first pass 60 s after launch, then every
    /// 5 minutes, checking the stop flag every 10 s while sleeping.
    pub async fn probe_loop(self: Arc<Self>, running: Arc<AtomicBool>) {
        info!(
            "Proxy health checker started (interval: {}s)",
            PROBE_INTERVAL.as_secs()
        );
        if !Self::interruptible_sleep(PROBE_START_DELAY, &running).await {
            return;
        }
        while running.load(Ordering::SeqCst) {
            if let Err(e) = self.probe_all().await {
                error!("Proxy health check error: {}", e);
            }
            if !Self::interruptible_sleep(PROBE_INTERVAL, &running).await {
                break;
            }
        }
        info!("Proxy health checker stopped");
    }

    async fn interruptible_sleep(total: Duration, running: &AtomicBool) -> bool {
        let step = Duration::from_secs(10);
        let mut remaining = total;
        while !remaining.is_zero() {
            if !running.load(Ordering::SeqCst) {
                return false;
            }
            let chunk = remaining.min(step);
            sleep(chunk).await;
            remaining -= chunk;
        }
        running.load(Ordering::SeqCst)
    }
}
