// Freshness-bounded in-process caches for upstream quote data. All of them
// are small: bounded by the token universe or a single value.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// One CEX side pair as returned by the batch ticker: (bid1, ask1).
pub type TickerSides = (Option<f64>, Option<f64>);

/// Per-contract lot metadata from the CEX contract-detail endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContractMeta {
    pub contract_size: f64,
    pub min_vol: f64,
    pub max_vol: f64,
}

/// A whole-snapshot cache: one fetch covers every symbol, shared via Arc so
/// hundreds of concurrent token tasks read it without copying.
pub struct SnapshotCache<T> {
    inner: RwLock<Option<(Instant, Arc<HashMap<String, T>>)>>,
    ttl: Duration,
}

impl<T> SnapshotCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(None),
            ttl,
        }
    }

    /// The snapshot if it is younger than the TTL.
    pub fn fresh(&self) -> Option<Arc<HashMap<String, T>>> {
        let guard = self.inner.read();
        match guard.as_ref() {
            Some((at, map)) if at.elapsed() < self.ttl => Some(Arc::clone(map)),
            _ => None,
        }
    }

    /// The snapshot regardless of age. Lookups between refreshes use this;
    /// the TTL only gates how often a refresh actually hits the network.
    pub fn latest(&self) -> Option<Arc<HashMap<String, T>>> {
        self.inner.read().as_ref().map(|(_, map)| Arc::clone(map))
    }

    pub fn store(&self, map: HashMap<String, T>) {
        *self.inner.write() = Some((Instant::now(), Arc::new(map)));
    }

    #[cfg(test)]
    pub fn store_at(&self, map: HashMap<String, T>, at: Instant) {
        *self.inner.write() = Some((at, Arc::new(map)));
    }
}

/// Per-mint DEX quote cache. `fresh` is the 1 s speed path; `last_good`
/// ignores age because a stale-but-sane quote is the fallback when a new
/// quote fails cross-validation.
pub struct MintQuoteCache {
    inner: RwLock<HashMap<String, (Instant, f64)>>,
    ttl: Duration,
}

impl MintQuoteCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn fresh(&self, mint: &str) -> Option<f64> {
        let guard = self.inner.read();
        match guard.get(mint) {
            Some((at, price)) if at.elapsed() < self.ttl => Some(*price),
            _ => None,
        }
    }

    pub fn last_good(&self, mint: &str) -> Option<f64> {
        self.inner.read().get(mint).map(|(_, price)| *price)
    }

    pub fn store(&self, mint: &str, price: f64) {
        self.inner
            .write()
            .insert(mint.to_string(), (Instant::now(), price));
    }
}

/// Shared short-lived bearer credential for the gasless router.
///
/// The mutex is the whole state machine: a caller holding it is either
/// reading a valid credential or refreshing an absent/expiring one, so
/// concurrent callers wait for the in-flight refresh instead of issuing
/// their own.
pub struct CredentialCache {
    state: tokio::sync::Mutex<Option<Credential>>,
    refresh_margin_secs: f64,
}

#[derive(Debug, Clone)]
struct Credential {
    token: String,
    /// Absolute unix-seconds expiry as declared by the issuer.
    exp: f64,
}

impl CredentialCache {
    pub fn new(refresh_margin_secs: f64) -> Self {
        Self {
            state: tokio::sync::Mutex::new(None),
            refresh_margin_secs,
        }
    }

    /// Return the cached credential, or drive `issue` to obtain a new one.
    /// `issue` yields `(token, exp)` on success.
    pub async fn get_or_issue<F, Fut>(&self, now: f64, issue: F) -> Option<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<(String, f64)>>,
    {
        let mut state = self.state.lock().await;
        if let Some(cred) = state.as_ref() {
            if now < cred.exp - self.refresh_margin_secs {
                return Some(cred.token.clone());
            }
            debug!("Credential within refresh window, reissuing");
        }
        match issue().await {
            Some((token, exp)) => {
                *state = Some(Credential {
                    token: token.clone(),
                    exp,
                });
                Some(token)
            }
            None => {
                *state = None;
                None
            }
        }
    }

    /// Drop the credential; the next caller reissues. Used on 401/403.
    pub async fn invalidate(&self) {
        *self.state.lock().await = None;
    }
}
