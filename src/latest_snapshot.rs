// Last observation per token. Written by the scheduler as tasks complete,
// read by the subscription path to seed newly-subscribed clients.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::spread_engine::Observation;

#[derive(Default)]
pub struct LatestSnapshot {
    inner: RwLock<HashMap<String, Observation>>,
}

impl LatestSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, observation: Observation) {
        self.inner
            .write()
            .insert(observation.token_name.clone(), observation);
    }

    pub fn get(&self, token: &str) -> Option<Observation> {
        self.inner.read().get(token).cloned()
    }

    pub fn all(&self) -> HashMap<String, Observation> {
        self.inner.read().clone()
    }

    /// Entries for the requested tokens only; absent tokens are skipped.
    pub fn filtered(&self, tokens: &[String]) -> HashMap<String, Observation> {
        let guard = self.inner.read();
        tokens
            .iter()
            .filter_map(|name| guard.get(name).map(|obs| (name.clone(), obs.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
