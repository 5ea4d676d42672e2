// Buffered history writer. Observations coalesce in a per-token buffer
// (most recent wins) and land in the store as one bulk insert every flush
// window. History is best-effort: a failed flush drops that window's batch
// rather than stalling the hot path.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::spread_engine::Observation;
use crate::store::{HistoryRow, Store};
use crate::unix_now;

#[derive(Clone)]
pub struct HistoryWriter {
    store: Store,
    retention_hours: u64,
    flush_interval: Duration,
    buffer: Arc<Mutex<HashMap<String, Observation>>>,
    last_flush: Arc<Mutex<Instant>>,
}

impl HistoryWriter {
    pub fn new(store: Store, retention_hours: u64, flush_interval: Duration) -> Self {
        Self {
            store,
            retention_hours,
            flush_interval,
            buffer: Arc::new(Mutex::new(HashMap::new())),
            last_flush: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Buffer an observation, overwriting any earlier one for the same token
    /// in this flush window. Kicks a background flush once the window has
    /// elapsed.
    pub fn enqueue(&self, observation: Observation) {
        self.buffer
            .lock()
            .insert(observation.token_name.clone(), observation);

        let due = {
            let mut last = self.last_flush.lock();
            if last.elapsed() >= self.flush_interval {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if due {
            let writer = self.clone();
            tokio::spawn(async move {
                writer.flush();
            });
        }
    }

    /// Swap the buffer for an empty one and bulk-insert its expansion.
    /// Concurrent enqueues land in the fresh buffer and are never lost.
    pub fn flush(&self) {
        let batch = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        let names: Vec<String> = batch.keys().cloned().collect();
        let ids = match self.store.token_ids_by_names(&names) {
            Ok(ids) => ids,
            Err(e) => {
                error!("History flush failed resolving token ids: {}", e);
                return;
            }
        };

        let rows = Self::expand_rows(&batch, &ids);
        if rows.is_empty() {
            return;
        }
        match self.store.insert_history_rows(&rows) {
            Ok(count) => debug!("Saved {} history rows in batch", count),
            Err(e) => error!("Error saving history batch: {}", e),
        }
    }

    fn expand_rows(
        batch: &HashMap<String, Observation>,
        ids: &HashMap<String, i64>,
    ) -> Vec<HistoryRow> {
        let mut rows = Vec::new();
        for (token_name, observation) in batch {
            let Some(&token_id) = ids.get(token_name) else {
                continue;
            };
            for (dex_name, block) in &observation.spreads {
                rows.push(HistoryRow {
                    token_id,
                    dex_name: dex_name.clone(),
                    timestamp: observation.timestamp,
                    direct_spread: block.direct,
                    reverse_spread: block.reverse,
                    dex_price: Some(block.dex_price),
                    cex_bid: block.cex_bid,
                    cex_ask: block.cex_ask,
                });
            }
        }
        rows
    }

    /// Delete rows past the retention horizon.
    pub fn prune(&self) {
        let cutoff = unix_now() - (self.retention_hours as f64) * 3600.0;
        match self.store.prune_history(cutoff) {
            Ok(deleted) if deleted > 0 => {
                info!("Cleaned up {} old history entries", deleted);
            }
            Ok(_) => {}
            Err(e) => error!("Error cleaning up history: {}", e),
        }
    }

    #[cfg(test)]
    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().len()
    }
}
