// Subscriber fan-out manager. Tracks each connected client's token interest
// and routes per-token observations to the interested set. The tables live
// behind one mutex and the critical sections do no I/O: a send is a push
// into the client's outbound channel, whose writer task owns the socket.

use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::spread_engine::Observation;
use crate::store::normalize_token_name;

/// Interest marker for "every token".
const ALL_TOKENS: &str = "__all__";

pub type ClientId = Uuid;

#[derive(Default)]
struct Tables {
    accepting: bool,
    senders: HashMap<ClientId, UnboundedSender<String>>,
    /// token name (or the all-tokens marker) -> interested clients
    by_token: HashMap<String, HashSet<ClientId>>,
    /// inverse, for O(1) teardown on disconnect
    by_client: HashMap<ClientId, HashSet<String>>,
}

pub struct ConnectionManager {
    tables: Mutex<Tables>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                accepting: true,
                ..Default::default()
            }),
        }
    }

    /// Register a new subscriber. Returns its id and the outbound frame
    /// stream, or `None` once shutdown has begun.
    pub fn connect(&self) -> Option<(ClientId, UnboundedReceiver<String>)> {
        let mut tables = self.tables.lock();
        if !tables.accepting {
            return None;
        }
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        tables.senders.insert(id, tx);
        tables.by_client.insert(id, HashSet::new());
        info!("Client connected. Total: {}", tables.senders.len());
        Some((id, rx))
    }

    pub fn disconnect(&self, id: ClientId) {
        let mut tables = self.tables.lock();
        Self::remove_client(&mut tables, id);
        info!("Client disconnected. Total: {}", tables.senders.len());
    }

    fn remove_client(tables: &mut Tables, id: ClientId) {
        tables.senders.remove(&id);
        if let Some(interests) = tables.by_client.remove(&id) {
            for token in interests {
                if let Some(set) = tables.by_token.get_mut(&token) {
                    set.remove(&id);
                    if set.is_empty() {
                        tables.by_token.remove(&token);
                    }
                }
            }
        }
    }

    /// Add tokens to a subscriber's interest. Re-subscribing is a no-op.
    pub fn subscribe(&self, id: ClientId, tokens: &[String]) {
        let mut tables = self.tables.lock();
        for raw in tokens {
            let token = normalize_token_name(raw);
            tables
                .by_token
                .entry(token.clone())
                .or_default()
                .insert(id);
            if let Some(interests) = tables.by_client.get_mut(&id) {
                interests.insert(token);
            }
        }
        debug!("Client {} subscribed to {:?}", id, tokens);
    }

    pub fn unsubscribe(&self, id: ClientId, tokens: &[String]) {
        let mut tables = self.tables.lock();
        for raw in tokens {
            let token = normalize_token_name(raw);
            if let Some(set) = tables.by_token.get_mut(&token) {
                set.remove(&id);
                if set.is_empty() {
                    tables.by_token.remove(&token);
                }
            }
            if let Some(interests) = tables.by_client.get_mut(&id) {
                interests.remove(&token);
            }
        }
        debug!("Client {} unsubscribed from {:?}", id, tokens);
    }

    pub fn subscribe_all(&self, id: ClientId) {
        let mut tables = self.tables.lock();
        tables
            .by_token
            .entry(ALL_TOKENS.to_string())
            .or_default()
            .insert(id);
        if let Some(interests) = tables.by_client.get_mut(&id) {
            interests.insert(ALL_TOKENS.to_string());
        }
    }

    /// Route one completed observation to every interested subscriber.
    /// Deliveries are single-token, so an explicit subscriber's filtered
    /// envelope and an all-tokens subscriber's full envelope coincide; a
    /// client in both sets is served once. Dead channels are dropped on the
    /// spot, which is the slow-consumer policy: a failed send disconnects
    /// that subscriber and never blocks its peers.
    pub fn deliver(&self, token: &str, observation: &Observation) {
        let frame = json!({
            "type": "data",
            "payload": { token: observation },
        })
        .to_string();

        let mut tables = self.tables.lock();
        let mut recipients: HashSet<ClientId> = HashSet::new();
        if let Some(set) = tables.by_token.get(ALL_TOKENS) {
            recipients.extend(set.iter().copied());
        }
        if let Some(set) = tables.by_token.get(token) {
            recipients.extend(set.iter().copied());
        }

        let mut dead = Vec::new();
        for id in recipients {
            match tables.senders.get(&id) {
                Some(sender) if sender.send(frame.clone()).is_ok() => {}
                _ => dead.push(id),
            }
        }
        for id in dead {
            warn!("Dropping unreachable client {}", id);
            Self::remove_client(&mut tables, id);
        }
    }

    /// Push one control frame to one subscriber. Returns false and removes
    /// the client when its channel is gone.
    pub fn send_personal(&self, id: ClientId, frame: &serde_json::Value) -> bool {
        let mut tables = self.tables.lock();
        let ok = tables
            .senders
            .get(&id)
            .map(|sender| sender.send(frame.to_string()).is_ok())
            .unwrap_or(false);
        if !ok {
            Self::remove_client(&mut tables, id);
        }
        ok
    }

    /// Stop accepting new subscribers and close every outbound channel; the
    /// writer tasks drain and shut their sockets.
    pub fn close_all(&self) {
        let mut tables = self.tables.lock();
        tables.accepting = false;
        let ids: Vec<ClientId> = tables.senders.keys().copied().collect();
        for id in ids {
            Self::remove_client(&mut tables, id);
        }
        info!("Connection manager closed");
    }

    pub fn connection_count(&self) -> usize {
        self.tables.lock().senders.len()
    }

    /// Token names with at least one explicit subscriber.
    pub fn subscribed_tokens(&self) -> HashSet<String> {
        let tables = self.tables.lock();
        tables
            .by_token
            .keys()
            .filter(|name| name.as_str() != ALL_TOKENS)
            .cloned()
            .collect()
    }

    #[cfg(test)]
    fn interest_of(&self, id: ClientId) -> HashSet<String> {
        self.tables
            .lock()
            .by_client
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spread_engine::build_observation;

    fn obs(token: &str) -> Observation {
        build_observation(token, Some(1.0), Some(1.02), None, &[("jupiter", 1.01)], 5.0)
    }

    fn payload_keys(frame: &str) -> Vec<String> {
        let value: serde_json::Value = serde_json::from_str(frame).unwrap();
        assert_eq!(value["type"], "data");
        value["payload"]
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn test_deliver_routes_by_interest() {
        let manager = ConnectionManager::new();
        let (a, mut rx_a) = manager.connect().unwrap();
        let (b, mut rx_b) = manager.connect().unwrap();
        manager.subscribe(a, &["X-USDT".to_string()]);
        manager.subscribe_all(b);

        manager.deliver("X-USDT", &obs("X-USDT"));
        manager.deliver("Y-USDT", &obs("Y-USDT"));

        // A sees only its token.
        let frame = rx_a.try_recv().unwrap();
        assert_eq!(payload_keys(&frame), vec!["X-USDT".to_string()]);
        assert!(rx_a.try_recv().is_err());

        // B sees one envelope per token.
        let first = rx_b.try_recv().unwrap();
        let second = rx_b.try_recv().unwrap();
        assert_eq!(payload_keys(&first), vec!["X-USDT".to_string()]);
        assert_eq!(payload_keys(&second), vec!["Y-USDT".to_string()]);
    }

    #[tokio::test]
    async fn test_subscriber_in_both_sets_served_once() {
        let manager = ConnectionManager::new();
        let (a, mut rx) = manager.connect().unwrap();
        manager.subscribe(a, &["X-USDT".to_string()]);
        manager.subscribe_all(a);

        manager.deliver("X-USDT", &obs("X-USDT"));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resubscribe_is_noop() {
        let manager = ConnectionManager::new();
        let (a, _rx) = manager.connect().unwrap();
        manager.subscribe(a, &["X-USDT".to_string()]);
        manager.subscribe(a, &["X-USDT".to_string()]);
        assert_eq!(manager.interest_of(a).len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_removes_from_all_tables() {
        let manager = ConnectionManager::new();
        let (a, _rx) = manager.connect().unwrap();
        manager.subscribe(a, &["X-USDT".to_string(), "Y-USDT".to_string()]);
        manager.disconnect(a);

        assert_eq!(manager.connection_count(), 0);
        assert!(manager.subscribed_tokens().is_empty());
    }

    #[tokio::test]
    async fn test_dead_channel_is_dropped_on_deliver() {
        let manager = ConnectionManager::new();
        let (a, rx) = manager.connect().unwrap();
        manager.subscribe(a, &["X-USDT".to_string()]);
        drop(rx);

        manager.deliver("X-USDT", &obs("X-USDT"));
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_close_all_stops_accepting() {
        let manager = ConnectionManager::new();
        let (_a, _rx) = manager.connect().unwrap();
        manager.close_all();
        assert_eq!(manager.connection_count(), 0);
        assert!(manager.connect().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_symmetric() {
        let manager = ConnectionManager::new();
        let (a, mut rx) = manager.connect().unwrap();
        manager.subscribe(a, &["X-USDT".to_string()]);
        manager.unsubscribe(a, &["X-USDT".to_string()]);

        manager.deliver("X-USDT", &obs("X-USDT"));
        assert!(rx.try_recv().is_err());
        assert!(manager.interest_of(a).is_empty());
    }
}
