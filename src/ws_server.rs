// WebSocket subscriber transport. The accept loop hands each connection to
// the fan-out manager; a writer task drains the client's outbound channel
// into the socket while the read half parses subscription frames.

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::connection_manager::{ClientId, ConnectionManager};
use crate::latest_snapshot::LatestSnapshot;
use crate::store::normalize_token_name;

pub struct WsServer {
    manager: Arc<ConnectionManager>,
    snapshot: Arc<LatestSnapshot>,
}

impl WsServer {
    pub fn new(manager: Arc<ConnectionManager>, snapshot: Arc<LatestSnapshot>) -> Self {
        Self { manager, snapshot }
    }

    /// Bind and serve until the shutdown signal flips.
    pub async fn run(
        self: Arc<Self>,
        bind_addr: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!("WebSocket server listening on {}", bind_addr);
        self.serve(listener, shutdown).await
    }

    /// Accept subscribers on an existing listener until the shutdown signal
    /// flips, then close every transport through the manager.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    debug!("Connection {} ended: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => error!("Accept failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.manager.close_all();
        info!("WebSocket server stopped");
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let websocket = accept_async(stream).await?;
        let Some((client_id, mut outbound)) = self.manager.connect() else {
            // Shutting down; refuse the handshake by dropping the socket.
            return Ok(());
        };

        let (mut sink, mut reader) = websocket.split();

        // Writer task: owns the sink, drains the manager's channel. A send
        // failure ends the task; the channel closing (disconnect) does too.
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        while let Some(message) = reader.next().await {
            match message {
                Ok(Message::Text(text)) => self.handle_frame(client_id, &text),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("Read error from client {}: {}", client_id, e);
                    break;
                }
            }
        }

        self.manager.disconnect(client_id);
        writer.abort();
        Ok(())
    }

    /// One inbound frame: `{"type": ..., "payload": ...}`. Malformed input
    /// gets an `error` frame; nothing else surfaces to the subscriber.
    fn handle_frame(&self, client_id: ClientId, text: &str) {
        let parsed: serde_json::Value = match serde_json::from_str(text) {
            Ok(parsed) => parsed,
            Err(_) => {
                self.send_error(client_id, "Invalid JSON");
                return;
            }
        };
        let msg_type = parsed.get("type").and_then(|v| v.as_str()).unwrap_or("");
        let payload = parsed.get("payload").cloned().unwrap_or(json!({}));

        match msg_type {
            "subscribe" => {
                let tokens = Self::token_list(&payload);
                if tokens.is_empty() {
                    self.send_error(client_id, "subscribe requires tokens");
                    return;
                }
                self.manager.subscribe(client_id, &tokens);
                self.manager.send_personal(
                    client_id,
                    &json!({"type": "subscribed", "payload": {"tokens": tokens}}),
                );
                let initial = self.snapshot.filtered(&tokens);
                self.manager.send_personal(
                    client_id,
                    &json!({"type": "initial_data", "payload": initial}),
                );
            }
            "subscribe_all" => {
                self.manager.subscribe_all(client_id);
                self.manager.send_personal(
                    client_id,
                    &json!({"type": "subscribed", "payload": {"all": true}}),
                );
            }
            "unsubscribe" => {
                let tokens = Self::token_list(&payload);
                if tokens.is_empty() {
                    self.send_error(client_id, "unsubscribe requires tokens");
                    return;
                }
                self.manager.unsubscribe(client_id, &tokens);
                self.manager.send_personal(
                    client_id,
                    &json!({"type": "unsubscribed", "payload": {"tokens": tokens}}),
                );
            }
            "ping" => {
                self.manager
                    .send_personal(client_id, &json!({"type": "pong", "payload": {}}));
            }
            other => {
                self.send_error(client_id, &format!("Unknown message type: {}", other));
            }
        }
    }

    fn token_list(payload: &serde_json::Value) -> Vec<String> {
        payload
            .get("tokens")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(normalize_token_name)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn send_error(&self, client_id: ClientId, message: &str) {
        self.manager.send_personal(
            client_id,
            &json!({"type": "error", "payload": {"message": message}}),
        );
    }
}
