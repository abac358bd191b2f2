//! WebSocket channel for real-time workflow notifications.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::{
    extract::{Query, State},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::AppState;
use crate::metrics;

/// Maximum number of events to buffer in the broadcast channel.
const BROADCAST_CAPACITY: usize = 1024;

/// Interval between server heartbeats.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Events pushed over the WebSocket channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsEvent {
    /// Connection established
    #[serde(rename = "connection:status")]
    ConnectionStatus { status: String },
    /// Keep-alive ping
    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: String },
    /// A workflow's live definition changed (sync or rollback)
    #[serde(rename = "workflow:update")]
    WorkflowUpdate {
        workflow_id: String,
        workflow_name: String,
    },
    /// A new version snapshot was recorded
    #[serde(rename = "workflow:version")]
    WorkflowVersion {
        workflow_id: String,
        workflow_name: String,
        version: u32,
    },
    /// Authentication failure at connect time
    #[serde(rename = "connection:error")]
    ConnectionError { message: String },
    /// Channel-level error (e.g. dropped messages)
    #[serde(rename = "error")]
    Error { message: String },
}

impl WsEvent {
    fn type_name(&self) -> &'static str {
        match self {
            Self::ConnectionStatus { .. } => "connection:status",
            Self::Heartbeat { .. } => "heartbeat",
            Self::WorkflowUpdate { .. } => "workflow:update",
            Self::WorkflowVersion { .. } => "workflow:version",
            Self::ConnectionError { .. } => "connection:error",
            Self::Error { .. } => "error",
        }
    }
}

/// Query parameters for the WebSocket connection.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// Get the expected channel token from the environment.
fn expected_ws_token() -> Option<String> {
    std::env::var("WFG_WS_TOKEN").ok()
}

/// Validate the channel token with a constant-time comparison.
fn validate_ws_token(provided: Option<&str>) -> bool {
    match (expected_ws_token(), provided) {
        (Some(expected), Some(provided)) => {
            expected.as_bytes().ct_eq(provided.as_bytes()).into()
        }
        (None, _) => {
            warn!("WFG_WS_TOKEN not set - WebSocket channel is unprotected!");
            true
        }
        (Some(_), None) => false,
    }
}

/// Shared broadcaster for workflow events.
///
/// Fan-out is unconditional: every connected client receives every
/// `workflow:update` and `workflow:version` event. Scoping happens at
/// connect time only, via the channel token.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<WsEvent>,
}

impl Broadcaster {
    /// Create a new broadcaster.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.tx.subscribe()
    }

    /// Number of currently subscribed receivers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Broadcast an event to all subscribers.
    pub fn broadcast(&self, event: WsEvent) {
        metrics::record_ws_event(event.type_name());
        // Send errors just mean there are no subscribers
        let _ = self.tx.send(event);
    }

    /// Announce that a workflow's live definition changed.
    pub fn workflow_updated(&self, workflow_id: &str, workflow_name: &str) {
        self.broadcast(WsEvent::WorkflowUpdate {
            workflow_id: workflow_id.to_string(),
            workflow_name: workflow_name.to_string(),
        });
    }

    /// Announce a newly recorded version snapshot.
    pub fn version_created(&self, workflow_id: &str, workflow_name: &str, version: u32) {
        self.broadcast(WsEvent::WorkflowVersion {
            workflow_id: workflow_id.to_string(),
            workflow_name: workflow_name.to_string(),
            version,
        });
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// WebSocket upgrade handler for `/api/ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let authorized = validate_ws_token(query.token.as_deref());
    ws.on_upgrade(move |socket| handle_socket(socket, state, authorized))
}

async fn handle_socket(socket: WebSocket, state: AppState, authorized: bool) {
    let (mut sender, mut receiver) = socket.split();

    if !authorized {
        // Reject after upgrade: one connection:error event, then close.
        // The client never joins the broadcast set.
        warn!("WebSocket connection rejected: invalid or missing token");
        let rejection = WsEvent::ConnectionError {
            message: "Invalid or missing authentication token".to_string(),
        };
        let _ = send_event(&mut sender, &rejection).await;
        let _ = sender.send(Message::Close(None)).await;
        return;
    }

    let mut rx = state.broadcaster.subscribe();
    metrics::inc_ws_connections();
    info!("WebSocket client connected");

    let connected = WsEvent::ConnectionStatus {
        status: "connected".to_string(),
    };
    if let Err(e) = send_event(&mut sender, &connected).await {
        error!("Failed to send connection status: {}", e);
        metrics::dec_ws_connections();
        return;
    }

    // First heartbeat fires one interval after connect, not immediately
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );

    // The heartbeat stops with the loop when the client disconnects.
    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received message from client: {}", text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client requested close");
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    None => {
                        info!("Client disconnected");
                        break;
                    }
                    _ => {}
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        if let Err(e) = send_event(&mut sender, &event).await {
                            error!("Failed to send event: {}", e);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client lagged behind by {} messages", n);
                        let error = WsEvent::Error {
                            message: format!("Dropped {} messages due to lag", n),
                        };
                        let _ = send_event(&mut sender, &error).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Broadcast channel closed");
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                let beat = WsEvent::Heartbeat {
                    timestamp: chrono::Utc::now().to_rfc3339(),
                };
                if let Err(e) = send_event(&mut sender, &beat).await {
                    debug!("Heartbeat failed, client gone: {}", e);
                    break;
                }
            }
        }
    }

    metrics::dec_ws_connections();
    info!("WebSocket client disconnected");
}

/// Send an event to the WebSocket client.
async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &WsEvent,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    sender
        .send(Message::Text(json.into()))
        .await
        .map_err(axum::Error::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_reaches_all_subscribers() {
        let broadcaster = Broadcaster::new();
        let mut rx1 = broadcaster.subscribe();
        let mut rx2 = broadcaster.subscribe();

        broadcaster.workflow_updated("wf-1", "Lead routing");

        for rx in [&mut rx1, &mut rx2] {
            match rx.try_recv().unwrap() {
                WsEvent::WorkflowUpdate {
                    workflow_id,
                    workflow_name,
                } => {
                    assert_eq!(workflow_id, "wf-1");
                    assert_eq!(workflow_name, "Lead routing");
                }
                other => panic!("Unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_version_created_event() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe();

        broadcaster.version_created("wf-1", "Lead routing", 4);

        match rx.try_recv().unwrap() {
            WsEvent::WorkflowVersion { version, .. } => assert_eq!(version, 4),
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_event_type_names() {
        let event = WsEvent::ConnectionStatus {
            status: "connected".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"connection:status""#));

        let event = WsEvent::WorkflowVersion {
            workflow_id: "wf-1".to_string(),
            workflow_name: "wf".to_string(),
            version: 2,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"workflow:version""#));

        let event = WsEvent::ConnectionError {
            message: "bad token".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"connection:error""#));
    }

    #[test]
    fn test_channel_token_gates_connections() {
        // One test for all token cases so the env var is not raced
        std::env::set_var("WFG_WS_TOKEN", "channel-secret");

        assert!(validate_ws_token(Some("channel-secret")));
        assert!(!validate_ws_token(Some("wrong-token")));
        assert!(!validate_ws_token(None));

        std::env::remove_var("WFG_WS_TOKEN");
        // With no token configured the channel is open
        assert!(validate_ws_token(None));
    }

    #[test]
    fn test_broadcast_without_subscribers_is_fine() {
        let broadcaster = Broadcaster::new();
        broadcaster.workflow_updated("wf-1", "wf");
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
