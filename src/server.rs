//! Central relay endpoint for monitored sessions and dashboards.
//!
//! This module provides a WebSocket server that:
//! - Accepts event streams from monitored sessions at `/ws/{session_id}`
//! - Scores every event against the session's running risk total
//! - Relays events and score changes to every client at `/ws/dashboard`
//! - Pushes an `alert` back to a session when it becomes flagged
//!
//! # Architecture
//!
//! ```text
//! session ──▶ /ws/{id} ──▶ [RiskLedger] ──▶ broadcast ──▶ /ws/dashboard
//!    ▲                          │
//!    └────────── alert ◀────────┘
//! ```

use crate::event::{Event, WireMessage, ALERT_TYPE, SCORE_UPDATE_TYPE};
use crate::risk::{PatternWeights, RiskLedger, RiskStatus, RiskThresholds, ScoreWeights};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::HeaderValue,
    response::Response,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tower_http::cors::{Any, CorsLayer};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind to (0 for random)
    pub port: u16,
    pub thresholds: RiskThresholds,
    /// Scoring window
    pub window: Duration,
    /// Sequence scoring, off unless set
    pub patterns: Option<PatternWeights>,
}

impl ServerConfig {
    pub fn new(port: u16, thresholds: RiskThresholds, window: Duration) -> Self {
        Self {
            port,
            thresholds,
            window,
            patterns: None,
        }
    }

    pub fn with_patterns(mut self, patterns: Option<PatternWeights>) -> Self {
        self.patterns = patterns;
        self
    }
}

/// Outbound channel of one session socket, tagged with its connection id
struct SessionLink {
    connection: u64,
    tx: mpsc::UnboundedSender<String>,
}

/// Shared relay state
pub struct Hub {
    dashboards: broadcast::Sender<String>,
    sessions: RwLock<HashMap<String, SessionLink>>,
    next_connection: AtomicU64,
    ledger: Mutex<RiskLedger>,
}

impl Hub {
    pub fn new(config: &ServerConfig) -> Self {
        let (dashboards, _) = broadcast::channel(1024);
        let mut ledger =
            RiskLedger::new(ScoreWeights::default(), config.thresholds).with_window(config.window);
        if let Some(patterns) = config.patterns {
            ledger = ledger.with_patterns(patterns);
        }
        Self {
            dashboards,
            sessions: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            ledger: Mutex::new(ledger),
        }
    }

    /// Route alerts for `session_id` to `tx`, replacing any older socket.
    /// Returns the connection id to hand back on unregister.
    async fn register(&self, session_id: &str, tx: mpsc::UnboundedSender<String>) -> u64 {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), SessionLink { connection, tx });
        tracing::info!("Session {} connected ({})", session_id, connection);
        connection
    }

    /// Drop the route only if it still belongs to `connection`. A session
    /// that reconnected before its old socket closed keeps its new route.
    async fn unregister(&self, session_id: &str, connection: u64) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(session_id)
            .is_some_and(|link| link.connection == connection)
        {
            sessions.remove(session_id);
        }
        tracing::info!("Session {} disconnected ({})", session_id, connection);
    }

    fn broadcast<T: Serialize>(&self, message: &T) {
        match serde_json::to_string(message) {
            // No dashboards connected is fine
            Ok(text) => {
                let _ = self.dashboards.send(text);
            }
            Err(e) => tracing::warn!("Failed to encode broadcast: {}", e),
        }
    }

    async fn send_to_session(&self, session_id: &str, message: &WireMessage) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Failed to encode session message: {}", e);
                return;
            }
        };
        if let Some(link) = self.sessions.read().await.get(session_id) {
            let _ = link.tx.send(text);
        }
    }

    /// Handle one inbound frame from a session socket.
    pub async fn ingest(&self, session_id: &str, text: &str) {
        let mut message: WireMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping malformed frame from {}: {}", session_id, e);
                return;
            }
        };
        // The socket path is authoritative for the session
        message.session_id = Some(session_id.to_string());

        let Some(event) = Event::from_wire(message) else {
            tracing::debug!("Ignoring non-event frame from {}", session_id);
            return;
        };
        if !event.event_type().is_known() {
            tracing::warn!(
                "Dropping {} event from {}: unknown type",
                event.event_type(),
                session_id
            );
            return;
        }

        self.broadcast(&event.to_live_event());

        let assessment = self.ledger.lock().await.record(&event);
        if assessment.delta == 0 {
            return;
        }
        tracing::info!(
            "Score: {} - {} ({})",
            session_id,
            assessment.score,
            assessment.status
        );
        self.broadcast(&WireMessage::new(
            SCORE_UPDATE_TYPE,
            serde_json::to_value(&assessment).unwrap_or_default(),
        ));

        if assessment.status == RiskStatus::Flagged {
            let alert = WireMessage::new(
                ALERT_TYPE,
                json!({
                    "message": "Suspicious behavior detected!",
                    "score": assessment.score,
                    "flags": assessment.flags,
                }),
            );
            self.send_to_session(session_id, &alert).await;
        }
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /ws/dashboard
async fn dashboard_socket(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> Response {
    ws.on_upgrade(move |socket| handle_dashboard(socket, hub))
}

/// GET /ws/{session_id}
async fn session_socket(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(hub): State<Arc<Hub>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_session(socket, session_id, hub))
}

async fn handle_session(socket: WebSocket, session_id: String, hub: Arc<Hub>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let connection = hub.register(&session_id, tx).await;

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => hub.ingest(&session_id, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Session {} socket error: {}", session_id, e);
                break;
            }
        }
    }

    hub.unregister(&session_id, connection).await;
    writer.abort();
}

async fn handle_dashboard(socket: WebSocket, hub: Arc<Hub>) {
    let (mut sink, mut stream) = socket.split();
    let mut updates = hub.dashboards.subscribe();
    tracing::info!("Dashboard connected");

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Dashboard lagging, skipped {} messages", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            frame = stream.next() => match frame {
                // Dashboards only keep the socket alive
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::info!("Dashboard disconnected");
}

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/dashboard", get(dashboard_socket))
        .route("/ws/:session_id", get(session_socket))
        .layer(
            CorsLayer::new()
                .allow_origin([
                    HeaderValue::from_static("http://localhost:5173"),
                    HeaderValue::from_static("http://localhost:3000"),
                ])
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(hub)
}

/// Run the relay server
pub async fn run(
    config: ServerConfig,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let hub = Arc::new(Hub::new(&config));
    let app = router(hub);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Relay listening on ws://{}/ws", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    fn hub() -> Hub {
        Hub::new(&ServerConfig::new(
            0,
            RiskThresholds::default(),
            Duration::from_secs(10),
        ))
    }

    #[tokio::test]
    async fn test_ingest_relays_and_scores() {
        let hub = hub();
        let mut dashboard = hub.dashboards.subscribe();
        let (tx, mut session_rx) = mpsc::unbounded_channel();
        hub.register("S-1", tx).await;

        let tab = Event::new(EventType::Screen, "ignored", 1, json!({"trigger": "tab_change"}));
        hub.ingest("S-1", &serde_json::to_string(&tab).unwrap()).await;

        let relayed: WireMessage = serde_json::from_str(&dashboard.recv().await.unwrap()).unwrap();
        let event = Event::from_wire(relayed).unwrap();
        assert_eq!(event.session_id(), "S-1");
        assert_eq!(event.timestamp(), 1);

        let score: WireMessage = serde_json::from_str(&dashboard.recv().await.unwrap()).unwrap();
        assert_eq!(score.kind, SCORE_UPDATE_TYPE);
        assert_eq!(score.data["score"], json!(5));
        assert!(session_rx.try_recv().is_err());

        let copy = Event::new(EventType::Screen, "S-1", 2, json!({"trigger": "copy"}));
        hub.ingest("S-1", &serde_json::to_string(&copy).unwrap()).await;
        let alert: WireMessage = serde_json::from_str(&session_rx.recv().await.unwrap()).unwrap();
        assert!(alert.is_alert());
        assert_eq!(alert.data["score"], json!(12));
    }

    #[tokio::test]
    async fn test_stale_socket_close_keeps_reconnected_route() {
        let hub = hub();
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        let old = hub.register("S-1", old_tx).await;
        let new = hub.register("S-1", new_tx).await;
        assert_ne!(old, new);

        // the old socket notices its close only after the reconnect
        hub.unregister("S-1", old).await;

        let tab = Event::new(EventType::Screen, "S-1", 1, json!({"trigger": "tab_change"}));
        let copy = Event::new(EventType::Screen, "S-1", 6_000, json!({"trigger": "copy"}));
        hub.ingest("S-1", &serde_json::to_string(&tab).unwrap()).await;
        hub.ingest("S-1", &serde_json::to_string(&copy).unwrap()).await;

        let alert: WireMessage = serde_json::from_str(&new_rx.recv().await.unwrap()).unwrap();
        assert!(alert.is_alert());

        hub.unregister("S-1", new).await;
        assert!(hub.sessions.read().await.get("S-1").is_none());
    }

    #[tokio::test]
    async fn test_pattern_scoring_reaches_alert() {
        let config = ServerConfig::new(0, RiskThresholds::default(), Duration::from_secs(10))
            .with_patterns(Some(PatternWeights::default()));
        let hub = Hub::new(&config);
        let (tx, mut session_rx) = mpsc::unbounded_channel();
        hub.register("S-1", tx).await;

        let tab = Event::new(EventType::Screen, "S-1", 1, json!({"trigger": "tab_change"}));
        let paste = Event::new(EventType::Screen, "S-1", 800, json!({"trigger": "paste"}));
        hub.ingest("S-1", &serde_json::to_string(&tab).unwrap()).await;
        hub.ingest("S-1", &serde_json::to_string(&paste).unwrap()).await;

        let alert: WireMessage = serde_json::from_str(&session_rx.recv().await.unwrap()).unwrap();
        assert_eq!(alert.data["score"], json!(17));
        assert_eq!(
            alert.data["flags"][2],
            json!("Suspicious tab-change followed by copy/paste")
        );
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let hub = hub();
        let mut dashboard = hub.dashboards.subscribe();
        hub.ingest("S-1", "not json").await;
        hub.ingest("S-1", r#"{"type":"alert","data":{}}"#).await;
        hub.ingest("S-1", r#"{"type":"heartbeat","data":{},"timestamp":1}"#).await;
        assert!(dashboard.try_recv().is_err());
    }
}
