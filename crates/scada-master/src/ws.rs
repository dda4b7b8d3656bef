//! ---
//! scada_section: "07-networking-external-interfaces"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "SCADA master: registry, aggregation, alarms, control, security, surfaces."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregator::Aggregator;
use crate::alarms::AlarmEngine;
use crate::auth::AuthService;
use crate::bus::{FanoutBus, WsMessage};
use crate::registry::NodeRegistry;
use crate::security::SecurityEngine;
use crate::store::TelemetryStore;

/// Sends that stall longer than this mark the client a slow consumer and end
/// the session.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// State for the WebSocket surface.
pub struct WsState {
    /// Token verification.
    pub auth: Arc<AuthService>,
    /// Fan-out bus.
    pub bus: Arc<FanoutBus>,
    /// Registry (snapshot contents).
    pub registry: Arc<NodeRegistry>,
    /// Store (snapshot contents).
    pub store: Arc<TelemetryStore>,
    /// Alarm engine (snapshot contents).
    pub alarms: Arc<AlarmEngine>,
    /// Security engine (snapshot counters).
    pub security: Arc<SecurityEngine>,
    /// Aggregator (snapshot grid rollup).
    pub aggregator: Arc<Aggregator>,
}

impl WsState {
    /// Build the `FullStateSnapshot` delivered on subscribe.
    pub fn full_snapshot(&self) -> WsMessage {
        let nodes = self.registry.list_nodes();
        let mut telemetry = HashMap::new();
        for node in &nodes {
            if let Some(sample) = self.store.latest(&node.node_id) {
                telemetry.insert(node.node_id.clone(), sample);
            }
        }
        WsMessage::FullStateSnapshot {
            grid: Some(self.aggregator.snapshot()),
            nodes,
            telemetry,
            alarms: self.alarms.active_alarms(),
            security: self.security.counters(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WsState>>,
    Query(query): Query<WsQuery>,
) -> Response {
    // Tokens are checked before the upgrade completes; an invalid token never
    // gets a socket.
    let Some(token) = query.token else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let claims = match state.auth.verify(&token) {
        Ok(claims) => claims,
        Err(_) => return StatusCode::UNAUTHORIZED.into_response(),
    };
    debug!(user = %claims.sub, "dashboard websocket authenticated");
    ws.on_upgrade(move |socket| client_loop(socket, state, claims.sub))
}

async fn client_loop(mut socket: WebSocket, state: Arc<WsState>, user: String) {
    let mut subscription = state.bus.subscribe(state.full_snapshot());
    info!(user = %user, "dashboard subscribed");

    loop {
        tokio::select! {
            message = subscription.recv() => {
                let Some(message) = message else { break };
                let Ok(text) = serde_json::to_string(&message) else {
                    warn!("failed to serialise fan-out message");
                    continue;
                };
                match tokio::time::timeout(WRITE_DEADLINE, socket.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        warn!(user = %user, "websocket write deadline exceeded; dropping slow consumer");
                        break;
                    }
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
    info!(user = %user, "dashboard disconnected");
}

/// Handle for the running WebSocket server.
pub struct WsServerHandle {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WsServerHandle {
    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Graceful shutdown.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await?;
        Ok(())
    }
}

/// Bind and spawn the WebSocket surface at `/ws/grid`.
pub async fn spawn_ws(listen: SocketAddr, state: Arc<WsState>) -> anyhow::Result<WsServerHandle> {
    let listener = TcpListener::bind(listen).await?;
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "websocket server listening");

    let app = Router::new()
        .route("/ws/grid", get(upgrade_handler))
        .with_state(state);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        if let Err(err) = server.await {
            warn!(error = %err, "websocket server exited with error");
        }
    });

    Ok(WsServerHandle {
        address: local_addr,
        shutdown: shutdown_tx,
        task,
    })
}
