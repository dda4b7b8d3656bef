//! ---
//! scada_section: "07-networking-external-interfaces"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "SCADA master: registry, aggregation, alarms, control, security, surfaces."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use scada_common::{ErrorKind, ServiceError};
use scada_proto::BreakerAction;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregator::Aggregator;
use crate::alarms::AlarmEngine;
use crate::audit::{AuditLog, AuditResult};
use crate::auth::{AuthService, Claims, Permission};
use crate::link::LinkManager;
use crate::registry::NodeRegistry;
use crate::sbo::SboCoordinator;
use crate::security::{SecurityEngine, SecurityEventType};
use crate::store::TelemetryStore;

const DEFAULT_TELEMETRY_LIMIT: usize = 1000;
const MAX_FIELD_LEN: usize = 64;
const MAX_REASON_LEN: usize = 256;

/// Everything the HTTP handlers need.
pub struct HttpState {
    /// Node registry.
    pub registry: Arc<NodeRegistry>,
    /// Telemetry store.
    pub store: Arc<TelemetryStore>,
    /// Alarm engine.
    pub alarms: Arc<AlarmEngine>,
    /// Control coordinator.
    pub sbo: Arc<SboCoordinator>,
    /// Security engine.
    pub security: Arc<SecurityEngine>,
    /// Token issuance and the authorisation gate.
    pub auth: Arc<AuthService>,
    /// Audit log.
    pub audit: Arc<AuditLog>,
    /// Grid aggregator.
    pub aggregator: Arc<Aggregator>,
    /// Node links (isolation commands).
    pub links: Arc<LinkManager>,
}

/// Error wrapper rendering the `{"error":{...}}` envelope with the mandated
/// status code.
struct ApiError(ServiceError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0.envelope())).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_owned)
}

/// The authorisation gate wrapping every protected route. Denials emit the
/// mandated side effects: an audit entry and a security event.
fn gate(
    state: &HttpState,
    headers: &HeaderMap,
    peer: IpAddr,
    permission: Permission,
    action: &str,
) -> Result<Claims, ApiError> {
    let Some(token) = bearer_token(headers) else {
        state.security.emit(
            SecurityEventType::AuthFailure,
            "warning",
            None,
            Some(peer.to_string()),
            format!("missing bearer token on {action}"),
            json!({}),
        );
        return Err(ServiceError::new(ErrorKind::AuthFailure, "missing bearer token").into());
    };
    match state.auth.authorise(&token, permission) {
        Ok(claims) => Ok(claims),
        Err(err) => {
            match err.kind {
                ErrorKind::PermissionDenied => {
                    let sub = state
                        .auth
                        .verify(&token)
                        .map(|claims| claims.sub)
                        .unwrap_or_else(|_| "unknown".to_string());
                    state.audit.record(
                        &sub,
                        action,
                        "endpoint",
                        action,
                        AuditResult::Denied,
                        &peer.to_string(),
                        json!({ "permission": format!("{permission:?}") }),
                    );
                    state.security.emit(
                        SecurityEventType::PermissionDenied,
                        "warning",
                        None,
                        Some(peer.to_string()),
                        format!("{sub} lacks {permission:?} for {action}"),
                        json!({ "user": sub }),
                    );
                }
                _ => {
                    state.security.emit(
                        SecurityEventType::AuthFailure,
                        "warning",
                        None,
                        Some(peer.to_string()),
                        format!("invalid token on {action}"),
                        json!({}),
                    );
                }
            }
            Err(err.into())
        }
    }
}

fn check_len(value: &str, field: &str, max: usize) -> Result<(), ApiError> {
    if value.is_empty() || value.len() > max {
        return Err(ServiceError::validation(format!(
            "field '{field}' must be 1..={max} characters"
        ))
        .into());
    }
    Ok(())
}

/// Strict body parsing: unknown fields, wrong types, and missing fields all
/// surface as `Validation` (400), not as the framework's default rejection.
fn parse_body<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, ApiError> {
    serde_json::from_value(value)
        .map_err(|err| ServiceError::validation(format!("invalid request body: {err}")).into())
}

// ---------------------------------------------------------------------------
// Request bodies. Unknown fields are rejected at the boundary.

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AcknowledgeRequest {
    operator_id: String,
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SelectRequest {
    node_id: String,
    breaker_id: String,
    action: BreakerAction,
    operator_id: String,
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OperateRequest {
    session_id: Uuid,
    operator_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CancelRequest {
    session_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IsolateRequest {
    operator_id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BlockRequest {
    client_ip: String,
}

#[derive(Debug, Deserialize)]
struct TelemetryQuery {
    #[serde(default)]
    from: Option<DateTime<Utc>>,
    #[serde(default)]
    to: Option<DateTime<Utc>>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    #[serde(default)]
    limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Handlers.

async fn get_health(State(state): State<Arc<HttpState>>) -> Json<serde_json::Value> {
    let counts = state.registry.counts();
    Json(json!({
        "status": "healthy",
        "nodes_connected": counts.online,
        "nodes_offline": counts.offline,
    }))
}

async fn post_login(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let request: LoginRequest = parse_body(body)?;
    check_len(&request.username, "username", MAX_FIELD_LEN)?;
    check_len(&request.password, "password", 128)?;

    match state.auth.login(&request.username, &request.password) {
        Ok(token) => {
            state.audit.record(
                &request.username,
                "auth.login",
                "session",
                &request.username,
                AuditResult::Success,
                &peer.ip().to_string(),
                json!({}),
            );
            Ok(Json(token).into_response())
        }
        Err(err) => {
            state.audit.record(
                &request.username,
                "auth.login",
                "session",
                &request.username,
                AuditResult::Denied,
                &peer.ip().to_string(),
                json!({ "reason": err.message }),
            );
            state.security.emit(
                SecurityEventType::AuthFailure,
                "warning",
                None,
                Some(peer.ip().to_string()),
                format!("failed login for '{}'", request.username),
                json!({}),
            );
            Err(err.into())
        }
    }
}

async fn get_grid_overview(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    gate(&state, &headers, peer.ip(), Permission::ReadGrid, "grid.read")?;
    Ok(Json(state.aggregator.snapshot()).into_response())
}

async fn get_nodes(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    gate(&state, &headers, peer.ip(), Permission::ReadNodes, "nodes.read")?;
    Ok(Json(state.registry.list_nodes()).into_response())
}

async fn get_node(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
) -> Result<Response, ApiError> {
    gate(&state, &headers, peer.ip(), Permission::ReadNodes, "nodes.read")?;
    let Some(view) = state.registry.get_node(&node_id) else {
        return Err(ServiceError::validation(format!("unknown node {node_id}")).into());
    };
    let mut body = serde_json::to_value(&view)
        .map_err(|_| ServiceError::new(ErrorKind::Internal, "serialization failed"))?;
    body["latest_telemetry"] = serde_json::to_value(state.store.latest(&node_id))
        .map_err(|_| ServiceError::new(ErrorKind::Internal, "serialization failed"))?;
    Ok(Json(body).into_response())
}

async fn get_node_telemetry(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
    Query(query): Query<TelemetryQuery>,
) -> Result<Response, ApiError> {
    gate(
        &state,
        &headers,
        peer.ip(),
        Permission::ReadHistorian,
        "telemetry.read",
    )?;
    if state.registry.get_node(&node_id).is_none() {
        return Err(ServiceError::validation(format!("unknown node {node_id}")).into());
    }
    let limit = query.limit.unwrap_or(DEFAULT_TELEMETRY_LIMIT).min(3600);
    let samples = state.store.query(&node_id, query.from, query.to, limit);
    Ok(Json(json!({ "node_id": node_id, "samples": samples })).into_response())
}

async fn get_active_alarms(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    gate(&state, &headers, peer.ip(), Permission::ReadAlarms, "alarms.read")?;
    Ok(Json(state.alarms.active_alarms()).into_response())
}

async fn post_acknowledge_alarm(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(alarm_id): Path<Uuid>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let request: AcknowledgeRequest = parse_body(body)?;
    gate(
        &state,
        &headers,
        peer.ip(),
        Permission::AcknowledgeAlarm,
        "alarm.acknowledge",
    )?;
    check_len(&request.operator_id, "operator_id", MAX_FIELD_LEN)?;

    let outcome = state
        .alarms
        .acknowledge(alarm_id, &request.operator_id, request.comment.as_deref());
    let (result, metadata) = match &outcome {
        Ok(_) => (AuditResult::Success, json!({ "comment": request.comment })),
        Err(err) => (AuditResult::Failure, json!({ "error": err.message })),
    };
    state.audit.record(
        &request.operator_id,
        "alarm.acknowledge",
        "alarm",
        &alarm_id.to_string(),
        result,
        &peer.ip().to_string(),
        metadata,
    );
    outcome?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn post_sbo_select(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let request: SelectRequest = parse_body(body)?;
    gate(
        &state,
        &headers,
        peer.ip(),
        Permission::ControlBreaker,
        "sbo.select",
    )?;
    check_len(&request.node_id, "node_id", MAX_FIELD_LEN)?;
    check_len(&request.breaker_id, "breaker_id", MAX_FIELD_LEN)?;
    check_len(&request.operator_id, "operator_id", MAX_FIELD_LEN)?;
    check_len(&request.reason, "reason", MAX_REASON_LEN)?;

    let session = state.sbo.select(
        &request.node_id,
        &request.breaker_id,
        request.action,
        &request.operator_id,
        &request.reason,
        &peer.ip().to_string(),
    )?;
    Ok(Json(json!({
        "session_id": session.session_id,
        "expires_at": session.deadline,
        "time_remaining_s": session.time_remaining_s(),
    }))
    .into_response())
}

async fn post_sbo_operate(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let request: OperateRequest = parse_body(body)?;
    gate(
        &state,
        &headers,
        peer.ip(),
        Permission::ControlBreaker,
        "sbo.operate",
    )?;
    check_len(&request.operator_id, "operator_id", MAX_FIELD_LEN)?;

    let outcome = state
        .sbo
        .operate(request.session_id, &request.operator_id, &peer.ip().to_string())
        .await?;
    Ok(Json(json!({
        "result": outcome.result,
        "new_breaker_state": outcome.new_breaker_state,
        "response_time_ms": outcome.response_time_ms,
    }))
    .into_response())
}

async fn post_sbo_cancel(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let request: CancelRequest = parse_body(body)?;
    let claims = gate(
        &state,
        &headers,
        peer.ip(),
        Permission::ControlBreaker,
        "sbo.cancel",
    )?;
    state
        .sbo
        .cancel(request.session_id, &claims.sub, &peer.ip().to_string())?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn post_isolate(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let request: IsolateRequest = parse_body(body)?;
    gate(
        &state,
        &headers,
        peer.ip(),
        Permission::IsolateNode,
        "node.isolate",
    )?;
    check_len(&request.operator_id, "operator_id", MAX_FIELD_LEN)?;
    if state.registry.get_node(&node_id).is_none() {
        return Err(ServiceError::validation(format!("unknown node {node_id}")).into());
    }

    state.audit.record(
        &request.operator_id,
        "node.isolate",
        "node",
        &node_id,
        AuditResult::Success,
        &peer.ip().to_string(),
        json!({ "reason": request.reason }),
    );
    info!(node = %node_id, operator = %request.operator_id, "isolation accepted");

    // Accepted: the command is dispatched asynchronously; the result shows up
    // as breaker events and telemetry.
    let links = state.links.clone();
    tokio::spawn(async move {
        if let Err(err) = links
            .send_command(&node_id, scada_proto::Command::Isolate, std::time::Duration::from_secs(2))
            .await
        {
            warn!(node = %node_id, error = %err, "isolation dispatch failed");
        }
    });
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn get_security_connections(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    gate(
        &state,
        &headers,
        peer.ip(),
        Permission::ViewSecurity,
        "security.connections",
    )?;
    let counters = state.security.counters();
    Ok(Json(json!({
        "authorised": counters.authorised,
        "unknown": counters.unknown,
        "by_node": state.security.by_node(),
    }))
    .into_response())
}

async fn post_security_block(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let request: BlockRequest = parse_body(body)?;
    let claims = gate(
        &state,
        &headers,
        peer.ip(),
        Permission::BlockIp,
        "security.block",
    )?;
    if request.client_ip.parse::<IpAddr>().is_err() {
        return Err(ServiceError::validation("client_ip must be a valid address").into());
    }

    let changed = state.security.block(&request.client_ip, &claims.sub);
    state.audit.record(
        &claims.sub,
        "security.block",
        "client_ip",
        &request.client_ip,
        AuditResult::Success,
        &peer.ip().to_string(),
        json!({ "already_blocked": !changed }),
    );
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn get_security_audit(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> Result<Response, ApiError> {
    gate(
        &state,
        &headers,
        peer.ip(),
        Permission::ViewAudit,
        "security.audit",
    )?;
    let limit = query.limit.unwrap_or(100).min(1000);
    Ok(Json(state.audit.recent(limit)).into_response())
}

/// Build the router for the master's HTTP surface. A panicking handler is
/// caught at the task boundary and answered with 500; the process survives.
pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/auth/login", post(post_login))
        .route("/grid/overview", get(get_grid_overview))
        .route("/nodes", get(get_nodes))
        .route("/nodes/:id", get(get_node))
        .route("/nodes/:id/telemetry", get(get_node_telemetry))
        .route("/alarms/active", get(get_active_alarms))
        .route("/alarms/:id/acknowledge", post(post_acknowledge_alarm))
        .route("/control/breaker/select", post(post_sbo_select))
        .route("/control/breaker/operate", post(post_sbo_operate))
        .route("/control/breaker/cancel", post(post_sbo_cancel))
        .route("/control/isolation/:node_id", post(post_isolate))
        .route("/security/connections", get(get_security_connections))
        .route("/security/block", post(post_security_block))
        .route("/security/audit", get(get_security_audit))
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

/// Handle for the running HTTP server.
pub struct HttpServerHandle {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HttpServerHandle {
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

/// Bind and spawn the HTTP surface.
pub async fn spawn_http(listen: SocketAddr, state: Arc<HttpState>) -> anyhow::Result<HttpServerHandle> {
    let listener = TcpListener::bind(listen).await?;
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "http api listening");

    let app = router(state);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        if let Err(err) = server.await {
            warn!(error = %err, "http server exited with error");
        }
    });

    Ok(HttpServerHandle {
        address: local_addr,
        shutdown: shutdown_tx,
        task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FanoutBus;
    use crate::link::NodeLink;
    use scada_common::config::{default_catalogue, ControlConfig};
    use scada_historian::{spawn_writer, NdjsonSink, WriterConfig};
    use scada_proto::{CommandOutcome, LinkState, ReplyFrame};
    use std::time::Duration;
    use tempfile::tempdir;

    struct Fixture {
        state: Arc<HttpState>,
        base: String,
        client: reqwest::Client,
        _handle: HttpServerHandle,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let registry = Arc::new(NodeRegistry::new(&default_catalogue()));
        let store = Arc::new(TelemetryStore::new(64));
        let bus = Arc::new(FanoutBus::new(256, None));
        let sink = Arc::new(NdjsonSink::new(dir.path()).unwrap());
        let historian = Arc::new(spawn_writer(sink, WriterConfig::default()));
        let alarms = Arc::new(AlarmEngine::new(bus.clone(), historian.clone(), None));
        let links = Arc::new(LinkManager::new());
        let security = Arc::new(SecurityEngine::new(
            [],
            bus.clone(),
            historian.clone(),
            links.clone(),
        ));
        let audit = Arc::new(AuditLog::new(historian.clone()));
        let auth = Arc::new(AuthService::with_default_users(
            "test-secret",
            Duration::from_secs(3600),
        ));
        let sbo = Arc::new(SboCoordinator::new(
            registry.clone(),
            links.clone(),
            alarms.clone(),
            audit.clone(),
            ControlConfig::default(),
            None,
        ));
        let aggregator = Arc::new(Aggregator::new(
            registry.clone(),
            store.clone(),
            alarms.clone(),
            bus.clone(),
            historian,
        ));

        let state = Arc::new(HttpState {
            registry,
            store,
            alarms,
            sbo,
            security,
            auth,
            audit,
            aggregator,
            links,
        });
        let handle = spawn_http("127.0.0.1:0".parse().unwrap(), state.clone())
            .await
            .unwrap();
        let base = format!("http://{}", handle.local_addr());
        Fixture {
            state,
            base,
            client: reqwest::Client::new(),
            _handle: handle,
            _dir: dir,
        }
    }

    async fn login(f: &Fixture, username: &str, password: &str) -> String {
        let response: serde_json::Value = f
            .client
            .post(format!("{}/auth/login", f.base))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        response["access_token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_is_public_and_reports_counts() {
        let f = fixture().await;
        for node in f.state.registry.list_nodes() {
            f.state
                .registry
                .set_link_state(&node.node_id, LinkState::Connected);
        }
        let body: serde_json::Value = f
            .client
            .get(format!("{}/health", f.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["nodes_connected"], 15);
        assert_eq!(body["nodes_offline"], 0);
    }

    #[tokio::test]
    async fn login_then_grid_overview() {
        let f = fixture().await;
        for node in f.state.registry.list_nodes() {
            f.state
                .registry
                .set_link_state(&node.node_id, LinkState::Connected);
        }
        let token = login(&f, "admin", "scada@2024").await;
        let body: serde_json::Value = f
            .client
            .get(format!("{}/grid/overview", f.base))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["nodes_online"], 15);
        assert_eq!(body["nodes_offline"], 0);
    }

    #[tokio::test]
    async fn bad_credentials_are_401_with_envelope() {
        let f = fixture().await;
        let response = f
            .client
            .post(format!("{}/auth/login", f.base))
            .json(&json!({ "username": "admin", "password": "nope" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"]["kind"], "AuthFailure");
        // Failed login leaves an audit trail and a security event.
        assert!(!f.state.audit.find_by_action("auth.login").is_empty());
        assert!(!f.state.security.recent_events(10).is_empty());
    }

    #[tokio::test]
    async fn missing_token_is_401() {
        let f = fixture().await;
        let response = f
            .client
            .get(format!("{}/nodes", f.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
    }

    #[tokio::test]
    async fn viewer_is_denied_every_mutating_endpoint() {
        let f = fixture().await;
        f.state
            .registry
            .set_link_state("SUB-001", LinkState::Connected);
        let token = login(&f, "viewer1", "view@2024").await;

        let alarm_id = Uuid::new_v4();
        let attempts: Vec<(reqwest::RequestBuilder, &str)> = vec![
            (
                f.client
                    .post(format!("{}/alarms/{alarm_id}/acknowledge", f.base))
                    .json(&json!({ "operator_id": "viewer1" })),
                "acknowledge",
            ),
            (
                f.client
                    .post(format!("{}/control/breaker/select", f.base))
                    .json(&json!({
                        "node_id": "SUB-001",
                        "breaker_id": "BRK-01",
                        "action": "open",
                        "operator_id": "viewer1",
                        "reason": "test",
                    })),
                "select",
            ),
            (
                f.client
                    .post(format!("{}/control/breaker/operate", f.base))
                    .json(&json!({ "session_id": Uuid::new_v4(), "operator_id": "viewer1" })),
                "operate",
            ),
            (
                f.client
                    .post(format!("{}/control/breaker/cancel", f.base))
                    .json(&json!({ "session_id": Uuid::new_v4() })),
                "cancel",
            ),
            (
                f.client
                    .post(format!("{}/control/isolation/SUB-001", f.base))
                    .json(&json!({ "operator_id": "viewer1" })),
                "isolate",
            ),
            (
                f.client
                    .post(format!("{}/security/block", f.base))
                    .json(&json!({ "client_ip": "203.0.113.9" })),
                "block",
            ),
        ];

        for (request, label) in attempts {
            let response = request.bearer_auth(&token).send().await.unwrap();
            assert_eq!(response.status(), 403, "endpoint {label} let a viewer through");
            let body: serde_json::Value = response.json().await.unwrap();
            assert_eq!(body["error"]["kind"], "PermissionDenied", "{label}");
        }

        // Each denial produced a PermissionDenied security event.
        let denials = f
            .state
            .security
            .recent_events(50)
            .into_iter()
            .filter(|e| e.event_type == SecurityEventType::PermissionDenied)
            .count();
        assert_eq!(denials, 6);
    }

    #[tokio::test]
    async fn unknown_body_fields_are_rejected() {
        let f = fixture().await;
        let token = login(&f, "operator1", "ops@2024").await;
        let response = f
            .client
            .post(format!("{}/control/breaker/select", f.base))
            .bearer_auth(&token)
            .json(&json!({
                "node_id": "SUB-001",
                "breaker_id": "BRK-01",
                "action": "open",
                "operator_id": "operator1",
                "reason": "test",
                "frobnicate": true,
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn sbo_flow_over_http() {
        let f = fixture().await;
        f.state
            .registry
            .set_link_state("SUB-001", LinkState::Connected);
        // Answering link standing in for the RTU.
        let (link, mut command_rx) = NodeLink::new(8);
        f.state.links.register("SUB-001", link.clone());
        tokio::spawn(async move {
            while let Some(frame) = command_rx.recv().await {
                link.resolve(ReplyFrame {
                    request_id: frame.request_id,
                    result: CommandOutcome::Success,
                    new_state: Some(scada_proto::BreakerState::Open),
                    response_time_ms: 9,
                    message: String::new(),
                });
            }
        });

        let token = login(&f, "operator1", "ops@2024").await;
        let select: serde_json::Value = f
            .client
            .post(format!("{}/control/breaker/select", f.base))
            .bearer_auth(&token)
            .json(&json!({
                "node_id": "SUB-001",
                "breaker_id": "BRK-01",
                "action": "open",
                "operator_id": "operator",
                "reason": "maintenance",
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let session_id = select["session_id"].as_str().unwrap();
        assert!(select["time_remaining_s"].as_f64().unwrap() > 9.0);

        let operate: serde_json::Value = f
            .client
            .post(format!("{}/control/breaker/operate", f.base))
            .bearer_auth(&token)
            .json(&json!({ "session_id": session_id, "operator_id": "operator" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(operate["result"], "Success");
        assert_eq!(operate["new_breaker_state"], "Open");
        assert!(operate["response_time_ms"].as_u64().unwrap() < 2000);
    }

    #[tokio::test]
    async fn acknowledge_unknown_alarm_is_400_and_cleared_is_409() {
        let f = fixture().await;
        let token = login(&f, "operator1", "ops@2024").await;

        let response = f
            .client
            .post(format!("{}/alarms/{}/acknowledge", f.base, Uuid::new_v4()))
            .bearer_auth(&token)
            .json(&json!({ "operator_id": "operator1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }
}
