//! ---
//! scada_section: "04-rtu-runtime"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Per-node RTU runtime: simulation, protocol listeners, control channel."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{ConnectInfo, State};
use axum::routing::get;
use axum::{Json, Router};
use scada_proto::{ConnectionProtocol, Frame};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::electrical::MAIN_BREAKER;
use crate::runtime::RtuShared;

#[derive(Clone)]
struct RestState {
    shared: RtuShared,
    started: Instant,
}

/// Spawn the RTU's HTTP status surface.
pub async fn spawn_rest(
    listen: SocketAddr,
    shared: RtuShared,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(listen).await?;
    let local_addr = listener.local_addr()?;
    info!(node = %shared.node_id(), address = %local_addr, "rtu rest api listening");

    let state = RestState {
        shared,
        started: Instant::now(),
    };
    let router = Router::new()
        .route("/status", get(get_status))
        .route("/connections", get(get_connections))
        .with_state(state);

    let task = tokio::spawn(async move {
        let server = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        });
        if let Err(err) = server.await {
            warn!(error = %err, "rtu rest server exited with error");
        }
    });

    Ok((local_addr, task))
}

/// Account the request as a short-lived REST connection so the security
/// console sees HTTP probes the same way it sees Modbus scans.
fn track_request(state: &RestState, peer: SocketAddr) {
    if let Some((id, record)) = state.shared.tracker.open(
        &peer.ip().to_string(),
        peer.port(),
        ConnectionProtocol::Rest,
    ) {
        state.shared.outbound.push(Frame::ConnectionReport(record));
        state.shared.tracker.touch(id, 1, 0, 0);
        if let Some(closed) = state.shared.tracker.close(id) {
            state.shared.outbound.push(Frame::ConnectionReport(closed));
        }
    }
}

async fn get_status(
    State(state): State<RestState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Json<serde_json::Value> {
    track_request(&state, peer);
    let sim = state.shared.sim.lock();
    let reading = sim.last_reading();
    Json(json!({
        "node_id": sim.descriptor().node_id,
        "kind": sim.descriptor().kind,
        "status": "ok",
        "uptime_seconds": state.started.elapsed().as_secs(),
        "breaker_state": sim.breaker(MAIN_BREAKER),
        "telemetry": reading.map(|r| json!({
            "voltage_kv": r.voltage_kv,
            "current_a": r.current_a,
            "active_power_mw": r.active_power_mw,
            "frequency_hz": r.frequency_hz,
            "temperature_c": r.temperature_c,
        })),
    }))
}

async fn get_connections(
    State(state): State<RestState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Json<serde_json::Value> {
    track_request(&state, peer);
    Json(json!({ "connections": state.shared.tracker.active() }))
}
