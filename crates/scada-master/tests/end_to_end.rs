//! ---
//! scada_section: "05-master-runtime"
//! scada_subsection: "integration-test"
//! scada_type: "test"
//! scada_scope: "code"
//! scada_description: "Master + RTU end-to-end flows over real sockets."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use scada_common::config::{default_catalogue, MasterConfig, SupervisionConfig};
use scada_historian::NdjsonSink;
use scada_master::{MasterHandle, MasterRuntime};
use scada_proto::LinkState;
use scada_rtu::runtime::{RtuHandle, RtuRuntime};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_tungstenite::connect_async;

struct Grid {
    master: MasterHandle,
    rtus: Vec<RtuHandle>,
    client: reqwest::Client,
    _historian_dir: TempDir,
}

impl Grid {
    fn base(&self) -> String {
        format!("http://{}", self.master.http_addr())
    }

    async fn login(&self, username: &str, password: &str) -> String {
        let body: Value = self
            .client
            .post(format!("{}/auth/login", self.base()))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        body["access_token"].as_str().unwrap().to_string()
    }

    async fn wait_connected(&self, expected: u64) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let health: Value = self
                .client
                .get(format!("{}/health", self.base()))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if health["nodes_connected"].as_u64() == Some(expected) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "nodes never connected: {health}"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Bring up a master plus RTUs for the named catalogue nodes, all on
/// loopback with ephemeral ports and fast cadences.
async fn grid(node_ids: &[&str]) -> Grid {
    let mut entries = Vec::new();
    let mut rtus = Vec::new();
    for node_id in node_ids {
        let mut config = scada_common::config::RtuConfig::for_node(node_id).unwrap();
        config.sampling_interval = Duration::from_millis(150);
        let rtu = RtuRuntime::new(config, "127.0.0.1")
            .ephemeral()
            .spawn()
            .await
            .unwrap();

        let mut entry = default_catalogue()
            .into_iter()
            .find(|n| n.node_id == *node_id)
            .unwrap();
        entry.node_ip = "127.0.0.1".to_string();
        entry.control_port = rtu.control_addr.port();
        entries.push(entry);
        rtus.push(rtu);
    }

    let historian_dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(NdjsonSink::new(historian_dir.path()).unwrap());
    let config = MasterConfig {
        nodes: entries,
        supervision: SupervisionConfig {
            heartbeat_interval: Duration::from_millis(500),
            degraded_after: Duration::from_secs(2),
            offline_after: Duration::from_secs(8),
            reconnect_initial: Duration::from_millis(100),
            reconnect_cap: Duration::from_millis(500),
        },
        aggregator_interval: Duration::from_millis(250),
        ..MasterConfig::default()
    };
    let master = MasterRuntime::new(config, sink)
        .ephemeral()
        .spawn()
        .await
        .unwrap();

    Grid {
        master,
        rtus,
        client: reqwest::Client::new(),
        _historian_dir: historian_dir,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn login_snapshot_and_grid_overview() {
    let grid = grid(&["GEN-001", "SUB-001"]).await;
    grid.wait_connected(2).await;

    let token = grid.login("admin", "scada@2024").await;
    let overview: Value = grid
        .client
        .get(format!("{}/grid/overview", grid.base()))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(overview["nodes_online"], 2);
    assert_eq!(overview["nodes_offline"], 0);

    // Telemetry is flowing into the per-node query path.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let telemetry: Value = grid
            .client
            .get(format!("{}/nodes/GEN-001/telemetry?limit=10", grid.base()))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if telemetry["samples"].as_array().map(Vec::len).unwrap_or(0) >= 2 {
            let samples = telemetry["samples"].as_array().unwrap();
            let first = samples[0]["sequence"].as_u64().unwrap();
            let second = samples[1]["sequence"].as_u64().unwrap();
            assert!(second > first, "sequence must be strictly increasing");
            break;
        }
        assert!(Instant::now() < deadline, "telemetry never arrived");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for rtu in grid.rtus {
        rtu.shutdown(Duration::from_secs(2)).await;
    }
    grid.master.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sbo_happy_path_reaches_the_breaker() {
    let grid = grid(&["SUB-001"]).await;
    grid.wait_connected(1).await;

    let token = grid.login("operator1", "ops@2024").await;
    let select: Value = grid
        .client
        .post(format!("{}/control/breaker/select", grid.base()))
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
    let session_id = select["session_id"].as_str().unwrap().to_string();
    let remaining = select["time_remaining_s"].as_f64().unwrap();
    assert!(remaining > 9.0 && remaining <= 10.0);

    let operate: Value = grid
        .client
        .post(format!("{}/control/breaker/operate", grid.base()))
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

    // Telemetry soon reflects the open breaker.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(sample) = grid.master.store.latest("SUB-001") {
            if sample.breaker_state == scada_proto::BreakerState::Open {
                break;
            }
        }
        assert!(Instant::now() < deadline, "breaker change never observed");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // A second operate on the same session is refused.
    let duplicate = grid
        .client
        .post(format!("{}/control/breaker/operate", grid.base()))
        .bearer_auth(&token)
        .json(&json!({ "session_id": session_id, "operator_id": "operator" }))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), 409);

    for rtu in grid.rtus {
        rtu.shutdown(Duration::from_secs(2)).await;
    }
    grid.master.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_modbus_client_raises_a_security_event() {
    // The RTU authorises only the master's control channel; a raw Modbus
    // connection from loopback is therefore Unknown.
    let mut config = scada_common::config::RtuConfig::for_node("GEN-001").unwrap();
    config.sampling_interval = Duration::from_millis(150);
    let rtu = RtuRuntime::new(config, "127.0.0.1")
        .ephemeral()
        .with_allow(vec![("127.0.0.1".to_string(), "WebSocket".to_string())])
        .spawn()
        .await
        .unwrap();

    let mut entry = default_catalogue()
        .into_iter()
        .find(|n| n.node_id == "GEN-001")
        .unwrap();
    entry.node_ip = "127.0.0.1".to_string();
    entry.control_port = rtu.control_addr.port();

    let historian_dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(NdjsonSink::new(historian_dir.path()).unwrap());
    let config = MasterConfig {
        nodes: vec![entry],
        aggregator_interval: Duration::from_millis(250),
        ..MasterConfig::default()
    };
    let master = MasterRuntime::new(config, sink).ephemeral().spawn().await.unwrap();
    let client = reqwest::Client::new();
    let base = format!("http://{}", master.http_addr());

    // Wait for the control channel.
    let deadline = Instant::now() + Duration::from_secs(10);
    while master.registry.link_state("GEN-001") != Some(LinkState::Connected) {
        assert!(Instant::now() < deadline, "rtu never connected");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Dashboard subscribes before the intrusion.
    let login: Value = client
        .post(format!("{base}/auth/login"))
        .json(&json!({ "username": "engineer1", "password": "eng@2024" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = login["access_token"].as_str().unwrap();
    let url = format!("ws://{}/ws/grid?token={token}", master.ws_addr());
    let (mut socket, _) = connect_async(&url).await.unwrap();
    let first = socket.next().await.unwrap().unwrap();
    let first: Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
    assert_eq!(first["type"], "FullStateSnapshot");

    // The intruder connects over Modbus.
    let _intruder = tokio::net::TcpStream::connect(rtu.modbus_addr).await.unwrap();

    // Within two seconds the dashboard hears about it.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(!remaining.is_zero(), "no UnknownConnection within 2 s");
        let frame = tokio::time::timeout(remaining, socket.next())
            .await
            .expect("no UnknownConnection within 2 s")
            .unwrap()
            .unwrap();
        let value: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        if value["type"] == "UnknownConnection" {
            assert_eq!(value["connection"]["node_id"], "GEN-001");
            assert_eq!(value["connection"]["protocol"], "Modbus");
            assert_eq!(value["connection"]["client_ip"], "127.0.0.1");
            assert_eq!(value["connection"]["status"], "Unknown");
            break;
        }
    }

    // And the security console counts it.
    let connections: Value = client
        .get(format!("{base}/security/connections"))
        .bearer_auth(token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(connections["unknown"].as_u64().unwrap() >= 1);

    rtu.shutdown(Duration::from_secs(2)).await;
    master.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn killed_rtu_leaves_connected_and_recovers_on_restart() {
    // Fixed loopback ports so the restarted RTU comes back on the same
    // address the master keeps dialling.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut rtu_config = scada_common::config::RtuConfig::for_node("DIST-001").unwrap();
    rtu_config.sampling_interval = Duration::from_millis(150);
    rtu_config.node.node_ip = "127.0.0.1".to_string();
    rtu_config.node.control_port = control_port;
    // Unused listeners still need free ports on loopback.
    rtu_config.node.rest_port = 0;
    rtu_config.node.modbus_port = 0;
    rtu_config.node.iec104_port = 0;

    let rtu = RtuRuntime::new(rtu_config.clone(), "127.0.0.1")
        .loopback()
        .spawn()
        .await
        .unwrap();

    let historian_dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(NdjsonSink::new(historian_dir.path()).unwrap());
    let master_config = MasterConfig {
        nodes: vec![rtu_config.node.clone()],
        supervision: SupervisionConfig {
            heartbeat_interval: Duration::from_millis(300),
            degraded_after: Duration::from_secs(1),
            offline_after: Duration::from_secs(4),
            reconnect_initial: Duration::from_millis(100),
            reconnect_cap: Duration::from_millis(300),
        },
        aggregator_interval: Duration::from_millis(250),
        ..MasterConfig::default()
    };
    let master = MasterRuntime::new(master_config, sink)
        .ephemeral()
        .spawn()
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while master.registry.link_state("DIST-001") != Some(LinkState::Connected) {
        assert!(Instant::now() < deadline, "rtu never connected");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Kill the RTU: the link leaves Connected.
    rtu.shutdown(Duration::from_secs(2)).await;
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let state = master.registry.link_state("DIST-001").unwrap();
        if state != LinkState::Connected {
            break;
        }
        assert!(Instant::now() < deadline, "link never left Connected");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Restart on the same port: the link returns within ten seconds and the
    // ring resumes with a fresh sequence base.
    let restarted = RtuRuntime::new(rtu_config, "127.0.0.1")
        .loopback()
        .spawn()
        .await
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while master.registry.link_state("DIST-001") != Some(LinkState::Connected) {
        assert!(Instant::now() < deadline, "rtu never reconnected");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(sample) = master.store.latest("DIST-001") {
            if sample.sequence < 5 {
                break;
            }
        }
        assert!(
            Instant::now() < deadline,
            "fresh-sequence telemetry never arrived"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    restarted.shutdown(Duration::from_secs(2)).await;
    master.shutdown().await;
}
