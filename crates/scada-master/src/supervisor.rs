//! ---
//! scada_section: "05-master-runtime"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "SCADA master: registry, aggregation, alarms, control, security, surfaces."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use scada_common::config::{NodeEntry, SupervisionConfig};
use scada_common::Backoff;
use scada_proto::{read_frame, write_frame, Frame, LinkState};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{FanoutBus, WsMessage};
use crate::ingest::Ingest;
use crate::link::{LinkManager, NodeLink};
use crate::registry::NodeRegistry;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);
const COMMAND_QUEUE_DEPTH: usize = 32;
/// Dial attempts before a node that never answered is declared `Offline`.
const MAX_UNREACHED_ATTEMPTS: u32 = 10;

/// Everything a per-node supervisor needs, shared across all of them.
#[derive(Clone)]
pub struct SupervisorDeps {
    /// Node registry (single writer per node: its supervisor).
    pub registry: Arc<NodeRegistry>,
    /// Link manager for command routing.
    pub links: Arc<LinkManager>,
    /// Ordered frame consumer.
    pub ingest: Arc<Ingest>,
    /// Fan-out bus for `NodeStateChanged`.
    pub bus: Arc<FanoutBus>,
    /// Metrics, when running under the full daemon.
    pub metrics: Option<scada_metrics::MasterMetrics>,
    /// Supervision timing parameters.
    pub config: SupervisionConfig,
}

impl SupervisorDeps {
    fn set_state(&self, node_id: &str, state: LinkState) {
        if self.registry.set_link_state(node_id, state) {
            self.bus.publish(WsMessage::NodeStateChanged {
                node_id: node_id.to_string(),
                state,
            });
            if let Some(metrics) = &self.metrics {
                metrics.set_node_state(node_id, &format!("{state:?}"));
            }
        }
    }
}

/// Spawn one supervisor task per catalogue node.
pub fn spawn_supervisors(
    entries: &[NodeEntry],
    deps: SupervisorDeps,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    entries
        .iter()
        .map(|entry| {
            let entry = entry.clone();
            let deps = deps.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(supervise_node(entry, deps, shutdown))
        })
        .collect()
}

/// The per-node dialler: drives the link state machine
/// `Connecting → Connected → Degraded → Offline` with bounded full-jitter
/// backoff between attempts, and owns the node's reader/writer task pair
/// while connected.
pub async fn supervise_node(
    entry: NodeEntry,
    deps: SupervisorDeps,
    mut shutdown: watch::Receiver<bool>,
) {
    let node_id = entry.node_id.clone();
    let addr = match entry.control_addr() {
        Ok(addr) => addr,
        Err(err) => {
            warn!(node = %node_id, error = %err, "invalid control address; supervisor exiting");
            deps.set_state(&node_id, LinkState::Offline);
            return;
        }
    };

    let mut backoff = Backoff::new(
        deps.config.reconnect_initial,
        deps.config.reconnect_cap,
    );
    let mut last_contact: Option<Instant> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }
        deps.set_state(&node_id, LinkState::Connecting);

        let connected = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr)).await;
        match connected {
            Ok(Ok(stream)) => {
                if run_link(&entry, stream, &deps, &mut shutdown).await {
                    backoff.reset();
                    last_contact = Some(Instant::now());
                }
            }
            Ok(Err(err)) => {
                debug!(node = %node_id, error = %err, "dial failed");
            }
            Err(_) => {
                debug!(node = %node_id, "dial timed out");
            }
        }

        if *shutdown.borrow() {
            break;
        }

        // Disconnected: Reconnecting while the outage is fresh, Offline once
        // the silence exceeds the offline deadline (or a never-reached node
        // exhausts its dial budget).
        let silent_for = last_contact.map(|at| at.elapsed());
        let state = match silent_for {
            Some(elapsed) if elapsed < deps.config.offline_after => LinkState::Reconnecting,
            Some(_) => LinkState::Offline,
            None if backoff.attempt() < MAX_UNREACHED_ATTEMPTS => LinkState::Reconnecting,
            None => LinkState::Offline,
        };
        deps.set_state(&node_id, state);

        let delay = backoff.next_delay();
        deps.registry
            .set_reconnect_attempts(&node_id, backoff.attempt());
        debug!(node = %node_id, attempt = backoff.attempt(), delay = ?delay, "reconnect backoff");
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    deps.links.unregister(&node_id);
    debug!(node = %node_id, "supervisor stopped");
}

/// Run one established connection to completion. Returns true if the
/// handshake succeeded (so the caller resets its backoff).
async fn run_link(
    entry: &NodeEntry,
    stream: TcpStream,
    deps: &SupervisorDeps,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let node_id = entry.node_id.clone();
    let (read_half, mut write_half) = stream.into_split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(256);
    let reader = tokio::spawn(read_frames(read_half, frame_tx));

    // Handshake: the RTU speaks first with Hello (then a full snapshot).
    let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, frame_rx.recv()).await;
    let hello = match hello {
        Ok(Some(frame @ Frame::Hello { .. })) => frame,
        Ok(Some(other)) => {
            warn!(node = %node_id, kind = other.kind(), "expected hello, closing link");
            reader.abort();
            return false;
        }
        Ok(None) | Err(_) => {
            debug!(node = %node_id, "handshake failed");
            reader.abort();
            return false;
        }
    };

    // Fresh session: reset the sequence expectation before the first sample.
    deps.ingest.reset_sequence(&node_id);
    deps.ingest.handle_frame(&node_id, hello);
    deps.registry.set_reconnect_attempts(&node_id, 0);
    deps.set_state(&node_id, LinkState::Connected);
    info!(node = %node_id, "control channel established");

    let (link, mut command_rx) = NodeLink::new(COMMAND_QUEUE_DEPTH);
    deps.links.register(&node_id, link.clone());

    let mut last_frame = Instant::now();
    let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut heartbeat = tokio::time::interval(deps.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = frame_rx.recv() => {
                let Some(frame) = frame else {
                    debug!(node = %node_id, "link closed by peer");
                    break;
                };
                last_frame = Instant::now();
                if deps.registry.link_state(&node_id) == Some(LinkState::Degraded) {
                    deps.set_state(&node_id, LinkState::Connected);
                }
                match frame {
                    Frame::Reply(reply) => link.resolve(reply),
                    other => deps.ingest.handle_frame(&node_id, other),
                }
            }
            command = command_rx.recv() => {
                let Some(command) = command else { break };
                if write_frame(&mut write_half, &Frame::Command(command)).await.is_err() {
                    warn!(node = %node_id, "command write failed; dropping link");
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if write_frame(&mut write_half, &Frame::heartbeat()).await.is_err() {
                    break;
                }
            }
            _ = watchdog.tick() => {
                let silent = last_frame.elapsed();
                if silent > deps.config.offline_after {
                    warn!(node = %node_id, silent = ?silent, "offline deadline exceeded on live socket");
                    deps.set_state(&node_id, LinkState::Offline);
                    break;
                }
                if silent > deps.config.degraded_after
                    && deps.registry.link_state(&node_id) == Some(LinkState::Connected)
                {
                    deps.set_state(&node_id, LinkState::Degraded);
                }
            }
        }
    }

    reader.abort();
    deps.links.unregister(&node_id);
    true
}

async fn read_frames(mut read_half: OwnedReadHalf, tx: mpsc::Sender<Frame>) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(frame) => {
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarms::AlarmEngine;
    use crate::security::SecurityEngine;
    use crate::store::TelemetryStore;
    use scada_common::config::default_catalogue;
    use scada_historian::{spawn_writer, NdjsonSink, WriterConfig};
    use scada_rtu::runtime::RtuRuntime;
    use tempfile::tempdir;

    fn deps() -> (SupervisorDeps, Arc<TelemetryStore>, tempfile::TempDir) {
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
        let ingest = Arc::new(Ingest::new(
            registry.clone(),
            store.clone(),
            alarms,
            security,
            bus.clone(),
            historian,
            None,
        ));
        let deps = SupervisorDeps {
            registry,
            links,
            ingest,
            bus,
            metrics: None,
            config: SupervisionConfig {
                heartbeat_interval: Duration::from_millis(200),
                degraded_after: Duration::from_millis(600),
                offline_after: Duration::from_secs(3),
                reconnect_initial: Duration::from_millis(50),
                reconnect_cap: Duration::from_millis(200),
            },
        };
        (deps, store, dir)
    }

    #[tokio::test]
    async fn supervisor_connects_to_a_live_rtu_and_ingests_telemetry() {
        let (deps, store, _dir) = deps();

        let mut config = scada_common::config::RtuConfig::for_node("GEN-001").unwrap();
        config.sampling_interval = Duration::from_millis(100);
        let rtu = RtuRuntime::new(config, "127.0.0.1")
            .ephemeral()
            .spawn()
            .await
            .unwrap();

        let mut entry = default_catalogue()
            .into_iter()
            .find(|n| n.node_id == "GEN-001")
            .unwrap();
        entry.node_ip = "127.0.0.1".to_string();
        entry.control_port = rtu.control_addr.port();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervise_node(entry, deps.clone(), shutdown_rx));

        // Within a couple of sampling periods the link is up and samples flow.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if deps.registry.link_state("GEN-001") == Some(LinkState::Connected)
                && store.latest("GEN-001").is_some()
            {
                break;
            }
            assert!(Instant::now() < deadline, "telemetry never arrived");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(deps.links.is_connected("GEN-001"));

        let _ = shutdown_tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(2), supervisor).await;
        rtu.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn unreachable_node_cycles_through_reconnecting() {
        let (deps, _store, _dir) = deps();
        let mut entry = default_catalogue()
            .into_iter()
            .find(|n| n.node_id == "DIST-005")
            .unwrap();
        // A loopback port with nothing listening.
        entry.node_ip = "127.0.0.1".to_string();
        entry.control_port = 1;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervise_node(entry, deps.clone(), shutdown_rx));

        tokio::time::sleep(Duration::from_millis(400)).await;
        let state = deps.registry.link_state("DIST-005").unwrap();
        assert!(
            matches!(state, LinkState::Connecting | LinkState::Reconnecting),
            "state was {state:?}"
        );

        let _ = shutdown_tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(2), supervisor).await;
    }
}
