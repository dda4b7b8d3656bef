//! ---
//! scada_section: "04-rtu-runtime"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Per-node RTU runtime: simulation, protocol listeners, control channel."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use scada_common::config::{NodeEntry, RtuConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::connections::ConnectionTracker;
use crate::control::spawn_control;
use crate::electrical::ElectricalSim;
use crate::iec104::spawn_iec104;
use crate::modbus::spawn_modbus;
use crate::outbound::OutboundQueue;
use crate::rest::spawn_rest;
use crate::sampler::run_sampler;

/// State shared by the sampler, listeners, and control channel of one RTU.
#[derive(Clone)]
pub struct RtuShared {
    /// Catalogue entry this RTU embodies.
    pub entry: Arc<NodeEntry>,
    /// Local electrical state.
    pub sim: Arc<Mutex<ElectricalSim>>,
    /// Inbound client tracker and allow/block lists.
    pub tracker: Arc<ConnectionTracker>,
    /// Frames queued for the master.
    pub outbound: OutboundQueue,
    /// Next telemetry sequence number.
    pub sequence: Arc<AtomicU64>,
}

impl RtuShared {
    /// Build the shared state for a node with the given authorised pairs.
    pub fn new(
        entry: NodeEntry,
        allow: impl IntoIterator<Item = (String, String)>,
        buffer_capacity: usize,
    ) -> Self {
        let sim = ElectricalSim::new(&entry);
        let tracker = ConnectionTracker::new(entry.node_id.clone(), allow);
        Self {
            entry: Arc::new(entry),
            sim: Arc::new(Mutex::new(sim)),
            tracker: Arc::new(tracker),
            outbound: OutboundQueue::new(buffer_capacity),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Node identifier.
    pub fn node_id(&self) -> &str {
        &self.entry.node_id
    }
}

/// Builder for one RTU instance.
pub struct RtuRuntime {
    config: RtuConfig,
    master_ip: String,
    bind_ip: IpAddr,
    ephemeral_ports: bool,
    allow_override: Option<Vec<(String, String)>>,
}

impl RtuRuntime {
    /// Create a runtime for the configured node, authorising `master_ip`.
    pub fn new(config: RtuConfig, master_ip: impl Into<String>) -> Self {
        Self {
            config,
            master_ip: master_ip.into(),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ephemeral_ports: false,
            allow_override: None,
        }
    }

    /// Bind all listeners on loopback with kernel-assigned ports. Test mode.
    pub fn ephemeral(mut self) -> Self {
        self.bind_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        self.ephemeral_ports = true;
        self
    }

    /// Bind on loopback but keep the catalogue ports (so a restarted instance
    /// comes back on the same address). Test mode.
    pub fn loopback(mut self) -> Self {
        self.bind_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        self
    }

    /// Replace the allow-list entirely.
    pub fn with_allow(mut self, allow: Vec<(String, String)>) -> Self {
        self.allow_override = Some(allow);
        self
    }

    fn listen_addr(&self, port: u16) -> SocketAddr {
        let port = if self.ephemeral_ports { 0 } else { port };
        SocketAddr::new(self.bind_ip, port)
    }

    /// Start the sampler, protocol listeners, and control channel.
    pub async fn spawn(self) -> Result<RtuHandle> {
        // Loopback stays authorised by default: co-located supervisor health
        // checks come in over it.
        let allow = self.allow_override.clone().unwrap_or_else(|| {
            vec![
                (self.master_ip.clone(), "*".to_string()),
                ("127.0.0.1".to_string(), "*".to_string()),
            ]
        });
        let shared = RtuShared::new(
            self.config.node.clone(),
            allow,
            self.config.offline_buffer,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let (control_addr, control_task) = spawn_control(
            self.listen_addr(self.config.node.control_port),
            shared.clone(),
            shutdown_rx.clone(),
        )
        .await?;
        tasks.push(control_task);

        let (modbus_addr, modbus_task) = spawn_modbus(
            self.listen_addr(self.config.node.modbus_port),
            shared.clone(),
            shutdown_rx.clone(),
        )
        .await?;
        tasks.push(modbus_task);

        let (iec104_addr, iec104_task) = spawn_iec104(
            self.listen_addr(self.config.node.iec104_port),
            shared.clone(),
            shutdown_rx.clone(),
        )
        .await?;
        tasks.push(iec104_task);

        let (rest_addr, rest_task) = spawn_rest(
            self.listen_addr(self.config.node.rest_port),
            shared.clone(),
            shutdown_rx.clone(),
        )
        .await?;
        tasks.push(rest_task);

        tasks.push(tokio::spawn(run_sampler(
            shared.sim.clone(),
            shared.outbound.clone(),
            shared.sequence.clone(),
            self.config.sampling_interval,
            shutdown_rx,
        )));

        info!(
            node = %shared.node_id(),
            %control_addr,
            %modbus_addr,
            %iec104_addr,
            %rest_addr,
            "rtu runtime started"
        );

        Ok(RtuHandle {
            shared,
            control_addr,
            modbus_addr,
            iec104_addr,
            rest_addr,
            shutdown: shutdown_tx,
            tasks,
        })
    }
}

/// Handle to a running RTU.
pub struct RtuHandle {
    /// Shared state, exposed for tests and the daemon's signal handlers.
    pub shared: RtuShared,
    /// Bound control-channel address.
    pub control_addr: SocketAddr,
    /// Bound Modbus address.
    pub modbus_addr: SocketAddr,
    /// Bound IEC-104 address.
    pub iec104_addr: SocketAddr,
    /// Bound REST address.
    pub rest_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RtuHandle {
    /// Signal shutdown and wait for the tasks, bounded by `grace`.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("rtu task did not stop within grace period; abandoning");
            }
        }
    }
}
