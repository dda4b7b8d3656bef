//! ---
//! scada_section: "01-core-functionality"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Shared primitives for the SCADA master and RTU runtimes."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LoggingConfig;

fn default_http_listen() -> SocketAddr {
    "0.0.0.0:9000".parse().expect("valid default http address")
}

fn default_ws_listen() -> SocketAddr {
    "0.0.0.0:9001".parse().expect("valid default ws address")
}

fn default_metrics_listen() -> SocketAddr {
    "0.0.0.0:9898"
        .parse()
        .expect("valid default metrics address")
}

fn default_jwt_secret() -> String {
    "scada-jwt-secret-change-in-production".to_owned()
}

fn default_token_lifetime() -> Duration {
    Duration::from_secs(3600)
}

fn default_sampling_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_aggregator_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_degraded_after() -> Duration {
    Duration::from_secs(15)
}

fn default_offline_after() -> Duration {
    Duration::from_secs(60)
}

fn default_reconnect_initial() -> Duration {
    Duration::from_secs(1)
}

fn default_reconnect_cap() -> Duration {
    Duration::from_secs(60)
}

fn default_arming_window() -> Duration {
    Duration::from_secs(10)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_ring_capacity() -> usize {
    3600
}

fn default_subscriber_queue() -> usize {
    256
}

fn default_master_ip() -> String {
    "10.0.0.1".to_owned()
}

/// Kind of a node in the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKindConfig {
    /// Power plant feeding the grid.
    Generation,
    /// Transmission substation.
    Substation,
    /// Distribution feeder.
    Distribution,
}

/// Static declaration of one RTU node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Unique short identifier, e.g. `GEN-001`.
    pub node_id: String,
    /// Node kind.
    pub kind: NodeKindConfig,
    /// Human readable site name.
    pub location: String,
    /// Rated capacity (generation) or peak load (distribution) in MW.
    pub capacity_mw: f64,
    /// Nominal bus voltage in kV.
    pub nominal_voltage_kv: f64,
    /// REST status port on the RTU host.
    pub rest_port: u16,
    /// Port accepting the master control channel.
    pub control_port: u16,
    /// Modbus TCP listener port.
    pub modbus_port: u16,
    /// IEC 60870-5-104 listener port.
    pub iec104_port: u16,
    /// Address of the RTU host.
    pub node_ip: String,
}

impl NodeEntry {
    /// Socket address of the control-channel listener.
    pub fn control_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.node_ip, self.control_port)
            .parse()
            .with_context(|| format!("invalid control address for {}", self.node_id))
    }
}

/// Allow-list entry: clients connecting from this address over this protocol
/// are classified `Authorised`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllowListEntry {
    /// Client address.
    pub client_ip: String,
    /// Protocol name (`REST`, `WebSocket`, `Modbus`, `IEC104`) or `*`.
    pub protocol: String,
}

/// Link supervision parameters for the master's node diallers.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisionConfig {
    /// Expected heartbeat interval from each RTU.
    #[serde(default = "default_heartbeat_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub heartbeat_interval: Duration,
    /// Heartbeat gap after which a link is marked `Degraded`.
    #[serde(default = "default_degraded_after")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub degraded_after: Duration,
    /// Heartbeat gap after which a link is marked `Offline`.
    #[serde(default = "default_offline_after")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub offline_after: Duration,
    /// Initial reconnect backoff.
    #[serde(default = "default_reconnect_initial")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reconnect_initial: Duration,
    /// Reconnect backoff cap.
    #[serde(default = "default_reconnect_cap")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reconnect_cap: Duration,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            degraded_after: default_degraded_after(),
            offline_after: default_offline_after(),
            reconnect_initial: default_reconnect_initial(),
            reconnect_cap: default_reconnect_cap(),
        }
    }
}

/// Control-coordinator parameters.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Select-before-operate arming window.
    #[serde(default = "default_arming_window")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub arming_window: Duration,
    /// Bound on the operate round trip to the RTU.
    #[serde(default = "default_command_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub command_timeout: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            arming_window: default_arming_window(),
            command_timeout: default_command_timeout(),
        }
    }
}

/// Primary configuration object for the SCADA master.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// HTTP API listen address (default port 9000).
    #[serde(default = "default_http_listen")]
    pub http_listen: SocketAddr,
    /// WebSocket listen address (default port 9001).
    #[serde(default = "default_ws_listen")]
    pub ws_listen: SocketAddr,
    /// Prometheus exporter listen address.
    #[serde(default = "default_metrics_listen")]
    pub metrics_listen: SocketAddr,
    /// Address of the master itself as seen by the RTUs.
    #[serde(default = "default_master_ip")]
    pub master_ip: String,
    /// HMAC secret for bearer tokens.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    /// Bearer token lifetime.
    #[serde(default = "default_token_lifetime")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub token_lifetime: Duration,
    /// RTU telemetry sampling cadence.
    #[serde(default = "default_sampling_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub sampling_interval: Duration,
    /// Grid aggregation cadence.
    #[serde(default = "default_aggregator_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub aggregator_interval: Duration,
    /// Per-node telemetry ring capacity.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    /// Per-subscriber fan-out queue depth.
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
    /// Link supervision parameters.
    #[serde(default)]
    pub supervision: SupervisionConfig,
    /// Control coordinator parameters.
    #[serde(default)]
    pub control: ControlConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Static node catalogue. Empty means "use the built-in 15-node plan".
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
    /// Extra allow-list entries beyond the catalogue-derived defaults.
    #[serde(default)]
    pub allow_list: Vec<AllowListEntry>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
            ws_listen: default_ws_listen(),
            metrics_listen: default_metrics_listen(),
            master_ip: default_master_ip(),
            jwt_secret: default_jwt_secret(),
            token_lifetime: default_token_lifetime(),
            sampling_interval: default_sampling_interval(),
            aggregator_interval: default_aggregator_interval(),
            ring_capacity: default_ring_capacity(),
            subscriber_queue: default_subscriber_queue(),
            supervision: SupervisionConfig::default(),
            control: ControlConfig::default(),
            logging: LoggingConfig::default(),
            nodes: Vec::new(),
            allow_list: Vec::new(),
        }
    }
}

impl MasterConfig {
    /// Environment variable overriding the configuration path.
    pub const ENV_CONFIG_PATH: &'static str = "SCADA_CONFIG";

    /// Load configuration from disk, respecting the `SCADA_CONFIG` override,
    /// then apply environment overrides and fill in the built-in catalogue.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        let mut config = Self::load_raw(candidates)?;
        config.apply_env_overrides();
        if config.nodes.is_empty() {
            config.nodes = default_catalogue();
        }
        config.validate()?;
        Ok(config)
    }

    fn load_raw<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                return Self::from_path(PathBuf::from(env_path));
            }
        }
        for candidate in candidates {
            if candidate.as_ref().exists() {
                return Self::from_path(candidate.as_ref().to_path_buf());
            }
        }
        debug!("no configuration file found; using built-in defaults");
        Ok(Self::default())
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        toml::from_str::<MasterConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("SCADA_HTTP_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.http_listen.set_port(port);
            }
        }
        if let Ok(port) = std::env::var("SCADA_WS_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.ws_listen.set_port(port);
            }
        }
        if let Ok(secret) = std::env::var("SCADA_JWT_SECRET") {
            if !secret.trim().is_empty() {
                self.jwt_secret = secret;
            }
        }
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(anyhow!("configuration must declare at least one node"));
        }
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.node_id.as_str()) {
                return Err(anyhow!("duplicate node id '{}'", node.node_id));
            }
            if node.capacity_mw <= 0.0 {
                return Err(anyhow!("node '{}' has non-positive capacity", node.node_id));
            }
        }
        if self.ring_capacity == 0 {
            return Err(anyhow!("ring_capacity must be positive"));
        }
        Ok(())
    }

    /// Allow-list seeded from the catalogue (every RTU IP plus the master IP,
    /// all protocols) merged with any configured extras.
    pub fn effective_allow_list(&self) -> Vec<AllowListEntry> {
        let mut entries: Vec<AllowListEntry> = self
            .nodes
            .iter()
            .map(|node| AllowListEntry {
                client_ip: node.node_ip.clone(),
                protocol: "*".to_owned(),
            })
            .collect();
        entries.push(AllowListEntry {
            client_ip: self.master_ip.clone(),
            protocol: "*".to_owned(),
        });
        entries.extend(self.allow_list.iter().cloned());
        entries
    }

    /// Look up a catalogue entry by id.
    pub fn node(&self, node_id: &str) -> Option<&NodeEntry> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }
}

impl std::str::FromStr for MasterConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let mut config: MasterConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        if config.nodes.is_empty() {
            config.nodes = default_catalogue();
        }
        config.validate()?;
        Ok(config)
    }
}

/// Per-RTU configuration resolved from the catalogue plus environment.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtuConfig {
    /// The node this RTU instance embodies.
    pub node: NodeEntry,
    /// Telemetry sampling cadence.
    #[serde(default = "default_sampling_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub sampling_interval: Duration,
    /// Capacity of the offline sample buffer.
    #[serde(default = "default_offline_buffer")]
    pub offline_buffer: usize,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_offline_buffer() -> usize {
    600
}

impl RtuConfig {
    /// Build an RTU configuration for a node from the built-in catalogue.
    pub fn for_node(node_id: &str) -> Result<Self> {
        let node = default_catalogue()
            .into_iter()
            .find(|n| n.node_id == node_id)
            .ok_or_else(|| anyhow!("unknown node id '{node_id}'"))?;
        Ok(Self {
            node,
            sampling_interval: default_sampling_interval(),
            offline_buffer: default_offline_buffer(),
            logging: LoggingConfig::default(),
        })
    }
}

/// The built-in 15-node deployment: 3 generation, 7 transmission, 5
/// distribution, addressed on the 10.x plan.
pub fn default_catalogue() -> Vec<NodeEntry> {
    let gen = [
        ("GEN-001", "Korba Thermal", 500.0, "10.1.1.1"),
        ("GEN-002", "Tehri Hydro", 300.0, "10.1.1.2"),
        ("GEN-003", "Bhadla Solar", 200.0, "10.1.1.3"),
    ];
    let sub = [
        ("SUB-001", "Kanpur 400kV", "10.2.1.1"),
        ("SUB-002", "Agra 400kV", "10.2.1.2"),
        ("SUB-003", "Gwalior 400kV", "10.2.1.3"),
        ("SUB-004", "Bina 400kV", "10.2.1.4"),
        ("SUB-005", "Satna 400kV", "10.2.1.5"),
        ("SUB-006", "Jabalpur 400kV", "10.2.1.6"),
        ("SUB-007", "Itarsi 400kV", "10.2.1.7"),
    ];
    let dist = [
        ("DIST-001", "Lucknow Feeder", 150.0, "10.3.1.1"),
        ("DIST-002", "Bhopal Feeder", 120.0, "10.3.1.2"),
        ("DIST-003", "Indore Feeder", 100.0, "10.3.1.3"),
        ("DIST-004", "Nagpur Feeder", 80.0, "10.3.1.4"),
        ("DIST-005", "Raipur Feeder", 90.0, "10.3.1.5"),
    ];

    let mut nodes = Vec::with_capacity(15);
    let mut rest_port = 8101u16;
    let mut modbus_port = 5021u16;
    for (index, (id, location, capacity, ip)) in gen.iter().enumerate() {
        nodes.push(NodeEntry {
            node_id: (*id).to_owned(),
            kind: NodeKindConfig::Generation,
            location: (*location).to_owned(),
            capacity_mw: *capacity,
            nominal_voltage_kv: 400.0,
            rest_port,
            control_port: rest_port + 1,
            modbus_port,
            iec104_port: 2404 + 10 * (index as u16 + 1),
            node_ip: (*ip).to_owned(),
        });
        rest_port += 2;
        modbus_port += 1;
    }
    for (index, (id, location, ip)) in sub.iter().enumerate() {
        nodes.push(NodeEntry {
            node_id: (*id).to_owned(),
            kind: NodeKindConfig::Substation,
            location: (*location).to_owned(),
            capacity_mw: 100.0,
            nominal_voltage_kv: 400.0,
            rest_port,
            control_port: rest_port + 1,
            modbus_port,
            iec104_port: 2504 + 10 * (index as u16 + 1),
            node_ip: (*ip).to_owned(),
        });
        rest_port += 2;
        modbus_port += 1;
    }
    for (index, (id, location, capacity, ip)) in dist.iter().enumerate() {
        nodes.push(NodeEntry {
            node_id: (*id).to_owned(),
            kind: NodeKindConfig::Distribution,
            location: (*location).to_owned(),
            capacity_mw: *capacity,
            nominal_voltage_kv: 132.0,
            rest_port,
            control_port: rest_port + 1,
            modbus_port,
            iec104_port: 2604 + 10 * (index as u16 + 1),
            node_ip: (*ip).to_owned(),
        });
        rest_port += 2;
        modbus_port += 1;
    }
    nodes
}
