//! ---
//! scada_section: "02-control-channel-data-model"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Shared data model and control-channel framing."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a grid node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Power plant feeding the grid.
    Generation,
    /// Transmission substation.
    Substation,
    /// Distribution feeder.
    Distribution,
}

/// Static description of a node, exchanged in the control-channel handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique short identifier, e.g. `GEN-001`.
    pub node_id: String,
    /// Node kind.
    pub kind: NodeKind,
    /// Human readable site name.
    pub location: String,
    /// Rated capacity (generation) or peak load (distribution) in MW.
    pub capacity_mw: f64,
    /// Nominal bus voltage in kV.
    pub nominal_voltage_kv: f64,
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakerState {
    /// Contacts open, no current flowing.
    Open,
    /// Contacts closed, circuit energised.
    Closed,
    /// Opened by protection action.
    Tripped,
}

/// Data quality flag carried on every sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Quality {
    /// Value is valid and current.
    #[default]
    Good,
    /// Value was substituted (e.g. last good held over a bad reading).
    Suspect,
}

/// One telemetry sample emitted by an RTU.
///
/// Sequence numbers are strictly increasing per node within one RTU session
/// and reset to zero across restarts; timestamps are non-decreasing. Any
/// measurement may be absent (distribution feeders carry no transformer
/// temperature, for example).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Originating node.
    pub node_id: String,
    /// Per-node monotonic sequence number.
    pub sequence: u64,
    /// Wall-clock timestamp of the measurement.
    pub timestamp: DateTime<Utc>,
    /// Bus voltage in kV.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage_kv: Option<f64>,
    /// Line current in A.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_a: Option<f64>,
    /// Active power in MW.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_power_mw: Option<f64>,
    /// Reactive power in MVAr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactive_power_mvar: Option<f64>,
    /// Power factor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_factor: Option<f64>,
    /// Frequency in Hz.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_hz: Option<f64>,
    /// Transformer hot-spot temperature in °C.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    /// Breaker state at sampling time.
    pub breaker_state: BreakerState,
    /// Cumulative energy delivered in MWh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_delivered_mwh: Option<f64>,
    /// Data quality flag.
    #[serde(default)]
    pub quality: Quality,
}

/// Protocol a client used to reach an RTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionProtocol {
    /// HTTP status/telemetry surface.
    #[serde(rename = "REST")]
    Rest,
    /// Dashboard or master WebSocket.
    WebSocket,
    /// Modbus TCP.
    Modbus,
    /// IEC 60870-5-104.
    #[serde(rename = "IEC104")]
    Iec104,
}

impl ConnectionProtocol {
    /// Canonical wire name, matching the allow-list keys.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionProtocol::Rest => "REST",
            ConnectionProtocol::WebSocket => "WebSocket",
            ConnectionProtocol::Modbus => "Modbus",
            ConnectionProtocol::Iec104 => "IEC104",
        }
    }
}

/// Classification of an inbound client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// `(client_ip, protocol)` is present in the shared allow-list.
    Authorised,
    /// Anything else.
    Unknown,
}

/// Record of one inbound client connection observed on an RTU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Node that accepted the connection.
    pub node_id: String,
    /// Client source address.
    pub client_ip: String,
    /// Client source port.
    pub client_port: u16,
    /// Protocol spoken on the connection.
    pub protocol: ConnectionProtocol,
    /// Classification computed at accept time.
    pub status: ConnectionStatus,
    /// Accept timestamp.
    pub connected_at: DateTime<Utc>,
    /// Close timestamp, absent while the connection is live.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
    /// Requests served on the connection.
    #[serde(default)]
    pub requests_count: u64,
    /// Bytes received from the client.
    #[serde(default)]
    pub bytes_in: u64,
    /// Bytes sent to the client.
    #[serde(default)]
    pub bytes_out: u64,
}

/// Master-side state of the control link to one RTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// Dialling the RTU.
    Connecting,
    /// Handshake complete, heartbeats current.
    Connected,
    /// Dial failed, backing off before the next attempt.
    Reconnecting,
    /// Heartbeat gap exceeded the degraded threshold.
    Degraded,
    /// Heartbeat gap exceeded the offline threshold or the operator disabled
    /// the node.
    Offline,
}

impl LinkState {
    /// Whether the node counts as online for grid rollups.
    pub fn is_online(self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Degraded)
    }
}
