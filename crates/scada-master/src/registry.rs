//! ---
//! scada_section: "05-master-runtime"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "SCADA master: registry, aggregation, alarms, control, security, surfaces."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use scada_common::config::{NodeEntry, NodeKindConfig};
use scada_proto::{BreakerState, LinkState};
use serde::Serialize;
use tracing::info;

/// Runtime record kept per declared node. The supervisor owning the node's
/// link is the single writer; everyone else reads snapshots.
#[derive(Debug, Clone)]
pub struct NodeRuntimeRecord {
    /// Static catalogue entry.
    pub entry: NodeEntry,
    /// Current link state.
    pub link_state: LinkState,
    /// Last heartbeat (or any frame) instant.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Consecutive reconnect attempts since the last successful handshake.
    pub reconnect_attempts: u32,
    /// Last known breaker states.
    pub breaker_states: BTreeMap<String, BreakerState>,
}

/// Serializable projection of a node record for the HTTP and WebSocket
/// surfaces (the ring buffer is deliberately not part of it).
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    /// Node identifier.
    pub node_id: String,
    /// Node kind.
    pub kind: NodeKindConfig,
    /// Site name.
    pub location: String,
    /// Rated capacity in MW.
    pub capacity_mw: f64,
    /// Nominal voltage in kV.
    pub nominal_voltage_kv: f64,
    /// Current link state.
    pub link_state: LinkState,
    /// Last heartbeat timestamp.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Reconnect attempts since the last successful handshake.
    pub reconnect_attempts: u32,
    /// Last known breaker states.
    pub breaker_states: BTreeMap<String, BreakerState>,
}

impl NodeRuntimeRecord {
    fn view(&self) -> NodeView {
        NodeView {
            node_id: self.entry.node_id.clone(),
            kind: self.entry.kind,
            location: self.entry.location.clone(),
            capacity_mw: self.entry.capacity_mw,
            nominal_voltage_kv: self.entry.nominal_voltage_kv,
            link_state: self.link_state,
            last_heartbeat: self.last_heartbeat,
            reconnect_attempts: self.reconnect_attempts,
            breaker_states: self.breaker_states.clone(),
        }
    }
}

/// Node counts by link state bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeCounts {
    /// `Connected` or `Degraded`.
    pub online: u32,
    /// `Offline`.
    pub offline: u32,
    /// `Degraded` only.
    pub degraded: u32,
}

/// Registry of all declared nodes.
pub struct NodeRegistry {
    records: RwLock<HashMap<String, NodeRuntimeRecord>>,
    order: Vec<String>,
}

impl NodeRegistry {
    /// Build the registry from the catalogue; every node starts `Connecting`.
    pub fn new(entries: &[NodeEntry]) -> Self {
        let mut records = HashMap::with_capacity(entries.len());
        let mut order = Vec::with_capacity(entries.len());
        for entry in entries {
            order.push(entry.node_id.clone());
            records.insert(
                entry.node_id.clone(),
                NodeRuntimeRecord {
                    entry: entry.clone(),
                    link_state: LinkState::Connecting,
                    last_heartbeat: None,
                    reconnect_attempts: 0,
                    breaker_states: BTreeMap::new(),
                },
            );
        }
        Self {
            records: RwLock::new(records),
            order,
        }
    }

    /// All nodes in catalogue order.
    pub fn list_nodes(&self) -> Vec<NodeView> {
        let records = self.records.read();
        self.order
            .iter()
            .filter_map(|id| records.get(id).map(NodeRuntimeRecord::view))
            .collect()
    }

    /// One node, if declared.
    pub fn get_node(&self, node_id: &str) -> Option<NodeView> {
        self.records.read().get(node_id).map(NodeRuntimeRecord::view)
    }

    /// Catalogue entry for a node.
    pub fn entry(&self, node_id: &str) -> Option<NodeEntry> {
        self.records.read().get(node_id).map(|r| r.entry.clone())
    }

    /// Current link state.
    pub fn link_state(&self, node_id: &str) -> Option<LinkState> {
        self.records.read().get(node_id).map(|r| r.link_state)
    }

    /// Transition a node's link state. Returns true when the state changed.
    pub fn set_link_state(&self, node_id: &str, state: LinkState) -> bool {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(node_id) else {
            return false;
        };
        if record.link_state == state {
            return false;
        }
        info!(node = node_id, from = ?record.link_state, to = ?state, "link state changed");
        record.link_state = state;
        true
    }

    /// Record a heartbeat observation.
    pub fn heartbeat(&self, node_id: &str, at: DateTime<Utc>) {
        if let Some(record) = self.records.write().get_mut(node_id) {
            record.last_heartbeat = Some(at);
        }
    }

    /// Record a reconnect attempt count.
    pub fn set_reconnect_attempts(&self, node_id: &str, attempts: u32) {
        if let Some(record) = self.records.write().get_mut(node_id) {
            record.reconnect_attempts = attempts;
        }
    }

    /// Replace the known breaker states (handshake/snapshot).
    pub fn set_breaker_states(&self, node_id: &str, states: BTreeMap<String, BreakerState>) {
        if let Some(record) = self.records.write().get_mut(node_id) {
            record.breaker_states = states;
        }
    }

    /// Update one breaker's cached state.
    pub fn set_breaker(&self, node_id: &str, breaker_id: &str, state: BreakerState) {
        if let Some(record) = self.records.write().get_mut(node_id) {
            record
                .breaker_states
                .insert(breaker_id.to_string(), state);
        }
    }

    /// Node counts for rollups and `/health`.
    pub fn counts(&self) -> NodeCounts {
        let records = self.records.read();
        let mut counts = NodeCounts::default();
        for record in records.values() {
            match record.link_state {
                LinkState::Connected => counts.online += 1,
                LinkState::Degraded => {
                    counts.online += 1;
                    counts.degraded += 1;
                }
                LinkState::Offline => counts.offline += 1,
                LinkState::Connecting | LinkState::Reconnecting => {}
            }
        }
        counts
    }
}
