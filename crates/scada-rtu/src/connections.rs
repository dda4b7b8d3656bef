//! ---
//! scada_section: "04-rtu-runtime"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Per-node RTU runtime: simulation, protocol listeners, control channel."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::RwLock;
use scada_proto::{ConnectionProtocol, ConnectionRecord, ConnectionStatus};
use tracing::{info, warn};

/// Identifier of one tracked connection.
pub type ConnectionId = u64;

/// Tracks every inbound protocol client on an RTU and classifies it against
/// the allow-list at accept time.
///
/// A connection is `Authorised` iff its `(client_ip, protocol)` pair, or the
/// wildcard `(client_ip, "*")`, is present. Blocked addresses are refused
/// outright before classification.
pub struct ConnectionTracker {
    node_id: String,
    allow: RwLock<HashSet<(String, String)>>,
    blocked: RwLock<HashSet<String>>,
    active: RwLock<HashMap<ConnectionId, ConnectionRecord>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl ConnectionTracker {
    /// Create a tracker seeded with authorised `(ip, protocol)` pairs.
    /// Protocol `"*"` authorises every protocol for the address.
    pub fn new(node_id: impl Into<String>, allow: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            node_id: node_id.into(),
            allow: RwLock::new(allow.into_iter().collect()),
            blocked: RwLock::new(HashSet::new()),
            active: RwLock::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Classify an address/protocol pair against the current allow-list.
    pub fn classify(&self, client_ip: &str, protocol: ConnectionProtocol) -> ConnectionStatus {
        let allow = self.allow.read();
        let key = (client_ip.to_string(), protocol.as_str().to_string());
        let wildcard = (client_ip.to_string(), "*".to_string());
        if allow.contains(&key) || allow.contains(&wildcard) {
            ConnectionStatus::Authorised
        } else {
            ConnectionStatus::Unknown
        }
    }

    /// Register an accepted connection. Returns `None` when the address is
    /// blocked, in which case the caller must drop the socket.
    pub fn open(
        &self,
        client_ip: &str,
        client_port: u16,
        protocol: ConnectionProtocol,
    ) -> Option<(ConnectionId, ConnectionRecord)> {
        if self.blocked.read().contains(client_ip) {
            warn!(node = %self.node_id, client_ip, ?protocol, "refused connection from blocked address");
            return None;
        }
        let status = self.classify(client_ip, protocol);
        let record = ConnectionRecord {
            node_id: self.node_id.clone(),
            client_ip: client_ip.to_string(),
            client_port,
            protocol,
            status,
            connected_at: Utc::now(),
            disconnected_at: None,
            requests_count: 0,
            bytes_in: 0,
            bytes_out: 0,
        };
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.active.write().insert(id, record.clone());
        info!(node = %self.node_id, client_ip, ?protocol, ?status, "connection accepted");
        Some((id, record))
    }

    /// Account traffic on a live connection.
    pub fn touch(&self, id: ConnectionId, requests: u64, bytes_in: u64, bytes_out: u64) {
        if let Some(record) = self.active.write().get_mut(&id) {
            record.requests_count += requests;
            record.bytes_in += bytes_in;
            record.bytes_out += bytes_out;
        }
    }

    /// Whether a tracked connection is authorised (used to gate writes).
    pub fn is_authorised(&self, id: ConnectionId) -> bool {
        self.active
            .read()
            .get(&id)
            .map(|record| record.status == ConnectionStatus::Authorised)
            .unwrap_or(false)
    }

    /// Close a connection, returning the final record for reporting.
    pub fn close(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        let mut record = self.active.write().remove(&id)?;
        record.disconnected_at = Some(Utc::now());
        Some(record)
    }

    /// Refuse future connections from the address and drop the classification
    /// of live ones. Idempotent; returns false when already blocked.
    pub fn block(&self, client_ip: &str) -> bool {
        let inserted = self.blocked.write().insert(client_ip.to_string());
        if inserted {
            warn!(node = %self.node_id, client_ip, "address blocked");
        }
        inserted
    }

    /// Whether the address is currently blocked.
    pub fn is_blocked(&self, client_ip: &str) -> bool {
        self.blocked.read().contains(client_ip)
    }

    /// Replace the allow-list and re-classify live connections.
    pub fn set_allow_list(&self, entries: impl IntoIterator<Item = (String, String)>) {
        *self.allow.write() = entries.into_iter().collect();
        let mut active = self.active.write();
        let snapshot: Vec<(ConnectionId, String, ConnectionProtocol)> = active
            .iter()
            .map(|(id, record)| (*id, record.client_ip.clone(), record.protocol))
            .collect();
        drop(active);
        for (id, ip, protocol) in snapshot {
            let status = self.classify(&ip, protocol);
            if let Some(record) = self.active.write().get_mut(&id) {
                record.status = status;
            }
        }
    }

    /// Snapshot of live connections.
    pub fn active(&self) -> Vec<ConnectionRecord> {
        self.active.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ConnectionTracker {
        ConnectionTracker::new(
            "GEN-001",
            [("10.0.0.1".to_string(), "*".to_string())],
        )
    }

    #[test]
    fn master_address_is_authorised_for_all_protocols() {
        let tracker = tracker();
        assert_eq!(
            tracker.classify("10.0.0.1", ConnectionProtocol::Modbus),
            ConnectionStatus::Authorised
        );
        assert_eq!(
            tracker.classify("10.0.0.1", ConnectionProtocol::Iec104),
            ConnectionStatus::Authorised
        );
    }

    #[test]
    fn unlisted_address_is_unknown() {
        let tracker = tracker();
        let (id, record) = tracker.open("203.0.113.9", 49712, ConnectionProtocol::Modbus).unwrap();
        assert_eq!(record.status, ConnectionStatus::Unknown);
        assert!(!tracker.is_authorised(id));
    }

    #[test]
    fn blocked_address_is_refused() {
        let tracker = tracker();
        assert!(tracker.block("203.0.113.9"));
        assert!(!tracker.block("203.0.113.9"));
        assert!(tracker
            .open("203.0.113.9", 50000, ConnectionProtocol::Modbus)
            .is_none());
    }

    #[test]
    fn close_stamps_disconnect_time() {
        let tracker = tracker();
        let (id, _) = tracker.open("10.0.0.1", 1234, ConnectionProtocol::Modbus).unwrap();
        tracker.touch(id, 3, 21, 42);
        let record = tracker.close(id).unwrap();
        assert!(record.disconnected_at.is_some());
        assert_eq!(record.requests_count, 3);
        assert!(tracker.close(id).is_none());
    }

    #[test]
    fn allow_list_change_reclassifies_live_connections() {
        let tracker = tracker();
        let (id, record) = tracker.open("198.51.100.7", 4000, ConnectionProtocol::Iec104).unwrap();
        assert_eq!(record.status, ConnectionStatus::Unknown);

        tracker.set_allow_list([
            ("10.0.0.1".to_string(), "*".to_string()),
            ("198.51.100.7".to_string(), "IEC104".to_string()),
        ]);
        assert!(tracker.is_authorised(id));
    }
}
