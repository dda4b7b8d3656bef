//! ---
//! scada_section: "06-security-access-control"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "SCADA master: registry, aggregation, alarms, control, security, surfaces."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use scada_historian::{HistorianHandle, HistorianRow, SecurityEventRow};
use scada_proto::{Command, ConnectionRecord, ConnectionStatus};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{FanoutBus, WsMessage};
use crate::link::LinkManager;

/// How long closed connections stay in the console view.
const HISTORY_WINDOW_HOURS: i64 = 24;
/// Bound on the closed-connection history.
const HISTORY_CAP: usize = 10_000;
/// Bound on the retained event list.
const EVENT_CAP: usize = 1_000;

/// Security event classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SecurityEventType {
    /// A client outside the allow-list connected to an RTU.
    UnknownConnection,
    /// Failed login or bad/expired token.
    AuthFailure,
    /// Valid principal, insufficient role.
    PermissionDenied,
    /// Request rejected by rate limiting.
    RateLimited,
    /// An operator blocked an address.
    BlockIssued,
}

impl SecurityEventType {
    fn as_str(self) -> &'static str {
        match self {
            SecurityEventType::UnknownConnection => "UnknownConnection",
            SecurityEventType::AuthFailure => "AuthFailure",
            SecurityEventType::PermissionDenied => "PermissionDenied",
            SecurityEventType::RateLimited => "RateLimited",
            SecurityEventType::BlockIssued => "BlockIssued",
        }
    }
}

/// One security event, as shown on the dashboard console.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    /// Identifier.
    pub event_id: Uuid,
    /// Classification.
    pub event_type: SecurityEventType,
    /// Severity name.
    pub severity: String,
    /// Node involved, if any.
    pub node_id: Option<String>,
    /// Client address involved, if any.
    pub client_ip: Option<String>,
    /// Human readable description.
    pub description: String,
    /// Event timestamp.
    pub raised_at: DateTime<Utc>,
    /// Structured context.
    pub metadata: JsonValue,
}

/// Console counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SecurityCounters {
    /// Connections classified `Authorised` in the view window.
    pub authorised: u32,
    /// Connections classified `Unknown` in the view window.
    pub unknown: u32,
}

/// Per-node console row.
#[derive(Debug, Clone, Serialize)]
pub struct NodeConnectionSummary {
    /// Node identifier.
    pub node_id: String,
    /// Authorised connections in the window.
    pub authorised: u32,
    /// Unknown connections in the window.
    pub unknown: u32,
}

type LiveKey = (String, String, u16, String);

/// The security engine: single source of truth for the dashboard security
/// console. Consumes connection reports from every RTU, keeps a bounded
/// 24-hour view, and emits `UnknownConnection` events exactly once per
/// offending `(node, client_ip, protocol)`.
pub struct SecurityEngine {
    allow: RwLock<HashSet<(String, String)>>,
    live: Mutex<HashMap<LiveKey, ConnectionRecord>>,
    history: Mutex<VecDeque<ConnectionRecord>>,
    alerted: Mutex<HashSet<(String, String, String)>>,
    blocked: Mutex<HashSet<String>>,
    events: Mutex<VecDeque<SecurityEvent>>,
    bus: Arc<FanoutBus>,
    historian: Arc<HistorianHandle>,
    links: Arc<LinkManager>,
}

impl SecurityEngine {
    /// Create the engine with the configured allow-list.
    pub fn new(
        allow: impl IntoIterator<Item = (String, String)>,
        bus: Arc<FanoutBus>,
        historian: Arc<HistorianHandle>,
        links: Arc<LinkManager>,
    ) -> Self {
        Self {
            allow: RwLock::new(allow.into_iter().collect()),
            live: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            alerted: Mutex::new(HashSet::new()),
            blocked: Mutex::new(HashSet::new()),
            events: Mutex::new(VecDeque::new()),
            bus,
            historian,
            links,
        }
    }

    /// Consume one connection report from an RTU.
    ///
    /// Accept reports enter the live view; close reports move the record to
    /// the bounded history. Repeated reports for the same connection produce
    /// at most one `UnknownConnection` event.
    pub fn ingest(&self, record: ConnectionRecord) {
        let key: LiveKey = (
            record.node_id.clone(),
            record.client_ip.clone(),
            record.client_port,
            record.protocol.as_str().to_string(),
        );

        if record.disconnected_at.is_some() {
            self.live.lock().remove(&key);
            let mut history = self.history.lock();
            if history.len() >= HISTORY_CAP {
                history.pop_front();
            }
            history.push_back(record);
            return;
        }

        let newly_alerted = record.status == ConnectionStatus::Unknown
            && self.alerted.lock().insert((
                record.node_id.clone(),
                record.client_ip.clone(),
                record.protocol.as_str().to_string(),
            ));

        self.live.lock().insert(key, record.clone());

        if newly_alerted {
            warn!(
                node = %record.node_id,
                client_ip = %record.client_ip,
                protocol = record.protocol.as_str(),
                "unknown connection detected"
            );
            let event = self.build_event(
                SecurityEventType::UnknownConnection,
                "warning",
                Some(record.node_id.clone()),
                Some(record.client_ip.clone()),
                format!(
                    "unknown {} connection to {} from {}",
                    record.protocol.as_str(),
                    record.node_id,
                    record.client_ip
                ),
                serde_json::json!({ "client_port": record.client_port }),
            );
            self.retain_event(event);
            self.bus
                .publish(WsMessage::UnknownConnection { connection: record });
        }
    }

    /// Emit a non-connection security event (auth failures, denials, blocks).
    pub fn emit(
        &self,
        event_type: SecurityEventType,
        severity: &str,
        node_id: Option<String>,
        client_ip: Option<String>,
        description: impl Into<String>,
        metadata: JsonValue,
    ) {
        let event = self.build_event(
            event_type,
            severity,
            node_id,
            client_ip,
            description.into(),
            metadata,
        );
        self.retain_event(event.clone());
        self.bus.publish(WsMessage::SecurityEvent { event });
    }

    fn build_event(
        &self,
        event_type: SecurityEventType,
        severity: &str,
        node_id: Option<String>,
        client_ip: Option<String>,
        description: String,
        metadata: JsonValue,
    ) -> SecurityEvent {
        let event = SecurityEvent {
            event_id: Uuid::new_v4(),
            event_type,
            severity: severity.to_string(),
            node_id,
            client_ip,
            description,
            raised_at: Utc::now(),
            metadata,
        };
        self.historian
            .record(HistorianRow::SecurityEvents(SecurityEventRow {
                event_id: event.event_id,
                event_type: event.event_type.as_str().to_string(),
                severity: event.severity.clone(),
                node_id: event.node_id.clone(),
                client_ip: event.client_ip.clone(),
                description: event.description.clone(),
                timestamp: event.raised_at,
                metadata_json: event.metadata.clone(),
            }));
        event
    }

    fn retain_event(&self, event: SecurityEvent) {
        let mut events = self.events.lock();
        if events.len() >= EVENT_CAP {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Block an address grid-wide. Idempotent: repeated blocks are no-ops.
    /// Returns whether anything changed.
    pub fn block(&self, client_ip: &str, operator: &str) -> bool {
        if !self.blocked.lock().insert(client_ip.to_string()) {
            info!(client_ip, "address already blocked");
            return false;
        }
        info!(client_ip, operator, "issuing grid-wide block");
        self.links
            .broadcast_command(Command::Block {
                client_ip: client_ip.to_string(),
            });
        self.emit(
            SecurityEventType::BlockIssued,
            "warning",
            None,
            Some(client_ip.to_string()),
            format!("operator {operator} blocked {client_ip} on all nodes"),
            serde_json::json!({ "operator": operator }),
        );
        true
    }

    /// Whether an address has been blocked.
    pub fn is_blocked(&self, client_ip: &str) -> bool {
        self.blocked.lock().contains(client_ip)
    }

    /// Whether a pair is on the allow-list.
    pub fn is_allowed(&self, client_ip: &str, protocol: &str) -> bool {
        let allow = self.allow.read();
        allow.contains(&(client_ip.to_string(), protocol.to_string()))
            || allow.contains(&(client_ip.to_string(), "*".to_string()))
    }

    fn window_records(&self) -> Vec<ConnectionRecord> {
        let cutoff = Utc::now() - Duration::hours(HISTORY_WINDOW_HOURS);
        let mut records: Vec<ConnectionRecord> = self.live.lock().values().cloned().collect();
        records.extend(
            self.history
                .lock()
                .iter()
                .filter(|record| record.connected_at >= cutoff)
                .cloned(),
        );
        records
    }

    /// Console counters over the 24-hour view.
    pub fn counters(&self) -> SecurityCounters {
        let mut counters = SecurityCounters::default();
        for record in self.window_records() {
            match record.status {
                ConnectionStatus::Authorised => counters.authorised += 1,
                ConnectionStatus::Unknown => counters.unknown += 1,
            }
        }
        counters
    }

    /// Per-node rollup for `GET /security/connections`.
    pub fn by_node(&self) -> Vec<NodeConnectionSummary> {
        let mut by_node: HashMap<String, NodeConnectionSummary> = HashMap::new();
        for record in self.window_records() {
            let entry = by_node
                .entry(record.node_id.clone())
                .or_insert_with(|| NodeConnectionSummary {
                    node_id: record.node_id.clone(),
                    authorised: 0,
                    unknown: 0,
                });
            match record.status {
                ConnectionStatus::Authorised => entry.authorised += 1,
                ConnectionStatus::Unknown => entry.unknown += 1,
            }
        }
        let mut rows: Vec<NodeConnectionSummary> = by_node.into_values().collect();
        rows.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        rows
    }

    /// Recent security events, newest last.
    pub fn recent_events(&self, limit: usize) -> Vec<SecurityEvent> {
        let events = self.events.lock();
        events
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scada_historian::{spawn_writer, NdjsonSink, WriterConfig};
    use scada_proto::ConnectionProtocol;
    use tempfile::tempdir;

    fn engine() -> (Arc<SecurityEngine>, Arc<FanoutBus>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let bus = Arc::new(FanoutBus::new(64, None));
        let sink = Arc::new(NdjsonSink::new(dir.path()).unwrap());
        let historian = Arc::new(spawn_writer(sink, WriterConfig::default()));
        let links = Arc::new(LinkManager::new());
        let engine = Arc::new(SecurityEngine::new(
            [("10.0.0.1".to_string(), "*".to_string())],
            bus.clone(),
            historian,
            links,
        ));
        (engine, bus, dir)
    }

    fn record(node: &str, ip: &str, port: u16, status: ConnectionStatus) -> ConnectionRecord {
        ConnectionRecord {
            node_id: node.into(),
            client_ip: ip.into(),
            client_port: port,
            protocol: ConnectionProtocol::Modbus,
            status,
            connected_at: Utc::now(),
            disconnected_at: None,
            requests_count: 0,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    #[tokio::test]
    async fn unknown_connection_alerts_exactly_once() {
        let (engine, bus, _dir) = engine();
        let mut sub = bus.subscribe(WsMessage::Resync);
        let _ = sub.recv().await;

        let report = record("GEN-001", "203.0.113.9", 49712, ConnectionStatus::Unknown);
        engine.ingest(report.clone());
        engine.ingest(report.clone());

        match sub.recv().await.unwrap() {
            WsMessage::UnknownConnection { connection } => {
                assert_eq!(connection.client_ip, "203.0.113.9");
                assert_eq!(connection.node_id, "GEN-001");
            }
            other => panic!("unexpected message {other:?}"),
        }
        // Second report produced no second event.
        assert_eq!(engine.recent_events(10).len(), 1);
        assert!(engine.counters().unknown >= 1);
    }

    #[tokio::test]
    async fn authorised_connections_do_not_alert() {
        let (engine, _bus, _dir) = engine();
        engine.ingest(record("SUB-001", "10.0.0.1", 9000, ConnectionStatus::Authorised));
        assert!(engine.recent_events(10).is_empty());
        assert_eq!(engine.counters().authorised, 1);
        assert_eq!(engine.counters().unknown, 0);
    }

    #[tokio::test]
    async fn closed_connections_stay_in_the_window_view() {
        let (engine, _bus, _dir) = engine();
        let mut report = record("DIST-001", "203.0.113.50", 4000, ConnectionStatus::Unknown);
        engine.ingest(report.clone());
        report.disconnected_at = Some(Utc::now());
        engine.ingest(report);
        assert_eq!(engine.counters().unknown, 1);
        let by_node = engine.by_node();
        assert_eq!(by_node.len(), 1);
        assert_eq!(by_node[0].unknown, 1);
    }

    #[tokio::test]
    async fn block_is_idempotent_and_emits_once() {
        let (engine, _bus, _dir) = engine();
        assert!(engine.block("203.0.113.9", "admin"));
        assert!(!engine.block("203.0.113.9", "admin"));
        assert!(engine.is_blocked("203.0.113.9"));
        let events: Vec<_> = engine
            .recent_events(10)
            .into_iter()
            .filter(|e| e.event_type == SecurityEventType::BlockIssued)
            .collect();
        assert_eq!(events.len(), 1);
    }
}
