//! ---
//! scada_section: "06-security-access-control"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "SCADA master: registry, aggregation, alarms, control, security, surfaces."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use scada_historian::{AuditRow, HistorianHandle, HistorianRow};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

/// Bound on the in-memory recent-entries view.
const RECENT_CAP: usize = 10_000;

/// Outcome recorded on an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditResult {
    /// Action executed.
    Success,
    /// Action attempted but failed downstream.
    Failure,
    /// Action refused by the authorisation gate.
    Denied,
}

impl AuditResult {
    /// Column value.
    pub fn as_str(self) -> &'static str {
        match self {
            AuditResult::Success => "Success",
            AuditResult::Failure => "Failure",
            AuditResult::Denied => "Denied",
        }
    }
}

struct ChainedEntry {
    row: AuditRow,
    hash: String,
    previous_hash: String,
}

/// Append-only audit log. Every mutating call routes through here with one
/// canonical row shape; entries are hash-chained so tampering with the
/// in-memory view is detectable, and each row is forwarded to the historian.
pub struct AuditLog {
    entries: Mutex<VecDeque<ChainedEntry>>,
    last_hash: Mutex<String>,
    historian: Arc<HistorianHandle>,
}

fn entry_hash(row: &AuditRow, previous: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(row.log_id.as_bytes());
    hasher.update(row.operator_id.as_bytes());
    hasher.update(row.action.as_bytes());
    hasher.update(row.resource_type.as_bytes());
    hasher.update(row.resource_id.as_bytes());
    hasher.update(row.result.as_bytes());
    hasher.update(row.ip.as_bytes());
    hasher.update(
        row.timestamp
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_be_bytes(),
    );
    hasher.update(row.metadata_json.to_string().as_bytes());
    hasher.update(previous.as_bytes());
    hex::encode(hasher.finalize())
}

impl AuditLog {
    /// Create the log; rows are forwarded to `historian`.
    pub fn new(historian: Arc<HistorianHandle>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            last_hash: Mutex::new("0".repeat(64)),
            historian,
        }
    }

    /// Append one entry.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        operator_id: &str,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        result: AuditResult,
        ip: &str,
        metadata: JsonValue,
    ) -> AuditRow {
        let row = AuditRow {
            log_id: Uuid::new_v4(),
            operator_id: operator_id.to_string(),
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            result: result.as_str().to_string(),
            ip: ip.to_string(),
            timestamp: Utc::now(),
            metadata_json: metadata,
        };

        let mut last_hash = self.last_hash.lock();
        let hash = entry_hash(&row, &last_hash);
        let chained = ChainedEntry {
            row: row.clone(),
            hash: hash.clone(),
            previous_hash: last_hash.clone(),
        };
        *last_hash = hash;
        drop(last_hash);

        let mut entries = self.entries.lock();
        if entries.len() >= RECENT_CAP {
            entries.pop_front();
        }
        entries.push_back(chained);
        drop(entries);

        debug!(operator = operator_id, action, result = result.as_str(), "audit entry recorded");
        self.historian.record(HistorianRow::AuditLog(row.clone()));
        row
    }

    /// Most recent entries, newest last.
    pub fn recent(&self, limit: usize) -> Vec<AuditRow> {
        let entries = self.entries.lock();
        entries
            .iter()
            .rev()
            .take(limit)
            .rev()
            .map(|entry| entry.row.clone())
            .collect()
    }

    /// Walk the retained chain and recompute every hash.
    pub fn verify(&self) -> bool {
        let entries = self.entries.lock();
        let mut previous: Option<&str> = None;
        for entry in entries.iter() {
            if let Some(previous) = previous {
                if entry.previous_hash != previous {
                    return false;
                }
            }
            if entry_hash(&entry.row, &entry.previous_hash) != entry.hash {
                return false;
            }
            previous = Some(&entry.hash);
        }
        true
    }

    /// Entries matching an action prefix (test and console helper).
    pub fn find_by_action(&self, action: &str) -> Vec<AuditRow> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.row.action == action)
            .map(|entry| entry.row.clone())
            .collect()
    }
}
