//! ---
//! scada_section: "05-master-runtime"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "SCADA master: registry, aggregation, alarms, control, security, surfaces."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use scada_proto::TelemetrySample;

/// Per-node fixed-capacity ring of recent samples plus a latest slot for the
/// short-path queries. Each node has a single writer (its supervisor's
/// reader task); readers take a consistent copy of the latest slot.
pub struct TelemetryStore {
    capacity: usize,
    rings: RwLock<HashMap<String, NodeRing>>,
}

struct NodeRing {
    ring: VecDeque<TelemetrySample>,
    latest: Option<TelemetrySample>,
}

impl TelemetryStore {
    /// Create a store with a per-node capacity (default 3600 ≈ 1 h at 1 Hz).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rings: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a sample, evicting exactly the oldest one at capacity.
    pub fn insert(&self, sample: TelemetrySample) {
        let mut rings = self.rings.write();
        let ring = rings
            .entry(sample.node_id.clone())
            .or_insert_with(|| NodeRing {
                ring: VecDeque::with_capacity(16),
                latest: None,
            });
        if ring.ring.len() >= self.capacity {
            ring.ring.pop_front();
        }
        ring.ring.push_back(sample.clone());
        ring.latest = Some(sample);
    }

    /// Latest sample for a node, read atomically.
    pub fn latest(&self, node_id: &str) -> Option<TelemetrySample> {
        self.rings.read().get(node_id)?.latest.clone()
    }

    /// Samples for a node bounded by an optional time window and a limit,
    /// oldest first.
    pub fn query(
        &self,
        node_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Vec<TelemetrySample> {
        let rings = self.rings.read();
        let Some(ring) = rings.get(node_id) else {
            return Vec::new();
        };
        let mut out: Vec<TelemetrySample> = ring
            .ring
            .iter()
            .filter(|sample| {
                from.map_or(true, |from| sample.timestamp >= from)
                    && to.map_or(true, |to| sample.timestamp <= to)
            })
            .cloned()
            .collect();
        // Keep the newest `limit` samples, still in chronological order.
        if out.len() > limit {
            out.drain(..out.len() - limit);
        }
        out
    }

    /// Number of samples held for a node.
    pub fn len(&self, node_id: &str) -> usize {
        self.rings
            .read()
            .get(node_id)
            .map(|ring| ring.ring.len())
            .unwrap_or(0)
    }

    /// Whether any sample was recorded for the node.
    pub fn is_empty(&self, node_id: &str) -> bool {
        self.len(node_id) == 0
    }
}
