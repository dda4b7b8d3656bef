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
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use scada_proto::{ConnectionRecord, LinkState, TelemetrySample};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::aggregator::GridSnapshot;
use crate::alarms::Alarm;
use crate::registry::NodeView;
use crate::security::{SecurityCounters, SecurityEvent};

/// Messages delivered to dashboard subscribers. The `type` tag is the wire
/// discriminator consumed by the browser console.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    /// Complete state sent once on subscribe (and after a `Resync`).
    FullStateSnapshot {
        /// Latest grid rollup, if one has been computed.
        grid: Option<GridSnapshot>,
        /// Every declared node.
        nodes: Vec<NodeView>,
        /// Latest sample per node.
        telemetry: HashMap<String, TelemetrySample>,
        /// Open alarms.
        alarms: Vec<Alarm>,
        /// Security console counters.
        security: SecurityCounters,
    },
    /// New grid rollup.
    GridOverviewUpdate {
        /// The snapshot.
        snapshot: GridSnapshot,
    },
    /// One node's new sample.
    TelemetryUpdate {
        /// Originating node.
        node_id: String,
        /// The sample.
        data: TelemetrySample,
    },
    /// Alarm entered `Raised`.
    AlarmRaised {
        /// The alarm record.
        alarm: Alarm,
    },
    /// Alarm entered `Cleared`.
    AlarmCleared {
        /// The alarm record.
        alarm: Alarm,
    },
    /// Alarm entered `Acknowledged`.
    AlarmAcknowledged {
        /// The alarm record.
        alarm: Alarm,
    },
    /// An unknown client connected to an RTU.
    UnknownConnection {
        /// The offending connection.
        connection: ConnectionRecord,
    },
    /// Any other security event.
    SecurityEvent {
        /// The event.
        event: SecurityEvent,
    },
    /// A node's link state changed.
    NodeStateChanged {
        /// The node.
        node_id: String,
        /// New link state.
        state: LinkState,
    },
    /// Liveness signal (every 5 s).
    Heartbeat {
        /// Server timestamp.
        timestamp: DateTime<Utc>,
    },
    /// The subscriber lost messages and must re-request a snapshot.
    Resync,
}

struct SubscriberQueue {
    queue: Mutex<VecDeque<WsMessage>>,
    notify: Notify,
    slow: AtomicBool,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            slow: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking push with the slow-consumer policy: on overflow the
    /// oldest messages are dropped and a single `Resync` sentinel holds the
    /// front of the queue until the subscriber drains it.
    fn push(&self, message: WsMessage, capacity: usize) -> u64 {
        let mut queue = self.queue.lock();
        let mut dropped = 0;
        while queue.len() + 1 > capacity {
            // The sentinel itself is never the victim.
            let victim = if matches!(queue.front(), Some(WsMessage::Resync)) {
                queue.remove(1)
            } else {
                queue.pop_front()
            };
            if victim.is_none() {
                break;
            }
            dropped += 1;
        }
        if dropped > 0 && !self.slow.swap(true, Ordering::Relaxed) {
            // First overflow: the sentinel displaces one more message.
            if queue.len() + 2 > capacity {
                queue.pop_front();
                dropped += 1;
            }
            queue.push_front(WsMessage::Resync);
        }
        queue.push_back(message);
        drop(queue);
        self.dropped.fetch_add(dropped, Ordering::Relaxed);
        self.notify.notify_one();
        dropped
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }
}

/// Subscription manager for dashboard clients: a bounded FIFO queue per
/// subscriber, non-blocking publishes, and `Resync` on overflow.
pub struct FanoutBus {
    subscribers: Mutex<HashMap<Uuid, Arc<SubscriberQueue>>>,
    capacity: usize,
    metrics: Option<scada_metrics::MasterMetrics>,
}

impl FanoutBus {
    /// Create a bus with the given per-subscriber queue depth.
    pub fn new(capacity: usize, metrics: Option<scada_metrics::MasterMetrics>) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            capacity: capacity.max(2),
            metrics,
        }
    }

    /// Register a subscriber; the snapshot is its first delivered message.
    pub fn subscribe(self: &Arc<Self>, snapshot: WsMessage) -> Subscription {
        let id = Uuid::new_v4();
        let queue = Arc::new(SubscriberQueue::new());
        queue.push(snapshot, self.capacity);
        let count = {
            let mut subscribers = self.subscribers.lock();
            subscribers.insert(id, queue.clone());
            subscribers.len()
        };
        debug!(subscriber = %id, total = count, "dashboard subscribed");
        if let Some(metrics) = &self.metrics {
            metrics.set_subscribers(count);
        }
        Subscription {
            id,
            queue,
            bus: self.clone(),
        }
    }

    /// Deliver a message to every subscriber without blocking.
    pub fn publish(&self, message: WsMessage) {
        let subscribers: Vec<Arc<SubscriberQueue>> =
            self.subscribers.lock().values().cloned().collect();
        let mut dropped_total = 0;
        let mut max_depth = 0;
        for queue in &subscribers {
            dropped_total += queue.push(message.clone(), self.capacity);
            max_depth = max_depth.max(queue.queue.lock().len());
        }
        if let Some(metrics) = &self.metrics {
            if dropped_total > 0 {
                metrics.inc_fanout_dropped(dropped_total);
            }
            metrics.observe_queue_depth("fanout_subscriber", max_depth);
        }
        if dropped_total > 0 {
            warn!(dropped = dropped_total, "slow consumers dropped fan-out messages");
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Close every subscriber queue (shutdown path).
    pub fn close_all(&self) {
        for queue in self.subscribers.lock().values() {
            queue.close();
        }
    }

    fn unsubscribe(&self, id: Uuid) {
        let count = {
            let mut subscribers = self.subscribers.lock();
            if let Some(queue) = subscribers.remove(&id) {
                queue.close();
            }
            subscribers.len()
        };
        debug!(subscriber = %id, total = count, "dashboard unsubscribed");
        if let Some(metrics) = &self.metrics {
            metrics.set_subscribers(count);
        }
    }
}

/// One dashboard subscriber's receive side. Dropping it unsubscribes.
pub struct Subscription {
    id: Uuid,
    queue: Arc<SubscriberQueue>,
    bus: Arc<FanoutBus>,
}

impl Subscription {
    /// Receive the next message in FIFO order; `None` once closed and empty.
    pub async fn recv(&mut self) -> Option<WsMessage> {
        loop {
            if let Some(message) = self.queue.queue.lock().pop_front() {
                return Some(message);
            }
            if self.queue.closed.load(Ordering::Relaxed) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Whether this subscriber has overflowed at least once.
    pub fn is_slow_consumer(&self) -> bool {
        self.queue.slow.load(Ordering::Relaxed)
    }

    /// Messages dropped from this subscriber's queue.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}
