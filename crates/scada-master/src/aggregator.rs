//! ---
//! scada_section: "05-master-runtime"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "SCADA master: registry, aggregation, alarms, control, security, surfaces."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use scada_common::config::NodeKindConfig;
use scada_historian::{GridMetricsRow, HistorianHandle, HistorianRow};
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::alarms::{AlarmCounts, AlarmEngine};
use crate::bus::{FanoutBus, WsMessage};
use crate::registry::NodeRegistry;
use crate::store::TelemetryStore;

/// Publication deadband for frequency.
const FREQ_EPSILON_HZ: f64 = 0.005;
/// Publication deadband for MW figures.
const MW_EPSILON: f64 = 0.5;
/// Keep-alive interval when nothing changed.
const KEEPALIVE: Duration = Duration::from_secs(5);
/// Frequency trace length (10 minutes at 1 Hz).
const TRACE_CAPACITY: usize = 600;

/// One point of the frequency trace.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrequencyPoint {
    /// Sample time.
    pub timestamp: DateTime<Utc>,
    /// System frequency in Hz.
    pub value: f64,
}

/// Grid-wide rollup computed once per aggregator tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridSnapshot {
    /// Capacity-weighted mean of generator frequencies.
    pub system_frequency_hz: f64,
    /// Sum of generator output in MW.
    pub total_generation_mw: f64,
    /// Sum of carried load in MW.
    pub total_load_mw: f64,
    /// `generation − load`, clamped non-negative.
    pub grid_losses_mw: f64,
    /// Nodes counted online (`Connected` or `Degraded`).
    pub nodes_online: u32,
    /// Nodes counted offline.
    pub nodes_offline: u32,
    /// Nodes in `Degraded`.
    pub nodes_degraded: u32,
    /// Active alarm counts by severity.
    pub alarms: AlarmCounts,
    /// Last ten minutes of system frequency.
    pub frequency_trend: Vec<FrequencyPoint>,
    /// Computation time.
    pub updated_at: DateTime<Utc>,
}

/// Computes the grid rollup at a fixed cadence, publishes it to the fan-out
/// bus when it moved beyond the deadbands (with a 5 s keep-alive otherwise),
/// and writes one `grid_metrics` row per tick.
pub struct Aggregator {
    registry: Arc<NodeRegistry>,
    store: Arc<TelemetryStore>,
    alarms: Arc<AlarmEngine>,
    bus: Arc<FanoutBus>,
    historian: Arc<HistorianHandle>,
    latest: RwLock<Option<GridSnapshot>>,
    trace: Mutex<VecDeque<FrequencyPoint>>,
    last_published: Mutex<Option<(GridSnapshot, Instant)>>,
}

impl Aggregator {
    /// Wire the aggregator to its inputs and outputs.
    pub fn new(
        registry: Arc<NodeRegistry>,
        store: Arc<TelemetryStore>,
        alarms: Arc<AlarmEngine>,
        bus: Arc<FanoutBus>,
        historian: Arc<HistorianHandle>,
    ) -> Self {
        Self {
            registry,
            store,
            alarms,
            bus,
            historian,
            latest: RwLock::new(None),
            trace: Mutex::new(VecDeque::new()),
            last_published: Mutex::new(None),
        }
    }

    /// Compute a rollup from the latest sample of every node under the
    /// registry's consistent view.
    pub fn compute(&self) -> GridSnapshot {
        let mut total_generation = 0.0;
        let mut total_load = 0.0;
        let mut weighted_freq = 0.0;
        let mut weight = 0.0;

        for node in self.registry.list_nodes() {
            let Some(sample) = self.store.latest(&node.node_id) else {
                continue;
            };
            let power = sample.active_power_mw.unwrap_or(0.0);
            match node.kind {
                NodeKindConfig::Generation => {
                    total_generation += power;
                    // Offline nodes and silent meters do not steer frequency.
                    if node.link_state.is_online() {
                        if let Some(freq) = sample.frequency_hz {
                            if freq > 0.0 && node.capacity_mw > 0.0 {
                                weighted_freq += freq * node.capacity_mw;
                                weight += node.capacity_mw;
                            }
                        }
                    }
                }
                NodeKindConfig::Substation | NodeKindConfig::Distribution => {
                    total_load += power.abs();
                }
            }
        }

        let system_frequency = if weight > 0.0 {
            weighted_freq / weight
        } else {
            50.0
        };
        let counts = self.registry.counts();
        let now = Utc::now();

        let trace: Vec<FrequencyPoint> = {
            let mut trace = self.trace.lock();
            if trace.len() >= TRACE_CAPACITY {
                trace.pop_front();
            }
            trace.push_back(FrequencyPoint {
                timestamp: now,
                value: system_frequency,
            });
            trace.iter().copied().collect()
        };

        GridSnapshot {
            system_frequency_hz: system_frequency,
            total_generation_mw: total_generation,
            total_load_mw: total_load,
            grid_losses_mw: (total_generation - total_load).max(0.0),
            nodes_online: counts.online,
            nodes_offline: counts.offline,
            nodes_degraded: counts.degraded,
            alarms: self.alarms.counts(),
            frequency_trend: trace,
            updated_at: now,
        }
    }

    /// One aggregation tick.
    pub fn tick(&self) {
        let snapshot = self.compute();
        *self.latest.write() = Some(snapshot.clone());

        self.historian
            .record(HistorianRow::GridMetrics(GridMetricsRow {
                time: snapshot.updated_at,
                total_generation_mw: snapshot.total_generation_mw,
                total_load_mw: snapshot.total_load_mw,
                system_frequency_hz: snapshot.system_frequency_hz,
                grid_losses_mw: snapshot.grid_losses_mw,
                nodes_online: snapshot.nodes_online,
                nodes_offline: snapshot.nodes_offline,
                active_alarms: snapshot.alarms.total(),
                critical_alarms: snapshot.alarms.critical,
            }));

        let mut last = self.last_published.lock();
        let publish = match last.as_ref() {
            None => true,
            Some((previous, at)) => {
                at.elapsed() >= KEEPALIVE || snapshot_moved(previous, &snapshot)
            }
        };
        if publish {
            *last = Some((snapshot.clone(), Instant::now()));
            drop(last);
            debug!(
                frequency = snapshot.system_frequency_hz,
                generation = snapshot.total_generation_mw,
                "grid overview published"
            );
            self.bus.publish(WsMessage::GridOverviewUpdate { snapshot });
        }
    }

    /// Latest rollup; computed on demand before the first tick.
    pub fn snapshot(&self) -> GridSnapshot {
        if let Some(snapshot) = self.latest.read().clone() {
            return snapshot;
        }
        self.compute()
    }

    /// Periodic driver.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.tick(),
            }
        }
    }
}

fn snapshot_moved(previous: &GridSnapshot, current: &GridSnapshot) -> bool {
    (previous.system_frequency_hz - current.system_frequency_hz).abs() > FREQ_EPSILON_HZ
        || (previous.total_generation_mw - current.total_generation_mw).abs() > MW_EPSILON
        || (previous.total_load_mw - current.total_load_mw).abs() > MW_EPSILON
        || (previous.grid_losses_mw - current.grid_losses_mw).abs() > MW_EPSILON
        || previous.nodes_online != current.nodes_online
        || previous.nodes_offline != current.nodes_offline
        || previous.alarms != current.alarms
}
