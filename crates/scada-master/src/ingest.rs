//! ---
//! scada_section: "05-master-runtime"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "SCADA master: registry, aggregation, alarms, control, security, surfaces."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use scada_historian::{HistorianHandle, HistorianRow, TelemetryRow};
use scada_proto::{Frame, RtuEvent, TelemetrySample};
use tracing::{debug, warn};

use crate::alarms::AlarmEngine;
use crate::bus::{FanoutBus, WsMessage};
use crate::registry::NodeRegistry;
use crate::security::SecurityEngine;
use crate::store::TelemetryStore;

/// Consumes frames from a node's control channel in emission order and fans
/// them into the store, alarm engine, security engine, fan-out bus, and
/// historian. One instance is shared by every supervisor; per-node ordering
/// holds because each node has exactly one reader task calling in.
pub struct Ingest {
    registry: Arc<NodeRegistry>,
    store: Arc<TelemetryStore>,
    alarms: Arc<AlarmEngine>,
    security: Arc<SecurityEngine>,
    bus: Arc<FanoutBus>,
    historian: Arc<HistorianHandle>,
    metrics: Option<scada_metrics::MasterMetrics>,
    expected_seq: Mutex<HashMap<String, u64>>,
}

impl Ingest {
    /// Wire the pump to its consumers.
    pub fn new(
        registry: Arc<NodeRegistry>,
        store: Arc<TelemetryStore>,
        alarms: Arc<AlarmEngine>,
        security: Arc<SecurityEngine>,
        bus: Arc<FanoutBus>,
        historian: Arc<HistorianHandle>,
        metrics: Option<scada_metrics::MasterMetrics>,
    ) -> Self {
        Self {
            registry,
            store,
            alarms,
            security,
            bus,
            historian,
            metrics,
            expected_seq: Mutex::new(HashMap::new()),
        }
    }

    /// Forget the sequence expectation for a node. Called on every fresh
    /// handshake: sequence numbers are dense within one RTU session but reset
    /// across restarts.
    pub fn reset_sequence(&self, node_id: &str) {
        self.expected_seq.lock().remove(node_id);
    }

    /// Handle one frame from a node, in the order the RTU emitted it.
    pub fn handle_frame(&self, node_id: &str, frame: Frame) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_frame(node_id, frame.kind());
        }
        match frame {
            Frame::Telemetry(sample) => self.handle_sample(node_id, sample),
            Frame::Event(event) => self.handle_event(node_id, event),
            Frame::ConnectionReport(record) => self.security.ingest(record),
            Frame::Heartbeat { .. } => self.registry.heartbeat(node_id, Utc::now()),
            Frame::Hello {
                breaker_states, ..
            } => {
                self.registry.set_breaker_states(node_id, breaker_states);
                self.reset_sequence(node_id);
            }
            Frame::Snapshot {
                latest,
                breaker_states,
            } => {
                self.registry.set_breaker_states(node_id, breaker_states);
                if let Some(sample) = latest {
                    self.handle_sample(node_id, sample);
                }
            }
            Frame::Reply(_) | Frame::Command(_) => {
                warn!(node = node_id, "frame kind out of place on ingest path");
            }
        }
    }

    fn handle_sample(&self, node_id: &str, sample: TelemetrySample) {
        if sample.node_id != node_id {
            warn!(node = node_id, claimed = %sample.node_id, "sample node mismatch; dropping");
            return;
        }

        {
            let mut expected = self.expected_seq.lock();
            if let Some(next) = expected.get(node_id) {
                if sample.sequence != *next {
                    debug!(
                        node = node_id,
                        expected = *next,
                        got = sample.sequence,
                        "telemetry sequence gap"
                    );
                }
            }
            expected.insert(node_id.to_string(), sample.sequence + 1);
        }

        self.registry.heartbeat(node_id, Utc::now());

        let nominal = self
            .registry
            .entry(node_id)
            .map(|entry| entry.nominal_voltage_kv)
            .unwrap_or(0.0);
        self.alarms.evaluate_sample(&sample, nominal);

        self.historian.record(HistorianRow::Telemetry(TelemetryRow {
            time: sample.timestamp,
            node_id: sample.node_id.clone(),
            voltage_kv: sample.voltage_kv,
            current_a: sample.current_a,
            real_power_mw: sample.active_power_mw,
            reactive_power_mvar: sample.reactive_power_mvar,
            power_factor: sample.power_factor,
            frequency_hz: sample.frequency_hz,
            temperature_c: sample.temperature_c,
            breaker_state: format!("{:?}", sample.breaker_state),
            energy_delivered_mwh: sample.energy_delivered_mwh,
        }));

        self.store.insert(sample.clone());
        self.bus.publish(WsMessage::TelemetryUpdate {
            node_id: node_id.to_string(),
            data: sample,
        });
    }

    fn handle_event(&self, node_id: &str, event: RtuEvent) {
        match event {
            RtuEvent::BreakerChanged {
                breaker_id, state, reason, ..
            } => {
                debug!(node = node_id, breaker = %breaker_id, ?state, reason, "breaker event");
                self.registry.set_breaker(node_id, &breaker_id, state);
            }
            RtuEvent::Alarm {
                code,
                severity,
                message,
                details,
                ..
            } => {
                self.alarms
                    .raise_external(node_id, &code, &severity, &message, details);
            }
        }
    }
}
