//! ---
//! scada_section: "05-master-runtime"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "SCADA master: registry, aggregation, alarms, control, security, surfaces."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use scada_common::{ErrorKind, ServiceError};
use scada_historian::{AlarmRow, HistorianHandle, HistorianRow};
use scada_proto::{BreakerState, TelemetrySample};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{FanoutBus, WsMessage};

const SHARDS: usize = 16;
/// Consecutive in-band samples required before an alarm clears.
const CLEAR_STREAK: u32 = 5;

const FREQ_LOW_HZ: f64 = 49.5;
const FREQ_HIGH_HZ: f64 = 50.5;
const FREQ_HYSTERESIS_HZ: f64 = 0.05;
const VOLTAGE_DEVIATION: f64 = 0.10;
const VOLTAGE_HYSTERESIS: f64 = 0.02;
const THERMAL_HIGH_C: f64 = 100.0;
const THERMAL_HYSTERESIS_C: f64 = 5.0;

/// Alarm severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmSeverity {
    /// Informational.
    Info,
    /// Requires operator attention.
    Warning,
    /// Requires immediate operator action.
    Critical,
}

impl AlarmSeverity {
    /// Wire/label name.
    pub fn as_str(self) -> &'static str {
        match self {
            AlarmSeverity::Info => "info",
            AlarmSeverity::Warning => "warning",
            AlarmSeverity::Critical => "critical",
        }
    }

    fn parse(name: &str) -> Self {
        match name {
            "critical" => AlarmSeverity::Critical,
            "info" => AlarmSeverity::Info,
            _ => AlarmSeverity::Warning,
        }
    }
}

/// Alarm lifecycle state. Transitions are monotone; `Cleared` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlarmState {
    /// Condition active, not yet seen by an operator.
    Raised,
    /// Condition active, acknowledged by an operator.
    Acknowledged,
    /// Condition gone; the record is immutable from here.
    Cleared,
}

/// One alarm record.
#[derive(Debug, Clone, Serialize)]
pub struct Alarm {
    /// Identifier.
    pub alarm_id: Uuid,
    /// Node the alarm belongs to.
    pub node_id: String,
    /// Code, e.g. `OVERVOLTAGE`.
    pub code: String,
    /// Severity (static per code).
    pub severity: AlarmSeverity,
    /// Lifecycle state.
    pub state: AlarmState,
    /// Raise timestamp.
    pub raised_at: DateTime<Utc>,
    /// Acknowledge timestamp.
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Acknowledging operator.
    pub acknowledged_by: Option<String>,
    /// Clear timestamp.
    pub cleared_at: Option<DateTime<Utc>>,
    /// Structured context; `occurrences` counts repeat crossings.
    pub details: JsonValue,
}

/// Active alarm counts by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlarmCounts {
    /// Active info alarms.
    pub info: u32,
    /// Active warning alarms.
    pub warning: u32,
    /// Active critical alarms.
    pub critical: u32,
}

impl AlarmCounts {
    /// Total active alarms.
    pub fn total(&self) -> u32 {
        self.info + self.warning + self.critical
    }
}

struct ActiveAlarm {
    alarm: Alarm,
    occurrences: u64,
    in_band_streak: u32,
}

/// Static severity mapping by code.
pub fn severity_for(code: &str) -> AlarmSeverity {
    match code {
        "UNDERFREQUENCY" | "THERMAL_TRIP" | "BREAKER_TRIP" => AlarmSeverity::Critical,
        "OVERFREQUENCY" | "OVERVOLTAGE" | "UNDERVOLTAGE" | "THERMAL_HIGH" => AlarmSeverity::Warning,
        _ => AlarmSeverity::Warning,
    }
}

/// The alarm engine: a table keyed by `(node_id, code)` with at most one
/// active alarm per key, hysteresis-based clearing, and an occurrence counter
/// for repeat crossings. Keys are sharded so unrelated nodes never contend.
pub struct AlarmEngine {
    shards: Vec<Mutex<HashMap<(String, String), ActiveAlarm>>>,
    cleared: Mutex<VecDeque<Alarm>>,
    bus: Arc<FanoutBus>,
    historian: Arc<HistorianHandle>,
    metrics: Option<scada_metrics::MasterMetrics>,
}

impl AlarmEngine {
    /// Create the engine.
    pub fn new(
        bus: Arc<FanoutBus>,
        historian: Arc<HistorianHandle>,
        metrics: Option<scada_metrics::MasterMetrics>,
    ) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            cleared: Mutex::new(VecDeque::new()),
            bus,
            historian,
            metrics,
        }
    }

    fn shard(&self, key: &(String, String)) -> &Mutex<HashMap<(String, String), ActiveAlarm>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Evaluate one telemetry sample against the static thresholds.
    pub fn evaluate_sample(&self, sample: &TelemetrySample, nominal_voltage_kv: f64) {
        let node = &sample.node_id;

        if let Some(freq) = sample.frequency_hz {
            if freq > 0.0 {
                self.drive(
                    node,
                    "UNDERFREQUENCY",
                    freq < FREQ_LOW_HZ,
                    freq >= FREQ_LOW_HZ + FREQ_HYSTERESIS_HZ,
                    serde_json::json!({ "frequency_hz": freq }),
                );
                self.drive(
                    node,
                    "OVERFREQUENCY",
                    freq > FREQ_HIGH_HZ,
                    freq <= FREQ_HIGH_HZ - FREQ_HYSTERESIS_HZ,
                    serde_json::json!({ "frequency_hz": freq }),
                );
            }
        }

        if let Some(voltage) = sample.voltage_kv {
            if voltage > 0.0 && nominal_voltage_kv > 0.0 {
                let deviation = (voltage - nominal_voltage_kv) / nominal_voltage_kv;
                self.drive(
                    node,
                    "OVERVOLTAGE",
                    deviation > VOLTAGE_DEVIATION,
                    deviation <= VOLTAGE_DEVIATION - VOLTAGE_HYSTERESIS,
                    serde_json::json!({ "voltage_kv": voltage, "nominal_kv": nominal_voltage_kv }),
                );
                self.drive(
                    node,
                    "UNDERVOLTAGE",
                    deviation < -VOLTAGE_DEVIATION,
                    deviation >= -(VOLTAGE_DEVIATION - VOLTAGE_HYSTERESIS),
                    serde_json::json!({ "voltage_kv": voltage, "nominal_kv": nominal_voltage_kv }),
                );
            }
        }

        if let Some(temp) = sample.temperature_c {
            self.drive(
                node,
                "THERMAL_HIGH",
                temp > THERMAL_HIGH_C,
                temp <= THERMAL_HIGH_C - THERMAL_HYSTERESIS_C,
                serde_json::json!({ "temperature_c": temp }),
            );
        }

        self.drive(
            node,
            "BREAKER_TRIP",
            sample.breaker_state == BreakerState::Tripped,
            sample.breaker_state != BreakerState::Tripped,
            serde_json::json!({ "breaker_state": sample.breaker_state }),
        );
    }

    /// Raise (or count) an alarm the RTU decided locally.
    pub fn raise_external(
        &self,
        node_id: &str,
        code: &str,
        severity: &str,
        message: &str,
        details: JsonValue,
    ) {
        let mut payload = serde_json::json!({ "message": message });
        if let (Some(map), Some(extra)) = (payload.as_object_mut(), details.as_object()) {
            for (key, value) in extra {
                map.insert(key.clone(), value.clone());
            }
        }
        self.raise_with_severity(node_id, code, AlarmSeverity::parse(severity), payload);
    }

    /// Threshold driver: `crossed` raises or counts, `in_band` advances the
    /// clear streak, anything between the threshold and the hysteresis band
    /// keeps the alarm active without progress in either direction.
    fn drive(&self, node_id: &str, code: &str, crossed: bool, in_band: bool, details: JsonValue) {
        let key = (node_id.to_string(), code.to_string());
        if crossed {
            self.raise_with_severity(node_id, code, severity_for(code), details);
            return;
        }

        let cleared = {
            let shard = self.shard(&key);
            let mut table = shard.lock();
            let Some(active) = table.get_mut(&key) else {
                return;
            };
            if !in_band {
                active.in_band_streak = 0;
                return;
            }
            active.in_band_streak += 1;
            if active.in_band_streak < CLEAR_STREAK {
                return;
            }
            let mut entry = table.remove(&key).expect("entry present under lock");
            entry.alarm.state = AlarmState::Cleared;
            entry.alarm.cleared_at = Some(Utc::now());
            entry.alarm.details["occurrences"] = serde_json::json!(entry.occurrences);
            entry.alarm
        };

        info!(node = node_id, code, "alarm cleared");
        self.remember_cleared(cleared.clone());
        self.persist(&cleared);
        self.bus.publish(WsMessage::AlarmCleared { alarm: cleared });
        self.update_metrics();
    }

    fn raise_with_severity(
        &self,
        node_id: &str,
        code: &str,
        severity: AlarmSeverity,
        details: JsonValue,
    ) {
        let key = (node_id.to_string(), code.to_string());
        let raised = {
            let shard = self.shard(&key);
            let mut table = shard.lock();
            if let Some(active) = table.get_mut(&key) {
                // Re-crossing while active only bumps the counter.
                active.occurrences += 1;
                active.in_band_streak = 0;
                active.alarm.details["occurrences"] = serde_json::json!(active.occurrences);
                None
            } else {
                let mut details = details;
                details["occurrences"] = serde_json::json!(1);
                let alarm = Alarm {
                    alarm_id: Uuid::new_v4(),
                    node_id: node_id.to_string(),
                    code: code.to_string(),
                    severity,
                    state: AlarmState::Raised,
                    raised_at: Utc::now(),
                    acknowledged_at: None,
                    acknowledged_by: None,
                    cleared_at: None,
                    details,
                };
                table.insert(
                    key.clone(),
                    ActiveAlarm {
                        alarm: alarm.clone(),
                        occurrences: 1,
                        in_band_streak: 0,
                    },
                );
                Some(alarm)
            }
        };

        if let Some(alarm) = raised {
            warn!(node = node_id, code, severity = severity.as_str(), "alarm raised");
            self.persist(&alarm);
            self.bus.publish(WsMessage::AlarmRaised { alarm });
            self.update_metrics();
        }
    }

    /// Operator acknowledgement. Idempotent on `Acknowledged`; conflicts on
    /// `Cleared`; unknown ids are a validation failure.
    pub fn acknowledge(
        &self,
        alarm_id: Uuid,
        operator: &str,
        comment: Option<&str>,
    ) -> Result<Alarm, ServiceError> {
        for shard in &self.shards {
            let mut table = shard.lock();
            if let Some(active) = table
                .values_mut()
                .find(|active| active.alarm.alarm_id == alarm_id)
            {
                match active.alarm.state {
                    AlarmState::Raised => {
                        active.alarm.state = AlarmState::Acknowledged;
                        active.alarm.acknowledged_at = Some(Utc::now());
                        active.alarm.acknowledged_by = Some(operator.to_string());
                        if let Some(comment) = comment {
                            active.alarm.details["ack_comment"] = serde_json::json!(comment);
                        }
                        let alarm = active.alarm.clone();
                        drop(table);
                        info!(alarm = %alarm_id, operator, "alarm acknowledged");
                        self.persist(&alarm);
                        self.bus
                            .publish(WsMessage::AlarmAcknowledged { alarm: alarm.clone() });
                        return Ok(alarm);
                    }
                    AlarmState::Acknowledged => return Ok(active.alarm.clone()),
                    AlarmState::Cleared => unreachable!("cleared alarms leave the table"),
                }
            }
        }

        if self
            .cleared
            .lock()
            .iter()
            .any(|alarm| alarm.alarm_id == alarm_id)
        {
            return Err(ServiceError::conflict("alarm already cleared"));
        }
        Err(ServiceError::new(ErrorKind::Validation, "unknown alarm id"))
    }

    /// Alarms with state `Raised` or `Acknowledged`, oldest first.
    pub fn active_alarms(&self) -> Vec<Alarm> {
        let mut alarms: Vec<Alarm> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .values()
                    .map(|active| active.alarm.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        alarms.sort_by_key(|alarm| alarm.raised_at);
        alarms
    }

    /// Active alarm counts by severity.
    pub fn counts(&self) -> AlarmCounts {
        let mut counts = AlarmCounts::default();
        for alarm in self.active_alarms() {
            match alarm.severity {
                AlarmSeverity::Info => counts.info += 1,
                AlarmSeverity::Warning => counts.warning += 1,
                AlarmSeverity::Critical => counts.critical += 1,
            }
        }
        counts
    }

    fn remember_cleared(&self, alarm: Alarm) {
        let mut cleared = self.cleared.lock();
        if cleared.len() >= 1000 {
            cleared.pop_front();
        }
        cleared.push_back(alarm);
    }

    fn persist(&self, alarm: &Alarm) {
        let state = match alarm.state {
            AlarmState::Raised => "Raised",
            AlarmState::Acknowledged => "Acknowledged",
            AlarmState::Cleared => "Cleared",
        };
        self.historian.record(HistorianRow::Alarms(AlarmRow {
            alarm_id: alarm.alarm_id,
            node_id: alarm.node_id.clone(),
            code: alarm.code.clone(),
            severity: alarm.severity.as_str().to_string(),
            status: state.to_string(),
            raised_at: alarm.raised_at,
            acknowledged_at: alarm.acknowledged_at,
            acknowledged_by: alarm.acknowledged_by.clone(),
            cleared_at: alarm.cleared_at,
            details_json: alarm.details.clone(),
        }));
    }

    fn update_metrics(&self) {
        if let Some(metrics) = &self.metrics {
            let counts = self.counts();
            metrics.set_alarms_active("info", counts.info as usize);
            metrics.set_alarms_active("warning", counts.warning as usize);
            metrics.set_alarms_active("critical", counts.critical as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FanoutBus;
    use scada_historian::{spawn_writer, NdjsonSink, WriterConfig};
    use scada_proto::Quality;
    use tempfile::tempdir;

    fn sample(node_id: &str, frequency: f64) -> TelemetrySample {
        TelemetrySample {
            node_id: node_id.into(),
            sequence: 0,
            timestamp: Utc::now(),
            voltage_kv: Some(400.0),
            current_a: Some(500.0),
            active_power_mw: Some(300.0),
            reactive_power_mvar: Some(10.0),
            power_factor: Some(0.97),
            frequency_hz: Some(frequency),
            temperature_c: Some(60.0),
            breaker_state: BreakerState::Closed,
            energy_delivered_mwh: Some(1.0),
            quality: Quality::Good,
        }
    }

    fn engine() -> (Arc<AlarmEngine>, Arc<FanoutBus>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let bus = Arc::new(FanoutBus::new(64, None));
        let sink = Arc::new(NdjsonSink::new(dir.path()).unwrap());
        let historian = Arc::new(spawn_writer(sink, WriterConfig::default()));
        let engine = Arc::new(AlarmEngine::new(bus.clone(), historian, None));
        (engine, bus, dir)
    }

    #[tokio::test]
    async fn boundary_frequency_does_not_alarm_at_exactly_49_5() {
        let (engine, _bus, _dir) = engine();
        engine.evaluate_sample(&sample("GEN-001", 49.5), 400.0);
        assert!(engine.active_alarms().is_empty());

        engine.evaluate_sample(&sample("GEN-001", 49.4), 400.0);
        let active = engine.active_alarms();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].code, "UNDERFREQUENCY");
        assert_eq!(active[0].severity, AlarmSeverity::Critical);
    }

    #[tokio::test]
    async fn repeat_crossings_increment_occurrences_without_duplicates() {
        let (engine, _bus, _dir) = engine();
        for _ in 0..4 {
            engine.evaluate_sample(&sample("GEN-001", 49.2), 400.0);
        }
        let active = engine.active_alarms();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].details["occurrences"], 4);
    }

    #[tokio::test]
    async fn clears_after_five_consecutive_in_band_samples() {
        let (engine, _bus, _dir) = engine();
        engine.evaluate_sample(&sample("GEN-001", 49.2), 400.0);
        assert_eq!(engine.active_alarms().len(), 1);

        // 49.52 is above the threshold but inside the hysteresis band: the
        // alarm must stay active and make no clearing progress.
        for _ in 0..10 {
            engine.evaluate_sample(&sample("GEN-001", 49.52), 400.0);
        }
        assert_eq!(engine.active_alarms().len(), 1);

        // Four samples in band: still active.
        for _ in 0..4 {
            engine.evaluate_sample(&sample("GEN-001", 49.98), 400.0);
        }
        assert_eq!(engine.active_alarms().len(), 1);

        // Fifth closes it out.
        engine.evaluate_sample(&sample("GEN-001", 49.98), 400.0);
        assert!(engine.active_alarms().is_empty());
    }

    #[tokio::test]
    async fn acknowledge_is_idempotent_and_cleared_conflicts() {
        let (engine, _bus, _dir) = engine();
        engine.evaluate_sample(&sample("SUB-001", 49.0), 400.0);
        let alarm_id = engine.active_alarms()[0].alarm_id;

        let first = engine.acknowledge(alarm_id, "operator1", Some("seen")).unwrap();
        assert_eq!(first.state, AlarmState::Acknowledged);
        let second = engine.acknowledge(alarm_id, "operator1", None).unwrap();
        assert_eq!(second.state, AlarmState::Acknowledged);
        assert_eq!(first.acknowledged_at, second.acknowledged_at);

        for _ in 0..5 {
            engine.evaluate_sample(&sample("SUB-001", 50.0), 400.0);
        }
        let err = engine.acknowledge(alarm_id, "operator1", None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn uniqueness_holds_per_node_and_code() {
        let (engine, _bus, _dir) = engine();
        engine.evaluate_sample(&sample("GEN-001", 49.0), 400.0);
        engine.evaluate_sample(&sample("GEN-002", 49.0), 400.0);
        engine.evaluate_sample(&sample("GEN-001", 49.0), 400.0);

        let active = engine.active_alarms();
        assert_eq!(active.len(), 2);
        let mut keys: Vec<(String, String)> = active
            .iter()
            .map(|a| (a.node_id.clone(), a.code.clone()))
            .collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn breaker_trip_raises_critical_alarm() {
        let (engine, _bus, _dir) = engine();
        let mut tripped = sample("SUB-002", 50.0);
        tripped.breaker_state = BreakerState::Tripped;
        engine.evaluate_sample(&tripped, 400.0);

        let active = engine.active_alarms();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].code, "BREAKER_TRIP");
        assert_eq!(active[0].severity, AlarmSeverity::Critical);
    }

    #[tokio::test]
    async fn external_alarm_carries_message_details() {
        let (engine, _bus, _dir) = engine();
        engine.raise_external(
            "GEN-003",
            "THERMAL_TRIP",
            "critical",
            "hot-spot exceeded trip threshold",
            serde_json::json!({ "temperature_c": 112.4 }),
        );
        let active = engine.active_alarms();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].severity, AlarmSeverity::Critical);
        assert_eq!(active[0].details["temperature_c"], 112.4);
    }
}
