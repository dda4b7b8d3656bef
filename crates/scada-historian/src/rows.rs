//! ---
//! scada_section: "03-persistence-metrics"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Historian schema rows, sinks, and the batching writer."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// One row of the `telemetry` hypertable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRow {
    /// Measurement timestamp.
    pub time: DateTime<Utc>,
    /// Originating node.
    pub node_id: String,
    /// Bus voltage in kV.
    pub voltage_kv: Option<f64>,
    /// Line current in A.
    pub current_a: Option<f64>,
    /// Active power in MW.
    pub real_power_mw: Option<f64>,
    /// Reactive power in MVAr.
    pub reactive_power_mvar: Option<f64>,
    /// Power factor.
    pub power_factor: Option<f64>,
    /// Frequency in Hz.
    pub frequency_hz: Option<f64>,
    /// Transformer temperature in °C.
    pub temperature_c: Option<f64>,
    /// Breaker state name (`Open`, `Closed`, `Tripped`).
    pub breaker_state: String,
    /// Cumulative energy delivered in MWh.
    pub energy_delivered_mwh: Option<f64>,
}

/// One row of the `grid_metrics` hypertable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridMetricsRow {
    /// Aggregation tick timestamp.
    pub time: DateTime<Utc>,
    /// Sum of generator output in MW.
    pub total_generation_mw: f64,
    /// Sum of load in MW.
    pub total_load_mw: f64,
    /// Capacity-weighted system frequency in Hz.
    pub system_frequency_hz: f64,
    /// Losses in MW (clamped non-negative).
    pub grid_losses_mw: f64,
    /// Nodes counted online.
    pub nodes_online: u32,
    /// Nodes counted offline.
    pub nodes_offline: u32,
    /// Alarms in `Raised` or `Acknowledged` state.
    pub active_alarms: u32,
    /// Active alarms with critical severity.
    pub critical_alarms: u32,
}

/// One row of the `alarms` table, written on every state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRow {
    /// Alarm identifier.
    pub alarm_id: Uuid,
    /// Node the alarm belongs to.
    pub node_id: String,
    /// Alarm code, e.g. `OVERVOLTAGE`.
    pub code: String,
    /// Severity name.
    pub severity: String,
    /// Current state name.
    pub status: String,
    /// When the alarm was raised.
    pub raised_at: DateTime<Utc>,
    /// Acknowledgement timestamp, if any.
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Acknowledging operator, if any.
    pub acknowledged_by: Option<String>,
    /// Clear timestamp, if any.
    pub cleared_at: Option<DateTime<Utc>>,
    /// Structured free-form context.
    pub details_json: JsonValue,
}

/// One row of the `audit_log` table. This is the single canonical audit
/// shape; every emitter routes through it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRow {
    /// Entry identifier.
    pub log_id: Uuid,
    /// Operator identity that performed (or attempted) the action.
    pub operator_id: String,
    /// Action name, e.g. `sbo.operate`.
    pub action: String,
    /// Resource category, e.g. `breaker`.
    pub resource_type: String,
    /// Resource identifier, e.g. `SUB-001/BRK-01`.
    pub resource_id: String,
    /// Outcome (`Success`, `Failure`, `Denied`).
    pub result: String,
    /// Caller address.
    pub ip: String,
    /// Entry timestamp.
    pub timestamp: DateTime<Utc>,
    /// Structured free-form context.
    pub metadata_json: JsonValue,
}

/// One row of the `security_events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEventRow {
    /// Event identifier.
    pub event_id: Uuid,
    /// Event type name, e.g. `UnknownConnection`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Severity name.
    pub severity: String,
    /// Node involved, if any.
    pub node_id: Option<String>,
    /// Client address involved, if any.
    pub client_ip: Option<String>,
    /// Human readable description.
    pub description: String,
    /// Event timestamp.
    pub timestamp: DateTime<Utc>,
    /// Structured free-form context.
    pub metadata_json: JsonValue,
}

/// A row destined for one of the historian tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum HistorianRow {
    /// `telemetry` hypertable.
    Telemetry(TelemetryRow),
    /// `grid_metrics` hypertable.
    GridMetrics(GridMetricsRow),
    /// `alarms` table.
    Alarms(AlarmRow),
    /// `audit_log` table.
    AuditLog(AuditRow),
    /// `security_events` table.
    SecurityEvents(SecurityEventRow),
}

impl HistorianRow {
    /// Target table name.
    pub fn table(&self) -> &'static str {
        match self {
            HistorianRow::Telemetry(_) => "telemetry",
            HistorianRow::GridMetrics(_) => "grid_metrics",
            HistorianRow::Alarms(_) => "alarms",
            HistorianRow::AuditLog(_) => "audit_log",
            HistorianRow::SecurityEvents(_) => "security_events",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_tag_their_table() {
        let row = HistorianRow::GridMetrics(GridMetricsRow {
            time: Utc::now(),
            total_generation_mw: 812.0,
            total_load_mw: 790.5,
            system_frequency_hz: 50.01,
            grid_losses_mw: 21.5,
            nodes_online: 15,
            nodes_offline: 0,
            active_alarms: 1,
            critical_alarms: 0,
        });
        assert_eq!(row.table(), "grid_metrics");
        let json = serde_json::to_string(&row).unwrap();
        assert!(json.contains("\"table\":\"grid_metrics\""));
        let back: HistorianRow = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn security_event_uses_type_column_name() {
        let row = SecurityEventRow {
            event_id: Uuid::new_v4(),
            event_type: "UnknownConnection".into(),
            severity: "warning".into(),
            node_id: Some("GEN-001".into()),
            client_ip: Some("203.0.113.9".into()),
            description: "unknown Modbus client".into(),
            timestamp: Utc::now(),
            metadata_json: serde_json::json!({}),
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["type"], "UnknownConnection");
    }
}
