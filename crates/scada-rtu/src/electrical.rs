//! ---
//! scada_section: "04-rtu-runtime"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Per-node RTU runtime: simulation, protocol listeners, control channel."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use chrono::{Timelike, Utc};
use rand::Rng;
use scada_common::config::{NodeEntry, NodeKindConfig};
use scada_proto::{BreakerState, NodeDescriptor, NodeKind, Quality, RtuEvent};
use tracing::{info, warn};

/// Identifier of the main incomer breaker every node carries.
pub const MAIN_BREAKER: &str = "BRK-01";
/// Identifier of the secondary feeder breaker.
pub const FEEDER_BREAKER: &str = "BRK-02";

/// Hot-spot temperature at which the transformer protection trips.
const THERMAL_TRIP_C: f64 = 110.0;

/// Raw measurement set produced by one simulation tick, before quality
/// screening.
#[derive(Debug, Clone, Copy)]
pub struct Reading {
    /// Bus voltage in kV.
    pub voltage_kv: f64,
    /// Line current in A.
    pub current_a: f64,
    /// Active power in MW.
    pub active_power_mw: f64,
    /// Reactive power in MVAr.
    pub reactive_power_mvar: f64,
    /// Power factor.
    pub power_factor: f64,
    /// Frequency in Hz.
    pub frequency_hz: f64,
    /// Transformer temperature in °C; feeders carry none.
    pub temperature_c: Option<f64>,
}

/// Local electrical state of one node.
///
/// This is a plausible random-walk model, not a power-flow solver: generation
/// ramps toward a dispatch setpoint, substations carry load with an
/// IEC-60076-style first-order thermal response, distribution feeders follow
/// a 24-hour demand shape. Values stay continuous between ticks so the
/// master-side threshold and hysteresis logic sees realistic traces.
pub struct ElectricalSim {
    descriptor: NodeDescriptor,
    breakers: BTreeMap<String, BreakerState>,
    output_mw: f64,
    temperature_c: f64,
    energy_mwh: f64,
    last_good: Option<Reading>,
    /// Injected measurement fault: next tick yields NaN voltage. Test hook
    /// and chaos knob.
    pub fault_next_sample: bool,
}

fn kind_from_config(kind: NodeKindConfig) -> NodeKind {
    match kind {
        NodeKindConfig::Generation => NodeKind::Generation,
        NodeKindConfig::Substation => NodeKind::Substation,
        NodeKindConfig::Distribution => NodeKind::Distribution,
    }
}

/// Fraction of peak demand by hour of day.
fn demand_fraction(hour: u32) -> f64 {
    const PROFILE: [f64; 24] = [
        0.30, 0.28, 0.30, 0.32, 0.35, 0.45, 0.60, 0.68, 0.70, 0.72, 0.70, 0.68, 0.60, 0.55, 0.55,
        0.58, 0.62, 0.70, 0.85, 0.95, 1.00, 0.95, 0.75, 0.50,
    ];
    PROFILE[(hour as usize) % 24]
}

impl ElectricalSim {
    /// Build the simulation for a catalogue entry.
    pub fn new(entry: &NodeEntry) -> Self {
        let descriptor = NodeDescriptor {
            node_id: entry.node_id.clone(),
            kind: kind_from_config(entry.kind),
            location: entry.location.clone(),
            capacity_mw: entry.capacity_mw,
            nominal_voltage_kv: entry.nominal_voltage_kv,
        };
        let mut breakers = BTreeMap::new();
        breakers.insert(MAIN_BREAKER.to_string(), BreakerState::Closed);
        breakers.insert(FEEDER_BREAKER.to_string(), BreakerState::Closed);
        Self {
            descriptor,
            breakers,
            output_mw: entry.capacity_mw * 0.6,
            temperature_c: 55.0,
            energy_mwh: 0.0,
            last_good: None,
            fault_next_sample: false,
        }
    }

    /// Static description exchanged in the control-channel handshake.
    pub fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    /// Current breaker states keyed by breaker id.
    pub fn breaker_states(&self) -> BTreeMap<String, BreakerState> {
        self.breakers.clone()
    }

    /// State of one breaker, if it exists.
    pub fn breaker(&self, breaker_id: &str) -> Option<BreakerState> {
        self.breakers.get(breaker_id).copied()
    }

    /// Whether the main incomer is carrying current.
    pub fn energised(&self) -> bool {
        self.breakers.get(MAIN_BREAKER) == Some(&BreakerState::Closed)
    }

    /// Drive one breaker to a new state. Returns the transition event, or
    /// `None` when the breaker is unknown or already in that state.
    pub fn set_breaker(
        &mut self,
        breaker_id: &str,
        state: BreakerState,
        reason: &str,
    ) -> Option<RtuEvent> {
        let current = self.breakers.get_mut(breaker_id)?;
        if *current == state {
            return None;
        }
        *current = state;
        info!(node = %self.descriptor.node_id, breaker = breaker_id, ?state, reason, "breaker state changed");
        Some(RtuEvent::BreakerChanged {
            breaker_id: breaker_id.to_string(),
            state,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Open every breaker owned by the node.
    pub fn isolate(&mut self, reason: &str) -> Vec<RtuEvent> {
        let ids: Vec<String> = self.breakers.keys().cloned().collect();
        ids.iter()
            .filter_map(|id| self.set_breaker(id, BreakerState::Open, reason))
            .collect()
    }

    /// Advance the model by `dt_s` seconds and produce a reading plus any
    /// protection events it caused.
    pub fn tick(&mut self, dt_s: f64) -> (Reading, Quality, Vec<RtuEvent>) {
        let mut rng = rand::thread_rng();
        let mut events = Vec::new();
        let capacity = self.descriptor.capacity_mw;
        let nominal_kv = self.descriptor.nominal_voltage_kv;

        let target_mw = match self.descriptor.kind {
            NodeKind::Generation => capacity * 0.70,
            NodeKind::Substation => capacity * rng.gen_range(0.55..0.75),
            NodeKind::Distribution => capacity * demand_fraction(Utc::now().hour()),
        };
        // First-order approach to the target with measurement noise on top.
        self.output_mw += (target_mw - self.output_mw) * (dt_s / 30.0).min(1.0);
        self.output_mw += rng.gen_range(-0.5..0.5);
        self.output_mw = self.output_mw.clamp(0.0, capacity * 1.1);

        let energised = self.energised();
        let power_mw = if energised { self.output_mw } else { 0.0 };
        let power_factor = rng.gen_range(0.93..0.99);
        let apparent_mva = if power_factor > 0.0 {
            power_mw / power_factor
        } else {
            power_mw
        };
        let reactive_mvar = (apparent_mva.powi(2) - power_mw.powi(2)).max(0.0).sqrt();

        let voltage_kv = if energised {
            nominal_kv * rng.gen_range(0.985..1.015)
        } else {
            0.0
        };
        let current_a = if energised && voltage_kv > 0.0 {
            apparent_mva * 1000.0 / (3f64.sqrt() * voltage_kv)
        } else {
            0.0
        };
        let frequency_hz = if energised {
            50.0 + rng.gen_range(-0.04..0.04)
        } else {
            0.0
        };

        // Transformer thermal response: relax toward ambient plus a
        // load-square rise (substations only carry the sensor).
        let temperature_c = match self.descriptor.kind {
            NodeKind::Distribution => None,
            _ => {
                let load_pu = if capacity > 0.0 { power_mw / capacity } else { 0.0 };
                let steady = 35.0 + 45.0 * load_pu * load_pu;
                self.temperature_c += (steady - self.temperature_c) * (dt_s / 180.0).min(1.0);
                Some(self.temperature_c)
            }
        };

        if let Some(temp) = temperature_c {
            if temp > THERMAL_TRIP_C && self.energised() {
                warn!(node = %self.descriptor.node_id, temp_c = temp, "thermal trip");
                if let Some(event) = self.set_breaker(MAIN_BREAKER, BreakerState::Tripped, "protection_trip") {
                    events.push(event);
                }
                events.push(RtuEvent::Alarm {
                    code: "THERMAL_TRIP".to_string(),
                    severity: "critical".to_string(),
                    message: format!("transformer hot-spot {temp:.1} °C exceeded trip threshold"),
                    details: serde_json::json!({ "temperature_c": temp }),
                    timestamp: Utc::now(),
                });
            }
        }

        if energised {
            self.energy_mwh += power_mw * dt_s / 3600.0;
        }

        let mut reading = Reading {
            voltage_kv,
            current_a,
            active_power_mw: power_mw,
            reactive_power_mvar: reactive_mvar,
            power_factor,
            frequency_hz,
            temperature_c,
        };
        if self.fault_next_sample {
            self.fault_next_sample = false;
            reading.voltage_kv = f64::NAN;
        }

        let quality = self.screen(&mut reading);
        (reading, quality, events)
    }

    /// Cumulative energy delivered in MWh.
    pub fn energy_mwh(&self) -> f64 {
        self.energy_mwh
    }

    /// Most recent good reading, served to protocol clients between ticks.
    pub fn last_reading(&self) -> Option<Reading> {
        self.last_good
    }

    /// Replace non-finite values with the last good reading and mark the
    /// sample `Suspect`.
    fn screen(&mut self, reading: &mut Reading) -> Quality {
        let finite = reading.voltage_kv.is_finite()
            && reading.current_a.is_finite()
            && reading.active_power_mw.is_finite()
            && reading.reactive_power_mvar.is_finite()
            && reading.power_factor.is_finite()
            && reading.frequency_hz.is_finite()
            && reading.temperature_c.map_or(true, f64::is_finite);
        if finite {
            self.last_good = Some(*reading);
            return Quality::Good;
        }
        warn!(node = %self.descriptor.node_id, "non-finite measurement; holding last good value");
        if let Some(good) = self.last_good {
            *reading = good;
        } else {
            *reading = Reading {
                voltage_kv: 0.0,
                current_a: 0.0,
                active_power_mw: 0.0,
                reactive_power_mvar: 0.0,
                power_factor: 1.0,
                frequency_hz: 50.0,
                temperature_c: None,
            };
        }
        Quality::Suspect
    }
}
