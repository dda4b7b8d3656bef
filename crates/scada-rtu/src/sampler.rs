//! ---
//! scada_section: "04-rtu-runtime"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Per-node RTU runtime: simulation, protocol listeners, control channel."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use scada_proto::{BreakerState, Frame, TelemetrySample};
use tokio::sync::watch;
use tracing::debug;

use crate::electrical::{ElectricalSim, MAIN_BREAKER};
use crate::outbound::OutboundQueue;

/// Take one sample from the simulation, assigning the next sequence number.
///
/// Sequence numbers restart at zero with the process; the master tolerates
/// the reset after a handshake.
pub fn sample_once(
    sim: &Mutex<ElectricalSim>,
    sequence: &AtomicU64,
    dt_s: f64,
) -> (TelemetrySample, Vec<Frame>) {
    let mut sim = sim.lock();
    let (reading, quality, events) = sim.tick(dt_s);
    let breaker_state = sim.breaker(MAIN_BREAKER).unwrap_or(BreakerState::Open);
    let sample = TelemetrySample {
        node_id: sim.descriptor().node_id.clone(),
        sequence: sequence.fetch_add(1, Ordering::Relaxed),
        timestamp: Utc::now(),
        voltage_kv: Some(reading.voltage_kv),
        current_a: Some(reading.current_a),
        active_power_mw: Some(reading.active_power_mw),
        reactive_power_mvar: Some(reading.reactive_power_mvar),
        power_factor: Some(reading.power_factor),
        frequency_hz: Some(reading.frequency_hz),
        temperature_c: reading.temperature_c,
        breaker_state,
        energy_delivered_mwh: Some(sim.energy_mwh()),
        quality,
    };
    let event_frames = events.into_iter().map(Frame::Event).collect();
    (sample, event_frames)
}

/// Periodic sampling task. Every tick pushes one `Telemetry` frame plus any
/// protection events onto the outbound queue, whether or not the master is
/// currently connected.
pub async fn run_sampler(
    sim: Arc<Mutex<ElectricalSim>>,
    outbound: OutboundQueue,
    sequence: Arc<AtomicU64>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let dt_s = interval.as_secs_f64();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let (sample, events) = sample_once(&sim, &sequence, dt_s);
                debug!(node = %sample.node_id, sequence = sample.sequence, "sample taken");
                outbound.push(Frame::Telemetry(sample));
                for event in events {
                    outbound.push(event);
                }
            }
        }
    }
}
