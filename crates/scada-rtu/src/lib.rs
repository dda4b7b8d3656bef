//! ---
//! scada_section: "04-rtu-runtime"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Per-node RTU runtime: simulation, protocol listeners, control channel."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! The per-node RTU service: local electrical simulation, 1 Hz telemetry
//! sampling, Modbus/IEC-104 listeners with connection classification, and the
//! persistent control channel to the master.

pub mod connections;
pub mod control;
pub mod electrical;
pub mod iec104;
pub mod modbus;
pub mod outbound;
pub mod rest;
pub mod runtime;
pub mod sampler;

pub use connections::ConnectionTracker;
pub use electrical::ElectricalSim;
pub use outbound::OutboundQueue;
pub use runtime::{RtuHandle, RtuRuntime};
