//! ---
//! scada_section: "02-control-channel-data-model"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Shared data model and control-channel framing."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! The data model shared between master and RTUs, plus the length-prefixed
//! JSON framing used on the persistent control channel.

pub mod codec;
pub mod frames;
pub mod model;

/// Schema version broadcast in every `Hello` frame.
pub const SCHEMA_VERSION: u16 = 1;

pub use codec::{read_frame, write_frame, CodecError, MAX_FRAME_BYTES};
pub use frames::{
    BreakerAction, Command, CommandFrame, CommandOutcome, Frame, ReplyFrame, RtuEvent,
};
pub use model::{
    BreakerState, ConnectionProtocol, ConnectionRecord, ConnectionStatus, LinkState,
    NodeDescriptor, NodeKind, Quality, TelemetrySample,
};
