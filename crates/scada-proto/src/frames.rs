//! ---
//! scada_section: "02-control-channel-data-model"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Shared data model and control-channel framing."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::model::{BreakerState, ConnectionRecord, NodeDescriptor, TelemetrySample};
use crate::SCHEMA_VERSION;

/// Frames exchanged on the persistent control channel (§ wire contract).
///
/// `Hello`, `Snapshot`, `Telemetry`, `Event`, `ConnectionReport` and `Reply`
/// travel RTU→master; `Command` travels master→RTU; `Heartbeat` travels both
/// ways. Unknown kinds are rejected at the boundary by serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Frame {
    /// First frame after accept: node identity plus current state.
    Hello {
        /// Protocol schema version spoken by the RTU.
        schema_version: u16,
        /// Static node description.
        descriptor: NodeDescriptor,
        /// Breaker states keyed by breaker id.
        breaker_states: BTreeMap<String, BreakerState>,
        /// Next telemetry sequence number the RTU will emit.
        next_sequence: u64,
    },
    /// Full state sent on request after a reconnect.
    Snapshot {
        /// Latest sample, if one has been taken.
        latest: Option<TelemetrySample>,
        /// Breaker states keyed by breaker id.
        breaker_states: BTreeMap<String, BreakerState>,
    },
    /// Periodic telemetry push.
    Telemetry(TelemetrySample),
    /// Asynchronous event (breaker change, locally decided alarm).
    Event(RtuEvent),
    /// Report of an inbound protocol client accept or close.
    ConnectionReport(ConnectionRecord),
    /// Command issued by the master.
    Command(CommandFrame),
    /// Reply to a command, correlated by `request_id`.
    Reply(ReplyFrame),
    /// Liveness signal.
    Heartbeat {
        /// Sender timestamp.
        timestamp: DateTime<Utc>,
    },
}

impl Frame {
    /// Build a `Hello` frame with the current schema version.
    pub fn hello(
        descriptor: NodeDescriptor,
        breaker_states: BTreeMap<String, BreakerState>,
        next_sequence: u64,
    ) -> Self {
        Frame::Hello {
            schema_version: SCHEMA_VERSION,
            descriptor,
            breaker_states,
            next_sequence,
        }
    }

    /// Build a heartbeat stamped now.
    pub fn heartbeat() -> Self {
        Frame::Heartbeat {
            timestamp: Utc::now(),
        }
    }

    /// Frame kind as a static string, for logging and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Snapshot { .. } => "snapshot",
            Frame::Telemetry(_) => "telemetry",
            Frame::Event(_) => "event",
            Frame::ConnectionReport(_) => "connection_report",
            Frame::Command(_) => "command",
            Frame::Reply(_) => "reply",
            Frame::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Events an RTU pushes outside the sampling cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RtuEvent {
    /// A breaker changed state.
    BreakerChanged {
        /// Breaker identifier within the node.
        breaker_id: String,
        /// New state.
        state: BreakerState,
        /// Cause (`command`, `protection_trip`, `isolate`, ...).
        reason: String,
        /// When the transition happened.
        timestamp: DateTime<Utc>,
    },
    /// An alarm condition decided locally on the RTU.
    Alarm {
        /// Alarm code, e.g. `THERMAL_TRIP`.
        code: String,
        /// Severity name understood by the master's alarm engine.
        severity: String,
        /// Human readable description.
        message: String,
        /// Structured context.
        #[serde(default)]
        details: JsonValue,
        /// When the condition was detected.
        timestamp: DateTime<Utc>,
    },
}

/// Requested direction of a breaker operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerAction {
    /// Open the breaker.
    Open,
    /// Close the breaker.
    Close,
}

impl BreakerAction {
    /// Breaker state resulting from this action.
    pub fn target_state(self) -> BreakerState {
        match self {
            BreakerAction::Open => BreakerState::Open,
            BreakerAction::Close => BreakerState::Closed,
        }
    }
}

/// Commands the master may issue to an RTU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Execute the operate phase of an armed SBO session.
    SboOperate {
        /// Target breaker.
        breaker_id: String,
        /// Direction to drive it.
        action: BreakerAction,
    },
    /// Open every breaker owned by the node.
    Isolate,
    /// Refuse further connections from the address.
    Block {
        /// Address to refuse.
        client_ip: String,
    },
    /// Round-trip liveness probe.
    Ping,
}

/// Command envelope carrying the correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    /// Correlation id echoed in the reply.
    pub request_id: Uuid,
    /// The command itself.
    pub command: Command,
}

impl CommandFrame {
    /// Wrap a command with a fresh correlation id.
    pub fn new(command: Command) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            command,
        }
    }
}

/// Result of a command execution on the RTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    /// Executed as requested.
    Success,
    /// Refused or failed locally.
    Failure,
}

/// Reply to a [`CommandFrame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyFrame {
    /// Correlation id of the command being answered.
    pub request_id: Uuid,
    /// Outcome.
    pub result: CommandOutcome,
    /// Breaker state after the command, where applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_state: Option<BreakerState>,
    /// Local execution time in milliseconds.
    pub response_time_ms: u64,
    /// Failure explanation, empty on success.
    #[serde(default)]
    pub message: String,
}
