//! ---
//! scada_section: "01-core-functionality"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Shared primitives for the SCADA master and RTU runtimes."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Shared configuration, logging bootstrap, error taxonomy, and backoff
//! helpers used by every service in the workspace.

pub mod backoff;
pub mod config;
pub mod error;
pub mod logging;

pub use backoff::Backoff;
pub use config::{MasterConfig, NodeEntry, NodeKindConfig, RtuConfig};
pub use error::{ErrorKind, ServiceError};
pub use logging::init_tracing;
