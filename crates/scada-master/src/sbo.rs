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
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use scada_common::config::ControlConfig;
use scada_common::{ErrorKind, ServiceError};
use scada_proto::{BreakerAction, BreakerState, Command, CommandOutcome, LinkState};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::alarms::AlarmEngine;
use crate::audit::{AuditLog, AuditResult};
use crate::link::LinkManager;
use crate::registry::NodeRegistry;

/// SBO session lifecycle state. `Armed` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SboState {
    /// Selected and inside the arming window.
    Armed,
    /// Operate was dispatched (successfully or not).
    Operated,
    /// Cancelled by the operator.
    Cancelled,
    /// Arming window elapsed without an operate.
    Expired,
}

/// One select-before-operate session.
#[derive(Debug, Clone, Serialize)]
pub struct SboSession {
    /// Session identifier returned by `select`.
    pub session_id: Uuid,
    /// Operator that armed the session; only they may operate it.
    pub operator_id: String,
    /// Target node.
    pub node_id: String,
    /// Target breaker.
    pub breaker_id: String,
    /// Requested action.
    pub action: BreakerAction,
    /// Stated reason.
    pub reason: String,
    /// Lifecycle state.
    pub state: SboState,
    /// Arm timestamp.
    pub armed_at: DateTime<Utc>,
    /// Arming deadline (`armed_at` + window).
    pub deadline: DateTime<Utc>,
    /// Outcome (`Success`/`Failure`) once operated.
    pub result: Option<String>,
    /// RTU round trip in milliseconds once operated.
    pub response_time_ms: Option<u64>,
}

impl SboSession {
    /// Seconds remaining inside the arming window.
    pub fn time_remaining_s(&self) -> f64 {
        let remaining = (self.deadline - Utc::now()).num_milliseconds() as f64 / 1000.0;
        remaining.max(0.0)
    }
}

/// Outcome returned by a successful `operate`.
#[derive(Debug, Clone, Serialize)]
pub struct OperateOutcome {
    /// `Success` or `Failure` as reported by the RTU path.
    pub result: String,
    /// Breaker state after the command, when known.
    pub new_breaker_state: Option<BreakerState>,
    /// Round trip in milliseconds.
    pub response_time_ms: u64,
}

struct Tables {
    sessions: HashMap<Uuid, SboSession>,
    armed: HashMap<(String, String), Uuid>,
}

/// The control coordinator: two-phase select/operate with single-armed-
/// selection per `(node_id, breaker_id)`, operator binding, a bounded
/// operate round trip, and a one-second expiry sweeper.
pub struct SboCoordinator {
    tables: Mutex<Tables>,
    registry: Arc<NodeRegistry>,
    links: Arc<LinkManager>,
    alarms: Arc<AlarmEngine>,
    audit: Arc<AuditLog>,
    config: ControlConfig,
    metrics: Option<scada_metrics::MasterMetrics>,
}

impl SboCoordinator {
    /// Wire the coordinator.
    pub fn new(
        registry: Arc<NodeRegistry>,
        links: Arc<LinkManager>,
        alarms: Arc<AlarmEngine>,
        audit: Arc<AuditLog>,
        config: ControlConfig,
        metrics: Option<scada_metrics::MasterMetrics>,
    ) -> Self {
        Self {
            tables: Mutex::new(Tables {
                sessions: HashMap::new(),
                armed: HashMap::new(),
            }),
            registry,
            links,
            alarms,
            audit,
            config,
            metrics,
        }
    }

    /// Phase one: arm a session.
    pub fn select(
        &self,
        node_id: &str,
        breaker_id: &str,
        action: BreakerAction,
        operator_id: &str,
        reason: &str,
        client_ip: &str,
    ) -> Result<SboSession, ServiceError> {
        let resource = format!("{node_id}/{breaker_id}");

        let outcome = self.select_inner(node_id, breaker_id, action, operator_id, reason);
        let (result, metadata) = match &outcome {
            Ok(session) => (
                AuditResult::Success,
                serde_json::json!({
                    "session_id": session.session_id,
                    "action": action,
                    "reason": reason,
                }),
            ),
            Err(err) => (
                AuditResult::Failure,
                serde_json::json!({ "error": err.message, "action": action }),
            ),
        };
        self.audit.record(
            operator_id,
            "sbo.select",
            "breaker",
            &resource,
            result,
            client_ip,
            metadata,
        );
        outcome
    }

    fn select_inner(
        &self,
        node_id: &str,
        breaker_id: &str,
        action: BreakerAction,
        operator_id: &str,
        reason: &str,
    ) -> Result<SboSession, ServiceError> {
        match self.registry.link_state(node_id) {
            None => return Err(ServiceError::validation(format!("unknown node {node_id}"))),
            Some(LinkState::Connected) => {}
            Some(state) => {
                return Err(ServiceError::unavailable(format!(
                    "node {node_id} is {state:?}"
                )))
            }
        }

        let key = (node_id.to_string(), breaker_id.to_string());
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.armed.get(&key) {
            // A stale armed entry may simply not have been swept yet.
            let still_armed = tables
                .sessions
                .get(existing)
                .map(|s| s.state == SboState::Armed && s.deadline > Utc::now())
                .unwrap_or(false);
            if still_armed {
                return Err(ServiceError::conflict(format!(
                    "breaker {breaker_id} on {node_id} already has an armed session"
                )));
            }
            tables.armed.remove(&key);
        }

        let armed_at = Utc::now();
        let session = SboSession {
            session_id: Uuid::new_v4(),
            operator_id: operator_id.to_string(),
            node_id: node_id.to_string(),
            breaker_id: breaker_id.to_string(),
            action,
            reason: reason.to_string(),
            state: SboState::Armed,
            armed_at,
            deadline: armed_at
                + chrono::Duration::from_std(self.config.arming_window)
                    .unwrap_or_else(|_| chrono::Duration::seconds(10)),
            result: None,
            response_time_ms: None,
        };
        tables.armed.insert(key, session.session_id);
        tables.sessions.insert(session.session_id, session.clone());
        info!(
            session = %session.session_id,
            node = node_id,
            breaker = breaker_id,
            operator = operator_id,
            ?action,
            "sbo session armed"
        );
        Ok(session)
    }

    /// Phase two: dispatch the operate for an armed session.
    ///
    /// The RTU receives at most one `SboOperate` per session: the session
    /// leaves `Armed` under the table lock before anything is sent, so a
    /// duplicate or racing operate is rejected locally and never forwarded.
    pub async fn operate(
        &self,
        session_id: Uuid,
        operator_id: &str,
        client_ip: &str,
    ) -> Result<OperateOutcome, ServiceError> {
        let prepared = self.prepare_operate(session_id, operator_id);
        let (node_id, breaker_id, action) = match prepared {
            Ok(target) => target,
            Err(err) => {
                self.audit.record(
                    operator_id,
                    "sbo.operate",
                    "breaker",
                    &session_id.to_string(),
                    AuditResult::Failure,
                    client_ip,
                    serde_json::json!({ "error": err.message }),
                );
                return Err(err);
            }
        };
        let resource = format!("{node_id}/{breaker_id}");

        let reply = self
            .links
            .send_command(
                &node_id,
                Command::SboOperate {
                    breaker_id: breaker_id.clone(),
                    action,
                },
                self.config.command_timeout,
            )
            .await;

        let outcome = match reply {
            Ok(reply) if reply.result == CommandOutcome::Success => OperateOutcome {
                result: "Success".to_string(),
                new_breaker_state: reply.new_state,
                response_time_ms: reply.response_time_ms,
            },
            Ok(reply) => {
                warn!(session = %session_id, message = %reply.message, "rtu refused operate");
                OperateOutcome {
                    result: "Failure".to_string(),
                    new_breaker_state: reply.new_state,
                    response_time_ms: reply.response_time_ms,
                }
            }
            Err(err) => {
                warn!(session = %session_id, error = %err, "operate dispatch failed");
                self.finish_operate(session_id, "Failure", None);
                self.alarms.raise_external(
                    &node_id,
                    "CONTROL_FAILURE",
                    "warning",
                    &format!("breaker operate failed: {}", err.message),
                    serde_json::json!({ "session_id": session_id, "breaker_id": breaker_id }),
                );
                self.audit.record(
                    operator_id,
                    "sbo.operate",
                    "breaker",
                    &resource,
                    AuditResult::Failure,
                    client_ip,
                    serde_json::json!({ "session_id": session_id, "error": err.message }),
                );
                if let Some(metrics) = &self.metrics {
                    metrics.inc_sbo("failure");
                }
                return Err(err);
            }
        };

        self.finish_operate(session_id, &outcome.result, Some(outcome.response_time_ms));
        let audit_result = if outcome.result == "Success" {
            AuditResult::Success
        } else {
            AuditResult::Failure
        };
        if outcome.result != "Success" {
            self.alarms.raise_external(
                &node_id,
                "CONTROL_FAILURE",
                "warning",
                "rtu reported breaker operate failure",
                serde_json::json!({ "session_id": session_id, "breaker_id": breaker_id }),
            );
        }
        self.audit.record(
            operator_id,
            "sbo.operate",
            "breaker",
            &resource,
            audit_result,
            client_ip,
            serde_json::json!({
                "session_id": session_id,
                "result": outcome.result,
                "response_time_ms": outcome.response_time_ms,
            }),
        );
        if let Some(metrics) = &self.metrics {
            metrics.inc_sbo(if outcome.result == "Success" {
                "success"
            } else {
                "failure"
            });
        }
        Ok(outcome)
    }

    fn prepare_operate(
        &self,
        session_id: Uuid,
        operator_id: &str,
    ) -> Result<(String, String, BreakerAction), ServiceError> {
        let mut tables = self.tables.lock();
        let Some(session) = tables.sessions.get_mut(&session_id) else {
            return Err(ServiceError::conflict("no such session"));
        };
        match session.state {
            SboState::Armed => {}
            SboState::Expired => return Err(ServiceError::conflict("session expired")),
            state => {
                return Err(ServiceError::conflict(format!(
                    "session is {state:?}, not Armed"
                )))
            }
        }
        if Utc::now() > session.deadline {
            session.state = SboState::Expired;
            let key = (session.node_id.clone(), session.breaker_id.clone());
            tables.armed.remove(&key);
            return Err(ServiceError::conflict("session expired"));
        }
        if session.operator_id != operator_id {
            return Err(ServiceError::conflict(
                "session was armed by a different operator",
            ));
        }

        session.state = SboState::Operated;
        let target = (
            session.node_id.clone(),
            session.breaker_id.clone(),
            session.action,
        );
        let key = (session.node_id.clone(), session.breaker_id.clone());
        tables.armed.remove(&key);
        Ok(target)
    }

    fn finish_operate(&self, session_id: Uuid, result: &str, response_time_ms: Option<u64>) {
        let mut tables = self.tables.lock();
        if let Some(session) = tables.sessions.get_mut(&session_id) {
            session.result = Some(result.to_string());
            session.response_time_ms = response_time_ms;
        }
    }

    /// Cancel an armed session. No-op in terminal states.
    pub fn cancel(
        &self,
        session_id: Uuid,
        operator_id: &str,
        client_ip: &str,
    ) -> Result<(), ServiceError> {
        let cancelled = {
            let mut tables = self.tables.lock();
            let Some(session) = tables.sessions.get_mut(&session_id) else {
                return Err(ServiceError::conflict("no such session"));
            };
            if session.state == SboState::Armed {
                session.state = SboState::Cancelled;
                let key = (session.node_id.clone(), session.breaker_id.clone());
                tables.armed.remove(&key);
                true
            } else {
                false
            }
        };
        if cancelled {
            info!(session = %session_id, operator = operator_id, "sbo session cancelled");
            self.audit.record(
                operator_id,
                "sbo.cancel",
                "breaker",
                &session_id.to_string(),
                AuditResult::Success,
                client_ip,
                serde_json::json!({}),
            );
            if let Some(metrics) = &self.metrics {
                metrics.inc_sbo("cancelled");
            }
        }
        Ok(())
    }

    /// Session lookup.
    pub fn session(&self, session_id: Uuid) -> Option<SboSession> {
        self.tables.lock().sessions.get(&session_id).cloned()
    }

    /// Expire any armed session past its deadline. Called by the sweeper.
    pub fn sweep(&self) {
        let expired: Vec<SboSession> = {
            let mut tables = self.tables.lock();
            let now = Utc::now();
            let expired_ids: Vec<Uuid> = tables
                .sessions
                .values()
                .filter(|s| s.state == SboState::Armed && now > s.deadline)
                .map(|s| s.session_id)
                .collect();
            expired_ids
                .into_iter()
                .filter_map(|id| {
                    let session = tables.sessions.get_mut(&id)?;
                    session.state = SboState::Expired;
                    let key = (session.node_id.clone(), session.breaker_id.clone());
                    let snapshot = session.clone();
                    tables.armed.remove(&key);
                    Some(snapshot)
                })
                .collect()
        };

        for session in expired {
            info!(session = %session.session_id, node = %session.node_id, "sbo session expired");
            self.audit.record(
                &session.operator_id,
                "sbo.expire",
                "breaker",
                &format!("{}/{}", session.node_id, session.breaker_id),
                AuditResult::Failure,
                "-",
                serde_json::json!({ "session_id": session.session_id }),
            );
            if let Some(metrics) = &self.metrics {
                metrics.inc_sbo("expired");
            }
        }
    }

    /// Periodic sweeper driver (1 s cadence).
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.sweep(),
            }
        }
    }
}
