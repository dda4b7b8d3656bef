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

use parking_lot::{Mutex, RwLock};
use scada_common::{ErrorKind, ServiceError};
use scada_proto::{Command, CommandFrame, ReplyFrame};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// Outbound command path to one connected RTU. The supervisor's writer task
/// drains `command_rx`; the reader task resolves replies by correlation id.
pub struct NodeLink {
    command_tx: mpsc::Sender<CommandFrame>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<ReplyFrame>>>,
}

impl NodeLink {
    /// Create a link and hand back the receiver for the writer task.
    pub fn new(depth: usize) -> (Arc<Self>, mpsc::Receiver<CommandFrame>) {
        let (command_tx, command_rx) = mpsc::channel(depth);
        (
            Arc::new(Self {
                command_tx,
                pending: Mutex::new(HashMap::new()),
            }),
            command_rx,
        )
    }

    /// Resolve a reply against its waiting caller. Unmatched replies are
    /// logged and dropped (the caller has already timed out).
    pub fn resolve(&self, reply: ReplyFrame) {
        match self.pending.lock().remove(&reply.request_id) {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => debug!(request_id = %reply.request_id, "reply with no waiter"),
        }
    }

    /// Fail every outstanding request (link lost).
    pub fn abort_pending(&self) {
        self.pending.lock().clear();
    }
}

/// Registry of live node links, the master side of every control channel.
#[derive(Default)]
pub struct LinkManager {
    links: RwLock<HashMap<String, Arc<NodeLink>>>,
}

impl LinkManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the link for a node (called on successful handshake).
    pub fn register(&self, node_id: &str, link: Arc<NodeLink>) {
        self.links.write().insert(node_id.to_string(), link);
    }

    /// Remove a node's link (called on disconnect).
    pub fn unregister(&self, node_id: &str) {
        if let Some(link) = self.links.write().remove(node_id) {
            link.abort_pending();
        }
    }

    /// Link for a node, if connected.
    pub fn get(&self, node_id: &str) -> Option<Arc<NodeLink>> {
        self.links.read().get(node_id).cloned()
    }

    /// Whether a node currently has a live link.
    pub fn is_connected(&self, node_id: &str) -> bool {
        self.links.read().contains_key(node_id)
    }

    /// Send one command and await the correlated reply within `timeout`.
    pub async fn send_command(
        &self,
        node_id: &str,
        command: Command,
        timeout: Duration,
    ) -> Result<ReplyFrame, ServiceError> {
        let Some(link) = self.get(node_id) else {
            return Err(ServiceError::unavailable(format!(
                "control channel to {node_id} is down"
            )));
        };

        let frame = CommandFrame::new(command);
        let request_id = frame.request_id;
        let (reply_tx, reply_rx) = oneshot::channel();
        link.pending.lock().insert(request_id, reply_tx);

        if link.command_tx.send(frame).await.is_err() {
            link.pending.lock().remove(&request_id);
            return Err(ServiceError::unavailable(format!(
                "control channel to {node_id} closed"
            )));
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                link.pending.lock().remove(&request_id);
                Err(ServiceError::unavailable(format!(
                    "control channel to {node_id} dropped mid-request"
                )))
            }
            Err(_) => {
                link.pending.lock().remove(&request_id);
                warn!(node = node_id, %request_id, "command timed out");
                Err(ServiceError::new(
                    ErrorKind::Timeout,
                    format!("{node_id} did not reply within {timeout:?}"),
                ))
            }
        }
    }

    /// Fire a command at every connected node, best effort, without waiting.
    pub fn broadcast_command(&self, command: Command) {
        let nodes: Vec<String> = self.links.read().keys().cloned().collect();
        for node_id in nodes {
            let command = command.clone();
            let link = self.get(&node_id);
            if let Some(link) = link {
                let frame = CommandFrame::new(command);
                if link.command_tx.try_send(frame).is_err() {
                    warn!(node = %node_id, "broadcast command dropped: writer queue full");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scada_proto::CommandOutcome;

    #[tokio::test]
    async fn command_resolves_with_matching_reply() {
        let manager = LinkManager::new();
        let (link, mut command_rx) = NodeLink::new(8);
        manager.register("SUB-001", link.clone());

        let responder = tokio::spawn(async move {
            let frame = command_rx.recv().await.unwrap();
            link.resolve(ReplyFrame {
                request_id: frame.request_id,
                result: CommandOutcome::Success,
                new_state: None,
                response_time_ms: 5,
                message: String::new(),
            });
        });

        let reply = manager
            .send_command("SUB-001", Command::Ping, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.result, CommandOutcome::Success);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn missing_link_is_unavailable() {
        let manager = LinkManager::new();
        let err = manager
            .send_command("GEN-001", Command::Ping, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn silent_rtu_times_out() {
        let manager = LinkManager::new();
        let (link, _command_rx) = NodeLink::new(8);
        manager.register("GEN-001", link);

        let err = manager
            .send_command("GEN-001", Command::Ping, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn unregister_aborts_pending_requests() {
        let manager = LinkManager::new();
        let (link, _command_rx) = NodeLink::new(8);
        manager.register("GEN-002", link);

        let send = manager.send_command("GEN-002", Command::Ping, Duration::from_secs(5));
        let unregister = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            manager.unregister("GEN-002");
        };
        let (result, ()) = tokio::join!(send, unregister);
        assert_eq!(result.unwrap_err().kind, ErrorKind::Unavailable);
    }
}
