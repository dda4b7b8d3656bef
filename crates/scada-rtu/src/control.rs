//! ---
//! scada_section: "04-rtu-runtime"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Per-node RTU runtime: simulation, protocol listeners, control channel."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use scada_proto::{
    read_frame, write_frame, Command, CommandFrame, CommandOutcome, ConnectionProtocol, Frame,
    ReplyFrame,
};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::runtime::RtuShared;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Spawn the control-channel listener.
///
/// Exactly one master link is active at a time: when a second channel is
/// offered the older one is closed as superseded, so a restarted master can
/// always take over without waiting for the dead link to time out.
pub async fn spawn_control(
    listen: SocketAddr,
    shared: RtuShared,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(listen).await?;
    let local_addr = listener.local_addr()?;
    info!(node = %shared.node_id(), address = %local_addr, "control channel listening");

    let active: Arc<Mutex<Option<watch::Sender<bool>>>> = Arc::new(Mutex::new(None));

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let Ok((stream, peer)) = accepted else { continue };
                    let (supersede_tx, supersede_rx) = watch::channel(false);
                    if let Some(previous) = active.lock().replace(supersede_tx) {
                        info!(node = %shared.node_id(), "superseding active control channel");
                        let _ = previous.send(true);
                    }
                    let shared = shared.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        serve_master(stream, peer, shared, supersede_rx, shutdown).await;
                    });
                }
            }
        }
    });

    Ok((local_addr, task))
}

async fn serve_master(
    stream: TcpStream,
    peer: SocketAddr,
    shared: RtuShared,
    mut supersede: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let conn = shared.tracker.open(
        &peer.ip().to_string(),
        peer.port(),
        ConnectionProtocol::WebSocket,
    );
    let Some((conn_id, record)) = conn else {
        return;
    };
    shared.outbound.push(Frame::ConnectionReport(record));

    let (read_half, mut write_half) = stream.into_split();

    // Handshake: identity and current state first, then the buffered backlog
    // drains through the normal writer path with original timestamps intact.
    let (hello, snapshot) = {
        let sim = shared.sim.lock();
        (
            Frame::hello(
                sim.descriptor().clone(),
                sim.breaker_states(),
                shared.sequence.load(std::sync::atomic::Ordering::Relaxed),
            ),
            Frame::Snapshot {
                latest: None,
                breaker_states: sim.breaker_states(),
            },
        )
    };
    if write_frame(&mut write_half, &hello).await.is_err()
        || write_frame(&mut write_half, &snapshot).await.is_err()
    {
        finish(&shared, conn_id);
        return;
    }
    info!(node = %shared.node_id(), peer = %peer, backlog = shared.outbound.len(), "master link established");

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Frame>(32);
    let reader = tokio::spawn(read_loop(read_half, inbound_tx));

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = supersede.changed() => {
                debug!(node = %shared.node_id(), "control channel superseded");
                break;
            }
            frame = shared.outbound.pop() => {
                if write_frame(&mut write_half, &frame).await.is_err() {
                    // Put nothing back: the sample is in the master's past
                    // now; newer ones are still queued behind it.
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if write_frame(&mut write_half, &Frame::heartbeat()).await.is_err() {
                    break;
                }
            }
            inbound = inbound_rx.recv() => {
                let Some(frame) = inbound else { break };
                match frame {
                    Frame::Command(command) => {
                        let (reply, events) = execute(&shared, command);
                        for event in events {
                            shared.outbound.push(event);
                        }
                        if write_frame(&mut write_half, &Frame::Reply(reply)).await.is_err() {
                            break;
                        }
                    }
                    Frame::Heartbeat { .. } => {}
                    other => {
                        warn!(node = %shared.node_id(), kind = other.kind(), "unexpected frame from master");
                    }
                }
            }
        }
    }

    reader.abort();
    finish(&shared, conn_id);
    info!(node = %shared.node_id(), peer = %peer, "master link closed");
}

async fn read_loop(mut read_half: OwnedReadHalf, tx: mpsc::Sender<Frame>) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(frame) => {
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

fn finish(shared: &RtuShared, conn_id: u64) {
    if let Some(record) = shared.tracker.close(conn_id) {
        shared.outbound.push(Frame::ConnectionReport(record));
    }
}

/// Execute a master command against local state.
fn execute(shared: &RtuShared, frame: CommandFrame) -> (ReplyFrame, Vec<Frame>) {
    let started = Instant::now();
    let mut events = Vec::new();
    let (result, new_state, message) = match frame.command {
        Command::SboOperate { breaker_id, action } => {
            let mut sim = shared.sim.lock();
            match sim.breaker(&breaker_id) {
                None => (
                    CommandOutcome::Failure,
                    None,
                    format!("unknown breaker {breaker_id}"),
                ),
                Some(_) => {
                    let target = action.target_state();
                    if let Some(event) = sim.set_breaker(&breaker_id, target, "sbo_operate") {
                        events.push(Frame::Event(event));
                    }
                    (CommandOutcome::Success, sim.breaker(&breaker_id), String::new())
                }
            }
        }
        Command::Isolate => {
            let mut sim = shared.sim.lock();
            for event in sim.isolate("isolate_command") {
                events.push(Frame::Event(event));
            }
            (CommandOutcome::Success, None, String::new())
        }
        Command::Block { client_ip } => {
            shared.tracker.block(&client_ip);
            (CommandOutcome::Success, None, String::new())
        }
        Command::Ping => (CommandOutcome::Success, None, String::new()),
    };
    let reply = ReplyFrame {
        request_id: frame.request_id,
        result,
        new_state,
        response_time_ms: started.elapsed().as_millis() as u64,
        message,
    };
    (reply, events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::electrical::MAIN_BREAKER;
    use crate::runtime::test_support::shared_for;
    use crate::sampler::sample_once;
    use scada_proto::{BreakerAction, BreakerState};

    async fn connect_and_handshake(addr: SocketAddr) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let hello = read_frame(&mut stream).await.unwrap();
        assert_eq!(hello.kind(), "hello");
        let snapshot = read_frame(&mut stream).await.unwrap();
        assert_eq!(snapshot.kind(), "snapshot");
        stream
    }

    #[tokio::test]
    async fn handshake_then_telemetry_then_command_reply() {
        let shared = shared_for("SUB-001", &[("127.0.0.1", "*")]);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (addr, _task) = spawn_control("127.0.0.1:0".parse().unwrap(), shared.clone(), shutdown_rx)
            .await
            .unwrap();

        let mut master = connect_and_handshake(addr).await;

        // Connection report for the link itself arrives ahead of data;
        // heartbeats may interleave anywhere.
        loop {
            let frame = read_frame(&mut master).await.unwrap();
            match frame.kind() {
                "connection_report" => break,
                "heartbeat" => continue,
                other => panic!("unexpected frame kind {other}"),
            }
        }

        // A queued sample drains to the master.
        let (sample, _) = sample_once(&shared.sim, &shared.sequence, 1.0);
        shared.outbound.push(Frame::Telemetry(sample.clone()));
        loop {
            match read_frame(&mut master).await.unwrap() {
                Frame::Telemetry(received) => {
                    assert_eq!(received.sequence, sample.sequence);
                    break;
                }
                Frame::Heartbeat { .. } => continue,
                other => panic!("unexpected frame {other:?}"),
            }
        }

        // Operate command flips the breaker and is answered with its id.
        let command = CommandFrame::new(Command::SboOperate {
            breaker_id: MAIN_BREAKER.to_string(),
            action: BreakerAction::Open,
        });
        write_frame(&mut master, &Frame::Command(command.clone()))
            .await
            .unwrap();
        loop {
            match read_frame(&mut master).await.unwrap() {
                Frame::Reply(reply) => {
                    assert_eq!(reply.request_id, command.request_id);
                    assert_eq!(reply.result, CommandOutcome::Success);
                    assert_eq!(reply.new_state, Some(BreakerState::Open));
                    break;
                }
                // Breaker-change events may interleave ahead of the reply.
                other => assert_ne!(other.kind(), "hello"),
            }
        }
    }

    #[tokio::test]
    async fn second_channel_supersedes_the_first() {
        let shared = shared_for("SUB-002", &[("127.0.0.1", "*")]);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (addr, _task) = spawn_control("127.0.0.1:0".parse().unwrap(), shared.clone(), shutdown_rx)
            .await
            .unwrap();

        let mut first = connect_and_handshake(addr).await;
        let _second = connect_and_handshake(addr).await;

        // The first link is closed; reads eventually fail.
        let deadline = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if read_frame(&mut first).await.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(deadline.is_ok(), "first channel was not superseded");
    }

    #[tokio::test]
    async fn offline_backlog_drains_on_reconnect_in_order() {
        let shared = shared_for("DIST-001", &[("127.0.0.1", "*")]);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (addr, _task) = spawn_control("127.0.0.1:0".parse().unwrap(), shared.clone(), shutdown_rx)
            .await
            .unwrap();

        // Queue a backlog before the master dials in.
        let backlog: Vec<_> = (0..3)
            .map(|_| {
                let (sample, _) = sample_once(&shared.sim, &shared.sequence, 1.0);
                sample
            })
            .collect();
        for sample in &backlog {
            shared.outbound.push(Frame::Telemetry(sample.clone()));
        }

        let mut master = connect_and_handshake(addr).await;
        let mut received = Vec::new();
        while received.len() < 3 {
            match read_frame(&mut master).await.unwrap() {
                Frame::Telemetry(sample) => received.push(sample.sequence),
                _ => continue,
            }
        }
        let expected_tail: Vec<u64> = backlog.iter().map(|s| s.sequence).collect();
        assert_eq!(received, expected_tail);
    }
}
