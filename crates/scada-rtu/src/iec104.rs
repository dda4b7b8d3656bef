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

use scada_proto::{ConnectionProtocol, Frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::runtime::RtuShared;

const START_BYTE: u8 = 0x68;

const U_STARTDT_ACT: u8 = 0x07;
const U_STARTDT_CON: u8 = 0x0B;
const U_STOPDT_ACT: u8 = 0x13;
const U_STOPDT_CON: u8 = 0x23;
const U_TESTFR_ACT: u8 = 0x43;
const U_TESTFR_CON: u8 = 0x83;

/// Spawn the IEC 60870-5-104 listener.
///
/// Only the APCI layer is implemented: STARTDT/STOPDT/TESTFR activations are
/// confirmed and I/S-frames are accepted and counted. The master cares about
/// accept/close reports and the authorised/unknown classification, not ASDU
/// content.
pub async fn spawn_iec104(
    listen: SocketAddr,
    shared: RtuShared,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(listen).await?;
    let local_addr = listener.local_addr()?;
    info!(node = %shared.node_id(), address = %local_addr, "iec104 listener started");

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let Ok((stream, peer)) = accepted else { continue };
                    let shared = shared.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        serve_client(stream, peer, shared, shutdown).await;
                    });
                }
            }
        }
    });

    Ok((local_addr, task))
}

async fn serve_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    shared: RtuShared,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some((conn_id, record)) = shared.tracker.open(
        &peer.ip().to_string(),
        peer.port(),
        ConnectionProtocol::Iec104,
    ) else {
        return;
    };
    shared.outbound.push(Frame::ConnectionReport(record));

    let mut head = [0u8; 2];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            read = stream.read_exact(&mut head) => {
                if read.is_err() {
                    break;
                }
                if head[0] != START_BYTE {
                    warn!(node = %shared.node_id(), peer = %peer, "bad iec104 start byte");
                    break;
                }
                let length = head[1] as usize;
                if !(4..=253).contains(&length) {
                    warn!(node = %shared.node_id(), peer = %peer, length, "bad iec104 apdu length");
                    break;
                }
                let mut apdu = vec![0u8; length];
                if stream.read_exact(&mut apdu).await.is_err() {
                    break;
                }
                shared.tracker.touch(conn_id, 1, (2 + length) as u64, 0);

                let control = apdu[0];
                let reply = if control & 0x03 == 0x03 {
                    // U-frame: confirm activations.
                    match control {
                        U_STARTDT_ACT => Some(U_STARTDT_CON),
                        U_STOPDT_ACT => Some(U_STOPDT_CON),
                        U_TESTFR_ACT => Some(U_TESTFR_CON),
                        _ => None,
                    }
                } else {
                    // I- and S-frames are accepted without ASDU processing.
                    None
                };

                if let Some(control) = reply {
                    let frame = [START_BYTE, 4, control, 0, 0, 0];
                    if stream.write_all(&frame).await.is_err() {
                        break;
                    }
                    shared.tracker.touch(conn_id, 0, 0, frame.len() as u64);
                }
            }
        }
    }

    if let Some(record) = shared.tracker.close(conn_id) {
        shared.outbound.push(Frame::ConnectionReport(record));
    }
    debug!(node = %shared.node_id(), peer = %peer, "iec104 client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::shared_for;
    use scada_proto::ConnectionStatus;

    #[tokio::test]
    async fn startdt_is_confirmed_and_connection_reported() {
        let shared = shared_for("GEN-001", &[]);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (addr, _task) = spawn_iec104("127.0.0.1:0".parse().unwrap(), shared.clone(), shutdown_rx)
            .await
            .unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&[START_BYTE, 4, U_STARTDT_ACT, 0, 0, 0])
            .await
            .unwrap();
        let mut reply = [0u8; 6];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[2], U_STARTDT_CON);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let report = shared.outbound.try_pop().unwrap();
        match report {
            Frame::ConnectionReport(record) => {
                assert_eq!(record.protocol, ConnectionProtocol::Iec104);
                assert_eq!(record.status, ConnectionStatus::Unknown);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn testfr_keepalive_is_answered() {
        let shared = shared_for("GEN-001", &[("127.0.0.1", "IEC104")]);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (addr, _task) = spawn_iec104("127.0.0.1:0".parse().unwrap(), shared, shutdown_rx)
            .await
            .unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&[START_BYTE, 4, U_TESTFR_ACT, 0, 0, 0])
            .await
            .unwrap();
        let mut reply = [0u8; 6];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[2], U_TESTFR_CON);
    }
}
