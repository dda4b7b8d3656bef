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

use scada_proto::{BreakerState, ConnectionProtocol, Frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::electrical::MAIN_BREAKER;
use crate::runtime::RtuShared;

const FC_READ_COILS: u8 = 0x01;
const FC_READ_HOLDING: u8 = 0x03;
const FC_READ_INPUT: u8 = 0x04;
const FC_WRITE_COIL: u8 = 0x05;

const EX_ILLEGAL_FUNCTION: u8 = 0x01;
const EX_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Coil 0 drives the main incomer breaker.
const BREAKER_COIL: u16 = 0;

/// Spawn the Modbus TCP listener. Fidelity is deliberately shallow: enough of
/// the protocol to serve register reads, gate the breaker coil write on
/// authorisation, and report every accept/close on the control channel.
pub async fn spawn_modbus(
    listen: SocketAddr,
    shared: RtuShared,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(listen).await?;
    let local_addr = listener.local_addr()?;
    info!(node = %shared.node_id(), address = %local_addr, "modbus listener started");

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
    let Some((conn_id, record)) =
        shared
            .tracker
            .open(&peer.ip().to_string(), peer.port(), ConnectionProtocol::Modbus)
    else {
        return;
    };
    shared.outbound.push(Frame::ConnectionReport(record));

    let mut header = [0u8; 7];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            read = stream.read_exact(&mut header) => {
                if read.is_err() {
                    break;
                }
                let tid = u16::from_be_bytes([header[0], header[1]]);
                let pid = u16::from_be_bytes([header[2], header[3]]);
                let length = u16::from_be_bytes([header[4], header[5]]) as usize;
                let uid = header[6];
                if length == 0 || length > 260 {
                    warn!(node = %shared.node_id(), peer = %peer, length, "malformed modbus header");
                    break;
                }
                let mut pdu = vec![0u8; length - 1];
                if stream.read_exact(&mut pdu).await.is_err() {
                    break;
                }
                shared.tracker.touch(conn_id, 1, (7 + pdu.len()) as u64, 0);

                let response_pdu = handle_pdu(&pdu, conn_id, &shared);
                let mut response = Vec::with_capacity(7 + response_pdu.len());
                response.extend_from_slice(&tid.to_be_bytes());
                response.extend_from_slice(&pid.to_be_bytes());
                response.extend_from_slice(&((response_pdu.len() + 1) as u16).to_be_bytes());
                response.push(uid);
                response.extend_from_slice(&response_pdu);
                if stream.write_all(&response).await.is_err() {
                    break;
                }
                shared.tracker.touch(conn_id, 0, 0, response.len() as u64);
            }
        }
    }

    if let Some(record) = shared.tracker.close(conn_id) {
        shared.outbound.push(Frame::ConnectionReport(record));
    }
    debug!(node = %shared.node_id(), peer = %peer, "modbus client disconnected");
}

fn exception(function: u8, code: u8) -> Vec<u8> {
    vec![function | 0x80, code]
}

fn handle_pdu(pdu: &[u8], conn_id: u64, shared: &RtuShared) -> Vec<u8> {
    if pdu.is_empty() {
        return exception(0, EX_ILLEGAL_FUNCTION);
    }
    let function = pdu[0];
    match function {
        FC_READ_COILS if pdu.len() >= 5 => {
            let count = u16::from_be_bytes([pdu[3], pdu[4]]);
            if count == 0 || count > 2000 {
                return exception(function, EX_ILLEGAL_DATA_VALUE);
            }
            let closed = shared.sim.lock().breaker(MAIN_BREAKER) == Some(BreakerState::Closed);
            let byte_count = count.div_ceil(8) as u8;
            let mut body = vec![function, byte_count];
            let mut bits = vec![0u8; byte_count as usize];
            if closed {
                bits[0] |= 1;
            }
            body.extend_from_slice(&bits);
            body
        }
        FC_READ_HOLDING | FC_READ_INPUT if pdu.len() >= 5 => {
            let address = u16::from_be_bytes([pdu[1], pdu[2]]);
            let count = u16::from_be_bytes([pdu[3], pdu[4]]);
            if count == 0 || count > 125 {
                return exception(function, EX_ILLEGAL_DATA_VALUE);
            }
            let image = register_image(shared);
            let mut body = vec![function, (count * 2) as u8];
            for offset in 0..count as usize {
                let value = image
                    .get(address as usize + offset)
                    .copied()
                    .unwrap_or(0);
                body.extend_from_slice(&value.to_be_bytes());
            }
            body
        }
        FC_WRITE_COIL if pdu.len() >= 5 => {
            let address = u16::from_be_bytes([pdu[1], pdu[2]]);
            let value = u16::from_be_bytes([pdu[3], pdu[4]]);
            if address != BREAKER_COIL {
                return exception(function, EX_ILLEGAL_DATA_VALUE);
            }
            if !shared.tracker.is_authorised(conn_id) {
                warn!(node = %shared.node_id(), "rejected breaker write from unknown modbus client");
                return exception(function, EX_ILLEGAL_FUNCTION);
            }
            let target = if value == 0xFF00 {
                BreakerState::Closed
            } else {
                BreakerState::Open
            };
            let event = shared
                .sim
                .lock()
                .set_breaker(MAIN_BREAKER, target, "modbus_command");
            if let Some(event) = event {
                shared.outbound.push(Frame::Event(event));
            }
            pdu.to_vec()
        }
        _ => exception(function, EX_ILLEGAL_FUNCTION),
    }
}

/// Telemetry scaled into a flat 16-bit register image:
/// `0` voltage (0.1 kV), `1` current (A), `2` active power (0.1 MW),
/// `3` reactive power (0.1 MVAr), `4` power factor (0.01), `5` frequency
/// (0.01 Hz), `6` temperature (0.1 °C, zero when absent), `7` breaker state.
fn register_image(shared: &RtuShared) -> Vec<u16> {
    let sim = shared.sim.lock();
    let closed = sim.breaker(MAIN_BREAKER) == Some(BreakerState::Closed);
    let Some(reading) = sim.last_reading() else {
        return vec![0, 0, 0, 0, 0, 0, 0, u16::from(closed)];
    };
    let scale = |value: f64, factor: f64| -> u16 {
        (value * factor).round().clamp(0.0, f64::from(u16::MAX)) as u16
    };
    vec![
        scale(reading.voltage_kv, 10.0),
        scale(reading.current_a, 1.0),
        scale(reading.active_power_mw, 10.0),
        scale(reading.reactive_power_mvar, 10.0),
        scale(reading.power_factor, 100.0),
        scale(reading.frequency_hz, 100.0),
        scale(reading.temperature_c.unwrap_or(0.0), 10.0),
        u16::from(closed),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::shared_for;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn read_request(function: u8, address: u16, count: u16) -> Vec<u8> {
        let mut frame = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, function];
        frame.extend_from_slice(&address.to_be_bytes());
        frame.extend_from_slice(&count.to_be_bytes());
        frame
    }

    async fn roundtrip(stream: &mut TcpStream, request: &[u8]) -> Vec<u8> {
        stream.write_all(request).await.unwrap();
        let mut header = [0u8; 7];
        stream.read_exact(&mut header).await.unwrap();
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut pdu = vec![0u8; length - 1];
        stream.read_exact(&mut pdu).await.unwrap();
        pdu
    }

    #[tokio::test]
    async fn serves_register_reads_and_reports_connections() {
        // Loopback is on the allow-list for this tracker.
        let shared = shared_for("SUB-001", &[("127.0.0.1", "*")]);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (addr, _task) = spawn_modbus("127.0.0.1:0".parse().unwrap(), shared.clone(), shutdown_rx)
            .await
            .unwrap();

        // Prime a reading so registers are non-zero.
        let _ = shared.sim.lock().tick(1.0);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let pdu = roundtrip(&mut stream, &read_request(FC_READ_INPUT, 0, 8)).await;
        assert_eq!(pdu[0], FC_READ_INPUT);
        assert_eq!(pdu[1], 16);
        let voltage = u16::from_be_bytes([pdu[2], pdu[3]]);
        assert!(voltage > 3900, "voltage register was {voltage}");

        drop(stream);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let kinds: Vec<&str> = std::iter::from_fn(|| shared.outbound.try_pop())
            .map(|frame| frame.kind())
            .collect();
        assert!(kinds.iter().filter(|k| **k == "connection_report").count() >= 2);
    }

    #[tokio::test]
    async fn unknown_client_cannot_write_the_breaker_coil() {
        // Empty allow-list: loopback classifies Unknown.
        let shared = shared_for("SUB-001", &[]);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (addr, _task) = spawn_modbus("127.0.0.1:0".parse().unwrap(), shared.clone(), shutdown_rx)
            .await
            .unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut request = vec![0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, FC_WRITE_COIL];
        request.extend_from_slice(&BREAKER_COIL.to_be_bytes());
        request.extend_from_slice(&0x0000u16.to_be_bytes());
        let pdu = roundtrip(&mut stream, &request).await;
        assert_eq!(pdu[0], FC_WRITE_COIL | 0x80);
        assert_eq!(pdu[1], EX_ILLEGAL_FUNCTION);
        assert_eq!(
            shared.sim.lock().breaker(MAIN_BREAKER),
            Some(BreakerState::Closed)
        );
    }

    #[tokio::test]
    async fn authorised_client_operates_the_breaker() {
        let shared = shared_for("SUB-001", &[("127.0.0.1", "Modbus")]);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (addr, _task) = spawn_modbus("127.0.0.1:0".parse().unwrap(), shared.clone(), shutdown_rx)
            .await
            .unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut request = vec![0x00, 0x03, 0x00, 0x00, 0x00, 0x06, 0x01, FC_WRITE_COIL];
        request.extend_from_slice(&BREAKER_COIL.to_be_bytes());
        request.extend_from_slice(&0x0000u16.to_be_bytes());
        let pdu = roundtrip(&mut stream, &request).await;
        assert_eq!(pdu[0], FC_WRITE_COIL);
        assert_eq!(
            shared.sim.lock().breaker(MAIN_BREAKER),
            Some(BreakerState::Open)
        );
    }
}
