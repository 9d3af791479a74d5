use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::transport::receiver::ReceivePath;

/// Large enough for any UDP payload, independent of the configured MTU - peers may be
///  configured differently.
const MAX_DATAGRAM_LEN: usize = 65536;

pub(crate) async fn recv_loop(socket: Arc<UdpSocket>, receive_path: Arc<ReceivePath>, mut cancel_receiver: broadcast::Receiver<()>) {
    info!(addr = ?socket.local_addr().ok(), "starting UDP receive loop");

    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        select! {
            r = socket.recv_from(&mut buf) => {
                match r {
                    Ok((len, from)) => {
                        trace!(?from, "received datagram of {} bytes", len);
                        receive_path.on_packet(from.ip(), Bytes::copy_from_slice(&buf[..len]));
                    }
                    Err(e) => {
                        // e.g. ICMP 'port unreachable' for an earlier send on some platforms
                        error!(error = ?e, "error receiving from datagram socket");
                    }
                }
            }
            _ = cancel_receiver.recv() => break,
        }
    }

    info!("UDP receive loop stopped");
}

/// Sends all packets, continuing after failures. Returns `false` if any packet failed.
pub(crate) async fn send_packets(socket: &UdpSocket, to: SocketAddr, packets: &[Bytes]) -> bool {
    let mut all_sent = true;
    for packet in packets {
        match socket.send_to(packet, to).await {
            Ok(n) if n == packet.len() => {}
            Ok(n) => {
                debug!(?to, "sent only {} of {} bytes of a packet", n, packet.len());
                all_sent = false;
            }
            Err(e) => {
                warn!(?to, "error sending packet: {}", e);
                all_sent = false;
            }
        }
    }
    all_sent
}
