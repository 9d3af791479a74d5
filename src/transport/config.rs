use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use anyhow::bail;

use crate::transport::error::TransportError;
use crate::transport::fragmenter::{Fragmenter, DEFAULT_MTU, IP_UDP_ALLOWANCE};
use crate::transport::packet_header::PacketHeader;
use crate::transport::reassembly::DEFAULT_REASSEMBLY_TIMEOUT;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Protocol {
    /// connectionless, one datagram per packet
    Udp,
    /// connection oriented, one length-prefixed frame per packet
    Tcp,
}

impl FromStr for Protocol {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(Protocol::Udp),
            "TCP" => Ok(Protocol::Tcp),
            _ => Err(TransportError::InvalidProtocol(s.to_string())),
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Tcp => write!(f, "TCP"),
        }
    }
}

/// Checks that a port number from untyped configuration fits into a u16.
pub fn check_port(port: i64) -> Result<u16, TransportError> {
    u16::try_from(port)
        .map_err(|_| TransportError::InvalidPort(port))
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub protocol: Protocol,

    /// The local address that sockets are bound to. Outbound TCP connections are bound to it as
    ///  well, so peers see this address as the sender when it is not the unspecified address.
    pub bind_ip: IpAddr,

    pub listen_port: u16,

    /// The port that peers listen on: all packets are sent to `<peer ip>:<send_port>`
    pub send_port: u16,

    /// Path MTU that packets are sized for. The default of 576 is the minimum every IPv4 host
    ///  must support, so it is safe without path MTU discovery - at the cost of more packets
    ///  per message.
    pub mtu: usize,

    /// Upper bound for a single TCP frame. A peer sending a longer frame is considered broken
    ///  and its connection is closed.
    pub max_frame_len: u32,

    /// Number of not-yet-accepted TCP connections before the OS refuses new ones
    pub tcp_backlog: u32,

    /// Incomplete messages are discarded if no fragment arrived for this long
    pub reassembly_timeout: Duration,
}

impl TransportConfig {
    pub fn new(protocol: Protocol, listen_port: i64, send_port: Option<i64>) -> Result<TransportConfig, TransportError> {
        let listen_port = check_port(listen_port)?;
        let send_port = match send_port {
            Some(p) => check_port(p)?,
            None => listen_port,
        };

        Ok(TransportConfig {
            protocol,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port,
            send_port,
            mtu: DEFAULT_MTU,
            max_frame_len: 64 * 1024,
            tcp_backlog: 3,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.listen_port)
    }

    pub fn send_addr(&self, peer: IpAddr) -> SocketAddr {
        SocketAddr::new(peer, self.send_port)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if Fragmenter::max_chunk_len_for_mtu(self.mtu) == 0 {
            bail!("MTU of {} leaves no room for payload: {} bytes are reserved for IP / UDP headers and {} for the packet header", self.mtu, IP_UDP_ALLOWANCE, PacketHeader::SERIALIZED_LEN);
        }
        if (self.max_frame_len as usize) < self.mtu {
            bail!("max frame length {} is smaller than the MTU {} - regular packets would be rejected", self.max_frame_len, self.mtu);
        }
        if self.tcp_backlog == 0 {
            bail!("TCP backlog must be positive");
        }
        if self.reassembly_timeout.is_zero() {
            bail!("reassembly timeout must be positive");
        }
        Ok(())
    }
}
