use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::select;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, trace, warn};

use crate::transport::config::TransportConfig;
use crate::transport::error::TransportError;
use crate::transport::receiver::ReceivePath;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// An open connection to a peer, in either direction. Packets are written as frames: a u32 BE
///  length prefix followed by the packet (header and payload fragment).
struct TcpConnection {
    id: u64,
    peer_addr: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

/// Open connections by peer IP. There is at most one entry per peer, and it is used for
///  sending regardless of which side opened it.
#[derive(Default)]
struct ConnectionTable {
    connections: Mutex<FxHashMap<IpAddr, Arc<TcpConnection>>>,
}

impl ConnectionTable {
    fn get(&self, peer: IpAddr) -> Option<Arc<TcpConnection>> {
        self.connections.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&peer)
            .cloned()
    }

    fn insert(&self, connection: Arc<TcpConnection>) {
        let prev = self.connections.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection.peer_addr.ip(), connection);
        if let Some(prev) = prev {
            debug!(peer = ?prev.peer_addr, "replacing existing connection");
        }
    }

    /// removes the entry only if it is still the given connection - a newer connection to
    ///  the same peer may have replaced it
    fn remove(&self, peer: IpAddr, connection_id: u64) {
        let mut connections = self.connections.lock()
            .unwrap_or_else(PoisonError::into_inner);
        if connections.get(&peer).map(|c| c.id) == Some(connection_id) {
            connections.remove(&peer);
        }
    }

    fn clear(&self) {
        self.connections.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn len(&self) -> usize {
        self.connections.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

pub(crate) struct TcpEndpoint {
    config: Arc<TransportConfig>,
    listener: TcpListener,
    connections: Arc<ConnectionTable>,
    readers: Mutex<JoinSet<()>>,
    next_connection_id: AtomicU64,
    receive_path: Arc<ReceivePath>,
}

impl TcpEndpoint {
    pub async fn bind(config: Arc<TransportConfig>, receive_path: Arc<ReceivePath>) -> Result<TcpEndpoint, TransportError> {
        let listen_addr = config.listen_addr();
        let socket = if listen_addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.set_reuseaddr(true)?;
        socket.bind(listen_addr)?;
        let listener = socket.listen(config.tcp_backlog)?;
        info!("bound TCP listener to {:?}", listener.local_addr()?);

        Ok(TcpEndpoint {
            config,
            listener,
            connections: Default::default(),
            readers: Default::default(),
            next_connection_id: AtomicU64::new(0),
            receive_path,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn num_connections(&self) -> usize {
        self.connections.len()
    }

    pub async fn accept_loop(self: Arc<Self>, mut cancel_receiver: broadcast::Receiver<()>) {
        info!("starting TCP accept loop");

        loop {
            select! {
                r = self.listener.accept() => {
                    match r {
                        Ok((stream, peer_addr)) => {
                            debug!(?peer_addr, "accepted connection");
                            self.register_connection(stream, peer_addr);
                        }
                        Err(e) => {
                            warn!(error = ?e, "error accepting connection");
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }

        info!("TCP accept loop stopped");
    }

    /// Sends all packets over the connection to `to`, opening one if there is none yet. A write
    ///  error closes the connection and aborts the remaining packets - the stream is broken at
    ///  that point.
    pub async fn send_packets(&self, to: IpAddr, packets: &[Bytes]) -> bool {
        let connection = match self.connection_to(to).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(?to, "could not connect: {}", e);
                return false;
            }
        };

        let mut writer = connection.writer.lock().await;
        for packet in packets {
            if let Err(e) = write_frame(&mut *writer, packet).await {
                warn!(peer = ?connection.peer_addr, "error writing to connection - closing it: {}", e);
                self.connections.remove(to, connection.id);
                return false;
            }
        }
        trace!(peer = ?connection.peer_addr, "sent {} frames", packets.len());
        true
    }

    /// Closes all connections and waits for their reader tasks to terminate.
    pub async fn shut_down_connections(&self) {
        self.connections.clear();

        let mut readers = std::mem::take(&mut *self.readers.lock()
            .unwrap_or_else(PoisonError::into_inner));
        readers.shutdown().await;
        debug!("all TCP connections closed");
    }

    async fn connection_to(&self, peer: IpAddr) -> io::Result<Arc<TcpConnection>> {
        if let Some(connection) = self.connections.get(peer) {
            return Ok(connection);
        }

        let peer_addr = self.config.send_addr(peer);
        let stream = self.connect(peer_addr).await?;
        debug!(?peer_addr, "opened connection");

        // a connection may have been accepted or opened concurrently - the first one wins
        if let Some(connection) = self.connections.get(peer) {
            return Ok(connection);
        }
        Ok(self.register_connection(stream, peer_addr))
    }

    async fn connect(&self, peer_addr: SocketAddr) -> io::Result<TcpStream> {
        if self.config.bind_ip.is_unspecified() {
            return TcpStream::connect(peer_addr).await;
        }

        let socket = if peer_addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.bind(SocketAddr::new(self.config.bind_ip, 0))?;
        socket.connect(peer_addr).await
    }

    fn register_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Arc<TcpConnection> {
        let (reader, writer) = stream.into_split();

        let connection = Arc::new(TcpConnection {
            id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            writer: tokio::sync::Mutex::new(writer),
        });
        self.connections.insert(connection.clone());

        let mut readers = self.readers.lock()
            .unwrap_or_else(PoisonError::into_inner);
        while readers.try_join_next().is_some() {}
        readers.spawn(
            read_loop(
                reader,
                peer_addr,
                connection.id,
                self.config.max_frame_len,
                self.receive_path.clone(),
                self.connections.clone(),
            )
        );

        connection
    }
}

#[instrument(name = "tcp_connection", skip_all, fields(peer = ?peer_addr))]
async fn read_loop(
    mut reader: OwnedReadHalf,
    peer_addr: SocketAddr,
    connection_id: u64,
    max_frame_len: u32,
    receive_path: Arc<ReceivePath>,
    connections: Arc<ConnectionTable>,
) {
    loop {
        match read_frame(&mut reader, max_frame_len).await {
            Ok(Some(packet)) => receive_path.on_packet(peer_addr.ip(), packet),
            Ok(None) => {
                debug!("connection closed by peer");
                break;
            }
            Err(e) => {
                warn!("connection broke: {}", e);
                break;
            }
        }
    }

    connections.remove(peer_addr.ip(), connection_id);
}

/// Reads one length-prefixed frame. Returns `None` if the stream ends cleanly at a frame
///  boundary, and `ConnectionClosed` if it ends inside a frame.
pub(crate) async fn read_frame(reader: &mut (impl AsyncRead + Unpin), max_frame_len: u32) -> Result<Option<Bytes>, TransportError> {
    let mut len_buf = [0u8; 4];
    let num_read = reader.read(&mut len_buf).await?;
    if num_read == 0 {
        return Ok(None);
    }
    read_exact_or_closed(reader, &mut len_buf[num_read..]).await?;

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_len {
        return Err(TransportError::PayloadTooLarge { len: frame_len.safe_cast(), max: max_frame_len.safe_cast() });
    }

    let mut frame = vec![0u8; frame_len.safe_cast()];
    read_exact_or_closed(reader, &mut frame).await?;
    Ok(Some(Bytes::from(frame)))
}

async fn read_exact_or_closed(reader: &mut (impl AsyncRead + Unpin), buf: &mut [u8]) -> Result<(), TransportError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TransportError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn write_frame(writer: &mut (impl AsyncWrite + Unpin), packet: &[u8]) -> io::Result<()> {
    let frame_len: u32 = packet.len().prechecked_cast();
    writer.write_all(&frame_len.to_be_bytes()).await?;
    writer.write_all(packet).await
}
