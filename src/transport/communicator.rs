use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::config::{Protocol, TransportConfig};
use crate::transport::error::TransportError;
use crate::transport::fragmenter::Fragmenter;
use crate::transport::receiver::ReceivePath;
use crate::transport::tag::Tag;
use crate::transport::tcp::TcpEndpoint;
use crate::transport::{udp, ReceiveCallback, Transport};

#[derive(Clone)]
enum Endpoint {
    Udp(Arc<UdpSocket>),
    Tcp(Arc<TcpEndpoint>),
}

/// A transport endpoint for a single node: it is bound to the listen port when it is opened,
///  receives in a background task between [Communicator::listen] and
///  [Communicator::stop_listening], and sends until it is closed.
///
/// For UDP, the listening socket is used for sending as well. For TCP, there is at most one
///  connection per peer IP, and it is used in both directions.
pub struct Communicator {
    config: Arc<TransportConfig>,
    fragmenter: Fragmenter,
    receive_path: Arc<ReceivePath>,
    endpoint: Mutex<Option<Endpoint>>,
    cancel_sender: broadcast::Sender<()>,
    listen_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Communicator {
    pub async fn open(config: TransportConfig) -> anyhow::Result<Communicator> {
        config.validate()?;
        let config = Arc::new(config);

        let receive_path = Arc::new(ReceivePath::new(config.reassembly_timeout));
        let endpoint = match config.protocol {
            Protocol::Udp => {
                let socket = UdpSocket::bind(config.listen_addr()).await?;
                info!("bound UDP socket to {:?}", socket.local_addr()?);
                Endpoint::Udp(Arc::new(socket))
            }
            Protocol::Tcp => {
                Endpoint::Tcp(Arc::new(TcpEndpoint::bind(config.clone(), receive_path.clone()).await?))
            }
        };

        let (cancel_sender, _) = broadcast::channel(1);

        Ok(Communicator {
            fragmenter: Fragmenter::new(config.mtu),
            config,
            receive_path,
            endpoint: Mutex::new(Some(endpoint)),
            cancel_sender,
            listen_handle: Default::default(),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.endpoint.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn is_listening(&self) -> bool {
        self.listen_handle.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        match self.endpoint()? {
            Endpoint::Udp(socket) => Ok(socket.local_addr()?),
            Endpoint::Tcp(tcp) => Ok(tcp.local_addr()?),
        }
    }

    /// Replaces a previously registered callback.
    pub fn register_receive_callback(&self, callback: Arc<dyn ReceiveCallback>) {
        self.receive_path.set_callback(callback);
    }

    /// Starts receiving in a background task. Calling this while already listening has no effect.
    pub fn listen(&self) -> Result<(), TransportError> {
        // the endpoint is looked up while holding the handle lock: `close` takes the endpoint
        //  before it takes the handle, so it either sees the new handle or this fails
        let mut listen_handle = self.listen_handle.lock()
            .unwrap_or_else(PoisonError::into_inner);
        let endpoint = self.endpoint()?;

        if listen_handle.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("already listening");
            return Ok(());
        }

        // subscribe before spawning so a cancel sent right after this call is not missed
        let cancel_receiver = self.cancel_sender.subscribe();
        let handle = match endpoint {
            Endpoint::Udp(socket) => tokio::spawn(udp::recv_loop(socket, self.receive_path.clone(), cancel_receiver)),
            Endpoint::Tcp(tcp) => tokio::spawn(tcp.accept_loop(cancel_receiver)),
        };
        *listen_handle = Some(handle);
        Ok(())
    }

    /// Stops the receive task and waits for it to terminate. For TCP, this closes all open
    ///  connections as well: they are re-established on the next send.
    pub async fn stop_listening(&self) {
        self.stop_receive_loop().await;

        if let Ok(Endpoint::Tcp(tcp)) = self.endpoint() {
            tcp.shut_down_connections().await;
        }
    }

    /// Stops listening and releases the socket(s). Messages that were received before remain
    ///  available through [Transport::get].
    pub async fn close(&self) -> Result<(), TransportError> {
        let endpoint = self.endpoint.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::AlreadyClosed)?;

        self.stop_receive_loop().await;
        if let Endpoint::Tcp(tcp) = endpoint {
            tcp.shut_down_connections().await;
        }

        info!("transport closed");
        Ok(())
    }

    async fn stop_receive_loop(&self) {
        let handle = self.listen_handle.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if self.cancel_sender.send(()).is_err() {
                debug!("receive loop terminated before it was canceled");
            }
            if let Err(e) = handle.await {
                warn!("receive loop terminated abnormally: {}", e);
            }
        }
    }

    fn endpoint(&self) -> Result<Endpoint, TransportError> {
        self.endpoint.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::TransportClosed)
    }

    /// Number of open TCP connections, always 0 for UDP.
    pub fn num_connections(&self) -> usize {
        match self.endpoint() {
            Ok(Endpoint::Tcp(tcp)) => tcp.num_connections(),
            _ => 0,
        }
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        // receive loops hold their own references to the sockets
        let _ = self.cancel_sender.send(());
    }
}

#[async_trait]
impl Transport for Communicator {
    /// Splits `data` into packets and sends them to `<to>:<send port>`.
    async fn send(&self, to: IpAddr, data: &[u8], tag: Tag) -> Result<bool, TransportError> {
        let endpoint = self.endpoint()?;
        let packets = self.fragmenter.fragment(data, tag)?;
        debug!(?to, ?tag, "sending message of {} bytes in {} packets", data.len(), packets.len());

        let sent = match endpoint {
            Endpoint::Udp(socket) => udp::send_packets(&socket, self.config.send_addr(to), &packets).await,
            Endpoint::Tcp(tcp) => tcp.send_packets(to, &packets).await,
        };
        Ok(sent)
    }

    fn get(&self, from: IpAddr, tag: Tag) -> Option<Bytes> {
        self.receive_path.message_store().take(from, tag)
    }
}
