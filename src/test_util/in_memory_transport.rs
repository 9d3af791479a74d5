use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::transport::error::TransportError;
use crate::transport::message_store::MessageStore;
use crate::transport::tag::Tag;
use crate::transport::Transport;

/// Delivers messages between [InMemoryTransport]s without fragmentation or sockets. Delivery is
///  immediate and reliable unless a node is muted.
#[derive(Default)]
pub struct InMemoryNetwork {
    nodes: Mutex<FxHashMap<IpAddr, Arc<MessageStore>>>,
    muted: Mutex<FxHashSet<IpAddr>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<InMemoryNetwork> {
        Default::default()
    }

    /// Registers a node with the given address, replacing any previous node with that address.
    pub fn transport(self: &Arc<Self>, addr: IpAddr) -> InMemoryTransport {
        let message_store = Arc::new(MessageStore::new());
        self.nodes.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, message_store.clone());

        InMemoryTransport {
            addr,
            network: self.clone(),
            message_store,
        }
    }

    /// Messages sent by a muted node are silently dropped.
    pub fn mute(&self, addr: IpAddr) {
        self.muted.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr);
    }

    fn deliver(&self, from: IpAddr, to: IpAddr, data: &[u8], tag: Tag) -> bool {
        if self.muted.lock().unwrap_or_else(PoisonError::into_inner).contains(&from) {
            return true;
        }

        let receiver = self.nodes.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&to)
            .cloned();
        match receiver {
            Some(message_store) => {
                message_store.put(from, tag, Bytes::copy_from_slice(data));
                true
            }
            None => false,
        }
    }
}

pub struct InMemoryTransport {
    addr: IpAddr,
    network: Arc<InMemoryNetwork>,
    message_store: Arc<MessageStore>,
}

impl InMemoryTransport {
    pub fn addr(&self) -> IpAddr {
        self.addr
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, to: IpAddr, data: &[u8], tag: Tag) -> Result<bool, TransportError> {
        Ok(self.network.deliver(self.addr, to, data, tag))
    }

    fn get(&self, from: IpAddr, tag: Tag) -> Option<Bytes> {
        self.message_store.take(from, tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    const C: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3));

    #[tokio::test]
    async fn test_delivery() {
        let network = InMemoryNetwork::new();
        let a = network.transport(A);
        let b = network.transport(B);
        assert_eq!(a.addr(), A);

        assert!(a.send(B, b"abc", Tag(*b"tag1")).await.unwrap());
        assert_eq!(b.get(A, Tag(*b"tag1")), Some(Bytes::from_static(b"abc")));
        assert_eq!(b.get(A, Tag(*b"tag1")), None);
        assert_eq!(a.get(B, Tag(*b"tag1")), None);

        assert!(!a.send(C, b"abc", Tag(*b"tag1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_mute() {
        let network = InMemoryNetwork::new();
        let a = network.transport(A);
        let b = network.transport(B);
        network.mute(A);

        assert!(a.send(B, b"abc", Tag(*b"tag1")).await.unwrap());
        assert_eq!(b.get(A, Tag(*b"tag1")), None);

        assert!(b.send(A, b"xyz", Tag(*b"tag1")).await.unwrap());
        assert_eq!(a.get(B, Tag(*b"tag1")), Some(Bytes::from_static(b"xyz")));
    }
}
