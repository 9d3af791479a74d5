//! Message transport between peers that are identified by their IP address.
//!
//! A message is an arbitrary byte sequence sent under a 4-byte [tag::Tag]. It is split into
//!  packets that each fit into a single datagram of the configured MTU, sent over UDP or TCP,
//!  and reassembled on the receiving side. Completed messages are kept per `(sender, tag)` until
//!  application code takes them.

pub mod communicator;
pub mod config;
pub mod error;
pub mod fragmenter;
pub mod message_store;
pub mod packet_header;
pub mod reassembly;
pub mod tag;

mod receiver;
mod tcp;
mod udp;

use std::net::IpAddr;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::transport::error::TransportError;
use crate::transport::tag::Tag;

/// The send / receive surface that consensus code works against, so it can run against an
///  in-memory network in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Returns `Ok(true)` if all packets of the message were handed to the network. This says
    ///  nothing about delivery. Network failures are logged and reported as `Ok(false)` - it is
    ///  up to the application protocol to deal with incomplete messages.
    ///
    /// Errors are contract violations like sending on a closed transport or a payload that is
    ///  too large to be fragmented. Retrying does not help with those.
    async fn send(&self, to: IpAddr, data: &[u8], tag: Tag) -> Result<bool, TransportError>;

    /// Removes and returns the message received from `from` under `tag`, if there is one.
    fn get(&self, from: IpAddr, tag: Tag) -> Option<Bytes>;
}

/// Invoked on the receive task for every completed message, after it was put into the message
///  store. Implementations should return quickly since they delay processing of subsequent
///  packets.
pub trait ReceiveCallback: Send + Sync + 'static {
    fn on_message(&self, from: IpAddr, tag: Tag, message: &[u8]);
}

impl <F> ReceiveCallback for F
where F: Fn(IpAddr, Tag, &[u8]) + Send + Sync + 'static
{
    fn on_message(&self, from: IpAddr, tag: Tag, message: &[u8]) {
        self(from, tag, message)
    }
}
