use bytes::{BufMut, Bytes, BytesMut};

use crate::transport::error::TransportError;
use crate::transport::packet_header::PacketHeader;
use crate::transport::tag::Tag;
use crate::util::safe_converter::PrecheckedCast;

/// The smallest MTU every IPv4 host must accept (RFC 791). Path MTU discovery is not attempted,
///  so this is the conservative default.
pub const DEFAULT_MTU: usize = 576;

/// Room left for IP and UDP headers: up to 60 bytes of IP header (RFC 791) plus 8 bytes of UDP
///  header (RFC 768).
pub const IP_UDP_ALLOWANCE: usize = 68;

/// Sequence numbers are u16, so a message can have at most this many packets.
pub const MAX_PACKETS_PER_MESSAGE: usize = u16::MAX as usize + 1;

/// Splits payloads into MTU-sized packets, each prefixed with a [PacketHeader].
///
/// All packets but the last carry exactly `max_chunk_len` payload bytes, the last one carries
///  the remainder. An empty payload is sent as a single header-only packet.
#[derive(Clone, Debug)]
pub struct Fragmenter {
    max_chunk_len: usize,
}

impl Fragmenter {
    /// `mtu` must leave room for payload after IP / UDP headers and the packet header - this is
    ///  checked by [crate::transport::config::TransportConfig::validate].
    pub fn new(mtu: usize) -> Fragmenter {
        Fragmenter {
            max_chunk_len: Self::max_chunk_len_for_mtu(mtu),
        }
    }

    pub fn max_chunk_len_for_mtu(mtu: usize) -> usize {
        mtu.saturating_sub(IP_UDP_ALLOWANCE + PacketHeader::SERIALIZED_LEN)
    }

    pub fn max_chunk_len(&self) -> usize {
        self.max_chunk_len
    }

    pub fn max_payload_len(&self) -> usize {
        MAX_PACKETS_PER_MESSAGE * self.max_chunk_len
    }

    pub fn num_packets(&self, payload_len: usize) -> usize {
        payload_len.div_ceil(self.max_chunk_len).max(1)
    }

    pub fn fragment(&self, data: &[u8], tag: Tag) -> Result<Vec<Bytes>, TransportError> {
        if data.len() > self.max_payload_len() {
            return Err(TransportError::PayloadTooLarge { len: data.len(), max: self.max_payload_len() });
        }

        let num_packets = self.num_packets(data.len());
        let seq_total: u16 = (num_packets - 1).prechecked_cast();

        let mut packets = Vec::with_capacity(num_packets);
        for seq_num in 0..num_packets {
            let chunk_start = seq_num * self.max_chunk_len;
            let chunk_end = (chunk_start + self.max_chunk_len).min(data.len());
            let chunk = &data[chunk_start.min(data.len())..chunk_end];

            let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + chunk.len());
            PacketHeader::new(seq_total, seq_num.prechecked_cast(), tag).ser(&mut buf);
            buf.put_slice(chunk);
            packets.push(buf.freeze());
        }
        Ok(packets)
    }
}

impl Default for Fragmenter {
    fn default() -> Self {
        Fragmenter::new(DEFAULT_MTU)
    }
}

/// Concatenates payload fragments in sequence order - the inverse of [Fragmenter::fragment] once
///  headers are stripped.
pub fn reassemble<'a>(fragments: impl IntoIterator<Item = &'a [u8]>) -> Bytes {
    let mut result = BytesMut::new();
    for fragment in fragments {
        result.put_slice(fragment);
    }
    result.freeze()
}
