use bytes::{Buf, BufMut};

use crate::transport::error::TransportError;
use crate::transport::tag::Tag;

/// Fixed header in front of every packet, both for UDP datagrams and for TCP frames:
///
/// ```ascii
/// 0: seq_total (u16 LE) - index of the *last* packet of the message, i.e. packet count - 1
/// 2: seq_num   (u16 LE) - this packet's zero-based index
/// 4: tag       (4 raw bytes)
/// 8: payload fragment
/// ```
///
/// NB: the 16 bit fields are little endian, unlike the rest of this crate's wire formats. This
///      is required for interoperability with existing nodes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub seq_total: u16,
    pub seq_num: u16,
    pub tag: Tag,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 2 * std::mem::size_of::<u16>() + Tag::SERIALIZED_LEN;

    pub fn new(seq_total: u16, seq_num: u16, tag: Tag) -> PacketHeader {
        PacketHeader {
            seq_total,
            seq_num,
            tag,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.seq_total);
        buf.put_u16_le(self.seq_num);
        buf.put_slice(self.tag.as_bytes());
    }

    /// Reads the header, leaving `buf` positioned at the start of the payload fragment.
    pub fn deser(buf: &mut impl Buf) -> Result<PacketHeader, TransportError> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(TransportError::MalformedPacket(buf.remaining()));
        }

        let seq_total = buf.get_u16_le();
        let seq_num = buf.get_u16_le();
        let mut tag = [0u8; Tag::SERIALIZED_LEN];
        buf.copy_to_slice(&mut tag);

        Ok(PacketHeader {
            seq_total,
            seq_num,
            tag: Tag(tag),
        })
    }
}
