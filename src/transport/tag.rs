use std::fmt::{Debug, Formatter};

use crate::transport::error::TransportError;

/// Opaque 4-byte message identifier. All fragments of one logical message carry the same tag,
///  and the receiving side stores completed messages by (sender, tag).
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Tag(pub [u8; Tag::SERIALIZED_LEN]);

impl Tag {
    pub const SERIALIZED_LEN: usize = 4;

    /// The tag's bytes as an unsigned little-endian integer. This is the key under which
    ///  completed messages are stored.
    pub fn as_u32(&self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tag({:02x}{:02x}{:02x}{:02x})", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl From<[u8; 4]> for Tag {
    fn from(value: [u8; 4]) -> Self {
        Tag(value)
    }
}

impl From<&[u8; 4]> for Tag {
    fn from(value: &[u8; 4]) -> Self {
        Tag(*value)
    }
}

/// Only the first four bytes of longer input are used.
impl TryFrom<&[u8]> for Tag {
    type Error = TransportError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        match value.get(..Self::SERIALIZED_LEN) {
            Some(prefix) => {
                let mut raw = [0u8; Self::SERIALIZED_LEN];
                raw.copy_from_slice(prefix);
                Ok(Tag(raw))
            }
            None => Err(TransportError::InvalidTag(value.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::exact(b"tst1", Some(*b"tst1"))]
    #[case::truncated(b"noice", Some(*b"noic"))]
    #[case::short(b"abc", None)]
    #[case::empty(b"", None)]
    fn test_try_from(#[case] raw: &[u8], #[case] expected: Option<[u8; 4]>) {
        match Tag::try_from(raw) {
            Ok(tag) => assert_eq!(Some(tag.0), expected),
            Err(TransportError::InvalidTag(len)) => {
                assert!(expected.is_none());
                assert_eq!(len, raw.len());
            }
            Err(e) => panic!("unexpected error {}", e),
        }
    }

    #[rstest]
    #[case([0, 0, 0, 0], 0)]
    #[case([1, 0, 0, 0], 1)]
    #[case([1, 0x4d, 0x01, 0], 0x00014d01)]
    #[case([0xff, 0xff, 0xff, 0xff], u32::MAX)]
    fn test_as_u32(#[case] raw: [u8; 4], #[case] expected: u32) {
        assert_eq!(Tag(raw).as_u32(), expected);
    }
}
