use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::transport::tag::Tag;

/// Completed messages, keyed by sender address and the tag's integer value.
///
/// Reads are destructive: [MessageStore::take] removes the message it returns, so each message
///  is consumed at most once, and a second `take` for the same key returns `None` until a new
///  message for that key completes. A message that is not taken is overwritten by the next
///  message completing for the same key.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Mutex<FxHashMap<(IpAddr, u32), Bytes>>,
}

impl MessageStore {
    pub fn new() -> MessageStore {
        Default::default()
    }

    pub fn put(&self, from: IpAddr, tag: Tag, message: Bytes) {
        self.messages.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((from, tag.as_u32()), message);
    }

    pub fn take(&self, from: IpAddr, tag: Tag) -> Option<Bytes> {
        self.messages.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(from, tag.as_u32()))
    }

    pub fn len(&self) -> usize {
        self.messages.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
