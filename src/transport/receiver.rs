use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::transport::message_store::MessageStore;
use crate::transport::reassembly::Reassembler;
use crate::transport::ReceiveCallback;

/// The part of the receive path that is shared by all protocols: every packet read from a UDP
///  socket or a TCP frame goes through [ReceivePath::on_packet].
///
/// Reassembly state is only ever touched from here. Completed messages are moved to the
///  [MessageStore] which is the only thing application code sees.
#[derive(Default)]
pub(crate) struct ReceivePath {
    reassembler: Mutex<Reassembler>,
    message_store: MessageStore,
    callback: RwLock<Option<Arc<dyn ReceiveCallback>>>,
}

impl ReceivePath {
    pub fn new(reassembly_timeout: Duration) -> ReceivePath {
        ReceivePath {
            reassembler: Mutex::new(Reassembler::with_timeout(reassembly_timeout)),
            ..Default::default()
        }
    }

    pub fn message_store(&self) -> &MessageStore {
        &self.message_store
    }

    pub fn set_callback(&self, callback: Arc<dyn ReceiveCallback>) {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn on_packet(&self, from: IpAddr, packet: Bytes) {
        let completed = self.reassembler.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_packet(from, packet);

        let (tag, message) = match completed {
            Ok(Some(x)) => x,
            Ok(None) => return,
            Err(e) => {
                warn!(?from, "dropping packet: {}", e);
                return;
            }
        };

        debug!(?from, ?tag, "received complete message of {} bytes", message.len());
        self.message_store.put(from, tag, message.clone());

        let callback = self.callback.read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback.on_message(from, tag, &message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fragmenter::Fragmenter;
    use crate::transport::tag::Tag;

    const FROM: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

    #[test]
    fn test_message_is_stored_and_callback_invoked_once() {
        let receive_path = ReceivePath::default();

        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_in_callback = calls.clone();
        receive_path.set_callback(Arc::new(move |from: IpAddr, tag: Tag, message: &[u8]| {
            calls_in_callback.lock().unwrap().push((from, tag, message.to_vec()));
        }));

        let data = b"x".repeat(1200);
        for packet in Fragmenter::default().fragment(&data, Tag(*b"_get")).unwrap() {
            receive_path.on_packet(FROM, packet);
        }

        assert_eq!(*calls.lock().unwrap(), vec![(FROM, Tag(*b"_get"), data.clone())]);
        assert_eq!(receive_path.message_store().take(FROM, Tag(*b"_get")).unwrap().as_ref(), data.as_slice());
        assert_eq!(receive_path.message_store().take(FROM, Tag(*b"_get")), None);
    }

    #[test]
    fn test_malformed_packet_is_dropped() {
        let receive_path = ReceivePath::default();
        receive_path.on_packet(FROM, Bytes::from_static(b"\0\0"));
        assert!(receive_path.message_store().is_empty());

        receive_path.on_packet(FROM, Bytes::from_static(b"\0\0\0\0tst1ok"));
        assert_eq!(receive_path.message_store().take(FROM, Tag(*b"tst1")), Some(Bytes::from_static(b"ok")));
    }
}
