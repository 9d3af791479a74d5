use std::io;

/// Failures of the transport layer.
///
/// Configuration and contract violations (`InvalidPort`, `InvalidProtocol`, `InvalidTag`,
///  `TransportClosed`, `AlreadyClosed`, `PayloadTooLarge`) are returned synchronously to the
///  caller. `MalformedPacket` and `ConnectionClosed` are produced on the receive path where they
///  are logged and absorbed - they never terminate a receive loop.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("port must be between 0 and 65535, was {0}")]
    InvalidPort(i64),

    #[error("protocol must be one of UDP or TCP, was {0:?}")]
    InvalidProtocol(String),

    #[error("a tag must have at least 4 bytes, got {0}")]
    InvalidTag(usize),

    /// Shorter than the packet header, or a sequence number beyond the sequence total
    #[error("malformed packet of {0} bytes")]
    MalformedPacket(usize),

    #[error("payload of {len} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("transport was closed")]
    TransportClosed,

    #[error("transport was already closed")]
    AlreadyClosed,

    #[error("connection closed in the middle of a frame")]
    ConnectionClosed,

    #[error(transparent)]
    Io(#[from] io::Error),
}
