//! Utilities for testing code that works against a [crate::transport::Transport]. They are part
//!  of the crate's regular (non-#[cfg(test)]) code so that applications can use them in their
//!  own tests.

pub mod in_memory_transport;

