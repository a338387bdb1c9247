//! Non-blocking transport layer for peer connections.
//!
//! A [`Transport`] exposes vectored, readiness-driven reads and writes over a
//! duplex byte stream. The bytes themselves flow through a pluggable
//! [`TransportFilter`] (plain or obfuscated), while a [`ReadinessSelector`]
//! reports readiness edges from its own thread.

mod buffers;
pub mod cipher;
pub mod filter;
pub mod mio_selector;
pub mod selector;
pub mod token_bucket;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

use std::io;
use std::sync::Arc;

pub use cipher::{CipherFilter, Keystream, XorKeystream};
pub use filter::{PlainFilter, TransportFilter, protocol_of};
pub use mio_selector::{MioSelector, SelectedSocket};
pub use selector::{Attachment, ReadinessSelector, SelectListener};
pub use token_bucket::{DispenserError, SpeedTokenDispenser, TokenBucket, TokenBucketDispenser};
pub use transport::{Transport, TransportMode, TransportState};

/// Errors surfaced by transport reads and writes.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport was closed; nothing succeeds afterwards
    #[error("Transport closed")]
    Closed,

    /// No filter is bound yet and there was nothing to deliver
    #[error("Transport not ready")]
    NotReady,

    /// The selector reported a failure while watching for read readiness
    #[error("Read select failure: {cause}")]
    ReadSelectFailure {
        /// Captured socket error, shared by every subsequent call
        cause: Arc<io::Error>,
    },

    /// The selector reported a failure while watching for write readiness
    #[error("Write select failure: {cause}")]
    WriteSelectFailure {
        /// Captured socket error, shared by every subsequent call
        cause: Arc<io::Error>,
    },

    /// The filter failed while moving bytes
    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Returns true for failures that leave the transport unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::NotReady)
    }
}
