//! Transport filters: the layer that actually moves bytes.
//!
//! A filter sits between a [`Transport`](super::Transport) and the socket and
//! may transform the stream (obfuscation, encryption). Filters report "would
//! block" as a zero-byte result, never as an error.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::sync::Arc;

use super::mio_selector::SelectedSocket;
use super::selector::ReadinessSelector;

/// Pluggable byte-stream transform bound to a transport.
pub trait TransportFilter: Send {
    /// Reads decoded bytes into `bufs`; `Ok(0)` means nothing available yet.
    ///
    /// # Errors
    ///
    /// - `std::io::Error` - If the underlying stream failed or reached EOF
    fn read(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize>;

    /// Writes bytes from `bufs`, returning how many were accepted.
    ///
    /// Bytes that were not accepted must be offered again, unchanged, on the
    /// next call.
    ///
    /// # Errors
    ///
    /// - `std::io::Error` - If the underlying stream failed
    fn write(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Whether bytes are encrypted or obfuscated on the wire.
    fn is_encrypted(&self) -> bool;

    /// Display name, formatted as `"<scheme> (<protocol>)"`.
    fn name(&self, verbose: bool) -> String;

    /// Whether decoded bytes are buffered inside the filter.
    fn has_buffered_read(&self) -> bool;

    /// Enables or disables trace logging.
    fn set_trace(&mut self, on: bool);

    /// Selector watching the stream underneath this filter.
    fn selector(&self) -> &dyn ReadinessSelector;
}

/// Extracts the protocol part of a filter name: the text inside the first
/// pair of parentheses, or an empty string.
pub fn protocol_of(name: &str) -> &str {
    let Some(open) = name.find('(') else {
        return "";
    };
    let rest = &name[open + 1..];
    match rest.find(')') {
        Some(close) if close > 0 => &rest[..close],
        _ => "",
    }
}

/// Maps the outcome of a non-blocking socket call to filter semantics.
fn non_blocking(result: io::Result<usize>) -> io::Result<usize> {
    match result {
        Ok(count) => Ok(count),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
        Err(e) => Err(e),
    }
}

/// Unencrypted pass-through over a selector-registered TCP socket.
pub struct PlainFilter {
    socket: Arc<SelectedSocket>,
    trace: bool,
}

impl PlainFilter {
    /// Creates a filter reading and writing `socket` directly.
    pub fn new(socket: Arc<SelectedSocket>) -> Self {
        Self {
            socket,
            trace: false,
        }
    }

    /// Socket this filter moves bytes through.
    pub fn socket(&self) -> &Arc<SelectedSocket> {
        &self.socket
    }
}

impl TransportFilter for PlainFilter {
    fn read(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        let wanted: usize = bufs.iter().map(|buf| buf.len()).sum();
        let mut stream = self.socket.stream();

        // WouldBlock surfaces as an error, so a zero-length Ok is an orderly shutdown.
        let count = match stream.read_vectored(bufs) {
            Ok(0) if wanted > 0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "end of stream on socket read",
                ));
            }
            result => non_blocking(result)?,
        };

        if self.trace {
            tracing::trace!(token = ?self.socket.token(), "plain read {count} bytes");
        }
        Ok(count)
    }

    fn write(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut stream = self.socket.stream();
        let count = non_blocking(stream.write_vectored(bufs))?;
        if self.trace {
            tracing::trace!(token = ?self.socket.token(), "plain wrote {count} bytes");
        }
        Ok(count)
    }

    fn is_encrypted(&self) -> bool {
        false
    }

    fn name(&self, verbose: bool) -> String {
        if verbose {
            match self.socket.stream().peer_addr() {
                Ok(address) => format!("None (TCP) peer={address}"),
                Err(_) => "None (TCP)".to_string(),
            }
        } else {
            "None (TCP)".to_string()
        }
    }

    fn has_buffered_read(&self) -> bool {
        false
    }

    fn set_trace(&mut self, on: bool) {
        self.trace = on;
    }

    fn selector(&self) -> &dyn ReadinessSelector {
        &*self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_extraction() {
        assert_eq!(protocol_of("None (TCP)"), "TCP");
        assert_eq!(protocol_of("XOR (uTP) peer=1.2.3.4:5"), "uTP");
        assert_eq!(protocol_of("None"), "");
        assert_eq!(protocol_of("Broken ("), "");
        assert_eq!(protocol_of("Empty ()"), "");
    }

    #[test]
    fn test_non_blocking_maps_would_block_to_zero() {
        let would_block = Err(io::Error::from(io::ErrorKind::WouldBlock));
        assert_eq!(non_blocking(would_block).unwrap(), 0);

        let reset = Err(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(non_blocking(reset).is_err());

        assert_eq!(non_blocking(Ok(7)).unwrap(), 7);
    }
}
