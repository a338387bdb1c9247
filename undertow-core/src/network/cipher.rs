//! Obfuscating filter that applies a symmetric keystream to the byte stream.
//!
//! The filter wraps another filter (normally a [`PlainFilter`](super::PlainFilter))
//! and can be swapped onto a transport mid-handshake. Raw bytes are read in
//! chunks, so decoded bytes that did not fit the caller's buffers stay inside
//! the filter and are reported through `has_buffered_read`.

use std::io::{self, IoSlice, IoSliceMut};

use bytes::{Buf, BytesMut};

use super::buffers;
use super::filter::{TransportFilter, protocol_of};
use super::selector::ReadinessSelector;

/// Size of one raw read from the wrapped filter.
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Symmetric keystream; each direction owns its own instance.
pub trait Keystream: Send {
    /// Transforms `data` in place, advancing the keystream by its length.
    fn apply(&mut self, data: &mut [u8]);

    /// Short scheme name used in filter names.
    fn name(&self) -> &str;
}

/// Repeating-key XOR keystream for demos and tests. Not encryption.
#[derive(Debug, Clone)]
pub struct XorKeystream {
    key: Vec<u8>,
    position: usize,
}

impl XorKeystream {
    /// Creates a keystream cycling over `key`.
    ///
    /// # Errors
    ///
    /// - `std::io::Error` (`InvalidInput`) - If `key` is empty
    pub fn new(key: &[u8]) -> io::Result<Self> {
        if key.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "XOR keystream key must not be empty",
            ));
        }
        Ok(Self {
            key: key.to_vec(),
            position: 0,
        })
    }
}

impl Keystream for XorKeystream {
    fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            *byte ^= self.key[self.position];
            self.position = (self.position + 1) % self.key.len();
        }
    }

    fn name(&self) -> &str {
        "XOR"
    }
}

/// Filter encoding outbound and decoding inbound bytes with a keystream.
///
/// Writes follow the usual non-blocking contract: bytes not accepted must be
/// offered again unchanged. The filter keeps the already-encoded copy of
/// those bytes and sends it first on the next call.
pub struct CipherFilter<K: Keystream> {
    inner: Box<dyn TransportFilter>,
    encoder: K,
    decoder: K,
    decoded: BytesMut,
    unsent: BytesMut,
    scratch: Vec<u8>,
    trace: bool,
}

impl<K: Keystream> CipherFilter<K> {
    /// Wraps `inner`, encoding writes with `encoder` and decoding reads with `decoder`.
    pub fn new(inner: Box<dyn TransportFilter>, encoder: K, decoder: K) -> Self {
        Self {
            inner,
            encoder,
            decoder,
            decoded: BytesMut::new(),
            unsent: BytesMut::new(),
            scratch: Vec::new(),
            trace: false,
        }
    }

    /// Encoded bytes waiting for the wrapped filter to accept them.
    pub fn unsent_len(&self) -> usize {
        self.unsent.len()
    }

    fn flush_unsent(&mut self) -> io::Result<usize> {
        if self.unsent.is_empty() {
            return Ok(0);
        }
        let sent = self.inner.write(&[IoSlice::new(&self.unsent)])?;
        self.unsent.advance(sent);
        Ok(sent)
    }
}

impl<K: Keystream> TransportFilter for CipherFilter<K> {
    fn read(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        let capacity = buffers::capacity(bufs);

        let delivered = buffers::scatter(&self.decoded, bufs);
        self.decoded.advance(delivered);
        if delivered == capacity {
            return Ok(delivered);
        }

        self.scratch.resize(READ_CHUNK_SIZE, 0);
        let raw = match self.inner.read(&mut [IoSliceMut::new(&mut self.scratch)]) {
            Ok(count) => count,
            Err(_) if delivered > 0 => 0,
            Err(e) => return Err(e),
        };
        if raw == 0 {
            return Ok(delivered);
        }

        let chunk = &mut self.scratch[..raw];
        self.decoder.apply(chunk);

        let fresh = buffers::scatter(chunk, &mut buffers::scatter_tail(bufs, delivered));
        self.decoded.extend_from_slice(&chunk[fresh..]);

        if self.trace {
            tracing::trace!(
                "cipher read raw={raw} delivered={} buffered={}",
                delivered + fresh,
                self.decoded.len()
            );
        }
        Ok(delivered + fresh)
    }

    fn write(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let offered = buffers::gather_len(bufs);

        // The unsent bytes are the encoded form of the head of `bufs`.
        let pending = self.unsent.len().min(offered);
        let flushed = self.flush_unsent()?.min(pending);
        if !self.unsent.is_empty() {
            return Ok(flushed);
        }

        self.scratch.clear();
        buffers::gather_into(bufs, pending, &mut self.scratch);
        if self.scratch.is_empty() {
            return Ok(pending);
        }

        self.encoder.apply(&mut self.scratch);
        let sent = self.inner.write(&[IoSlice::new(&self.scratch)])?;
        self.unsent.extend_from_slice(&self.scratch[sent..]);

        if self.trace {
            tracing::trace!(
                "cipher write offered={offered} sent={sent} unsent={}",
                self.unsent.len()
            );
        }
        Ok(pending + sent)
    }

    fn is_encrypted(&self) -> bool {
        true
    }

    fn name(&self, verbose: bool) -> String {
        let inner_name = self.inner.name(verbose);
        let name = format!("{} ({})", self.encoder.name(), protocol_of(&inner_name));
        if verbose {
            format!("{name} over {inner_name}")
        } else {
            name
        }
    }

    fn has_buffered_read(&self) -> bool {
        !self.decoded.is_empty() || self.inner.has_buffered_read()
    }

    fn set_trace(&mut self, on: bool) {
        self.trace = on;
        self.inner.set_trace(on);
    }

    fn selector(&self) -> &dyn ReadinessSelector {
        self.inner.selector()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_support::{ManualSelector, MemoryFilter, MemoryPipe};

    const KEY: &[u8] = b"k3y";

    fn cipher_over_pipe() -> (CipherFilter<XorKeystream>, MemoryPipe) {
        let (inner, pipe) = MemoryFilter::new(ManualSelector::new());
        let filter = CipherFilter::new(
            Box::new(inner),
            XorKeystream::new(KEY).unwrap(),
            XorKeystream::new(KEY).unwrap(),
        );
        (filter, pipe)
    }

    fn encode(data: &[u8]) -> Vec<u8> {
        let mut encoded = data.to_vec();
        XorKeystream::new(KEY).unwrap().apply(&mut encoded);
        encoded
    }

    #[test]
    fn test_xor_keystream_is_symmetric() {
        let mut data = b"handshake".to_vec();
        XorKeystream::new(KEY).unwrap().apply(&mut data);
        assert_ne!(data, b"handshake");

        XorKeystream::new(KEY).unwrap().apply(&mut data);
        assert_eq!(data, b"handshake");
    }

    #[test]
    fn test_empty_key_is_rejected() {
        let error = XorKeystream::new(b"").unwrap_err();

        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_write_encodes_bytes() {
        let (mut filter, pipe) = cipher_over_pipe();

        let written = filter.write(&[IoSlice::new(b"piece")]).unwrap();

        assert_eq!(written, 5);
        assert_eq!(pipe.take_outbound(), encode(b"piece"));
    }

    #[test]
    fn test_partial_write_resends_encoded_tail_first() {
        let (mut filter, pipe) = cipher_over_pipe();
        pipe.set_write_budget(Some(2));

        let first = filter.write(&[IoSlice::new(b"abcdef")]).unwrap();
        assert_eq!(first, 2);
        assert_eq!(filter.unsent_len(), 4);

        pipe.set_write_budget(None);
        let second = filter.write(&[IoSlice::new(b"cdef")]).unwrap();
        assert_eq!(second, 4);
        assert_eq!(filter.unsent_len(), 0);

        let third = filter.write(&[IoSlice::new(b"gh")]).unwrap();
        assert_eq!(third, 2);

        assert_eq!(pipe.take_outbound(), encode(b"abcdefgh"));
    }

    #[test]
    fn test_read_decodes_and_buffers_overflow() {
        let (mut filter, pipe) = cipher_over_pipe();
        pipe.push_inbound(&encode(b"bitfield"));

        let mut small = [0u8; 3];
        let count = filter.read(&mut [IoSliceMut::new(&mut small)]).unwrap();

        assert_eq!(count, 3);
        assert_eq!(&small, b"bit");
        assert!(filter.has_buffered_read());
        assert_eq!(pipe.inbound_len(), 0);

        let mut rest = [0u8; 16];
        let count = filter.read(&mut [IoSliceMut::new(&mut rest)]).unwrap();

        assert_eq!(&rest[..count], b"field");
        assert!(!filter.has_buffered_read());
    }

    #[test]
    fn test_read_returns_zero_when_nothing_arrives() {
        let (mut filter, _pipe) = cipher_over_pipe();

        let mut buffer = [0u8; 8];
        let count = filter.read(&mut [IoSliceMut::new(&mut buffer)]).unwrap();

        assert_eq!(count, 0);
    }

    #[test]
    fn test_names_and_encryption_flag() {
        let (filter, _pipe) = cipher_over_pipe();

        assert!(filter.is_encrypted());
        assert_eq!(filter.name(false), "XOR (Memory)");
        assert_eq!(filter.name(true), "XOR (Memory) over None (Memory) in-process");
    }

    #[test]
    fn test_trace_reaches_inner_filter() {
        let (mut filter, pipe) = cipher_over_pipe();

        filter.set_trace(true);

        assert!(pipe.trace_enabled());
    }

    #[test]
    fn test_selector_is_inner_selector() {
        let selector = ManualSelector::new();
        let (inner, _pipe) = MemoryFilter::new(selector.clone());
        let filter = CipherFilter::new(
            Box::new(inner),
            XorKeystream::new(KEY).unwrap(),
            XorKeystream::new(KEY).unwrap(),
        );

        filter.selector().resume_read_selects();

        assert_eq!(selector.read_resumes(), 1);
    }
}
