//! Duplex, non-blocking byte-stream transport.
//!
//! The transport owns the consumer side of a connection: the bound filter,
//! bytes pushed back ahead of the live stream, and the lifecycle state. The
//! readiness flags and captured selector failures live in a [`Readiness`]
//! block shared with the selector thread. Each field there has a single
//! writer per side, so the read/write path takes no locks.

use std::io::{self, IoSlice, IoSliceMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwapOption;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::TransportError;
use super::buffers;
use super::filter::{TransportFilter, protocol_of};
use super::selector::{Attachment, ReadinessSelector, SelectListener};
use crate::clock::ClockSource;
use crate::config::TransportConfig;
use crate::waiter::EventWaiter;

/// Lifecycle of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Created, no connection attempt yet
    Unconnected,
    /// Connection attempt in progress
    Connecting,
    /// Connected and registered with the selector
    ReadinessTracking,
    /// Closed; terminal
    Closed,
}

/// Speed mode of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    #[default]
    Normal,
    Fast,
    Turbo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

/// Cross-thread readiness state of one transport.
struct Readiness {
    ready_for_read: AtomicBool,
    ready_for_write: AtomicBool,
    read_failure: OnceLock<Arc<io::Error>>,
    write_failure: OnceLock<Arc<io::Error>>,
    read_waiter: ArcSwapOption<EventWaiter>,
    write_waiter: ArcSwapOption<EventWaiter>,
    trace: AtomicBool,
    closed: AtomicBool,
}

impl Readiness {
    fn new(trace: bool) -> Self {
        Self {
            ready_for_read: AtomicBool::new(false),
            ready_for_write: AtomicBool::new(false),
            read_failure: OnceLock::new(),
            write_failure: OnceLock::new(),
            read_waiter: ArcSwapOption::empty(),
            write_waiter: ArcSwapOption::empty(),
            trace: AtomicBool::new(trace),
            closed: AtomicBool::new(false),
        }
    }

    fn flag(&self, direction: Direction) -> &AtomicBool {
        match direction {
            Direction::Read => &self.ready_for_read,
            Direction::Write => &self.ready_for_write,
        }
    }

    fn waiter(&self, direction: Direction) -> &ArcSwapOption<EventWaiter> {
        match direction {
            Direction::Read => &self.read_waiter,
            Direction::Write => &self.write_waiter,
        }
    }

    fn failure(&self, direction: Direction) -> &OnceLock<Arc<io::Error>> {
        match direction {
            Direction::Read => &self.read_failure,
            Direction::Write => &self.write_failure,
        }
    }

    /// Updates a readiness flag. Returns true only for a not-ready to ready
    /// transition, which is also the only case that wakes the waiter.
    fn set_ready(&self, direction: Direction, ready: bool) -> bool {
        if self.trace.load(Ordering::Relaxed) {
            tracing::trace!("Transport ready_for_{direction:?} -> {ready}");
        }

        if !ready {
            self.flag(direction).store(false, Ordering::Release);
            return false;
        }

        let progress = !self.flag(direction).swap(true, Ordering::AcqRel);
        if progress {
            if let Some(waiter) = self.waiter(direction).load_full() {
                waiter.event_occurred();
            }
        }
        progress
    }

    /// Records a selector failure and forces the flag so the next call on the
    /// consumer thread observes it. The first failure is kept.
    fn fail(&self, direction: Direction, cause: io::Error) {
        tracing::debug!("Transport {direction:?} select failure: {cause}");

        let _ = self.failure(direction).set(Arc::new(cause));
        self.flag(direction).store(true, Ordering::Release);
        if let Some(waiter) = self.waiter(direction).load_full() {
            waiter.event_occurred();
        }
    }
}

/// Selector listener feeding one direction of a transport's readiness.
struct ReadinessListener {
    readiness: Arc<Readiness>,
    direction: Direction,
}

impl SelectListener for ReadinessListener {
    fn select_success(
        &self,
        _selector: &dyn ReadinessSelector,
        _attachment: Option<&Attachment>,
    ) -> bool {
        if self.readiness.closed.load(Ordering::Acquire) {
            return false;
        }
        self.readiness.set_ready(self.direction, true)
    }

    fn select_failure(
        &self,
        _selector: &dyn ReadinessSelector,
        _attachment: Option<&Attachment>,
        cause: io::Error,
    ) {
        if self.readiness.closed.load(Ordering::Acquire) {
            return;
        }
        self.readiness.fail(self.direction, cause);
    }
}

/// Non-blocking duplex transport for one peer connection.
///
/// "Would block" is reported as a zero-byte result. Selector failures are
/// captured on the selector thread and surfaced by the next read or write.
pub struct Transport {
    readiness: Arc<Readiness>,
    filter: Option<Box<dyn TransportFilter>>,
    already_read: Option<Bytes>,
    last_ready_for_read: u64,
    state: TransportState,
    mode: TransportMode,
    trace: bool,
    clock: Arc<dyn ClockSource>,
    bytes_read: u64,
    bytes_written: u64,
}

impl Transport {
    /// Creates an unconnected transport with default settings.
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self::with_config(clock, &TransportConfig::default())
    }

    /// Creates an unconnected transport using `config` defaults.
    pub fn with_config(clock: Arc<dyn ClockSource>, config: &TransportConfig) -> Self {
        let now = clock.monotonic_millis();
        Self {
            readiness: Arc::new(Readiness::new(config.trace)),
            filter: None,
            already_read: None,
            last_ready_for_read: now,
            state: TransportState::Unconnected,
            mode: config.default_mode,
            trace: config.trace,
            clock,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Marks the start of a connection attempt.
    pub fn begin_connect(&mut self) {
        if self.state == TransportState::Unconnected {
            self.state = TransportState::Connecting;
        }
    }

    /// Binds `filter`, returning the previously bound one.
    ///
    /// The transport's trace setting carries over to the new filter.
    pub fn set_filter(
        &mut self,
        mut filter: Box<dyn TransportFilter>,
    ) -> Option<Box<dyn TransportFilter>> {
        if self.trace {
            filter.set_trace(true);
        }
        self.filter.replace(filter)
    }

    /// Currently bound filter.
    pub fn filter(&self) -> Option<&dyn TransportFilter> {
        self.filter.as_deref()
    }

    /// Pushes bytes back in front of the stream.
    ///
    /// They are placed ahead of bytes pushed back earlier, so repeated calls
    /// rebuild the original arrival order when peeked data is returned in
    /// reverse.
    pub fn set_already_read(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }

        let merged = match self.already_read.take() {
            Some(existing) => {
                let mut buffer = BytesMut::with_capacity(bytes.len() + existing.len());
                buffer.put(bytes);
                buffer.put(existing);
                buffer.freeze()
            }
            None => bytes,
        };
        self.already_read = Some(merged);
        self.readiness.set_ready(Direction::Read, true);
    }

    /// Name of the filter's encoding, or empty when unbound.
    pub fn encryption(&self, verbose: bool) -> String {
        self.filter
            .as_ref()
            .map(|filter| filter.name(verbose))
            .unwrap_or_default()
    }

    /// Protocol named inside the encoding's parentheses, or empty.
    pub fn protocol(&self) -> String {
        protocol_of(&self.encryption(false)).to_string()
    }

    /// Whether the bound filter encrypts the stream.
    pub fn is_encrypted(&self) -> bool {
        self.filter
            .as_ref()
            .is_some_and(|filter| filter.is_encrypted())
    }

    /// Returns whether a write would currently make progress.
    ///
    /// `waiter`, when given, replaces the waiter woken on the next
    /// not-ready to ready transition.
    pub fn is_ready_for_write(&self, waiter: Option<Arc<EventWaiter>>) -> bool {
        if let Some(waiter) = waiter {
            self.readiness.write_waiter.store(Some(waiter));
        }
        self.readiness.ready_for_write.load(Ordering::Acquire)
    }

    /// Returns 0 if a read would currently make progress, otherwise the
    /// milliseconds since the transport last was read-ready (at least 1).
    ///
    /// Bytes pushed back with [`set_already_read`](Self::set_already_read)
    /// and bytes buffered inside the filter count as readable.
    pub fn is_ready_for_read(&mut self, waiter: Option<Arc<EventWaiter>>) -> u64 {
        if let Some(waiter) = waiter {
            self.readiness.read_waiter.store(Some(waiter));
        }

        let ready = self.readiness.ready_for_read.load(Ordering::Acquire)
            || self.already_read.is_some()
            || self
                .filter
                .as_ref()
                .is_some_and(|filter| filter.has_buffered_read());

        let now = self.clock.monotonic_millis();
        if ready {
            self.last_ready_for_read = now;
            return 0;
        }
        now.saturating_sub(self.last_ready_for_read) + 1
    }

    /// Forces read readiness, waking the read waiter on a transition.
    pub fn set_ready_for_read(&self) {
        self.readiness.set_ready(Direction::Read, true);
    }

    /// Writes from `bufs` through the bound filter.
    ///
    /// Returns 0 while no filter is bound. Accepting fewer bytes than offered
    /// re-arms write readiness with the selector.
    ///
    /// # Errors
    ///
    /// - `TransportError::Closed` - If the transport was closed
    /// - `TransportError::WriteSelectFailure` - If the selector reported a write failure
    /// - `TransportError::Io` - If the filter failed
    pub fn write(&mut self, bufs: &[IoSlice<'_>]) -> Result<usize, TransportError> {
        self.ensure_open()?;

        if let Some(cause) = self.readiness.write_failure.get() {
            return Err(TransportError::WriteSelectFailure {
                cause: Arc::clone(cause),
            });
        }

        let Some(filter) = self.filter.as_mut() else {
            return Ok(0);
        };

        let requested = buffers::gather_len(bufs);
        let written = filter.write(bufs)?;
        self.bytes_written += written as u64;

        if written < requested {
            self.request_write_select();
        }

        Ok(written)
    }

    /// Reads into `bufs`, delivering pushed-back bytes before stream bytes.
    ///
    /// When the pushed-back bytes fill `bufs` the stream is not touched. A
    /// filter read of zero bytes re-arms read readiness with the selector.
    ///
    /// # Errors
    ///
    /// - `TransportError::Closed` - If the transport was closed
    /// - `TransportError::ReadSelectFailure` - If the selector reported a read failure
    /// - `TransportError::NotReady` - If no filter is bound and nothing was delivered
    /// - `TransportError::Io` - If the filter failed
    pub fn read(&mut self, bufs: &mut [IoSliceMut<'_>]) -> Result<usize, TransportError> {
        self.ensure_open()?;

        if let Some(cause) = self.readiness.read_failure.get() {
            return Err(TransportError::ReadSelectFailure {
                cause: Arc::clone(cause),
            });
        }

        let capacity = buffers::capacity(bufs);
        let inserted = self.drain_already_read(bufs);

        if inserted > 0 && inserted == capacity {
            self.bytes_read += inserted as u64;
            return Ok(inserted);
        }

        let Some(filter) = self.filter.as_mut() else {
            if inserted > 0 {
                self.bytes_read += inserted as u64;
                return Ok(inserted);
            }
            return Err(TransportError::NotReady);
        };

        let filter_result = if inserted == 0 {
            filter.read(bufs)
        } else {
            filter.read(&mut buffers::scatter_tail(bufs, inserted))
        };

        let bytes_read = match filter_result {
            Ok(count) => count,
            // Bytes already copied out must not be lost; the error repeats next call.
            Err(_) if inserted > 0 => 0,
            Err(e) => return Err(e.into()),
        };

        if bytes_read == 0 {
            self.request_read_select();
        }

        let total = inserted + bytes_read;
        self.bytes_read += total as u64;
        Ok(total)
    }

    fn drain_already_read(&mut self, bufs: &mut [IoSliceMut<'_>]) -> usize {
        let Some(pending) = self.already_read.as_mut() else {
            return 0;
        };

        let inserted = buffers::scatter(pending, bufs);
        pending.advance(inserted);
        if !pending.has_remaining() {
            self.already_read = None;
        }
        inserted
    }

    fn request_write_select(&self) {
        self.readiness.set_ready(Direction::Write, false);
        if let Some(filter) = self.filter.as_ref() {
            filter.selector().resume_write_selects();
        }
    }

    fn request_read_select(&self) {
        self.readiness.set_ready(Direction::Read, false);
        if let Some(filter) = self.filter.as_ref() {
            filter.selector().resume_read_selects();
        }
    }

    /// Inbound connection established: start readiness tracking.
    pub fn connected_inbound(&mut self) {
        self.register_select_handling();
    }

    /// Outbound connection established: start readiness tracking.
    pub fn connected_outbound(&mut self) {
        self.register_select_handling();
    }

    fn register_select_handling(&mut self) {
        if self.state == TransportState::Closed {
            return;
        }

        let Some(filter) = self.filter.as_ref() else {
            tracing::error!("Select handling requested without a bound filter");
            return;
        };

        let selector = filter.selector();
        selector.register_for_read_selects(
            Arc::new(ReadinessListener {
                readiness: Arc::clone(&self.readiness),
                direction: Direction::Read,
            }),
            None,
        );
        selector.register_for_write_selects(
            Arc::new(ReadinessListener {
                readiness: Arc::clone(&self.readiness),
                direction: Direction::Write,
            }),
            None,
        );

        tracing::debug!(
            encryption = %filter.name(false),
            "Transport registered for readiness selects"
        );
        self.state = TransportState::ReadinessTracking;
    }

    /// Enables or disables trace logging, including the filter's.
    pub fn set_trace(&mut self, on: bool) {
        self.trace = on;
        self.readiness.trace.store(on, Ordering::Relaxed);
        if let Some(filter) = self.filter.as_mut() {
            filter.set_trace(on);
        }
    }

    /// Current speed mode.
    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Switches the speed mode.
    pub fn set_mode(&mut self, mode: TransportMode) {
        self.mode = mode;
    }

    /// Bytes delivered to the consumer so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Bytes accepted by the filter so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Closes the transport. Idempotent.
    ///
    /// Readiness reporting is cancelled and every later read or write fails
    /// with `TransportError::Closed`.
    pub fn close(&mut self, reason: &str) {
        if self.state == TransportState::Closed {
            return;
        }

        self.state = TransportState::Closed;
        self.readiness.closed.store(true, Ordering::Release);
        self.already_read = None;

        if let Some(filter) = self.filter.take() {
            filter.selector().cancel_selects();
        }

        tracing::debug!("Transport closed: {reason}");
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.state == TransportState::Closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("state", &self.state)
            .field("mode", &self.mode)
            .field("encryption", &self.encryption(false))
            .field("bytes_read", &self.bytes_read)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}
