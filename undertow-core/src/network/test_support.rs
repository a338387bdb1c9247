//! In-memory selector and filter doubles for transport tests.
//!
//! `ManualSelector` lets a test play the selector thread: it fires readiness
//! edges and failures on demand and counts re-arm requests. `MemoryFilter`
//! moves bytes through an in-process pipe the test controls.

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::buffers;
use super::filter::TransportFilter;
use super::selector::{Attachment, ReadinessSelector, SelectListener};

type Registration = Option<(Arc<dyn SelectListener>, Option<Attachment>)>;

/// Selector driven explicitly by the test.
#[derive(Default)]
pub struct ManualSelector {
    read: Mutex<Registration>,
    write: Mutex<Registration>,
    read_resumes: AtomicUsize,
    write_resumes: AtomicUsize,
    cancelled: AtomicBool,
}

impl ManualSelector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reports read readiness; returns the listener's transition result.
    pub fn fire_read_ready(&self) -> bool {
        self.fire(&self.read)
    }

    /// Reports write readiness; returns the listener's transition result.
    pub fn fire_write_ready(&self) -> bool {
        self.fire(&self.write)
    }

    /// Reports a read-side selector failure.
    pub fn fail_read(&self, cause: io::Error) {
        self.fail(&self.read, cause);
    }

    /// Reports a write-side selector failure.
    pub fn fail_write(&self, cause: io::Error) {
        self.fail(&self.write, cause);
    }

    pub fn has_read_listener(&self) -> bool {
        self.read.lock().is_some()
    }

    pub fn has_write_listener(&self) -> bool {
        self.write.lock().is_some()
    }

    /// Number of `resume_read_selects` calls so far.
    pub fn read_resumes(&self) -> usize {
        self.read_resumes.load(Ordering::SeqCst)
    }

    /// Number of `resume_write_selects` calls so far.
    pub fn write_resumes(&self) -> usize {
        self.write_resumes.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn fire(&self, slot: &Mutex<Registration>) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let registered = slot.lock().clone();
        match registered {
            Some((listener, attachment)) => listener.select_success(self, attachment.as_ref()),
            None => false,
        }
    }

    fn fail(&self, slot: &Mutex<Registration>, cause: io::Error) {
        if self.is_cancelled() {
            return;
        }
        let registered = slot.lock().clone();
        if let Some((listener, attachment)) = registered {
            listener.select_failure(self, attachment.as_ref(), cause);
        }
    }
}

impl ReadinessSelector for ManualSelector {
    fn register_for_read_selects(
        &self,
        listener: Arc<dyn SelectListener>,
        attachment: Option<Attachment>,
    ) {
        *self.read.lock() = Some((listener, attachment));
    }

    fn register_for_write_selects(
        &self,
        listener: Arc<dyn SelectListener>,
        attachment: Option<Attachment>,
    ) {
        *self.write.lock() = Some((listener, attachment));
    }

    fn resume_read_selects(&self) {
        self.read_resumes.fetch_add(1, Ordering::SeqCst);
    }

    fn resume_write_selects(&self) {
        self.write_resumes.fetch_add(1, Ordering::SeqCst);
    }

    fn cancel_selects(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct PipeState {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    write_budget: Option<usize>,
    inbound_closed: bool,
    buffered_read: bool,
    trace: bool,
}

/// Test-side handle onto a [`MemoryFilter`]'s pipe.
#[derive(Clone, Default)]
pub struct MemoryPipe {
    state: Arc<Mutex<PipeState>>,
}

impl MemoryPipe {
    /// Queues bytes for the transport to read.
    pub fn push_inbound(&self, data: &[u8]) {
        self.state.lock().inbound.extend(data.iter().copied());
    }

    /// Bytes queued but not yet read by the transport.
    pub fn inbound_len(&self) -> usize {
        self.state.lock().inbound.len()
    }

    /// Marks the inbound side as shut down; reads then fail with EOF.
    pub fn close_inbound(&self) {
        self.state.lock().inbound_closed = true;
    }

    /// Takes every byte written by the transport so far.
    pub fn take_outbound(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().outbound)
    }

    /// Limits how many bytes each write accepts (None = unlimited).
    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.state.lock().write_budget = budget;
    }

    /// Makes the filter report buffered decoded bytes.
    pub fn set_buffered_read(&self, buffered: bool) {
        self.state.lock().buffered_read = buffered;
    }

    pub fn trace_enabled(&self) -> bool {
        self.state.lock().trace
    }
}

/// Unencrypted filter over an in-process pipe.
pub struct MemoryFilter {
    pipe: MemoryPipe,
    selector: Arc<dyn ReadinessSelector>,
}

impl MemoryFilter {
    /// Creates a filter bound to `selector` plus the test-side pipe handle.
    pub fn new(selector: Arc<dyn ReadinessSelector>) -> (Self, MemoryPipe) {
        let pipe = MemoryPipe::default();
        let filter = Self {
            pipe: pipe.clone(),
            selector,
        };
        (filter, pipe)
    }
}

impl TransportFilter for MemoryFilter {
    fn read(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        let mut state = self.pipe.state.lock();
        if state.inbound.is_empty() {
            if state.inbound_closed {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "end of stream on memory pipe",
                ));
            }
            return Ok(0);
        }

        let count = buffers::capacity(bufs).min(state.inbound.len());
        let chunk: Vec<u8> = state.inbound.drain(..count).collect();
        Ok(buffers::scatter(&chunk, bufs))
    }

    fn write(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut data = Vec::new();
        buffers::gather_into(bufs, 0, &mut data);

        let mut state = self.pipe.state.lock();
        let accepted = state
            .write_budget
            .map_or(data.len(), |budget| budget.min(data.len()));
        state.outbound.extend_from_slice(&data[..accepted]);
        Ok(accepted)
    }

    fn is_encrypted(&self) -> bool {
        false
    }

    fn name(&self, verbose: bool) -> String {
        if verbose {
            "None (Memory) in-process".to_string()
        } else {
            "None (Memory)".to_string()
        }
    }

    fn has_buffered_read(&self) -> bool {
        self.pipe.state.lock().buffered_read
    }

    fn set_trace(&mut self, on: bool) {
        self.pipe.state.lock().trace = on;
    }

    fn selector(&self) -> &dyn ReadinessSelector {
        &*self.selector
    }
}
