//! Readiness selector contract.
//!
//! A selector watches one byte stream for read/write readiness and reports
//! edges to registered listeners from its own thread. After reporting an edge
//! for a direction it stays quiet for that direction until the consumer asks
//! for more with `resume_read_selects` / `resume_write_selects`.

use std::any::Any;
use std::io;
use std::sync::Arc;

/// Opaque value handed back to a listener on every callback.
pub type Attachment = Arc<dyn Any + Send + Sync>;

/// Receives readiness edges for one direction of a selected stream.
pub trait SelectListener: Send + Sync {
    /// The direction became ready.
    ///
    /// Returns `true` if this caused a not-ready to ready transition, which
    /// the selector uses to tell useful wakeups from redundant ones.
    fn select_success(
        &self,
        selector: &dyn ReadinessSelector,
        attachment: Option<&Attachment>,
    ) -> bool;

    /// Selecting failed; `cause` describes the socket error.
    fn select_failure(
        &self,
        selector: &dyn ReadinessSelector,
        attachment: Option<&Attachment>,
        cause: io::Error,
    );
}

/// OS-level readiness notifier for a single stream.
pub trait ReadinessSelector: Send + Sync {
    /// Registers the listener for read readiness, replacing any previous one.
    fn register_for_read_selects(
        &self,
        listener: Arc<dyn SelectListener>,
        attachment: Option<Attachment>,
    );

    /// Registers the listener for write readiness, replacing any previous one.
    fn register_for_write_selects(
        &self,
        listener: Arc<dyn SelectListener>,
        attachment: Option<Attachment>,
    );

    /// Re-arms read readiness reporting.
    fn resume_read_selects(&self);

    /// Re-arms write readiness reporting.
    fn resume_write_selects(&self);

    /// Stops all reporting for this stream. Later callbacks are dropped.
    fn cancel_selects(&self) {}
}
