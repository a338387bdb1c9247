//! Undertow Core - network engine of a peer-to-peer file sharing client
//!
//! This crate provides the runtime underneath peer connections: a cooperative
//! tick scheduler that drives every peer instance from one thread, non-blocking
//! transports with pluggable filters and edge-triggered readiness, a mio based
//! selector, and the rate limiting token dispenser shared by all peers.

pub mod clock;
pub mod config;
pub mod network;
pub mod scheduler;
pub mod tracing_setup;
pub mod waiter;

// Re-export main types for convenient access
pub use clock::{ClockSource, ManualClock, SystemClock};
pub use config::{ConfigError, UndertowConfig};
pub use network::{Transport, TransportError, TransportFilter};
pub use scheduler::{PeerInstance, SchedulerError, TickScheduler};
pub use waiter::EventWaiter;

/// Core errors that can bubble up from any Undertow subsystem.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UndertowError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            UndertowError::Transport(e) => match e {
                TransportError::Closed => "Connection already closed".to_string(),
                TransportError::NotReady => "Connection not ready yet".to_string(),
                TransportError::ReadSelectFailure { cause }
                | TransportError::WriteSelectFailure { cause } => {
                    format!("Connection failed: {cause}")
                }
                TransportError::Io(_) => "Connection error occurred".to_string(),
            },
            UndertowError::Scheduler(_) => "Scheduler error occurred".to_string(),
            UndertowError::Config(e) => format!("Invalid configuration: {e}"),
            UndertowError::Io(_) => "System I/O error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(self, UndertowError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;
