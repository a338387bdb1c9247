//! Integration tests for Undertow
//!
//! These tests exercise the scheduler, transports and rate limiting together:
//! deterministic scenarios through the simulation crate, and real sockets
//! through the mio selector.

#[path = "style.rs"]
mod style;

#[path = "integration/scheduler_scenarios.rs"]
mod scheduler_scenarios;

#[path = "integration/loopback_transport.rs"]
mod loopback_transport;

#[path = "integration/scheduled_transfer.rs"]
mod scheduled_transfer;

#[path = "integration/rate_limiting.rs"]
mod rate_limiting;
