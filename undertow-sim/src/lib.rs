//! Undertow Simulation Framework - Deterministic testing for the tick scheduler.
//!
//! This crate drives the Undertow scheduler and transports under controlled,
//! reproducible conditions. The scheduler's pass loop is run by hand against a
//! manual clock, so a scenario never depends on wall-clock timing.
//!
//! # Features
//!
//! - **Deterministic Execution**: Same seed always produces identical results
//! - **Simulated Peers**: Counting, failing, stalling and transferring peers
//! - **Invariant Checking**: Tick spacing, isolation and rate limits validated after each run
//! - **Serializable Reports**: Every run produces a JSON-ready report
//!
//! # Example
//!
//! ```rust
//! use undertow_sim::{ScenarioConfig, run_scenario};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let report = run_scenario(ScenarioConfig::steady(12345))?;
//! assert!(report.is_clean());
//! println!("{} ticks over {} passes", report.scheduler.total_ticks, report.passes);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]

pub mod invariants;
pub mod peers;
pub mod report;
pub mod rng;
pub mod runner;

pub use invariants::{Invariant, InvariantViolation};
pub use peers::{CountingPeer, FailingPeer, FailureMode, SlowPeer, TickLog, TransferPeer};
pub use report::{PeerKind, PeerReport, SimulationReport};
pub use rng::DeterministicRng;
pub use runner::{SIMULATION_START_MS, ScenarioConfig, ScenarioRunner, run_scenario};
use undertow_core::scheduler::SchedulerError;

/// Errors that can occur while building or reporting a simulation.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    /// Scenario configuration cannot be run
    #[error("Invalid scenario configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration
        reason: String,
    },

    /// The scheduler refused to hand out its pass loop
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// The report could not be encoded
    #[error("Report serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
