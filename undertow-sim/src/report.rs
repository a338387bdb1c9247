//! Serializable outcome of a scenario run.

use serde::{Deserialize, Serialize};
use undertow_core::scheduler::SchedulerStatsSnapshot;

use crate::SimulationError;
use crate::invariants::InvariantViolation;

/// Kind of simulated peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    /// Only counts ticks
    Counting,
    /// Fails some of its ticks
    Failing,
    /// Stalls the clock on every tick
    Slow,
    /// Moves bytes through a transport
    Transfer,
}

/// What happened to one peer during the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerReport {
    /// Peer name
    pub name: String,
    /// Peer kind
    pub kind: PeerKind,
    /// Ticks received
    pub ticks: usize,
    /// Time of the first tick
    pub first_tick: Option<u64>,
    /// Time of the last tick
    pub last_tick: Option<u64>,
    /// Largest gap between consecutive ticks
    pub max_gap_ms: Option<u64>,
    /// Ticks that failed
    pub failures: u64,
    /// Time at which the peer was unregistered, if it was
    pub unregistered_at: Option<u64>,
    /// Bytes delivered through the peer's transport
    pub bytes_delivered: u64,
}

/// Complete record of one scenario run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    /// Scenario name
    pub scenario: String,
    /// Seed the run was derived from
    pub seed: u64,
    /// Simulated time at which the run started
    pub start_ms: u64,
    /// Simulated time at which the run ended
    pub end_ms: u64,
    /// Scheduler passes executed
    pub passes: u64,
    /// Scheduler counters at the end of the run
    pub scheduler: SchedulerStatsSnapshot,
    /// Per-peer results, registration order
    pub peers: Vec<PeerReport>,
    /// Invariants that did not hold
    pub violations: Vec<InvariantViolation>,
}

impl SimulationReport {
    /// True when every invariant held.
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// Simulated duration of the run.
    pub fn elapsed_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    /// Bytes delivered by all transfer peers.
    pub fn total_delivered(&self) -> u64 {
        self.peers.iter().map(|peer| peer.bytes_delivered).sum()
    }

    /// Peers of the given kind.
    pub fn peers_of(&self, kind: PeerKind) -> impl Iterator<Item = &PeerReport> {
        self.peers.iter().filter(move |peer| peer.kind == kind)
    }

    /// Pretty-printed JSON form of the report.
    ///
    /// # Errors
    ///
    /// - `SimulationError::Serialization` - If the report cannot be encoded
    pub fn to_json(&self) -> Result<String, SimulationError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
