//! Invariant checking framework for simulation validation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::report::{PeerKind, SimulationReport};

/// Violation of a simulation invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: String,
    /// Detailed description of the violation
    pub description: String,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invariant '{}' violated: {}", self.invariant, self.description)
    }
}

/// Trait for checking simulation invariants.
pub trait Invariant: Send + Sync {
    /// Checks if invariant holds for a finished run.
    ///
    /// # Errors
    /// Returns `InvariantViolation` if the invariant condition is not met.
    fn check(&self, report: &SimulationReport) -> Result<(), InvariantViolation>;

    /// Returns name of this invariant.
    fn name(&self) -> &str;

    /// Builds a violation of this invariant.
    fn violation(&self, description: String) -> InvariantViolation {
        InvariantViolation {
            invariant: self.name().to_string(),
            description,
        }
    }
}

/// Ensures no peer waits much longer than one period between ticks.
///
/// Only meaningful when nothing stalls the clock.
pub struct TickSpacingInvariant {
    max_gap_ms: u64,
}

impl TickSpacingInvariant {
    /// Creates invariant allowing gaps up to `max_gap_ms`.
    pub fn new(max_gap_ms: u64) -> Self {
        Self { max_gap_ms }
    }
}

impl Invariant for TickSpacingInvariant {
    fn check(&self, report: &SimulationReport) -> Result<(), InvariantViolation> {
        for peer in &report.peers {
            if let Some(gap) = peer.max_gap_ms.filter(|gap| *gap > self.max_gap_ms) {
                return Err(self.violation(format!(
                    "{} waited {gap}ms between ticks, limit {}ms",
                    peer.name, self.max_gap_ms
                )));
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "TickSpacing"
    }
}

/// Ensures unregistered peers are never ticked again.
pub struct NoTickAfterUnregisterInvariant;

impl Invariant for NoTickAfterUnregisterInvariant {
    fn check(&self, report: &SimulationReport) -> Result<(), InvariantViolation> {
        for peer in &report.peers {
            let (Some(removed), Some(last)) = (peer.unregistered_at, peer.last_tick) else {
                continue;
            };
            if last >= removed {
                return Err(self.violation(format!(
                    "{} ticked at {last} after being unregistered at {removed}",
                    peer.name
                )));
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "NoTickAfterUnregister"
    }
}

/// Ensures failing peers do not starve the others.
pub struct FailureIsolationInvariant;

impl Invariant for FailureIsolationInvariant {
    fn check(&self, report: &SimulationReport) -> Result<(), InvariantViolation> {
        let any_failures = report.peers.iter().any(|peer| peer.failures > 0);
        if !any_failures {
            return Ok(());
        }

        let starved = report
            .peers
            .iter()
            .filter(|peer| peer.kind != PeerKind::Failing && peer.unregistered_at.is_none())
            .find(|peer| peer.ticks == 0);
        match starved {
            Some(peer) => Err(self.violation(format!(
                "{} never ticked while other peers were failing",
                peer.name
            ))),
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "FailureIsolation"
    }
}

/// Ensures transfer peers together stay within the download limit.
pub struct RateLimitInvariant {
    rate: u64,
    burst: u64,
}

impl RateLimitInvariant {
    /// Creates invariant for `rate` bytes per second plus an initial `burst`.
    pub fn new(rate: u64, burst: u64) -> Self {
        Self { rate, burst }
    }
}

impl Invariant for RateLimitInvariant {
    fn check(&self, report: &SimulationReport) -> Result<(), InvariantViolation> {
        let allowed = self.burst + self.rate * report.elapsed_ms() / 1000;
        let delivered = report.total_delivered();
        if delivered > allowed {
            return Err(self.violation(format!(
                "delivered {delivered} bytes, at most {allowed} allowed"
            )));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "RateLimit"
    }
}

#[cfg(test)]
mod tests {
    use undertow_core::scheduler::SchedulerStatsSnapshot;

    use super::*;
    use crate::report::PeerReport;

    fn report(peers: Vec<PeerReport>) -> SimulationReport {
        SimulationReport {
            scenario: "test".to_string(),
            seed: 0,
            start_ms: 0,
            end_ms: 1_000,
            passes: 100,
            scheduler: SchedulerStatsSnapshot::default(),
            peers,
            violations: Vec::new(),
        }
    }

    fn peer(name: &str, kind: PeerKind) -> PeerReport {
        PeerReport {
            name: name.to_string(),
            kind,
            ticks: 10,
            first_tick: Some(20),
            last_tick: Some(950),
            max_gap_ms: Some(60),
            failures: 0,
            unregistered_at: None,
            bytes_delivered: 0,
        }
    }

    #[test]
    fn test_tick_spacing_detects_long_gap() {
        let mut late = peer("late", PeerKind::Counting);
        late.max_gap_ms = Some(400);
        let report = report(vec![peer("ok", PeerKind::Counting), late]);

        assert!(TickSpacingInvariant::new(60).check(&report).is_err());
        assert!(TickSpacingInvariant::new(400).check(&report).is_ok());
    }

    #[test]
    fn test_tick_after_unregister_is_violation() {
        let mut removed = peer("gone", PeerKind::Counting);
        removed.unregistered_at = Some(900);
        let report = report(vec![removed]);

        let violation = NoTickAfterUnregisterInvariant.check(&report).unwrap_err();

        assert_eq!(violation.invariant, "NoTickAfterUnregister");
        assert!(violation.to_string().contains("gone"));
    }

    #[test]
    fn test_starved_peer_next_to_failures_is_violation() {
        let mut failing = peer("flaky", PeerKind::Failing);
        failing.failures = 3;
        let mut starved = peer("starved", PeerKind::Counting);
        starved.ticks = 0;

        assert!(FailureIsolationInvariant.check(&report(vec![failing.clone()])).is_ok());
        assert!(
            FailureIsolationInvariant
                .check(&report(vec![failing, starved]))
                .is_err()
        );
    }

    #[test]
    fn test_rate_limit_allows_burst_plus_rate() {
        let mut transfer = peer("xfer", PeerKind::Transfer);
        transfer.bytes_delivered = 3_000;

        assert!(RateLimitInvariant::new(1_000, 2_000).check(&report(vec![transfer.clone()])).is_ok());
        transfer.bytes_delivered = 3_001;
        assert!(RateLimitInvariant::new(1_000, 2_000).check(&report(vec![transfer])).is_err());
    }
}
