//! Scenario runner driving scheduler passes against a manual clock.
//!
//! The runner owns the scheduler's pass loop instead of a thread, so a run
//! is a pure function of its [`ScenarioConfig`]: the same seed always yields
//! the same report.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use undertow_core::clock::{ClockSource, ManualClock};
use undertow_core::config::{RateLimitConfig, SchedulerConfig};
use undertow_core::network::{SpeedTokenDispenser, TokenBucketDispenser};
use undertow_core::scheduler::{PeerInstance, SchedulerWorker, TickScheduler};

use crate::SimulationError;
use crate::invariants::{
    FailureIsolationInvariant, Invariant, NoTickAfterUnregisterInvariant, RateLimitInvariant,
    TickSpacingInvariant,
};
use crate::peers::{CountingPeer, FailingPeer, FailureMode, SlowPeer, TickLog, TransferPeer};
use crate::report::{PeerKind, PeerReport, SimulationReport};
use crate::rng::DeterministicRng;

/// Simulated time at which every run starts.
pub const SIMULATION_START_MS: u64 = 1_000_000;

/// Bytes a transfer peer asks the dispenser for per tick.
const TRANSFER_CHUNK_SIZE: u64 = 16 * 1024;

/// Shape of a simulated run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Scenario name used in the report
    pub name: String,
    /// Seed for jitter, churn and peer behaviour
    pub seed: u64,
    /// Scheduler tick period
    pub period_ms: u64,
    /// Simulated time between two scheduler passes
    pub pass_interval_ms: u64,
    /// Simulated length of the run
    pub duration_ms: u64,
    /// Peers that only count ticks
    pub counting_peers: usize,
    /// Peers that fail every few ticks
    pub failing_peers: usize,
    /// Whether failing peers panic instead of returning errors
    pub failures_panic: bool,
    /// Peers that stall the clock on every tick
    pub slow_peers: usize,
    /// Stall per slow tick
    pub slow_tick_ms: u64,
    /// Peers moving bytes through transports
    pub transfer_peers: usize,
    /// Shared download limit in bytes per second (None = unlimited)
    pub download_limit: Option<u64>,
    /// Chance per pass that a counting peer is replaced by a fresh one
    pub churn_probability: f64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            name: "steady".to_string(),
            seed: 0,
            period_ms: 50,
            pass_interval_ms: 10,
            duration_ms: 2_000,
            counting_peers: 8,
            failing_peers: 0,
            failures_panic: false,
            slow_peers: 0,
            slow_tick_ms: 0,
            transfer_peers: 0,
            download_limit: None,
            churn_probability: 0.0,
        }
    }
}

impl ScenarioConfig {
    /// Counting peers only; every peer ticks once per period.
    pub fn steady(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    /// Peers are unregistered and replaced while the scheduler runs.
    pub fn churn(seed: u64) -> Self {
        Self {
            name: "churn".to_string(),
            seed,
            counting_peers: 16,
            churn_probability: 0.2,
            ..Self::default()
        }
    }

    /// Failing and panicking peers mixed with healthy ones.
    pub fn faults(seed: u64) -> Self {
        Self {
            name: "faults".to_string(),
            seed,
            failing_peers: 4,
            failures_panic: true,
            ..Self::default()
        }
    }

    /// A slow consumer stalls the scheduler thread.
    pub fn stall(seed: u64) -> Self {
        Self {
            name: "stall".to_string(),
            seed,
            counting_peers: 4,
            slow_peers: 1,
            slow_tick_ms: 1_500,
            duration_ms: 10_000,
            ..Self::default()
        }
    }

    /// Transfer peers sharing a download limit.
    pub fn rate_limited(seed: u64) -> Self {
        Self {
            name: "rate_limited".to_string(),
            seed,
            counting_peers: 0,
            transfer_peers: 4,
            download_limit: Some(256 * 1024),
            ..Self::default()
        }
    }

    /// Looks up a preset by name.
    pub fn preset(name: &str, seed: u64) -> Option<Self> {
        match name {
            "steady" => Some(Self::steady(seed)),
            "churn" => Some(Self::churn(seed)),
            "faults" => Some(Self::faults(seed)),
            "stall" => Some(Self::stall(seed)),
            "rate_limited" => Some(Self::rate_limited(seed)),
            _ => None,
        }
    }

    /// Names accepted by [`preset`](Self::preset).
    pub fn preset_names() -> &'static [&'static str] {
        &["steady", "churn", "faults", "stall", "rate_limited"]
    }

    /// Checks the configuration can be run.
    ///
    /// # Errors
    ///
    /// - `SimulationError::InvalidConfig` - If a timing value is zero or the churn
    ///   probability is outside `[0, 1]`
    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.period_ms == 0 || self.pass_interval_ms == 0 {
            return Err(SimulationError::InvalidConfig {
                reason: "period and pass interval must be at least 1ms".to_string(),
            });
        }
        if self.duration_ms == 0 {
            return Err(SimulationError::InvalidConfig {
                reason: "duration must be at least 1ms".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.churn_probability) {
            return Err(SimulationError::InvalidConfig {
                reason: format!(
                    "churn probability {} is outside [0, 1]",
                    self.churn_probability
                ),
            });
        }
        Ok(())
    }
}

struct Tracked<P> {
    peer: Arc<P>,
    unregistered_at: Option<u64>,
}

impl<P> Tracked<P> {
    fn new(peer: Arc<P>) -> Self {
        Self {
            peer,
            unregistered_at: None,
        }
    }
}

/// Runs one scenario to completion.
pub struct ScenarioRunner {
    config: ScenarioConfig,
    clock: Arc<ManualClock>,
    scheduler: TickScheduler,
    worker: SchedulerWorker,
    rng: DeterministicRng,
    counting: Vec<Tracked<CountingPeer>>,
    failing: Vec<Arc<FailingPeer>>,
    slow: Vec<Arc<SlowPeer>>,
    transfer: Vec<Arc<TransferPeer>>,
    burst_capacity: Option<u64>,
}

impl ScenarioRunner {
    /// Builds the scheduler and peers described by `config`.
    ///
    /// # Errors
    ///
    /// - `SimulationError::InvalidConfig` - If the configuration is invalid
    /// - `SimulationError::Scheduler` - If the pass loop cannot be taken
    pub fn new(config: ScenarioConfig) -> Result<Self, SimulationError> {
        config.validate()?;

        let mut rng = DeterministicRng::from_seed(config.seed);
        let clock = ManualClock::new(SIMULATION_START_MS);
        let clock_source: Arc<dyn ClockSource> = clock.clone();

        let rate_limit = RateLimitConfig {
            download_limit: config.download_limit,
            ..RateLimitConfig::default()
        };
        let dispenser = TokenBucketDispenser::from_config(&rate_limit, Arc::clone(&clock_source));
        let burst_capacity = dispenser.capacity();
        let dispenser: Arc<dyn SpeedTokenDispenser> = Arc::new(dispenser);

        let scheduler = TickScheduler::new(
            SchedulerConfig {
                schedule_period: Duration::from_millis(config.period_ms),
                jitter_seed: Some(rng.derive_seed()),
                ..SchedulerConfig::default()
            },
            Arc::clone(&clock_source),
            Arc::clone(&dispenser),
        );

        let counting: Vec<_> = (0..config.counting_peers)
            .map(|index| Tracked::new(CountingPeer::new(format!("counting-{index}"))))
            .collect();
        let failure_mode = if config.failures_panic {
            FailureMode::Panic
        } else {
            FailureMode::Error
        };
        let failing: Vec<_> = (0..config.failing_peers)
            .map(|index| {
                let fail_every = rng.random_range(2, 5);
                FailingPeer::new(format!("failing-{index}"), fail_every, failure_mode)
            })
            .collect();
        let slow: Vec<_> = (0..config.slow_peers)
            .map(|index| {
                SlowPeer::new(
                    format!("slow-{index}"),
                    Arc::clone(&clock),
                    Duration::from_millis(config.slow_tick_ms),
                )
            })
            .collect();
        let transfer: Vec<_> = (0..config.transfer_peers)
            .map(|index| {
                TransferPeer::new(
                    format!("transfer-{index}"),
                    Arc::clone(&clock_source),
                    Arc::clone(&dispenser),
                    TRANSFER_CHUNK_SIZE,
                    None,
                )
            })
            .collect();

        for tracked in &counting {
            scheduler.register(tracked.peer.clone());
        }
        for peer in &failing {
            scheduler.register(peer.clone());
        }
        for peer in &slow {
            scheduler.register(peer.clone());
        }
        for peer in &transfer {
            scheduler.register(peer.clone());
        }

        let worker = scheduler.take_worker()?;
        info!(
            "Scenario '{}' prepared: seed={} instances={}",
            config.name,
            config.seed,
            scheduler.instance_count()
        );

        Ok(Self {
            config,
            clock,
            scheduler,
            worker,
            rng,
            counting,
            failing,
            slow,
            transfer,
            burst_capacity,
        })
    }

    /// Runs passes until the configured duration has elapsed and checks
    /// the invariants that apply to the scenario.
    pub fn run(mut self) -> SimulationReport {
        let end = SIMULATION_START_MS + self.config.duration_ms;
        let interval = Duration::from_millis(self.config.pass_interval_ms);
        let mut passes = 0;

        while self.clock.monotonic_millis() < end {
            self.maybe_churn();
            let outcome = self.worker.run_pass();
            passes += 1;
            debug!(
                "Pass {passes} at {}: ticked={} active={}",
                outcome.now, outcome.ticked, outcome.active
            );
            self.clock.advance(interval);
        }

        let mut report = SimulationReport {
            scenario: self.config.name.clone(),
            seed: self.config.seed,
            start_ms: SIMULATION_START_MS,
            end_ms: self.clock.monotonic_millis(),
            passes,
            scheduler: self.scheduler.stats(),
            peers: self.peer_reports(),
            violations: Vec::new(),
        };
        for invariant in self.invariants() {
            if let Err(violation) = invariant.check(&report) {
                report.violations.push(violation);
            }
        }

        info!(
            "Scenario '{}' finished: passes={} ticks={} violations={}",
            report.scenario,
            report.passes,
            report.scheduler.total_ticks,
            report.violations.len()
        );
        report
    }

    fn maybe_churn(&mut self) {
        let probability = self.config.churn_probability;
        if probability <= 0.0 || !self.rng.random_bool(probability) {
            return;
        }

        let live: Vec<usize> = self
            .counting
            .iter()
            .enumerate()
            .filter(|(_, tracked)| tracked.unregistered_at.is_none())
            .map(|(index, _)| index)
            .collect();
        let Some(choice) = self.rng.choose_index(live.len()) else {
            return;
        };

        let now = self.clock.monotonic_millis();
        let retired = &mut self.counting[live[choice]];
        self.scheduler.unregister(&retired.peer);
        retired.unregistered_at = Some(now);

        let replacement = CountingPeer::new(format!("counting-{}", self.counting.len()));
        self.scheduler.register(replacement.clone());
        self.counting.push(Tracked::new(replacement));
    }

    fn invariants(&self) -> Vec<Box<dyn Invariant>> {
        let mut invariants: Vec<Box<dyn Invariant>> = vec![
            Box::new(NoTickAfterUnregisterInvariant),
            Box::new(FailureIsolationInvariant),
        ];
        if self.slow.is_empty() {
            invariants.push(Box::new(TickSpacingInvariant::new(
                self.config.period_ms + self.config.pass_interval_ms,
            )));
        }
        if let (Some(rate), Some(burst)) = (self.config.download_limit, self.burst_capacity) {
            invariants.push(Box::new(RateLimitInvariant::new(rate, burst)));
        }
        invariants
    }

    fn peer_reports(&self) -> Vec<PeerReport> {
        let mut reports = Vec::new();
        for tracked in &self.counting {
            reports.push(peer_report(
                tracked.peer.name(),
                PeerKind::Counting,
                tracked.peer.log(),
                0,
                tracked.unregistered_at,
                0,
            ));
        }
        for peer in &self.failing {
            reports.push(peer_report(
                peer.name(),
                PeerKind::Failing,
                peer.log(),
                peer.failures(),
                None,
                0,
            ));
        }
        for peer in &self.slow {
            reports.push(peer_report(peer.name(), PeerKind::Slow, peer.log(), 0, None, 0));
        }
        for peer in &self.transfer {
            reports.push(peer_report(
                peer.name(),
                PeerKind::Transfer,
                peer.log(),
                0,
                None,
                peer.delivered(),
            ));
        }
        reports
    }
}

fn peer_report(
    name: String,
    kind: PeerKind,
    log: &TickLog,
    failures: u64,
    unregistered_at: Option<u64>,
    bytes_delivered: u64,
) -> PeerReport {
    let ticks = log.tick_times();
    PeerReport {
        name,
        kind,
        ticks: ticks.len(),
        first_tick: ticks.first().copied(),
        last_tick: ticks.last().copied(),
        max_gap_ms: log.max_gap(),
        failures,
        unregistered_at,
        bytes_delivered,
    }
}

/// Runs the scenario described by `config`.
///
/// # Errors
///
/// - `SimulationError` - If the scenario cannot be built or run
pub fn run_scenario(config: ScenarioConfig) -> Result<SimulationReport, SimulationError> {
    Ok(ScenarioRunner::new(config)?.run())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ScenarioConfig {
            period_ms: 0,
            ..ScenarioConfig::default()
        };

        assert!(matches!(
            ScenarioRunner::new(config),
            Err(SimulationError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_churn_probability_must_be_a_probability() {
        let config = ScenarioConfig {
            churn_probability: 1.5,
            ..ScenarioConfig::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_steady_scenario_ticks_every_peer_once_per_period() {
        let report = run_scenario(ScenarioConfig::steady(11)).unwrap();

        assert!(report.is_clean(), "violations: {:?}", report.violations);
        assert_eq!(report.passes, 200);
        for peer in &report.peers {
            // 2000ms at a 50ms period.
            assert!((39..=41).contains(&peer.ticks), "{} ticked {}", peer.name, peer.ticks);
        }
    }

    #[test]
    fn test_same_seed_same_report() {
        let first = run_scenario(ScenarioConfig::churn(5)).unwrap();
        let second = run_scenario(ScenarioConfig::churn(5)).unwrap();

        assert_eq!(first.peers, second.peers);
        assert_eq!(first.scheduler, second.scheduler);
    }

    #[test]
    fn test_presets_resolve_by_name() {
        for name in ScenarioConfig::preset_names() {
            let config = ScenarioConfig::preset(name, 1).unwrap();
            assert_eq!(config.name, *name);
        }
        assert!(ScenarioConfig::preset("unknown", 1).is_none());
    }
}
