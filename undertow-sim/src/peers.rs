//! Simulated peer instances for scheduler scenarios.
//!
//! Each peer records what the scheduler did to it so the runner can check
//! tick spacing, failure isolation and rate limiting after the fact.

use std::io::IoSlice;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use undertow_core::clock::{ClockSource, ManualClock};
use undertow_core::network::test_support::{ManualSelector, MemoryFilter, MemoryPipe};
use undertow_core::network::{SpeedTokenDispenser, Transport};
use undertow_core::scheduler::PeerInstance;

/// Tick history shared by every simulated peer.
#[derive(Debug, Default)]
pub struct TickLog {
    ticks: Mutex<Vec<u64>>,
}

impl TickLog {
    fn record(&self, now: u64) {
        self.ticks.lock().push(now);
    }

    /// Times at which the peer was ticked, in order.
    pub fn tick_times(&self) -> Vec<u64> {
        self.ticks.lock().clone()
    }

    /// Number of ticks received.
    pub fn count(&self) -> usize {
        self.ticks.lock().len()
    }

    /// Largest gap between two consecutive ticks.
    pub fn max_gap(&self) -> Option<u64> {
        self.ticks
            .lock()
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .max()
    }
}

/// Peer whose ticks only get counted.
#[derive(Debug)]
pub struct CountingPeer {
    name: String,
    log: TickLog,
}

impl CountingPeer {
    /// Creates a counting peer.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            log: TickLog::default(),
        })
    }

    /// Tick history of this peer.
    pub fn log(&self) -> &TickLog {
        &self.log
    }
}

impl PeerInstance for CountingPeer {
    fn tick(&self, now_millis: u64) -> anyhow::Result<()> {
        self.log.record(now_millis);
        Ok(())
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// How a [`FailingPeer`] misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// The tick returns an error
    Error,
    /// The tick panics
    Panic,
}

/// Peer that fails every `fail_every`-th tick.
#[derive(Debug)]
pub struct FailingPeer {
    name: String,
    fail_every: u64,
    mode: FailureMode,
    log: TickLog,
    failures: AtomicU64,
}

impl FailingPeer {
    /// Creates a peer failing on every `fail_every`-th tick (at least every tick).
    pub fn new(name: impl Into<String>, fail_every: u64, mode: FailureMode) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            fail_every: fail_every.max(1),
            mode,
            log: TickLog::default(),
            failures: AtomicU64::new(0),
        })
    }

    /// Tick history of this peer, failed ticks included.
    pub fn log(&self) -> &TickLog {
        &self.log
    }

    /// Number of ticks that failed.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl PeerInstance for FailingPeer {
    fn tick(&self, now_millis: u64) -> anyhow::Result<()> {
        self.log.record(now_millis);
        if self.log.count() as u64 % self.fail_every != 0 {
            return Ok(());
        }

        self.failures.fetch_add(1, Ordering::Relaxed);
        match self.mode {
            FailureMode::Error => anyhow::bail!("{} refused the tick at {now_millis}", self.name),
            FailureMode::Panic => panic!("{} crashed at {now_millis}", self.name),
        }
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Peer whose tick takes `delay` of simulated time.
///
/// Advancing the shared manual clock from inside the tick is how a scenario
/// models a consumer that blocks the scheduler thread.
pub struct SlowPeer {
    name: String,
    clock: Arc<ManualClock>,
    delay: Duration,
    log: TickLog,
}

impl SlowPeer {
    /// Creates a peer stalling the clock by `delay` on every tick.
    pub fn new(name: impl Into<String>, clock: Arc<ManualClock>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            clock,
            delay,
            log: TickLog::default(),
        })
    }

    /// Tick history of this peer.
    pub fn log(&self) -> &TickLog {
        &self.log
    }
}

impl PeerInstance for SlowPeer {
    fn tick(&self, now_millis: u64) -> anyhow::Result<()> {
        self.log.record(now_millis);
        self.clock.advance(self.delay);
        Ok(())
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Peer pushing bytes through a transport, paced by the speed token dispenser.
///
/// The transport writes into an in-memory pipe that accepts at most
/// `link_budget` bytes per write, so partial writes re-arm write readiness
/// and the peer waits for the simulated selector to report it again.
pub struct TransferPeer {
    name: String,
    transport: Mutex<Transport>,
    pipe: MemoryPipe,
    selector: Arc<ManualSelector>,
    dispenser: Arc<dyn SpeedTokenDispenser>,
    chunk_size: u64,
    delivered: AtomicU64,
    log: TickLog,
}

impl TransferPeer {
    /// Creates a connected transfer peer.
    pub fn new(
        name: impl Into<String>,
        clock: Arc<dyn ClockSource>,
        dispenser: Arc<dyn SpeedTokenDispenser>,
        chunk_size: u64,
        link_budget: Option<usize>,
    ) -> Arc<Self> {
        let selector = ManualSelector::new();
        let (filter, pipe) = MemoryFilter::new(selector.clone());
        pipe.set_write_budget(link_budget);

        let mut transport = Transport::new(clock);
        transport.begin_connect();
        transport.set_filter(Box::new(filter));
        transport.connected_outbound();
        selector.fire_write_ready();

        Arc::new(Self {
            name: name.into(),
            transport: Mutex::new(transport),
            pipe,
            selector,
            dispenser,
            chunk_size,
            delivered: AtomicU64::new(0),
            log: TickLog::default(),
        })
    }

    /// Bytes that reached the far end of the pipe.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Bytes accepted by the transport.
    pub fn bytes_written(&self) -> u64 {
        self.transport.lock().bytes_written()
    }

    /// Tick history of this peer.
    pub fn log(&self) -> &TickLog {
        &self.log
    }
}

impl PeerInstance for TransferPeer {
    fn tick(&self, now_millis: u64) -> anyhow::Result<()> {
        self.log.record(now_millis);

        let mut transport = self.transport.lock();
        if !transport.is_ready_for_write(None) {
            // The link drained since the last tick.
            self.selector.fire_write_ready();
            return Ok(());
        }

        let granted = self.dispenser.dispense(self.chunk_size);
        if granted == 0 {
            return Ok(());
        }

        let payload = vec![0x5a; granted as usize];
        let written = transport.write(&[IoSlice::new(&payload)])? as u64;
        self.dispenser.return_unused(granted - written);

        let drained = self.pipe.take_outbound().len() as u64;
        self.delivered.fetch_add(drained, Ordering::Relaxed);
        Ok(())
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use undertow_core::network::TokenBucketDispenser;

    use super::*;

    #[test]
    fn test_tick_log_gaps() {
        let peer = CountingPeer::new("counter");
        for now in [100, 150, 260, 300] {
            peer.tick(now).unwrap();
        }

        assert_eq!(peer.log().count(), 4);
        assert_eq!(peer.log().max_gap(), Some(110));
        assert_eq!(peer.name(), "counter");
    }

    #[test]
    fn test_failing_peer_fails_on_schedule() {
        let peer = FailingPeer::new("flaky", 3, FailureMode::Error);

        let results: Vec<bool> = (0..6).map(|now| peer.tick(now).is_ok()).collect();

        assert_eq!(results, vec![true, true, false, true, true, false]);
        assert_eq!(peer.failures(), 2);
    }

    #[test]
    #[should_panic(expected = "crasher crashed at 0")]
    fn test_panicking_peer_panics() {
        let peer = FailingPeer::new("crasher", 1, FailureMode::Panic);
        let _ = peer.tick(0);
    }

    #[test]
    fn test_slow_peer_advances_clock() {
        let clock = ManualClock::new(1_000);
        let peer = SlowPeer::new("slow", clock.clone(), Duration::from_millis(300));

        peer.tick(1_000).unwrap();

        assert_eq!(clock.monotonic_millis(), 1_300);
    }

    #[test]
    fn test_transfer_peer_respects_link_budget() {
        let clock = ManualClock::new(0);
        let dispenser = Arc::new(TokenBucketDispenser::unlimited());
        let peer = TransferPeer::new("xfer", clock, dispenser, 1_000, Some(400));

        peer.tick(0).unwrap();
        assert_eq!(peer.delivered(), 400);

        // Partial write disarmed write readiness; this tick only re-arms it.
        peer.tick(50).unwrap();
        assert_eq!(peer.delivered(), 400);

        peer.tick(100).unwrap();
        assert_eq!(peer.delivered(), 800);
        assert_eq!(peer.bytes_written(), 800);
    }

    #[test]
    fn test_transfer_peer_is_paced_by_dispenser() {
        let clock = ManualClock::new(0);
        let dispenser = Arc::new(TokenBucketDispenser::limited(1_000, 1.0, clock.clone()));
        let peer = TransferPeer::new("paced", clock.clone(), dispenser, 600, None);

        peer.tick(0).unwrap();
        peer.tick(0).unwrap();
        assert_eq!(peer.delivered(), 1_000);

        clock.advance(Duration::from_millis(100));
        peer.tick(100).unwrap();
        assert_eq!(peer.delivered(), 1_100);
    }
}
