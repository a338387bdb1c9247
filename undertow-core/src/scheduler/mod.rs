//! Cooperative tick scheduler for peer instances.
//!
//! Every registered [`PeerInstance`] is ticked roughly once per schedule
//! period on a single dedicated thread. Registration never blocks on tick
//! work: changes are queued and merged at the start of the next pass.

mod registry;
mod stats;
mod worker;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

pub use registry::ScheduledInstance;
pub use stats::SchedulerStatsSnapshot;
pub use worker::{PassOutcome, SchedulerWorker, next_target};

use self::registry::{Registry, key_of};
use self::stats::SchedulerStats;
use crate::clock::ClockSource;
use crate::config::{SchedulerConfig, UndertowConfig};
use crate::network::{SpeedTokenDispenser, TokenBucketDispenser};
use crate::waiter::EventWaiter;

/// Something the scheduler ticks periodically, typically one peer connection.
pub trait PeerInstance: Send + Sync {
    /// Performs one unit of periodic work at monotonic time `now_millis`.
    ///
    /// # Errors
    ///
    /// Any error is logged by the scheduler and does not affect other instances.
    fn tick(&self, now_millis: u64) -> anyhow::Result<()>;

    /// Name used in scheduler diagnostics.
    fn name(&self) -> String {
        "peer".to_string()
    }
}

/// Errors from starting or stopping the scheduler thread.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The pass loop was already handed to a thread or a caller
    #[error("Scheduler already started")]
    AlreadyStarted,

    /// The dedicated thread could not be spawned
    #[error("Failed to spawn scheduler thread: {0}")]
    SpawnFailed(#[from] io::Error),

    /// The scheduler thread exited by panicking
    #[error("Scheduler thread panicked")]
    WorkerPanicked,
}

/// State shared between the scheduler handle and its worker.
pub(crate) struct SchedulerShared {
    pub(crate) config: SchedulerConfig,
    pub(crate) period: u64,
    pub(crate) clock: Arc<dyn ClockSource>,
    pub(crate) registry: Registry,
    pub(crate) waiter: EventWaiter,
    pub(crate) stats: SchedulerStats,
    pub(crate) running: AtomicBool,
}

/// Handle to the tick scheduler.
///
/// The pass loop lives in a [`SchedulerWorker`] that is either moved onto a
/// dedicated thread by [`start`](Self::start) or taken by the caller with
/// [`take_worker`](Self::take_worker) to drive passes by hand.
pub struct TickScheduler {
    shared: Arc<SchedulerShared>,
    dispenser: Arc<dyn SpeedTokenDispenser>,
    worker: Mutex<Option<SchedulerWorker>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TickScheduler {
    /// Creates a stopped scheduler. Clock ticks wake the pass loop early.
    pub fn new(
        config: SchedulerConfig,
        clock: Arc<dyn ClockSource>,
        dispenser: Arc<dyn SpeedTokenDispenser>,
    ) -> Self {
        let shared = Arc::new(SchedulerShared {
            period: config.period_millis(),
            registry: Registry::new(config.jitter_seed),
            config,
            clock: Arc::clone(&clock),
            waiter: EventWaiter::new(),
            stats: SchedulerStats::default(),
            running: AtomicBool::new(false),
        });

        let weak: Weak<SchedulerShared> = Arc::downgrade(&shared);
        clock.subscribe(Box::new(move |_now| match weak.upgrade() {
            Some(shared) => {
                shared.waiter.event_occurred();
                true
            }
            None => false,
        }));

        Self {
            worker: Mutex::new(Some(SchedulerWorker::new(Arc::clone(&shared)))),
            shared,
            dispenser,
            thread: Mutex::new(None),
        }
    }

    /// Creates a scheduler with the dispenser described by `config`.
    pub fn from_config(config: &UndertowConfig, clock: Arc<dyn ClockSource>) -> Self {
        let dispenser = Arc::new(TokenBucketDispenser::from_config(
            &config.rate_limit,
            Arc::clone(&clock),
        ));
        Self::new(config.scheduler.clone(), clock, dispenser)
    }

    /// Spawns the dedicated scheduler thread.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::AlreadyStarted` - If the worker was already started or taken
    /// - `SchedulerError::SpawnFailed` - If the thread could not be spawned
    pub fn start(&self) -> Result<(), SchedulerError> {
        let worker = self
            .worker
            .lock()
            .take()
            .ok_or(SchedulerError::AlreadyStarted)?;

        self.shared.running.store(true, Ordering::Release);
        let spawned = thread::Builder::new()
            .name(self.shared.config.thread_name.clone())
            .spawn(move || worker.run());

        match spawned {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                info!(
                    "Scheduler thread '{}' started",
                    self.shared.config.thread_name
                );
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(SchedulerError::SpawnFailed(e))
            }
        }
    }

    /// Takes the pass loop for manual driving instead of starting a thread.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::AlreadyStarted` - If the worker was already started or taken
    pub fn take_worker(&self) -> Result<SchedulerWorker, SchedulerError> {
        self.worker
            .lock()
            .take()
            .ok_or(SchedulerError::AlreadyStarted)
    }

    /// Stops the scheduler thread and waits for it to exit.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::WorkerPanicked` - If the thread terminated by panicking
    pub fn shutdown(&self) -> Result<(), SchedulerError> {
        self.shared.running.store(false, Ordering::Release);
        self.shared.waiter.event_occurred();

        let Some(handle) = self.thread.lock().take() else {
            return Ok(());
        };
        handle.join().map_err(|_| SchedulerError::WorkerPanicked)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Admits `instance`; it is ticked from the next pass on, first at a
    /// random offset within one period.
    pub fn register(&self, instance: Arc<dyn PeerInstance>) {
        let name = instance.name();
        let now = self.shared.clock.monotonic_millis();
        if self.shared.registry.register(instance, now, self.shared.period) {
            debug!("Registered {name}");
            self.shared.waiter.event_occurred();
        } else {
            warn!("Ignoring duplicate registration of {name}");
        }
    }

    /// Removes `instance`; a tick already in progress runs to completion.
    ///
    /// Returns false, after logging, if the instance was not registered.
    pub fn unregister<P: PeerInstance + ?Sized>(&self, instance: &Arc<P>) -> bool {
        if self.shared.registry.unregister(key_of(instance)) {
            debug!("Unregistered {}", instance.name());
            true
        } else {
            warn!("Unregister of unknown instance {}", instance.name());
            false
        }
    }

    pub fn is_registered<P: PeerInstance + ?Sized>(&self, instance: &Arc<P>) -> bool {
        self.shared.registry.contains(key_of(instance))
    }

    /// Number of registered instances.
    pub fn instance_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn stats(&self) -> SchedulerStatsSnapshot {
        self.shared.stats.snapshot(self.instance_count())
    }

    /// Rate-limiting token pool shared by every instance.
    pub fn speed_token_dispenser(&self) -> &Arc<dyn SpeedTokenDispenser> {
        &self.dispenser
    }

    /// Schedule period in milliseconds.
    pub fn period_millis(&self) -> u64 {
        self.shared.period
    }
}

impl Drop for TickScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Scheduler shutdown failed: {e}");
        }
    }
}

impl std::fmt::Debug for TickScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickScheduler")
            .field("period_ms", &self.shared.period)
            .field("instances", &self.instance_count())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::clock::{ManualClock, SystemClock};

    const PERIOD: Duration = Duration::from_millis(50);

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            schedule_period: PERIOD,
            jitter_seed: Some(42),
            ..SchedulerConfig::default()
        }
    }

    fn manual_scheduler(start: u64) -> (TickScheduler, Arc<ManualClock>) {
        let clock = ManualClock::new(start);
        let scheduler = TickScheduler::new(
            config(),
            clock.clone(),
            Arc::new(TokenBucketDispenser::unlimited()),
        );
        (scheduler, clock)
    }

    #[derive(Default)]
    struct Counter {
        ticks: AtomicUsize,
        last_now: parking_lot::Mutex<Vec<u64>>,
    }

    impl Counter {
        fn count(&self) -> usize {
            self.ticks.load(Ordering::SeqCst)
        }
    }

    impl PeerInstance for Counter {
        fn tick(&self, now_millis: u64) -> anyhow::Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            self.last_now.lock().push(now_millis);
            Ok(())
        }

        fn name(&self) -> String {
            "counter".to_string()
        }
    }

    struct Failing;

    impl PeerInstance for Failing {
        fn tick(&self, _now_millis: u64) -> anyhow::Result<()> {
            anyhow::bail!("choked")
        }
    }

    struct Panicking;

    impl PeerInstance for Panicking {
        fn tick(&self, _now_millis: u64) -> anyhow::Result<()> {
            panic!("tick exploded")
        }
    }

    #[test]
    fn test_three_instances_tick_once_per_period() {
        let (scheduler, clock) = manual_scheduler(10_000);
        let counters: Vec<Arc<Counter>> = (0..3).map(|_| Arc::new(Counter::default())).collect();
        for counter in &counters {
            scheduler.register(counter.clone());
        }
        let mut worker = scheduler.take_worker().unwrap();

        for step in 0..=50 {
            if step > 0 {
                clock.advance(Duration::from_millis(10));
            }
            worker.run_pass();
        }

        for counter in &counters {
            let count = counter.count();
            assert!((9..=11).contains(&count), "unexpected tick count {count}");
        }
        let total: usize = counters.iter().map(|counter| counter.count()).sum();
        assert_eq!(scheduler.stats().total_ticks as usize, total);
    }

    #[test]
    fn test_now_is_read_once_per_pass() {
        let (scheduler, clock) = manual_scheduler(0);
        let counters: Vec<Arc<Counter>> = (0..4).map(|_| Arc::new(Counter::default())).collect();
        for counter in &counters {
            scheduler.register(counter.clone());
        }
        let mut worker = scheduler.take_worker().unwrap();

        clock.advance(PERIOD);
        let outcome = worker.run_pass();

        assert_eq!(outcome.ticked, 4);
        for counter in &counters {
            assert_eq!(*counter.last_now.lock(), vec![outcome.now]);
        }
    }

    #[test]
    fn test_registration_is_applied_on_next_pass() {
        let (scheduler, clock) = manual_scheduler(0);
        let mut worker = scheduler.take_worker().unwrap();
        assert_eq!(worker.run_pass().active, 0);

        let counter = Arc::new(Counter::default());
        scheduler.register(counter.clone());
        assert_eq!(scheduler.instance_count(), 1);
        assert!(worker.active_instances().is_empty());

        clock.advance(PERIOD);
        let outcome = worker.run_pass();
        assert_eq!(outcome.active, 1);
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn test_unregister_twice_reports_unknown() {
        let (scheduler, clock) = manual_scheduler(0);
        let counter = Arc::new(Counter::default());
        scheduler.register(counter.clone());
        let mut worker = scheduler.take_worker().unwrap();
        worker.run_pass();

        assert!(scheduler.unregister(&counter));
        assert!(!scheduler.unregister(&counter));
        assert!(!scheduler.is_registered(&counter));

        clock.advance(PERIOD * 4);
        let ticks_before = counter.count();
        let outcome = worker.run_pass();

        assert_eq!(outcome.active, 0);
        assert_eq!(counter.count(), ticks_before);
    }

    #[test]
    fn test_failing_instances_do_not_stop_others() {
        let (scheduler, clock) = manual_scheduler(0);
        let counter = Arc::new(Counter::default());
        scheduler.register(Arc::new(Failing));
        scheduler.register(Arc::new(Panicking));
        scheduler.register(counter.clone());
        let mut worker = scheduler.take_worker().unwrap();

        for _ in 0..5 {
            clock.advance(PERIOD);
            worker.run_pass();
        }

        assert_eq!(counter.count(), 5);
        let stats = scheduler.stats();
        assert_eq!(stats.total_ticks, 15);
        assert_eq!(stats.tick_failures, 10);
        assert_eq!(stats.instances, 3);
    }

    #[test]
    fn test_stall_realigns_instead_of_bursting() {
        let (scheduler, clock) = manual_scheduler(0);
        let counter = Arc::new(Counter::default());
        scheduler.register(counter.clone());
        let mut worker = scheduler.take_worker().unwrap();

        clock.advance(PERIOD);
        worker.run_pass();
        assert_eq!(counter.count(), 1);

        // Ten periods pass without a scheduler pass.
        clock.advance(PERIOD * 10);
        worker.run_pass();
        worker.run_pass();
        worker.run_pass();

        // At most one catch-up tick beyond the one that was due.
        assert!((2..=3).contains(&counter.count()));
        let scheduled = &worker.active_instances()[0];
        let now = clock.monotonic_millis();
        assert!(scheduled.next_tick_time() >= now);
        assert!(scheduled.next_tick_time() <= now + 50);
    }

    #[test]
    fn test_lag_reports_are_debounced() {
        let clock = ManualClock::new(0);
        let scheduler = TickScheduler::new(
            SchedulerConfig {
                lag_threshold: Duration::from_millis(1_000),
                lag_log_interval: Duration::from_millis(5_000),
                ..config()
            },
            clock.clone(),
            Arc::new(TokenBucketDispenser::unlimited()),
        );
        let counter = Arc::new(Counter::default());
        scheduler.register(counter.clone());
        let mut worker = scheduler.take_worker().unwrap();

        clock.advance(PERIOD);
        worker.run_pass();
        assert_eq!(counter.count(), 1);
        assert_eq!(scheduler.stats().lag_reports, 0);

        clock.advance(Duration::from_millis(1_500));
        worker.run_pass();
        assert_eq!(scheduler.stats().lag_reports, 1);

        // Still lagging, but inside the log interval of the first report.
        clock.advance(Duration::from_millis(1_500));
        worker.run_pass();
        clock.advance(Duration::from_millis(1_500));
        worker.run_pass();
        assert_eq!(counter.count(), 4);
        assert_eq!(scheduler.stats().lag_reports, 1);

        clock.advance(Duration::from_millis(2_500));
        worker.run_pass();
        assert_eq!(scheduler.stats().lag_reports, 2);
    }

    #[test]
    fn test_gaps_below_threshold_are_not_lag() {
        let (scheduler, clock) = manual_scheduler(0);
        scheduler.register(Arc::new(Counter::default()));
        let mut worker = scheduler.take_worker().unwrap();

        for _ in 0..20 {
            clock.advance(Duration::from_millis(900));
            worker.run_pass();
        }

        assert_eq!(scheduler.stats().total_ticks, 20);
        assert_eq!(scheduler.stats().lag_reports, 0);
    }

    #[test]
    fn test_dropped_scheduler_unsubscribes_from_clock() {
        let clock = ManualClock::new(0);
        let first = TickScheduler::new(
            config(),
            clock.clone(),
            Arc::new(TokenBucketDispenser::unlimited()),
        );
        let second = TickScheduler::new(
            config(),
            clock.clone(),
            Arc::new(TokenBucketDispenser::unlimited()),
        );
        assert_eq!(clock.subscriber_count(), 2);

        drop(first);
        clock.advance(Duration::from_millis(1));

        assert_eq!(clock.subscriber_count(), 1);
        drop(second);
    }

    #[test]
    fn test_duplicate_registration_is_ignored() {
        let (scheduler, _clock) = manual_scheduler(0);
        let counter = Arc::new(Counter::default());

        scheduler.register(counter.clone());
        scheduler.register(counter.clone());

        assert_eq!(scheduler.instance_count(), 1);
    }

    #[test]
    fn test_take_worker_only_once() {
        let (scheduler, _clock) = manual_scheduler(0);

        assert!(scheduler.take_worker().is_ok());
        assert!(matches!(
            scheduler.take_worker(),
            Err(SchedulerError::AlreadyStarted)
        ));
        assert!(matches!(
            scheduler.start(),
            Err(SchedulerError::AlreadyStarted)
        ));
    }

    #[test]
    fn test_idle_waits_when_nothing_ticked() {
        let (scheduler, _clock) = manual_scheduler(0);
        let mut worker = scheduler.take_worker().unwrap();

        let outcome = worker.run_pass();
        worker.idle(&outcome);

        let stats = scheduler.stats();
        assert_eq!(stats.wait_count, 1);
        assert_eq!(stats.yield_count, 0);
    }

    #[test]
    fn test_idle_yields_after_work() {
        let (scheduler, clock) = manual_scheduler(0);
        scheduler.register(Arc::new(Counter::default()));
        let mut worker = scheduler.take_worker().unwrap();

        clock.advance(PERIOD);
        let outcome = worker.run_pass();
        worker.idle(&outcome);

        let stats = scheduler.stats();
        assert_eq!(stats.yield_count, 1);
        assert_eq!(stats.wait_count, 0);
    }

    #[test]
    fn test_clock_tick_wakes_waiting_pass() {
        let (scheduler, clock) = manual_scheduler(0);
        let worker = scheduler.take_worker().unwrap();
        let outcome = PassOutcome {
            now: 0,
            ticked: 0,
            active: 0,
        };

        // The manual clock notifies the scheduler on every step.
        clock.advance(Duration::from_millis(1));
        worker.idle(&outcome);

        assert!(scheduler.stats().total_wait_time_ms < PERIOD.as_millis() as u64);
    }

    #[test]
    fn test_dedicated_thread_ticks_and_shuts_down() {
        let clock = SystemClock::new();
        let scheduler = TickScheduler::new(
            SchedulerConfig {
                schedule_period: Duration::from_millis(10),
                ..config()
            },
            clock,
            Arc::new(TokenBucketDispenser::unlimited()),
        );
        let counter = Arc::new(Counter::default());
        scheduler.register(counter.clone());

        scheduler.start().unwrap();
        assert!(scheduler.is_running());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.count() < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        scheduler.shutdown().unwrap();
        assert!(!scheduler.is_running());
        assert!(counter.count() >= 3);
    }

    #[test]
    fn test_from_config_uses_rate_limit() {
        let mut config = UndertowConfig::for_testing();
        config.rate_limit.download_limit = Some(1_000);

        let scheduler = TickScheduler::from_config(&config, ManualClock::new(0));

        assert_eq!(scheduler.speed_token_dispenser().dispense(10_000), 2_000);
        assert_eq!(scheduler.period_millis(), 50);
    }
}
