//! The scheduler pass loop.
//!
//! A [`SchedulerWorker`] owns the active instance list. Each pass merges
//! registration changes, reads the clock once, ticks every due instance and
//! then either sleeps for one period (nothing was due) or yields (work was
//! done, more may be due soon).

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::registry::ScheduledInstance;
use super::{PeerInstance, SchedulerShared};

/// Result of one scheduler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassOutcome {
    /// Clock reading used for every due check in the pass
    pub now: u64,
    /// Instances ticked during the pass
    pub ticked: usize,
    /// Instances in the active list after merging changes
    pub active: usize,
}

/// Computes the next due time after a tick scheduled for `target` ran at `now`.
///
/// Normally one period after `target`. If that is not in the future the
/// target is realigned to `now + target % period`.
///
/// The result lies in `[now, now + period]`. The upper bound is reached only
/// by an instance ticked exactly on time (`target == now`); a realigned
/// target is always strictly below it.
pub fn next_target(target: u64, now: u64, period: u64) -> u64 {
    let next = target.saturating_add(period);
    if next > now || period == 0 {
        return next;
    }
    now.saturating_add(target % period)
}

/// Drives scheduler passes; either on the scheduler thread or by hand.
pub struct SchedulerWorker {
    shared: Arc<SchedulerShared>,
    active: Vec<ScheduledInstance>,
    last_lag_report: Option<u64>,
}

impl SchedulerWorker {
    pub(crate) fn new(shared: Arc<SchedulerShared>) -> Self {
        Self {
            shared,
            active: Vec::new(),
            last_lag_report: None,
        }
    }

    /// Active instances as of the last pass.
    pub fn active_instances(&self) -> &[ScheduledInstance] {
        &self.active
    }

    /// Runs one pass: merge registration changes, then tick due instances.
    pub fn run_pass(&mut self) -> PassOutcome {
        if self.shared.registry.merge_into(&mut self.active) {
            debug!("Registration change applied: active={}", self.active.len());
        }

        let now = self.shared.clock.monotonic_millis();
        let period = self.shared.period;
        let lag_threshold = self.shared.config.lag_threshold.as_millis() as u64;
        let mut ticked = 0;
        let mut worst_lag = None;

        for scheduled in &mut self.active {
            if scheduled.is_unregistered() || now < scheduled.next_tick_time() {
                continue;
            }

            if let Some(last) = scheduled.last_tick_time() {
                let gap = now.saturating_sub(last);
                if gap > lag_threshold && worst_lag.is_none_or(|worst| gap > worst) {
                    worst_lag = Some(gap);
                }
            }

            if !tick_isolated(scheduled.instance().as_ref(), now) {
                self.shared.stats.record_failure();
            }
            self.shared.stats.record_tick();
            ticked += 1;

            let next = next_target(scheduled.next_tick_time(), now, period);
            scheduled.record_tick(now, next);
        }

        if let Some(lag) = worst_lag {
            self.report_lag(lag, now);
        }

        PassOutcome {
            now,
            ticked,
            active: self.active.len(),
        }
    }

    /// Waits for the next pass: sleeps for one period if nothing ticked,
    /// otherwise yields the processor.
    pub fn idle(&self, outcome: &PassOutcome) {
        if outcome.ticked == 0 {
            let started = Instant::now();
            self.shared.waiter.wait_timeout(self.shared.config.schedule_period);
            self.shared
                .stats
                .record_wait(started.elapsed().as_millis() as u64);
        } else {
            self.shared.stats.record_yield();
            thread::yield_now();
        }
    }

    /// Runs passes until the owning scheduler shuts down.
    pub fn run(mut self) {
        info!("Scheduler running with period={}ms", self.shared.period);
        while self.shared.running.load(Ordering::Acquire) {
            let outcome = self.run_pass();
            self.idle(&outcome);
        }
        info!("Scheduler stopped with {} active instances", self.active.len());
    }

    fn report_lag(&mut self, lag: u64, now: u64) {
        let interval = self.shared.config.lag_log_interval.as_millis() as u64;
        let due = self
            .last_lag_report
            .is_none_or(|last| now.saturating_sub(last) >= interval);
        if due {
            warn!(
                "Scheduling lagging: {lag}ms - instances={}",
                self.active.len()
            );
            self.last_lag_report = Some(now);
            self.shared.stats.record_lag_report();
        }
    }
}

/// Ticks `instance`, containing errors and panics. Returns false on failure.
fn tick_isolated(instance: &dyn PeerInstance, now: u64) -> bool {
    match catch_unwind(AssertUnwindSafe(|| instance.tick(now))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("Tick failed for {}: {e:#}", instance.name());
            false
        }
        Err(payload) => {
            error!(
                "Tick panicked for {}: {}",
                instance.name(),
                panic_message(payload.as_ref())
            );
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_next_target_advances_one_period() {
        assert_eq!(next_target(1_000, 1_000, 50), 1_050);
        assert_eq!(next_target(1_000, 1_049, 50), 1_050);
    }

    #[test]
    fn test_next_target_realigns_after_stall() {
        // Target 1_020 ran at 1_500: 1_070 is already past.
        assert_eq!(next_target(1_020, 1_500, 50), 1_520);
    }

    #[test]
    fn test_next_target_boundary_realigns_to_now() {
        // next == now is not in the future.
        assert_eq!(next_target(1_000, 1_050, 50), 1_050);
        assert_eq!(next_target(1_010, 1_060, 50), 1_070);
    }

    #[test]
    fn test_panic_message_variants() {
        let text: Box<dyn Any + Send> = Box::new("boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let other: Box<dyn Any + Send> = Box::new(7u8);

        assert_eq!(panic_message(text.as_ref()), "boom");
        assert_eq!(panic_message(owned.as_ref()), "bang");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    proptest! {
        #[test]
        fn test_next_target_bounded_by_one_period(
            period in 1u64..10_000,
            target in 0u64..1_000_000,
            late_by in 0u64..1_000_000,
        ) {
            let now = target + late_by;
            let next = next_target(target, now, period);
            prop_assert!(next >= now);
            if late_by == 0 {
                prop_assert_eq!(next, now + period);
            } else {
                prop_assert!(next < now + period);
            }
        }
    }
}
