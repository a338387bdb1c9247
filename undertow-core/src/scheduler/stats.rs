//! Operational counters for the tick scheduler.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub(crate) struct SchedulerStats {
    total_ticks: AtomicU64,
    tick_failures: AtomicU64,
    wait_count: AtomicU64,
    yield_count: AtomicU64,
    total_wait_time_ms: AtomicU64,
    lag_reports: AtomicU64,
}

impl SchedulerStats {
    pub(crate) fn record_tick(&self) {
        self.total_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.tick_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_wait(&self, waited_ms: u64) {
        self.wait_count.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms.fetch_add(waited_ms, Ordering::Relaxed);
    }

    pub(crate) fn record_yield(&self) {
        self.yield_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lag_report(&self) {
        self.lag_reports.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, instances: usize) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            total_ticks: self.total_ticks.load(Ordering::Relaxed),
            tick_failures: self.tick_failures.load(Ordering::Relaxed),
            wait_count: self.wait_count.load(Ordering::Relaxed),
            yield_count: self.yield_count.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            lag_reports: self.lag_reports.load(Ordering::Relaxed),
            instances,
        }
    }
}

/// Point-in-time view of scheduler activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchedulerStatsSnapshot {
    /// Ticks delivered to instances since start
    pub total_ticks: u64,
    /// Ticks that returned an error or panicked
    pub tick_failures: u64,
    /// Passes that ended by sleeping
    pub wait_count: u64,
    /// Passes that ended by yielding
    pub yield_count: u64,
    /// Cumulative time spent sleeping between passes
    pub total_wait_time_ms: u64,
    /// Lag warnings emitted after debouncing
    pub lag_reports: u64,
    /// Registered instances at snapshot time
    pub instances: usize,
}

impl SchedulerStatsSnapshot {
    /// Mean sleep per waiting pass, in milliseconds.
    pub fn average_wait_ms(&self) -> f64 {
        if self.wait_count == 0 {
            0.0
        } else {
            self.total_wait_time_ms as f64 / self.wait_count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = SchedulerStats::default();
        stats.record_tick();
        stats.record_tick();
        stats.record_failure();
        stats.record_wait(40);
        stats.record_wait(60);
        stats.record_yield();
        stats.record_lag_report();

        let snapshot = stats.snapshot(3);

        assert_eq!(snapshot.total_ticks, 2);
        assert_eq!(snapshot.tick_failures, 1);
        assert_eq!(snapshot.wait_count, 2);
        assert_eq!(snapshot.yield_count, 1);
        assert_eq!(snapshot.total_wait_time_ms, 100);
        assert_eq!(snapshot.lag_reports, 1);
        assert_eq!(snapshot.instances, 3);
        assert_eq!(snapshot.average_wait_ms(), 50.0);
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let snapshot = SchedulerStatsSnapshot {
            total_ticks: 5,
            instances: 2,
            ..SchedulerStatsSnapshot::default()
        };

        let json = serde_json::to_value(snapshot).unwrap();

        assert_eq!(json["total_ticks"], 5);
        assert_eq!(json["instances"], 2);
        assert_eq!(json["wait_count"], 0);
    }
}
