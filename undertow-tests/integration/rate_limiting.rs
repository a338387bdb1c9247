//! Speed token dispensing shared between scheduled instances.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use proptest::prelude::*;
use undertow_core::clock::{ClockSource, ManualClock};
use undertow_core::config::{RateLimitConfig, SchedulerConfig};
use undertow_core::network::{SpeedTokenDispenser, TokenBucketDispenser};
use undertow_core::scheduler::{PeerInstance, TickScheduler};
use undertow_sim::{PeerKind, ScenarioConfig, run_scenario};

struct GreedyPeer {
    dispenser: Arc<dyn SpeedTokenDispenser>,
    want: u64,
    granted: AtomicU64,
}

impl PeerInstance for GreedyPeer {
    fn tick(&self, _now_millis: u64) -> anyhow::Result<()> {
        let granted = self.dispenser.dispense(self.want);
        self.granted.fetch_add(granted, Ordering::Relaxed);
        Ok(())
    }
}

#[test]
fn test_instances_share_one_bandwidth_budget() {
    let clock = ManualClock::new(10_000);
    let dispenser: Arc<dyn SpeedTokenDispenser> = Arc::new(TokenBucketDispenser::limited(
        10_000,
        1.0,
        clock.clone(),
    ));
    let scheduler = TickScheduler::new(
        SchedulerConfig {
            schedule_period: Duration::from_millis(100),
            jitter_seed: Some(8),
            ..SchedulerConfig::default()
        },
        clock.clone(),
        Arc::clone(&dispenser),
    );

    let peers: Vec<_> = (0..4)
        .map(|_| {
            Arc::new(GreedyPeer {
                dispenser: Arc::clone(scheduler.speed_token_dispenser()),
                want: 5_000,
                granted: AtomicU64::new(0),
            })
        })
        .collect();
    for peer in &peers {
        scheduler.register(peer.clone());
    }

    let mut worker = scheduler.take_worker().unwrap();
    for _ in 0..200 {
        worker.run_pass();
        clock.advance(Duration::from_millis(10));
    }

    // Two seconds: one full bucket plus two seconds of refill.
    let total: u64 = peers.iter().map(|peer| peer.granted.load(Ordering::Relaxed)).sum();
    assert!(total <= 10_000 + 20_000, "granted {total}");
    assert!(total >= 20_000, "granted only {total}");
}

#[test]
fn test_unused_tokens_return_to_the_pool() {
    let clock = ManualClock::new(0);
    let dispenser = TokenBucketDispenser::limited(1_000, 2.0, clock.clone());

    assert_eq!(dispenser.dispense(1_500), 1_500);
    assert_eq!(dispenser.peek(1_000), 500);

    dispenser.return_unused(700);
    assert_eq!(dispenser.dispense(5_000), 1_200);
    assert_eq!(dispenser.dispense(1), 0);

    clock.advance(Duration::from_millis(250));
    dispenser.refill();
    assert_eq!(dispenser.peek(5_000), 250);
}

#[test]
fn test_rate_limited_scenario_tracks_the_limit() {
    let config = ScenarioConfig::rate_limited(17);
    let limit = config.download_limit.unwrap();
    let report = run_scenario(config).unwrap();

    assert!(report.is_clean(), "violations: {:?}", report.violations);

    // Burst (twice the rate) plus the refill of the whole run.
    let ceiling = limit * 2 + limit * report.elapsed_ms() / 1000;
    let delivered = report.total_delivered();
    assert!(delivered <= ceiling, "delivered {delivered} above {ceiling}");
    assert!(delivered >= limit * 3, "delivered only {delivered}");

    for peer in report.peers_of(PeerKind::Transfer) {
        assert!(peer.bytes_delivered > 0, "{} starved", peer.name);
    }
}

#[test]
fn test_unlimited_scenario_is_not_throttled() {
    let limited = run_scenario(ScenarioConfig::rate_limited(4)).unwrap();
    let unlimited = run_scenario(ScenarioConfig {
        download_limit: None,
        ..ScenarioConfig::rate_limited(4)
    })
    .unwrap();

    assert!(unlimited.total_delivered() > limited.total_delivered());
}

#[test]
fn test_zero_limit_config_means_unlimited() {
    let clock = ManualClock::new(0);
    let dispenser = TokenBucketDispenser::from_config(
        &RateLimitConfig {
            download_limit: Some(0),
            ..RateLimitConfig::default()
        },
        clock,
    );

    assert!(dispenser.is_unlimited());
    assert_eq!(dispenser.dispense(u64::MAX / 2), u64::MAX / 2);
}

proptest! {
    #[test]
    fn test_dispensed_never_exceeds_burst_plus_refill(
        rate in 100u64..100_000,
        steps in proptest::collection::vec((0u64..200, 0u64..50_000), 1..100),
    ) {
        let clock = ManualClock::new(0);
        let dispenser = TokenBucketDispenser::limited(rate, 1.0, clock.clone());
        let mut dispensed = 0u64;

        for (advance_ms, request) in steps {
            clock.advance(Duration::from_millis(advance_ms));
            dispensed += dispenser.dispense(request);
        }

        let elapsed = clock.monotonic_millis();
        prop_assert!(dispensed <= rate + rate * elapsed / 1000 + 1);
    }
}
