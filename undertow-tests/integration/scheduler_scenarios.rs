//! Scheduler scenarios run through the deterministic simulation.

use undertow_sim::{PeerKind, ScenarioConfig, SimulationError, run_scenario};

const SEEDS: [u64; 4] = [1, 42, 1337, 0xdead_beef];

#[test]
fn test_every_preset_is_clean_across_seeds() {
    for name in ScenarioConfig::preset_names() {
        for seed in SEEDS {
            let config = ScenarioConfig::preset(name, seed).unwrap();
            let report = run_scenario(config).unwrap();

            assert!(
                report.is_clean(),
                "{name} seed={seed} violated: {:?}",
                report.violations
            );
        }
    }
}

#[test]
fn test_steady_peers_tick_once_per_period() {
    let report = run_scenario(ScenarioConfig::steady(7)).unwrap();

    // 2000ms at a 50ms period, first tick no later than one period in.
    for peer in &report.peers {
        assert!(
            (39..=41).contains(&peer.ticks),
            "{} ticked {} times",
            peer.name,
            peer.ticks
        );
        let first = peer.first_tick.unwrap();
        assert!(first <= report.start_ms + 50, "{} started late at {first}", peer.name);
    }
    assert_eq!(report.scheduler.tick_failures, 0);
    assert_eq!(report.scheduler.lag_reports, 0);
}

#[test]
fn test_registration_jitter_spreads_first_ticks() {
    let report = run_scenario(ScenarioConfig {
        counting_peers: 32,
        ..ScenarioConfig::steady(99)
    })
    .unwrap();

    let mut first_ticks: Vec<u64> = report.peers.iter().filter_map(|peer| peer.first_tick).collect();
    first_ticks.sort_unstable();
    first_ticks.dedup();

    // 32 peers over 5 pass slots of one period cannot all share a slot.
    assert!(first_ticks.len() > 1);
}

#[test]
fn test_churned_peers_stop_ticking() {
    let report = run_scenario(ScenarioConfig::churn(5)).unwrap();

    let retired: Vec<_> = report
        .peers
        .iter()
        .filter(|peer| peer.unregistered_at.is_some())
        .collect();
    assert!(!retired.is_empty(), "churn scenario retired nobody");
    assert!(report.peers.len() > 16);

    for peer in retired {
        let removed = peer.unregistered_at.unwrap();
        if let Some(last) = peer.last_tick {
            assert!(last < removed, "{} ticked at {last} after {removed}", peer.name);
        }
    }
}

#[test]
fn test_faulty_peers_do_not_disturb_healthy_ones() {
    let report = run_scenario(ScenarioConfig::faults(11)).unwrap();

    let failures: u64 = report.peers_of(PeerKind::Failing).map(|peer| peer.failures).sum();
    assert!(failures > 0);
    assert_eq!(report.scheduler.tick_failures, failures);

    // Failing peers keep being scheduled after a panic.
    for peer in report.peers_of(PeerKind::Failing) {
        assert!(peer.ticks >= 39, "{} ticked {} times", peer.name, peer.ticks);
    }
    for peer in report.peers_of(PeerKind::Counting) {
        assert!(peer.ticks >= 39, "{} ticked {} times", peer.name, peer.ticks);
    }
}

#[test]
fn test_stall_does_not_cause_catch_up_burst() {
    let config = ScenarioConfig::stall(3);
    let report = run_scenario(config.clone()).unwrap();

    let slow = report.peers_of(PeerKind::Slow).next().unwrap();
    // Each slow tick eats 1500ms, so the run holds only a handful of them.
    assert!(slow.ticks <= (config.duration_ms / config.slow_tick_ms) as usize + 1);

    // After a stall every counting peer is rescheduled once instead of
    // replaying every missed period.
    for peer in report.peers_of(PeerKind::Counting) {
        assert!(
            peer.ticks <= slow.ticks * 2 + 2,
            "{} ticked {} times around {} stalls",
            peer.name,
            peer.ticks,
            slow.ticks
        );
    }

    // Every stall is followed by at most one debounced lag warning.
    let lag_reports = report.scheduler.lag_reports;
    assert!(
        (1..=slow.ticks as u64).contains(&lag_reports),
        "{lag_reports} lag reports for {} stalls",
        slow.ticks
    );
}

#[test]
fn test_same_seed_reproduces_report() {
    let first = run_scenario(ScenarioConfig::churn(2024)).unwrap();
    let second = run_scenario(ScenarioConfig::churn(2024)).unwrap();
    let other = run_scenario(ScenarioConfig::churn(2025)).unwrap();

    assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    assert_ne!(first.peers, other.peers);
}

#[test]
fn test_invalid_scenario_is_rejected() {
    let result = run_scenario(ScenarioConfig {
        churn_probability: 1.5,
        ..ScenarioConfig::churn(0)
    });

    assert!(matches!(result, Err(SimulationError::InvalidConfig { .. })));
}
