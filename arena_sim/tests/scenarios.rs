//! End-to-end scenarios: real session engine, simulated network, replay check.

use arena_core::RejectedReason;
use arena_sim::scenarios::ScenarioId;
use arena_sim::ScenarioRunner;
use proptest::prelude::*;

#[test]
fn test_all_scenarios_pass() {
    let runner = ScenarioRunner::new(42, 4);
    for scenario in ScenarioId::all() {
        let result = runner.run(scenario);
        assert!(
            result.passed,
            "{} failed: {:?}",
            scenario,
            result.failure_reason
        );
        assert_eq!(result.metrics.live_hash, result.metrics.replay_hash);
    }
}

#[test]
fn test_silent_agent_two_ticks() {
    let result = ScenarioRunner::new(1, 1).run(ScenarioId::SilentAgent);
    assert!(result.passed, "{:?}", result.failure_reason);
    assert_eq!(result.total_ticks, 2);
    assert_eq!(result.metrics.applied, 0);
    assert_eq!(result.metrics.log_records, 2);
    assert_eq!(result.metrics.rejected.get(&RejectedReason::Timeout), Some(&2));
}

#[test]
fn test_same_seed_same_world() {
    let a = ScenarioRunner::new(99, 4).with_duration(3.0).run(ScenarioId::Brawl);
    let b = ScenarioRunner::new(99, 4).with_duration(3.0).run(ScenarioId::Brawl);
    assert!(a.passed, "{:?}", a.failure_reason);
    assert_eq!(a.metrics.live_hash, b.metrics.live_hash);
    assert_eq!(a.metrics.rejected, b.metrics.rejected);
    assert_eq!(a.final_time_secs, b.final_time_secs);
}

#[test]
fn test_rate_flood_never_drops_commands() {
    let result = ScenarioRunner::new(5, 1).with_duration(4.0).run(ScenarioId::RateFlood);
    assert!(result.passed, "{:?}", result.failure_reason);
    // 4 windows of 60 ticks, 4 commands each
    assert_eq!(result.metrics.applied, 16);
    let rejected: u64 = result.metrics.rejected.values().sum();
    assert!(result.metrics.rejected.get(&RejectedReason::RateLimited).is_some());
    assert_eq!(result.metrics.applied + rejected, result.metrics.log_records as u64);
}

#[test]
fn test_controller_quit_ends_early() {
    let result = ScenarioRunner::new(3, 2).run(ScenarioId::ControllerQuit);
    assert!(result.passed, "{:?}", result.failure_reason);
    assert!(result.total_ticks < 600);
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["scenario"], "controller_quit");
    assert_eq!(json["total_ticks"], result.total_ticks);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn test_replay_matches_live_for_any_seed(seed in 1u64..u64::MAX) {
        let result = ScenarioRunner::new(seed, 3).with_duration(2.0).run(ScenarioId::Brawl);
        prop_assert!(result.passed, "{:?}", result.failure_reason);
        prop_assert_eq!(result.metrics.live_hash, result.metrics.replay_hash);
    }

    #[test]
    fn test_partition_recovers_for_any_seed(seed in 1u64..u64::MAX) {
        let result = ScenarioRunner::new(seed, 2).with_duration(4.0).run(ScenarioId::Partition);
        prop_assert!(result.passed, "{:?}", result.failure_reason);
        prop_assert!(result.metrics.reconnects >= 1);
    }
}
