//! Property-based tests for the stage curve, metric aggregation and
//! threshold comparison.
//!
//! Uses proptest to verify invariants across randomized inputs:
//! - The VU target hits every declared target at stage boundaries and stays
//!   within each stage's start/target band
//! - Counters, rates and trends aggregate the same values regardless of how
//!   they were recorded
//! - Threshold comparisons are strict at the boundary

use proptest::prelude::*;
use stampede::loadtest::metrics::{percentile, tags, MetricSummary, MetricsRegistry, Tags};
use stampede::loadtest::stage::{Stage, StageSchedule};
use stampede::loadtest::threshold::{evaluate, ThresholdSet};
use std::time::Duration;

/// Up to six stages of 1ms..=120s with targets 0..=200.
fn arb_stages() -> impl Strategy<Value = Vec<Stage>> {
    proptest::collection::vec(
        (1u64..=120_000, 0u32..=200)
            .prop_map(|(ms, target)| Stage::new(Duration::from_millis(ms), target)),
        1..=6,
    )
}

proptest! {
    /// Every stage boundary reports exactly the declared target.
    #[test]
    fn prop_target_equals_declared_target_at_boundaries(stages in arb_stages()) {
        let schedule = StageSchedule::new(stages.clone());
        let mut end = Duration::ZERO;
        for stage in &stages {
            end += stage.duration;
            prop_assert_eq!(schedule.target_at(end), stage.target_vus);
        }
        prop_assert_eq!(schedule.total_duration(), end);
        prop_assert_eq!(schedule.target_at(end + Duration::from_millis(1)), 0);
    }

    /// Inside a stage the target stays between the stage's start level and
    /// its target, and never strays more than one VU from the exact curve.
    #[test]
    fn prop_target_stays_within_stage_band(
        stages in arb_stages(),
        fraction in 0.0f64..=1.0,
    ) {
        let schedule = StageSchedule::new(stages.clone());
        let at = schedule.total_duration().mul_f64(fraction).min(schedule.total_duration());
        let index = schedule.stage_index_at(at).unwrap();
        let start = if index == 0 { 0 } else { stages[index - 1].target_vus };
        let target = stages[index].target_vus;

        let vus = schedule.target_at(at);
        prop_assert!(vus >= start.min(target) && vus <= start.max(target),
            "vus {} outside [{}, {}]", vus, start.min(target), start.max(target));
        prop_assert!((schedule.curve_at(at) - f64::from(vus)).abs() < 1.0 + 1e-9);
    }

    /// While ramping up, the target never decreases.
    #[test]
    fn prop_ramp_up_is_monotonic(
        duration_ms in 1u64..=60_000,
        target in 1u32..=500,
        samples in proptest::collection::vec(0.0f64..=1.0, 2..=20),
    ) {
        let schedule = StageSchedule::new(vec![Stage::new(Duration::from_millis(duration_ms), target)]);
        let mut points: Vec<Duration> = samples
            .iter()
            .map(|f| Duration::from_millis(duration_ms).mul_f64(*f).min(Duration::from_millis(duration_ms)))
            .collect();
        points.sort();
        let targets: Vec<u32> = points.iter().map(|t| schedule.target_at(*t)).collect();
        prop_assert!(targets.windows(2).all(|w| w[0] <= w[1]), "{:?}", targets);
    }

    /// A counter's count is the sum of what was added, across threads and tag sets.
    #[test]
    fn prop_concurrent_counter_sum(
        per_thread in proptest::collection::vec(proptest::collection::vec(0u32..=1000, 0..50), 1..=8),
    ) {
        let registry = MetricsRegistry::new();
        std::thread::scope(|scope| {
            for (i, values) in per_thread.iter().enumerate() {
                let registry = registry.clone();
                scope.spawn(move || {
                    let t = tags([("vu", (i % 3).to_string())]);
                    for v in values {
                        registry.add_counter("reqs", f64::from(*v), &t).unwrap();
                    }
                });
            }
        });

        let expected: u64 = per_thread.iter().flatten().map(|v| u64::from(*v)).sum();
        let observations: usize = per_thread.iter().map(Vec::len).sum();
        match registry.snapshot("reqs") {
            Some(MetricSummary::Counter(c)) => {
                prop_assert_eq!(c.count, expected as f64);
                prop_assert_eq!(c.observations, observations as u64);
            }
            None => prop_assert_eq!(observations, 0),
            other => prop_assert!(false, "unexpected summary {:?}", other),
        }
    }

    /// k passes out of n give a rate of exactly k/n.
    #[test]
    fn prop_rate_is_pass_fraction(outcomes in proptest::collection::vec(any::<bool>(), 1..200)) {
        let registry = MetricsRegistry::new();
        for passed in &outcomes {
            registry.add_rate("ok", *passed, &Tags::new()).unwrap();
        }
        let passes = outcomes.iter().filter(|p| **p).count() as u64;
        match registry.snapshot("ok") {
            Some(MetricSummary::Rate(r)) => {
                prop_assert_eq!(r.passes, passes);
                prop_assert_eq!(r.total, outcomes.len() as u64);
                prop_assert_eq!(r.rate, Some(passes as f64 / outcomes.len() as f64));
            }
            other => prop_assert!(false, "unexpected summary {:?}", other),
        }
    }

    /// Percentiles are bounded by min and max and grow with p.
    #[test]
    fn prop_percentiles_are_ordered(
        mut samples in proptest::collection::vec(0.0f64..1e6, 1..300),
        p in 0.0f64..=100.0,
    ) {
        samples.sort_by(f64::total_cmp);
        let min = samples[0];
        let max = samples[samples.len() - 1];
        prop_assert_eq!(percentile(&samples, 0.0), Some(min));
        prop_assert_eq!(percentile(&samples, 100.0), Some(max));
        // Interpolation may round by an ulp or so.
        let eps = 1e-9 * (1.0 + max);
        let value = percentile(&samples, p).unwrap();
        prop_assert!(value >= min - eps && value <= max + eps);
        let higher = percentile(&samples, (p + 1.0).min(100.0)).unwrap();
        prop_assert!(higher + eps >= value);
    }

    /// Snapshots do not consume or alter the data.
    #[test]
    fn prop_snapshot_is_idempotent(samples in proptest::collection::vec(0.0f64..10_000.0, 1..100)) {
        let registry = MetricsRegistry::new();
        for s in &samples {
            registry.add_trend("latency", *s, &Tags::new()).unwrap();
        }
        let (first, second) = match (registry.snapshot("latency"), registry.snapshot("latency")) {
            (Some(MetricSummary::Trend(a)), Some(MetricSummary::Trend(b))) => (a, b),
            other => return Err(TestCaseError::fail(format!("unexpected {other:?}"))),
        };
        prop_assert_eq!(first.count, samples.len() as u64);
        prop_assert_eq!(first.count, second.count);
        prop_assert_eq!(first.p95, second.p95);
        prop_assert_eq!(first.avg, second.avg);
    }

    /// `<` and `>` fail when the actual value equals the bound.
    #[test]
    fn prop_threshold_comparison_is_strict(passes in 0u32..=20, fails in 1u32..=20) {
        let registry = MetricsRegistry::new();
        for _ in 0..passes {
            registry.add_rate("checks", true, &Tags::new()).unwrap();
        }
        for _ in 0..fails {
            registry.add_rate("checks", false, &Tags::new()).unwrap();
        }
        let rate = f64::from(passes) / f64::from(passes + fails);
        let sets = vec![ThresholdSet::parse("checks", &[
            format!("rate<{rate}"),
            format!("rate>{rate}"),
            format!("rate<={rate}"),
            format!("rate>={rate}"),
        ]).unwrap()];

        let report = evaluate(&sets, &registry, Duration::from_secs(1));
        let outcomes: Vec<bool> = report.results.iter().map(|r| r.passed).collect();
        prop_assert_eq!(outcomes, vec![false, false, true, true]);
        prop_assert!(!report.verdict);
    }
}
