//! Fuzz target for threshold parsing and evaluation.
//!
//! The first line of the input is the selector, the rest are expressions.
//! Anything that parses is evaluated against a small registry, which must
//! never panic and must fail every threshold it cannot resolve.
//!
//! Run with: `cargo +nightly fuzz run fuzz_threshold_expr`

#![no_main]
use libfuzzer_sys::fuzz_target;

use stampede::loadtest::metrics::{tags, MetricsRegistry};
use stampede::loadtest::threshold::{evaluate, ThresholdSet};
use std::time::Duration;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    let mut lines = s.lines();
    let Some(key) = lines.next() else {
        return;
    };
    let expressions: Vec<&str> = lines.collect();
    let Ok(set) = ThresholdSet::parse(key, &expressions) else {
        return;
    };

    let registry = MetricsRegistry::new();
    let t = tags([("status", "200")]);
    let _ = registry.add_trend("http_req_duration", 12.5, &t);
    let _ = registry.add_rate("http_req_failed", false, &t);
    let _ = registry.add_counter("http_reqs", 1.0, &t);

    let report = evaluate(&[set], &registry, Duration::from_secs(1));
    for result in &report.results {
        assert!(result.actual.is_some() || !result.passed);
    }
});
