//! End-to-end runs of the config-driven workload against an in-process
//! transport, on paused tokio time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stampede::loadtest::config::LoadTestConfig;
use stampede::loadtest::engine::{LoadTestEngine, StopReason};
use stampede::loadtest::metrics::MetricSummary;
use stampede::loadtest::report::{ReportEmitter, SummarySink, TestReport};
use stampede::loadtest::scenario::ScenarioWorkload;
use stampede::loadtest::transport::{FnTransport, Request, Response, Transport};

/// Ramp to 5 VUs over 10s, hold for 20s, ramp down over 10s; one request
/// and a 1s think time per iteration.
const RAMP_HOLD_RAMP: &str = r#"
[settings]
name = "ramp-hold-ramp"
base_url = "http://svc.test"
tick = "100ms"

[[stage]]
duration = "10s"
target = 5

[[stage]]
duration = "20s"
target = 5

[[stage]]
duration = "10s"
target = 0

[thresholds]
http_req_duration = "p(95)<500"
http_req_failed = "rate<0.05"
checks = "rate>0.95"
"http_reqs{name:stores}" = "count>0"

[[scenario]]
type = "request"
name = "stores"
path = "/api/v1/stores"
checks = [{ type = "status", equals = 200 }]

[[scenario]]
type = "pause"
duration = "1s"
"#;

/// Returns 500 for every `fail_every`-th request, 200 otherwise.
fn flaky_transport(fail_every: u64) -> Arc<dyn Transport> {
    let calls = AtomicU64::new(0);
    Arc::new(FnTransport::new(move |_req: &Request| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        let status = if fail_every > 0 && n % fail_every == 0 { 500 } else { 200 };
        Ok(Response::new(status)
            .with_body(r#"{"data":[]}"#)
            .with_duration(Duration::from_millis(20)))
    }))
}

async fn run(fail_every: u64) -> (stampede::LoadTestResult, TestReport) {
    let config = LoadTestConfig::from_toml(RAMP_HOLD_RAMP).unwrap();
    let workload = ScenarioWorkload::from_config(&config).unwrap();
    let engine = LoadTestEngine::new(config, Arc::new(workload), flaky_transport(fail_every));
    let result = engine.run().await.unwrap();
    let report = TestReport::from_result(&result, Some("http://svc.test"));
    (result, report)
}

#[tokio::test(start_paused = true)]
async fn test_ramp_hold_ramp_iteration_count() {
    let (result, report) = run(0).await;

    assert_eq!(result.stop_reason, StopReason::Deadline);
    assert_eq!(result.peak_vus, 5);
    // Area under the curve: 5 * (10/2 + 20 + 10/2) = 150 VU-seconds at ~1
    // iteration per VU-second, less ramp quantization.
    assert!(
        (122..=148).contains(&result.total_iterations),
        "iterations: {}",
        result.total_iterations
    );
    match result.registry.snapshot("http_reqs") {
        Some(MetricSummary::Counter(c)) => assert_eq!(c.count, result.total_iterations as f64),
        other => panic!("expected counter, got {other:?}"),
    }
    assert!(result.passed());
    assert!(report.verdict);
    assert_eq!(report.checks.len(), 1);
    assert_eq!(report.checks[0].name, "stores status is 200");
    assert_eq!(report.checks[0].fails, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failures_above_threshold_fail_the_verdict() {
    let (result, report) = run(10).await;

    assert!(!result.passed());
    assert!(!report.verdict);
    let failed: Vec<&str> = report.failed_thresholds().map(|t| t.metric.as_str()).collect();
    assert!(failed.contains(&"http_req_failed"), "{failed:?}");
    assert!(failed.contains(&"checks"), "{failed:?}");
    assert!(!failed.contains(&"http_req_duration"), "{failed:?}");

    match result.registry.snapshot("http_req_failed") {
        Some(MetricSummary::Rate(r)) => {
            let rate = r.rate.unwrap();
            assert!((0.09..=0.11).contains(&rate), "rate: {rate}");
        },
        other => panic!("expected rate, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_iteration_limit_and_report_emission() {
    let config = LoadTestConfig::from_toml(RAMP_HOLD_RAMP).unwrap();
    let workload = ScenarioWorkload::from_config(&config).unwrap();
    let engine =
        LoadTestEngine::new(config, Arc::new(workload), flaky_transport(0)).with_iterations(20);
    let result = engine.run().await.unwrap();
    assert_eq!(result.stop_reason, StopReason::IterationLimit);
    assert_eq!(result.total_iterations, 20);

    colored::control::set_override(false);
    let report = TestReport::from_result(&result, None);
    let emitter = ReportEmitter::new().with_sink(SummarySink::new(Vec::new()));
    let outcomes = emitter.emit(&report);
    assert!(outcomes.iter().all(|o| o.result.is_ok()));
    assert_eq!(report.stop_reason, StopReason::IterationLimit);
}

#[tokio::test(start_paused = true)]
async fn test_unobserved_threshold_metric_fails() {
    let mut config = LoadTestConfig::from_toml(RAMP_HOLD_RAMP).unwrap();
    config.thresholds.insert(
        "grpc_req_duration".to_string(),
        stampede::loadtest::config::ThresholdSpec::One("p(95)<100".to_string()),
    );
    let workload = ScenarioWorkload::from_config(&config).unwrap();
    let engine =
        LoadTestEngine::new(config, Arc::new(workload), flaky_transport(0)).with_iterations(3);
    let result = engine.run().await.unwrap();

    assert!(!result.passed());
    let missing = result
        .thresholds
        .failed()
        .find(|t| t.metric == "grpc_req_duration")
        .expect("threshold on missing metric should fail");
    assert!(missing.actual.is_none());
    assert!(missing.error.is_some());
}
