//! Test report assembly and emission.
//!
//! [`TestReport`] is built once from a [`LoadTestResult`] and handed by
//! reference to every [`ReportSink`] registered on a [`ReportEmitter`]. The
//! emitter performs no I/O itself; sinks fail independently and their
//! failures never change the verdict.

use std::collections::BTreeMap;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::loadtest::check::{panic_message, CHECKS_METRIC};
use crate::loadtest::engine::{LoadTestResult, StopReason};
use crate::loadtest::error::SinkError;
use crate::loadtest::metrics::{MetricSummary, Tags};
use crate::loadtest::stage::Stage;
use crate::loadtest::summary::render_summary;
use crate::loadtest::threshold::ThresholdResult;

/// Schema version for the JSON report format.
///
/// Increment when making breaking changes to the report structure.
const SCHEMA_VERSION: &str = "1.0";

/// Default JSON report location.
pub const DEFAULT_REPORT_TEMPLATE: &str = "load_test_results/{name}_{timestamp}.json";

/// Immutable summary of a finished run.
#[derive(Debug, Serialize)]
pub struct TestReport {
    /// Report format version for parser compatibility.
    pub schema_version: String,
    /// RFC 3339 timestamp when the report was generated.
    pub timestamp: String,
    #[serde(skip)]
    pub generated_at: DateTime<Utc>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    pub duration_secs: f64,
    pub total_iterations: u64,
    pub peak_vus: u32,
    pub stop_reason: StopReason,
    pub stages: Vec<Stage>,
    /// Metric name to its merged summary.
    pub metrics: BTreeMap<String, MetricSummary>,
    /// Per-series breakdown for metrics recorded under more than one tag set.
    pub series: BTreeMap<String, Vec<SeriesReport>>,
    /// Pass/fail counts per check name.
    pub checks: Vec<CheckSummary>,
    /// Threshold selector to the outcomes of its expressions.
    pub thresholds: BTreeMap<String, Vec<ThresholdResult>>,
    pub verdict: bool,
}

#[derive(Debug, Serialize)]
pub struct SeriesReport {
    pub tags: Tags,
    #[serde(flatten)]
    pub summary: MetricSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckSummary {
    pub name: String,
    pub passes: u64,
    pub fails: u64,
}

impl TestReport {
    /// Build a report from a finished run.
    pub fn from_result(result: &LoadTestResult, target_url: Option<&str>) -> Self {
        let registry = &result.registry;
        let generated_at = Utc::now();

        let mut metrics = BTreeMap::new();
        let mut series = BTreeMap::new();
        for name in registry.metric_names() {
            if let Some(summary) = registry.snapshot(&name) {
                metrics.insert(name.clone(), summary.with_elapsed(result.elapsed));
            }
            let per_series = registry.series(&name);
            if per_series.len() > 1 {
                series.insert(
                    name,
                    per_series
                        .into_iter()
                        .map(|(tags, summary)| SeriesReport {
                            tags,
                            summary: summary.with_elapsed(result.elapsed),
                        })
                        .collect(),
                );
            }
        }

        let mut checks: BTreeMap<String, CheckSummary> = BTreeMap::new();
        for (tags, summary) in registry.series(CHECKS_METRIC) {
            let (Some(name), MetricSummary::Rate(rate)) = (tags.get("check"), summary) else {
                continue;
            };
            let entry = checks.entry(name.clone()).or_insert_with(|| CheckSummary {
                name: name.clone(),
                passes: 0,
                fails: 0,
            });
            entry.passes += rate.passes;
            entry.fails += rate.fails;
        }

        let mut thresholds: BTreeMap<String, Vec<ThresholdResult>> = BTreeMap::new();
        for threshold in &result.thresholds.results {
            thresholds
                .entry(threshold.metric.clone())
                .or_default()
                .push(threshold.clone());
        }

        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            timestamp: generated_at.to_rfc3339(),
            generated_at,
            name: result.name.clone(),
            target_url: target_url.map(str::to_string),
            duration_secs: result.elapsed.as_secs_f64(),
            total_iterations: result.total_iterations,
            peak_vus: result.peak_vus,
            stop_reason: result.stop_reason,
            stages: result.schedule.stages().to_vec(),
            metrics,
            series,
            checks: checks.into_values().collect(),
            thresholds,
            verdict: result.thresholds.verdict,
        }
    }

    /// Failed thresholds in selector order.
    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.thresholds.values().flatten().filter(|t| !t.passed)
    }
}

/// Destination for a finished report.
pub trait ReportSink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn emit(&self, report: &TestReport) -> Result<(), SinkError>;
}

/// Result of one sink.
#[derive(Debug)]
pub struct SinkOutcome {
    pub sink: String,
    pub result: Result<(), SinkError>,
}

/// Fans a report out to every registered sink.
#[derive(Default)]
pub struct ReportEmitter {
    sinks: Vec<Box<dyn ReportSink>>,
}

impl ReportEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: impl ReportSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn push(&mut self, sink: Box<dyn ReportSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Hand `report` to every sink in registration order. A failing sink is
    /// logged and the remaining sinks still run.
    ///
    /// A sink that panics is reported as [`SinkError::Panicked`] and does not
    /// stop the sinks after it.
    pub fn emit(&self, report: &TestReport) -> Vec<SinkOutcome> {
        self.sinks
            .iter()
            .map(|sink| {
                let result = catch_unwind(AssertUnwindSafe(|| sink.emit(report)))
                    .unwrap_or_else(|payload| {
                        Err(SinkError::Panicked {
                            message: panic_message(&*payload),
                        })
                    });
                if let Err(e) = &result {
                    tracing::warn!(sink = sink.name(), error = %e, "Report sink failed");
                }
                SinkOutcome {
                    sink: sink.name().to_string(),
                    result,
                }
            })
            .collect()
    }
}

/// Writes the report as pretty JSON to a templated path.
///
/// `{name}` is replaced by the test name and `{timestamp}` by the report's
/// UTC time as `YYYY-MM-DDTHH-MM-SS-mmmZ` (no colons, for Windows).
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    template: String,
}

impl JsonFileSink {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// The file this sink writes `report` to.
    pub fn path_for(&self, report: &TestReport) -> PathBuf {
        report_path(&self.template, &report.name, &report.generated_at)
    }
}

impl Default for JsonFileSink {
    fn default() -> Self {
        Self::new(DEFAULT_REPORT_TEMPLATE)
    }
}

impl ReportSink for JsonFileSink {
    fn name(&self) -> &str {
        "json"
    }

    fn emit(&self, report: &TestReport) -> Result<(), SinkError> {
        let path = self.path_for(report);
        let io_err = |source| SinkError::Io {
            source,
            path: path.display().to_string(),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(&path, json).map_err(io_err)?;
        tracing::info!(path = %path.display(), "Wrote JSON report");
        Ok(())
    }
}

/// Expand a report path template.
pub fn report_path(template: &str, name: &str, timestamp: &DateTime<Utc>) -> PathBuf {
    let safe_name: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stamp = timestamp.format("%Y-%m-%dT%H-%M-%S-%3fZ").to_string();
    PathBuf::from(
        template
            .replace("{name}", &safe_name)
            .replace("{timestamp}", &stamp),
    )
}

/// Writes the rendered terminal summary to a writer (stdout by default).
pub struct SummarySink<W> {
    writer: Mutex<W>,
}

impl SummarySink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> SummarySink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> ReportSink for SummarySink<W> {
    fn name(&self) -> &str {
        "summary"
    }

    fn emit(&self, report: &TestReport) -> Result<(), SinkError> {
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", render_summary(report))
            .and_then(|()| writer.flush())
            .map_err(|source| SinkError::Write { source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::metrics::{tags, MetricsRegistry};
    use crate::loadtest::stage::StageSchedule;
    use crate::loadtest::threshold::{evaluate, ThresholdSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_result() -> LoadTestResult {
        let registry = MetricsRegistry::new();
        for (status, ms) in [("200", 120.0), ("200", 80.0), ("502", 900.0)] {
            let t = tags([("status", status)]);
            registry.add_counter("http_reqs", 1.0, &t).unwrap();
            registry.add_trend("http_req_duration", ms, &t).unwrap();
            registry.add_rate("http_req_failed", status != "200", &t).unwrap();
        }
        registry
            .add_rate("checks", true, &tags([("check", "status is 200")]))
            .unwrap();
        registry
            .add_rate("checks", false, &tags([("check", "status is 200")]))
            .unwrap();

        let sets = vec![
            ThresholdSet::parse("http_req_duration", &["p(95)<4000"]).unwrap(),
            ThresholdSet::parse("http_req_failed", &["rate<0.05"]).unwrap(),
        ];
        let thresholds = evaluate(&sets, &registry, Duration::from_secs(10));
        LoadTestResult {
            name: "smoke test".to_string(),
            registry,
            thresholds,
            elapsed: Duration::from_secs(10),
            total_iterations: 3,
            peak_vus: 2,
            schedule: StageSchedule::flat(2, Duration::from_secs(10)),
            stop_reason: StopReason::Deadline,
        }
    }

    #[test]
    fn test_report_fields() {
        let report = TestReport::from_result(&test_result(), Some("http://svc"));
        assert_eq!(report.schema_version, "1.0");
        assert_eq!(report.target_url.as_deref(), Some("http://svc"));
        assert_eq!(report.total_iterations, 3);
        assert_eq!(report.stages.len(), 2);
        assert!(!report.verdict);
        assert_eq!(report.thresholds.len(), 2);
        assert_eq!(
            report.failed_thresholds().map(|t| t.metric.as_str()).collect::<Vec<_>>(),
            vec!["http_req_failed"]
        );
        assert_eq!(
            report.checks,
            vec![CheckSummary {
                name: "status is 200".to_string(),
                passes: 1,
                fails: 1
            }]
        );
        // Two status tag sets -> per-series breakdown.
        assert_eq!(report.series["http_reqs"].len(), 2);
        assert!(!report.series.contains_key("checks"));
    }

    #[test]
    fn test_report_serializes_to_valid_json() {
        let report = TestReport::from_result(&test_result(), None);
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&report).unwrap()).unwrap();
        assert_eq!(json["schema_version"], "1.0");
        assert_eq!(json["verdict"], false);
        assert_eq!(json["metrics"]["http_reqs"]["type"], "counter");
        assert_eq!(json["metrics"]["http_reqs"]["count"], 3.0);
        assert_eq!(json["metrics"]["http_reqs"]["rate"], 0.3);
        assert_eq!(json["series"]["http_reqs"][0]["rate"], 0.2);
        assert_eq!(json["stages"][1]["duration_secs"], 10.0);
        assert_eq!(json["stop_reason"], "deadline");
        assert!(json.get("target_url").is_none());
        assert!(json["thresholds"]["http_req_failed"][0]["actual"].is_number());
    }

    #[test]
    fn test_report_path_format() {
        let ts = DateTime::parse_from_rfc3339("2024-03-05T14:30:45.123Z")
            .unwrap()
            .with_timezone(&Utc);
        let path = report_path(DEFAULT_REPORT_TEMPLATE, "complex load/balancer", &ts);
        assert_eq!(
            path,
            PathBuf::from("load_test_results/complex_load_balancer_2024-03-05T14-30-45-123Z.json")
        );
        assert!(!path.to_string_lossy().contains(':'));
    }

    #[test]
    fn test_json_sink_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir
            .path()
            .join("nested/out/{name}.json")
            .to_string_lossy()
            .into_owned();
        let sink = JsonFileSink::new(template);
        let report = TestReport::from_result(&test_result(), None);

        sink.emit(&report).unwrap();

        let written = std::fs::read_to_string(sink.path_for(&report)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(json["name"], "smoke test");
    }

    #[test]
    fn test_summary_sink_writes_rendered_summary() {
        colored::control::set_override(false);
        let sink = SummarySink::new(Vec::new());
        let report = TestReport::from_result(&test_result(), None);
        sink.emit(&report).unwrap();
        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert!(out.contains("http_req_duration"), "{out}");
    }

    struct FailingSink;

    impl ReportSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn emit(&self, _report: &TestReport) -> Result<(), SinkError> {
            Err(SinkError::Write {
                source: std::io::Error::other("disk full"),
            })
        }
    }

    struct CountingSink(Arc<AtomicUsize>);

    impl ReportSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        fn emit(&self, _report: &TestReport) -> Result<(), SinkError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_failing_sink_does_not_block_others() {
        let emitted = Arc::new(AtomicUsize::new(0));
        let emitter = ReportEmitter::new()
            .with_sink(FailingSink)
            .with_sink(CountingSink(emitted.clone()));
        let report = TestReport::from_result(&test_result(), None);

        let outcomes = emitter.emit(&report);

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].sink, "failing");
        assert!(outcomes[0].result.is_err());
        assert!(outcomes[1].result.is_ok());
        assert_eq!(emitted.load(Ordering::SeqCst), 1);
        assert!(!report.verdict);
    }

    #[test]
    fn test_json_sink_reports_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "file, not a directory").unwrap();
        let sink = JsonFileSink::new(blocker.join("report.json").to_string_lossy().into_owned());
        let report = TestReport::from_result(&test_result(), None);
        assert!(matches!(sink.emit(&report), Err(SinkError::Io { .. })));
    }

    struct PanickingSink;

    impl ReportSink for PanickingSink {
        fn name(&self) -> &str {
            "panicking"
        }

        fn emit(&self, _report: &TestReport) -> Result<(), SinkError> {
            panic!("sink exploded");
        }
    }

    #[test]
    fn test_panicking_sink_does_not_block_others() {
        let emitted = Arc::new(AtomicUsize::new(0));
        let emitter = ReportEmitter::new()
            .with_sink(PanickingSink)
            .with_sink(CountingSink(emitted.clone()));
        let report = TestReport::from_result(&test_result(), None);

        let outcomes = emitter.emit(&report);

        match &outcomes[0].result {
            Err(SinkError::Panicked { message }) => assert!(message.contains("sink exploded")),
            other => panic!("expected Panicked, got {other:?}"),
        }
        assert!(outcomes[1].result.is_ok());
        assert_eq!(emitted.load(Ordering::SeqCst), 1);
    }
}
