//! k6-style terminal summary renderer for finished runs.
//!
//! Produces a colorized, human-readable summary with:
//! - ASCII art header with the run shape
//! - Dotted-line metric rows (metric.........: value), one per metric
//! - Check pass/fail counts
//! - Threshold outcomes and the final verdict
//!
//! [`render_summary`] is a pure function over a [`TestReport`]. Color coding
//! goes through the `colored` crate, which respects the global override set
//! by `colored::control::set_override(false)` when `--no-color` is active or
//! output is piped.

use colored::Colorize;

use crate::loadtest::metrics::{MetricSummary, RateSummary, TrendSummary};
use crate::loadtest::report::TestReport;
use crate::loadtest::vu::names;

/// Width for dotted metric row padding.
const PAD_WIDTH: usize = 40;

/// Built-in trends recorded in milliseconds.
const MILLISECOND_TRENDS: &[&str] = &[
    names::ITERATION_DURATION,
    names::HTTP_REQ_DURATION,
    names::HTTP_REQ_WAITING,
    names::HTTP_REQ_RECEIVING,
];

/// Render a k6-style terminal summary.
///
/// # Layout
///
/// ```text
///           /\      |  stampede
///          /  \     |
///     /\  /    \    |  name:      smoke
///    /  \/      \   |  target:    http://localhost:8080
///   /    \       \  |  vus:       5 max, 3 stages
///  /      \       \ |  duration:  40.0s (deadline reached)
///
///   checks:
///     ✓ status is 200...........................: 145 ✓ 0 ✗
///
///   http_req_duration.........................: avg=12.40ms min=3.10ms med=10.00ms ...
///   http_req_failed...........................: 0.00%  ✓ 0  ✗ 145
///   http_reqs.................................: 145  3.6/s
///
///   thresholds:
///     ✓ http_req_duration: p(95)<500 (actual 21.30)
///
///   verdict: PASSED
/// ```
pub fn render_summary(report: &TestReport) -> String {
    let mut lines = vec![render_header(report)];

    if !report.checks.is_empty() {
        lines.push("  checks:".to_string());
        for check in &report.checks {
            let mark = if check.fails == 0 {
                "✓".green().to_string()
            } else {
                "✗".red().to_string()
            };
            lines.push(format_metric_row(
                &format!("  {mark} {}", check.name),
                &format!("{} ✓ {} ✗", check.passes, check.fails),
                PAD_WIDTH,
            ));
        }
        lines.push(String::new());
    }

    for (name, summary) in &report.metrics {
        let value = match summary {
            MetricSummary::Counter(counter) => format!(
                "{}  {:.1}/s",
                format_number(counter.count),
                counter.rate.unwrap_or(0.0)
            ),
            MetricSummary::Rate(rate) => format_rate(rate),
            MetricSummary::Trend(trend) => {
                format_trend(trend, MILLISECOND_TRENDS.contains(&name.as_str()))
            }
        };
        lines.push(format_metric_row(name, &value, PAD_WIDTH));
    }

    if !report.thresholds.is_empty() {
        lines.push(String::new());
        lines.push("  thresholds:".to_string());
        for result in report.thresholds.values().flatten() {
            let mark = if result.passed {
                "✓".green().to_string()
            } else {
                "✗".red().to_string()
            };
            let detail = match (&result.actual, &result.error) {
                (_, Some(error)) => error.yellow().to_string(),
                (Some(actual), None) => format!("actual {actual:.2}"),
                (None, None) => "no data".to_string(),
            };
            lines.push(format!(
                "    {mark} {}: {} ({detail})",
                result.metric, result.expression
            ));
        }
    }

    lines.push(String::new());
    let verdict = if report.verdict {
        "PASSED".green().bold().to_string()
    } else {
        "FAILED".red().bold().to_string()
    };
    lines.push(format!("  verdict: {verdict}"));

    lines.join("\n")
}

/// Render the ASCII art header with the run shape.
fn render_header(report: &TestReport) -> String {
    let peak = report.stages.iter().map(|s| s.target_vus).max().unwrap_or(0);
    format!(
        r#"
          /\      |  {}
         /  \     |
    /\  /    \    |  name:      {}
   /  \/      \   |  target:    {}
  /    \       \  |  vus:       {} max, {} stages
 /      \       \ |  duration:  {:.1}s ({})
"#,
        "stampede".bold(),
        report.name,
        report.target_url.as_deref().unwrap_or("-"),
        peak.max(report.peak_vus),
        report.stages.len(),
        report.duration_secs,
        report.stop_reason,
    )
}

fn format_rate(rate: &RateSummary) -> String {
    match rate.rate {
        Some(r) => format!("{:.2}%  ✓ {}  ✗ {}", r * 100.0, rate.passes, rate.fails),
        None => "no data".to_string(),
    }
}

fn format_trend(trend: &TrendSummary, millis: bool) -> String {
    if trend.count == 0 {
        return "no data".to_string();
    }
    let unit = if millis { "ms" } else { "" };
    format!(
        "avg={:.2}{unit} min={:.2}{unit} med={:.2}{unit} max={:.2}{unit} p(90)={:.2}{unit} p(95)={:.2}{unit}",
        trend.avg, trend.min, trend.med, trend.max, trend.p90, trend.p95
    )
}

/// Whole numbers print without a fraction.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}

/// Format a single metric row with dot-padding.
///
/// Produces: `"  metric_name..................: value_string"`
fn format_metric_row(name: &str, value: &str, pad_width: usize) -> String {
    format!("  {name:.<pad_width$}: {value}")
}
