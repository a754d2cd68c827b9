//! k6-style live terminal display for load test progress.
//!
//! Renders a single in-place updating line showing the stage, active and
//! target VUs, completed iterations, request rate, failure rate and p95
//! latency. The engine's control loop publishes the schedule position
//! through a watch channel; the display task reads the metrics itself.

use crate::loadtest::engine::DisplayState;
use crate::loadtest::metrics::MetricsRegistry;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::time::Duration;
use tokio::sync::watch;

/// p95 above this many milliseconds is highlighted.
const SLOW_P95_MS: f64 = 1000.0;

/// Spinner line on stderr.
pub struct LiveDisplay {
    status_bar: ProgressBar,
}

impl LiveDisplay {
    /// Create a new live display.
    ///
    /// If `no_color` is true or stderr is not a terminal (piped),
    /// color output is disabled.
    pub fn new(no_color: bool) -> Self {
        if no_color || !std::io::stderr().is_terminal() {
            colored::control::set_override(false);
        }

        let status_bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        status_bar.set_style(style);
        status_bar.enable_steady_tick(Duration::from_millis(100));

        Self { status_bar }
    }

    /// Format one status line.
    ///
    /// Failures are shown in red once any request failed and p95 in yellow
    /// above one second.
    pub fn format_status(state: &DisplayState) -> String {
        let elapsed_secs = state.elapsed.as_secs_f64();
        let rps = if elapsed_secs > 0.0 {
            state.requests as f64 / elapsed_secs
        } else {
            0.0
        };

        let vus = format!("{}/{}", state.active_vus, state.target_vus).green();
        let rps = format!("{rps:.1}").green();
        let p95 = match state.p95_ms {
            Some(p95) if p95 > SLOW_P95_MS => format!("{p95:.1}ms").yellow().to_string(),
            Some(p95) => format!("{p95:.1}ms").green().to_string(),
            None => "-".to_string(),
        };
        let failed = match state.failed_rate {
            Some(rate) if rate > 0.0 => format!("{:.1}%", rate * 100.0).red().to_string(),
            Some(rate) => format!("{:.1}%", rate * 100.0),
            None => "-".to_string(),
        };

        let line = format!(
            "vus: {vus}  |  iters: {}  |  rps: {rps}  |  p95: {p95}  |  failed: {failed}  |  elapsed: {}s",
            state.iterations,
            state.elapsed.as_secs()
        );

        match &state.stage_label {
            Some(label) => format!("  [{label}]  {line}"),
            None => format!("  {line}"),
        }
    }

    pub fn update(&self, state: &DisplayState) {
        self.status_bar.set_message(Self::format_status(state));
    }

    /// Stop the display and clear the spinner.
    pub fn finish(&self) {
        self.status_bar.finish_and_clear();
    }
}

/// Run the live display until the engine drops its sender.
///
/// The engine publishes only schedule state; the metric numbers are read
/// from `registry` here, off the scheduler's control loop.
pub async fn display_loop(
    mut display_rx: watch::Receiver<DisplayState>,
    registry: MetricsRegistry,
    no_color: bool,
) {
    let display = LiveDisplay::new(no_color);

    eprintln!();
    eprintln!("  Running load test...");
    eprintln!();

    while display_rx.changed().await.is_ok() {
        let state = display_rx.borrow_and_update().clone();
        display.update(&state.with_metrics(&registry));
    }

    let state = display_rx.borrow().clone();
    display.update(&state.with_metrics(&registry));
    display.finish();
}
