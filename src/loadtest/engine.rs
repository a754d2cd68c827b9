//! Load test execution engine.
//!
//! [`LoadTestEngine`] is the top-level orchestrator that:
//! - Runs the workload's setup hook on VU 0
//! - Samples the [`StageSchedule`] on every tick and spawns or retires VU
//!   tasks (tracked by a [`TaskTracker`]) to match the target
//! - Publishes [`DisplayState`] through a watch channel for the live display
//! - Stops at the deadline, the iteration limit or Ctrl+C, then drains
//!   in-flight iterations within the graceful-stop window
//! - Evaluates thresholds against the final registry

use crate::loadtest::config::LoadTestConfig;
use crate::loadtest::display::display_loop;
use crate::loadtest::error::LoadTestError;
use crate::loadtest::metrics::{MetricSummary, MetricsRegistry};
use crate::loadtest::stage::StageSchedule;
use crate::loadtest::threshold::{self, ThresholdReport};
use crate::loadtest::transport::Transport;
use crate::loadtest::vu::{
    names, vu_loop, ActiveVuCounter, IterationCounter, VirtualUser, VuContext, VuSpawn, Workload,
};

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How often the live display is refreshed.
const DISPLAY_INTERVAL: Duration = Duration::from_secs(1);

/// How long VU tasks get to exit after the hard stop before they are aborted.
const HARD_STOP_GRACE: Duration = Duration::from_secs(5);

/// Compile-time Send bounds verification for types crossing task boundaries.
fn _assert_send<T: Send>() {}
#[allow(dead_code)]
fn _check_send_bounds() {
    _assert_send::<DisplayState>();
    _assert_send::<VuSpawn>();
    _assert_send::<LoadTestResult>();
}

/// State published through the watch channel to the live display.
#[derive(Debug, Clone, Default)]
pub struct DisplayState {
    pub elapsed: Duration,
    /// Current stage label (e.g., `"stage 2/3"`), `None` after the last stage.
    pub stage_label: Option<String>,
    /// Running VU tasks, including retired ones finishing an iteration.
    pub active_vus: u32,
    pub target_vus: u32,
    pub iterations: u64,
    pub requests: u64,
    pub failed_rate: Option<f64>,
    pub p95_ms: Option<f64>,
}

impl DisplayState {
    /// Fill in the headline numbers from `registry`. Runs on the display
    /// task, never on the scheduler's control loop.
    pub fn with_metrics(mut self, registry: &MetricsRegistry) -> Self {
        if let Some(MetricSummary::Counter(c)) = registry.snapshot(names::ITERATIONS) {
            self.iterations = c.count as u64;
        }
        if let Some(MetricSummary::Counter(c)) = registry.snapshot(names::HTTP_REQS) {
            self.requests = c.count as u64;
        }
        if let Some(MetricSummary::Rate(r)) = registry.snapshot(names::HTTP_REQ_FAILED) {
            self.failed_rate = r.rate;
        }
        if let Some(MetricSummary::Trend(t)) = registry.snapshot(names::HTTP_REQ_DURATION) {
            self.p95_ms = Some(t.p95);
        }
        self
    }
}

/// Why the control loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The schedule (or `max_duration`) ran out.
    Deadline,
    IterationLimit,
    Interrupted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Deadline => "deadline reached",
            Self::IterationLimit => "iteration limit reached",
            Self::Interrupted => "interrupted",
        })
    }
}

/// Top-level load test engine.
///
/// The configuration is supplied once and shared immutably; the workload
/// and transport are injected.
pub struct LoadTestEngine {
    config: Arc<LoadTestConfig>,
    workload: Arc<dyn Workload>,
    transport: Arc<dyn Transport>,
    max_iterations: Option<u64>,
    live_display: bool,
    no_color: bool,
    handle_signals: bool,
}

impl LoadTestEngine {
    pub fn new(
        config: LoadTestConfig,
        workload: Arc<dyn Workload>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            workload,
            transport,
            max_iterations: None,
            live_display: false,
            no_color: false,
            handle_signals: false,
        }
    }

    /// Sets an iteration limit, overriding `settings.iterations`. The test
    /// stops after this many total iterations across all VUs or at the
    /// deadline, whichever comes first.
    pub fn with_iterations(mut self, n: u64) -> Self {
        self.max_iterations = Some(n);
        self
    }

    /// Enables the live spinner on stderr.
    pub fn with_live_display(mut self, enabled: bool, no_color: bool) -> Self {
        self.live_display = enabled;
        self.no_color = no_color;
        self
    }

    /// Installs the two-phase Ctrl+C handler for the duration of the run.
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn config(&self) -> &LoadTestConfig {
        &self.config
    }

    pub fn max_iterations(&self) -> Option<u64> {
        self.max_iterations
    }

    /// Run the load test.
    ///
    /// Returns [`LoadTestError`] only for configuration or setup failures,
    /// before any load is generated. Everything that goes wrong during the
    /// run ends up in the metrics and the threshold report.
    pub async fn run(&self) -> Result<LoadTestResult, LoadTestError> {
        let plan = self.config.resolve()?;
        let registry = MetricsRegistry::with_trend_storage(plan.trend_storage);
        let stop = CancellationToken::new();
        let hard_stop = CancellationToken::new();
        let tracker = TaskTracker::new();
        let active_vus = ActiveVuCounter::new();
        let iterations = IterationCounter::new(self.max_iterations.or(plan.iterations));

        let mut lifecycle_ctx = VuContext::new(
            VirtualUser::new(0),
            registry.clone(),
            self.transport.clone(),
            plan.tags.clone(),
            hard_stop.clone(),
        );
        self.workload
            .setup(&mut lifecycle_ctx)
            .await
            .map_err(|e| LoadTestError::Setup {
                message: e.to_string(),
            })?;

        tracing::info!(
            name = %plan.name,
            stages = plan.schedule.stages().len(),
            peak_vus = plan.schedule.peak_vus(),
            duration_secs = plan.deadline.as_secs_f64(),
            "Starting load test"
        );

        let (display_tx, display_rx) = watch::channel(DisplayState::default());
        let display_handle = self
            .live_display
            .then(|| tokio::spawn(display_loop(display_rx, registry.clone(), self.no_color)));
        let signal_handle = self
            .handle_signals
            .then(|| tokio::spawn(handle_ctrl_c(stop.clone())));

        let test_start = Instant::now();
        let mut tick = tokio::time::interval(plan.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut vu_tokens: Vec<CancellationToken> = Vec::new();
        let mut vu_handles: Vec<AbortHandle> = Vec::new();
        let mut next_vu_id: u32 = 1;
        let mut peak_vus: u32 = 0;
        let mut current_stage: Option<usize> = None;
        let mut last_display: Option<Instant> = None;

        let stop_reason = loop {
            tokio::select! {
                biased;

                _ = stop.cancelled() => break StopReason::Interrupted,
                _ = tick.tick() => {}
            }

            let elapsed = test_start.elapsed();
            if elapsed >= plan.deadline {
                break StopReason::Deadline;
            }
            if iterations.exhausted() {
                break StopReason::IterationLimit;
            }

            let stage = plan.schedule.stage_index_at(elapsed);
            if stage != current_stage {
                if let Some(index) = stage {
                    tracing::info!(
                        stage = index + 1,
                        of = plan.schedule.stages().len(),
                        target_vus = plan.schedule.stages()[index].target_vus,
                        "Entering stage"
                    );
                }
                current_stage = stage;
            }

            let target = plan.schedule.target_at(elapsed);
            let current = vu_tokens.len() as u32;
            if target > current {
                for _ in current..target {
                    let retire = stop.child_token();
                    vu_tokens.push(retire.clone());
                    tracing::debug!(vu = next_vu_id, "Spawning VU");
                    vu_handles.retain(|handle| !handle.is_finished());
                    let handle = tracker.spawn(vu_loop(VuSpawn {
                        id: next_vu_id,
                        workload: self.workload.clone(),
                        registry: registry.clone(),
                        transport: self.transport.clone(),
                        tags: plan.tags.clone(),
                        retire,
                        hard_stop: hard_stop.clone(),
                        iterations: iterations.clone(),
                        active_vus: active_vus.clone(),
                    }));
                    vu_handles.push(handle.abort_handle());
                    next_vu_id += 1;
                }
            } else if target < current {
                // LIFO: last spawned, first retired.
                for _ in target..current {
                    if let Some(token) = vu_tokens.pop() {
                        token.cancel();
                    }
                }
                tracing::debug!(from = current, to = target, "Retiring VUs");
            }
            peak_vus = peak_vus.max(vu_tokens.len() as u32);

            if self.live_display && last_display.is_none_or(|at| at.elapsed() >= DISPLAY_INTERVAL) {
                last_display = Some(Instant::now());
                let _ = display_tx.send(DisplayState {
                    elapsed,
                    stage_label: plan.schedule.label_at(elapsed),
                    active_vus: active_vus.get(),
                    target_vus: target,
                    ..DisplayState::default()
                });
            }
        };

        tracing::info!(reason = %stop_reason, in_flight = active_vus.get(), "Stopping load test");
        stop.cancel();
        tracker.close();
        if tokio::time::timeout(plan.graceful_stop, tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = active_vus.get(),
                graceful_stop_secs = plan.graceful_stop.as_secs_f64(),
                "Graceful stop window expired, interrupting remaining VUs"
            );
            hard_stop.cancel();
            if tokio::time::timeout(HARD_STOP_GRACE, tracker.wait())
                .await
                .is_err()
            {
                let stragglers = vu_handles.iter().filter(|h| !h.is_finished()).count();
                tracing::warn!(
                    stragglers,
                    "VUs ignored the hard stop, aborting them"
                );
                for handle in &vu_handles {
                    handle.abort();
                }
                // Aborted tasks are dropped at their next await point.
                let _ = tokio::time::timeout(HARD_STOP_GRACE, tracker.wait()).await;
            }
        }
        let elapsed = test_start.elapsed();

        if let Err(e) = self.workload.teardown(&mut lifecycle_ctx).await {
            tracing::warn!(error = %e, "Teardown failed");
        }

        if let Some(handle) = signal_handle {
            handle.abort();
        }
        let _ = display_tx.send(DisplayState {
            elapsed,
            active_vus: active_vus.get(),
            ..DisplayState::default()
        });
        drop(display_tx);
        if let Some(handle) = display_handle {
            let _ = handle.await;
        }

        let thresholds = threshold::evaluate(&plan.thresholds, &registry, elapsed);
        let total_iterations = iterations.completed();
        tracing::info!(
            iterations = total_iterations,
            elapsed_secs = elapsed.as_secs_f64(),
            verdict = thresholds.verdict,
            "Load test finished"
        );

        Ok(LoadTestResult {
            name: plan.name,
            registry,
            thresholds,
            elapsed,
            total_iterations,
            peak_vus,
            schedule: plan.schedule,
            stop_reason,
        })
    }
}

/// Result of a completed load test run.
#[derive(Debug)]
pub struct LoadTestResult {
    pub name: String,
    /// Final metric store. No VU records into it any more.
    pub registry: MetricsRegistry,
    pub thresholds: ThresholdReport,
    /// Total elapsed time, including the graceful-stop drain.
    pub elapsed: Duration,
    pub total_iterations: u64,
    pub peak_vus: u32,
    pub schedule: StageSchedule,
    pub stop_reason: StopReason,
}

impl LoadTestResult {
    /// `true` when every threshold held.
    pub fn passed(&self) -> bool {
        self.thresholds.verdict
    }
}

/// Ctrl+C handler with two-phase shutdown.
///
/// First Ctrl+C triggers graceful drain via the cancellation token.
/// Second Ctrl+C aborts the process.
async fn handle_ctrl_c(stop: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
        return;
    }
    eprintln!("\nReceived Ctrl+C, stopping gracefully...");
    stop.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
        eprintln!("\nReceived second Ctrl+C, aborting immediately.");
        std::process::exit(130);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::error::WorkloadError;
    use crate::loadtest::transport::{FnTransport, Request, Response};
    use async_trait::async_trait;

    fn flat_config(vus: u32, duration: &str) -> LoadTestConfig {
        LoadTestConfig::from_toml(&format!(
            "[settings]\nname = \"engine\"\nvus = {vus}\nduration = \"{duration}\"\ntick = \"100ms\"\n"
        ))
        .unwrap()
    }

    fn ok_transport() -> Arc<dyn Transport> {
        Arc::new(FnTransport::new(|_req: &Request| Ok(Response::new(200))))
    }

    struct Sleeper(Duration);

    #[async_trait]
    impl Workload for Sleeper {
        async fn iteration(&self, ctx: &mut VuContext) -> Result<(), WorkloadError> {
            ctx.request(Request::get("http://svc/")).await?;
            ctx.pause(self.0).await;
            Ok(())
        }
    }

    struct FailingSetup;

    #[async_trait]
    impl Workload for FailingSetup {
        async fn setup(&self, _ctx: &mut VuContext) -> Result<(), WorkloadError> {
            Err(WorkloadError::failed("login rejected"))
        }

        async fn iteration(&self, _ctx: &mut VuContext) -> Result<(), WorkloadError> {
            Ok(())
        }
    }

    #[test]
    fn test_engine_builder() {
        let engine = LoadTestEngine::new(
            flat_config(2, "10s"),
            Arc::new(Sleeper(Duration::from_secs(1))),
            ok_transport(),
        )
        .with_iterations(1000)
        .with_live_display(false, true);

        assert_eq!(engine.max_iterations(), Some(1000));
        assert_eq!(engine.config().settings.vus, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flat_run_holds_vus_and_stops_at_deadline() {
        let engine = LoadTestEngine::new(
            flat_config(3, "10s"),
            Arc::new(Sleeper(Duration::from_secs(1))),
            ok_transport(),
        );
        let result = engine.run().await.unwrap();

        assert_eq!(result.stop_reason, StopReason::Deadline);
        assert_eq!(result.peak_vus, 3);
        // 3 VUs x 10 iterations; the in-flight one at the deadline finishes too.
        assert!(
            (30..=33).contains(&result.total_iterations),
            "iterations: {}",
            result.total_iterations
        );
        assert!(result.passed());
        assert!(result.elapsed >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_iteration_limit_stops_early() {
        let engine = LoadTestEngine::new(
            flat_config(2, "1m"),
            Arc::new(Sleeper(Duration::from_millis(500))),
            ok_transport(),
        )
        .with_iterations(5);
        let result = engine.run().await.unwrap();

        assert_eq!(result.stop_reason, StopReason::IterationLimit);
        assert_eq!(result.total_iterations, 5);
        assert!(result.elapsed < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop_expiry_interrupts_pauses() {
        let config = LoadTestConfig::from_toml(
            "[settings]\nvus = 1\nduration = \"2s\"\ngraceful_stop = \"1s\"\ntick = \"100ms\"\n",
        )
        .unwrap();
        let engine = LoadTestEngine::new(
            config,
            Arc::new(Sleeper(Duration::from_secs(600))),
            ok_transport(),
        );
        let result = engine.run().await.unwrap();

        assert!(result.elapsed < Duration::from_secs(5), "{:?}", result.elapsed);
    }

    /// Ignores every stop signal.
    struct Stuck;

    #[async_trait]
    impl Workload for Stuck {
        async fn iteration(&self, _ctx: &mut VuContext) -> Result<(), WorkloadError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_stop_aborts_uncooperative_vus() {
        let config = LoadTestConfig::from_toml(
            "[settings]\nvus = 1\nduration = \"2s\"\ngraceful_stop = \"1s\"\ntick = \"100ms\"\n\n[thresholds]\nhttp_reqs = \"count>0\"\n",
        )
        .unwrap();
        let engine = LoadTestEngine::new(config, Arc::new(Stuck), ok_transport());
        let result = engine.run().await.unwrap();

        assert!(result.elapsed < Duration::from_secs(60), "{:?}", result.elapsed);
        assert_eq!(result.stop_reason, StopReason::Deadline);
        assert_eq!(result.total_iterations, 0);
        // Thresholds are still evaluated; nothing was requested.
        assert!(!result.passed());
    }

    #[tokio::test]
    async fn test_setup_failure_aborts_before_load() {
        let engine = LoadTestEngine::new(flat_config(1, "10s"), Arc::new(FailingSetup), ok_transport());
        let err = engine.run().await.unwrap_err();
        match err {
            LoadTestError::Setup { message } => assert!(message.contains("login rejected")),
            other => panic!("expected Setup, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_run() {
        let engine = LoadTestEngine::new(
            LoadTestConfig::default(),
            Arc::new(Sleeper(Duration::ZERO)),
            ok_transport(),
        );
        assert!(matches!(
            engine.run().await,
            Err(LoadTestError::ConfigValidation { .. })
        ));
    }

    #[test]
    fn test_display_state_with_metrics() {
        let registry = MetricsRegistry::new();
        let tags = crate::loadtest::metrics::Tags::new();
        registry.add_counter(names::HTTP_REQS, 1.0, &tags).unwrap();
        registry.add_rate(names::HTTP_REQ_FAILED, false, &tags).unwrap();
        registry.add_trend(names::HTTP_REQ_DURATION, 12.0, &tags).unwrap();

        let state = DisplayState {
            elapsed: Duration::from_secs(3),
            stage_label: Some("stage 1/2".to_string()),
            active_vus: 2,
            target_vus: 4,
            ..DisplayState::default()
        }
        .with_metrics(&registry);
        assert_eq!(state.requests, 1);
        assert_eq!(state.iterations, 0);
        assert_eq!(state.failed_rate, Some(0.0));
        assert_eq!(state.p95_ms, Some(12.0));
        assert_eq!(state.stage_label.as_deref(), Some("stage 1/2"));
    }

    #[test]
    fn test_stop_reason_display() {
        assert_eq!(StopReason::Deadline.to_string(), "deadline reached");
        assert_eq!(
            serde_json::to_string(&StopReason::IterationLimit).unwrap(),
            "\"iteration_limit\""
        );
    }
}
