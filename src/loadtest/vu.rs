//! Virtual user (VU) task loop.
//!
//! Each VU is one tokio task running [`vu_loop`]: it invokes the injected
//! [`Workload`] once per iteration until its retire token is cancelled. A
//! failed or panicking iteration is recorded in `iteration_errors` and the
//! loop moves on. Retirement is only observed between iterations.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rand::prelude::*;
use rand::rngs::StdRng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::loadtest::check::{self, panic_message, CheckOutcome, Checks};
use crate::loadtest::error::{MetricError, TransportError, WorkloadError};
use crate::loadtest::metrics::{MetricsRegistry, Tags};
use crate::loadtest::transport::{Request, Response, Timings, Transport};

/// Built-in metric names.
pub mod names {
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const ITERATION_ERRORS: &str = "iteration_errors";
    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_WAITING: &str = "http_req_waiting";
    pub const HTTP_REQ_RECEIVING: &str = "http_req_receiving";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const HTTP_REQ_ERRORS: &str = "http_req_errors";
    pub const DATA_RECEIVED: &str = "data_received";
}

/// Atomic counter tracking the number of running VU tasks, including
/// retired ones that are still finishing an iteration.
#[derive(Clone)]
pub struct ActiveVuCounter(Arc<AtomicU32>);

impl ActiveVuCounter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(Arc::new(AtomicU32::new(0)))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    /// Returns the current number of running VU tasks.
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for ActiveVuCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Run-wide iteration accounting with an optional cap.
#[derive(Clone, Default)]
pub struct IterationCounter {
    started: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
    limit: Option<u64>,
}

impl IterationCounter {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Claim a slot for a new iteration. `false` once the cap is reached.
    pub fn try_start(&self) -> bool {
        match self.limit {
            None => {
                self.started.fetch_add(1, Ordering::Relaxed);
                true
            }
            Some(limit) => self
                .started
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < limit).then_some(n + 1)
                })
                .is_ok(),
        }
    }

    fn finish(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    /// Iterations that ran to completion (successfully or not).
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// `true` once the cap is set and every allowed iteration has completed.
    pub fn exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.completed() >= limit)
    }
}

/// Identity and per-VU state. Owned by the VU task; the workload borrows it
/// through [`VuContext`] for the duration of one iteration.
#[derive(Debug)]
pub struct VirtualUser {
    id: u32,
    iterations: u64,
    rng: StdRng,
}

impl VirtualUser {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            iterations: 0,
            rng: StdRng::from_rng(&mut rand::rng()),
        }
    }

    /// Deterministic RNG stream, for reproducible tests.
    pub fn with_seed(id: u32, seed: u64) -> Self {
        Self {
            id,
            iterations: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Completed iterations.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }
}

/// What a workload sees during an iteration.
pub struct VuContext {
    vu: VirtualUser,
    registry: MetricsRegistry,
    transport: Arc<dyn Transport>,
    tags: Tags,
    hard_stop: CancellationToken,
}

impl VuContext {
    pub fn new(
        vu: VirtualUser,
        registry: MetricsRegistry,
        transport: Arc<dyn Transport>,
        tags: Tags,
        hard_stop: CancellationToken,
    ) -> Self {
        Self {
            vu,
            registry,
            transport,
            tags,
            hard_stop,
        }
    }

    pub fn vu_id(&self) -> u32 {
        self.vu.id
    }

    /// Zero-based index of the current iteration.
    pub fn iteration(&self) -> u64 {
        self.vu.iterations
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.vu.rng
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    /// Tags applied to every metric this VU records.
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// `true` once the engine has given up waiting for this VU.
    pub fn is_stopping(&self) -> bool {
        self.hard_stop.is_cancelled()
    }

    /// Suspend this VU only. Returns early if the run is hard-stopped.
    pub async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.hard_stop.cancelled() => {}
        }
    }

    /// Send a request through the transport and record the HTTP metrics.
    ///
    /// A transport error is recorded as a failed request with status `"0"`
    /// and returned to the caller.
    pub async fn request(&self, request: Request) -> Result<Response, TransportError> {
        let mut tags = self.tags.clone();
        tags.extend(request.tags.clone());
        tags.insert("method".to_string(), request.method.as_str().to_string());
        tags.insert("name".to_string(), request.metric_name().to_string());

        let start = Instant::now();
        let result = self.transport.send(request).await;
        match &result {
            Ok(response) => {
                tags.insert("status".to_string(), response.status.to_string());
                self.record_http(&tags, response.timings, response.body.len(), response.is_failure());
            }
            Err(err) => {
                let elapsed = start.elapsed();
                tags.insert("status".to_string(), "0".to_string());
                let timings = Timings {
                    duration: elapsed,
                    waiting: elapsed,
                    receiving: Duration::ZERO,
                };
                self.record_http(&tags, timings, 0, true);
                let mut error_tags = tags.clone();
                error_tags.insert("category".to_string(), err.category().to_string());
                warn_on_error(self.registry.add_counter(names::HTTP_REQ_ERRORS, 1.0, &error_tags));
                tracing::debug!(vu = self.vu.id, error = %err, "Request failed");
            }
        }
        result
    }

    fn record_http(&self, tags: &Tags, timings: Timings, bytes: usize, failed: bool) {
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        let registry = &self.registry;
        warn_on_error(registry.add_counter(names::HTTP_REQS, 1.0, tags));
        warn_on_error(registry.add_trend(names::HTTP_REQ_DURATION, ms(timings.duration), tags));
        warn_on_error(registry.add_trend(names::HTTP_REQ_WAITING, ms(timings.waiting), tags));
        warn_on_error(registry.add_trend(names::HTTP_REQ_RECEIVING, ms(timings.receiving), tags));
        warn_on_error(registry.add_rate(names::HTTP_REQ_FAILED, failed, tags));
        warn_on_error(registry.add_counter(names::DATA_RECEIVED, bytes as f64, tags));
    }

    /// Evaluate named assertions against `response`. Outcomes carry this
    /// VU's tags plus `tags`, so thresholds like `checks{kind:gateway}`
    /// select them.
    pub fn check<R>(&self, response: &R, checks: &Checks<'_, R>, tags: &Tags) -> CheckOutcome {
        if tags.is_empty() {
            return check::check(&self.registry, response, checks, &self.tags);
        }
        let mut merged = self.tags.clone();
        merged.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        check::check(&self.registry, response, checks, &merged)
    }

    /// Add to a custom counter with this VU's tags.
    pub fn add_counter(&self, name: &str, value: f64) -> Result<(), MetricError> {
        self.registry.add_counter(name, value, &self.tags)
    }

    /// Record a pass or fail on a custom rate with this VU's tags.
    pub fn add_rate(&self, name: &str, passed: bool) -> Result<(), MetricError> {
        self.registry.add_rate(name, passed, &self.tags)
    }

    /// Record a sample on a custom trend with this VU's tags.
    pub fn add_trend(&self, name: &str, value: f64) -> Result<(), MetricError> {
        self.registry.add_trend(name, value, &self.tags)
    }
}

fn warn_on_error(result: Result<(), MetricError>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "Failed to record metric");
    }
}

/// The user-supplied code each VU runs.
#[async_trait]
pub trait Workload: Send + Sync {
    /// Runs once on VU 0 before any load. An error aborts the run.
    async fn setup(&self, _ctx: &mut VuContext) -> Result<(), WorkloadError> {
        Ok(())
    }

    /// One iteration.
    async fn iteration(&self, ctx: &mut VuContext) -> Result<(), WorkloadError>;

    /// Runs once on VU 0 after load has stopped. Errors are logged.
    async fn teardown(&self, _ctx: &mut VuContext) -> Result<(), WorkloadError> {
        Ok(())
    }
}

/// Everything a VU task needs.
pub struct VuSpawn {
    pub id: u32,
    pub workload: Arc<dyn Workload>,
    pub registry: MetricsRegistry,
    pub transport: Arc<dyn Transport>,
    pub tags: Tags,
    /// Cancelled by the scheduler to retire this VU.
    pub retire: CancellationToken,
    /// Cancelled when the graceful-stop window expires.
    pub hard_stop: CancellationToken,
    pub iterations: IterationCounter,
    pub active_vus: ActiveVuCounter,
}

/// Main virtual user task loop.
///
/// Runs iterations until the retire token is cancelled, the hard stop fires
/// or the iteration cap is reached. The `active_vus` counter is incremented
/// on entry and decremented when the task ends or is aborted.
pub async fn vu_loop(spawn: VuSpawn) {
    let VuSpawn {
        id,
        workload,
        registry,
        transport,
        tags,
        retire,
        hard_stop,
        iterations,
        active_vus,
    } = spawn;

    active_vus.increment();
    let _active = ActiveGuard(active_vus);
    let mut ctx = VuContext::new(VirtualUser::new(id), registry, transport, tags, hard_stop);

    while !retire.is_cancelled() && !ctx.is_stopping() {
        if !iterations.try_start() {
            break;
        }
        run_iteration(workload.as_ref(), &mut ctx).await;
        iterations.finish();
    }

    tracing::debug!(vu = id, iterations = ctx.vu.iterations, "VU exited");
}

/// Decrements the active count when the VU task ends, including when the
/// engine aborts it.
struct ActiveGuard(ActiveVuCounter);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.decrement();
    }
}

/// Run one iteration and record `iterations`, `iteration_duration` and, on
/// failure, `iteration_errors`.
pub async fn run_iteration(workload: &dyn Workload, ctx: &mut VuContext) {
    let start = Instant::now();
    let result = AssertUnwindSafe(workload.iteration(ctx)).catch_unwind().await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    let error_kind = match result {
        Ok(Ok(())) => None,
        Ok(Err(err)) => {
            tracing::debug!(vu = ctx.vu.id, error = %err, "Iteration failed");
            Some(err.kind())
        }
        Err(payload) => {
            tracing::warn!(
                vu = ctx.vu.id,
                panic = %panic_message(&*payload),
                "Iteration panicked"
            );
            Some("panic")
        }
    };

    ctx.vu.iterations += 1;
    warn_on_error(ctx.registry.add_counter(names::ITERATIONS, 1.0, &ctx.tags));
    warn_on_error(ctx.registry.add_trend(names::ITERATION_DURATION, elapsed_ms, &ctx.tags));
    if let Some(kind) = error_kind {
        let mut tags = ctx.tags.clone();
        tags.insert("error".to_string(), kind.to_string());
        warn_on_error(ctx.registry.add_counter(names::ITERATION_ERRORS, 1.0, &tags));
    }
}
