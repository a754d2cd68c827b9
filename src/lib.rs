//! # stampede
//!
//! A staged virtual-user load generator. A [`Workload`] runs on a pool of
//! virtual users whose size follows a piecewise-linear [`StageSchedule`];
//! every request, check and custom value lands in a tagged
//! [`MetricsRegistry`], and the run ends with a pass/fail verdict from the
//! configured thresholds.
//!
//! ```no_run
//! use std::sync::Arc;
//! use stampede::{HttpTransport, LoadTestConfig, LoadTestEngine, ScenarioWorkload};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = LoadTestConfig::load(std::path::Path::new("stampede.toml"))?;
//! let workload = ScenarioWorkload::from_config(&config)?;
//! let transport = HttpTransport::new(std::time::Duration::from_secs(60))?;
//! let result = LoadTestEngine::new(config, Arc::new(workload), Arc::new(transport))
//!     .run()
//!     .await?;
//! println!("passed: {}", result.passed());
//! # Ok(())
//! # }
//! ```

pub mod loadtest;

pub use loadtest::check::{check, CheckOutcome, Checks};
pub use loadtest::config::LoadTestConfig;
pub use loadtest::engine::{LoadTestEngine, LoadTestResult, StopReason};
pub use loadtest::error::{
    AggregationError, LoadTestError, MetricError, SinkError, TransportError, WorkloadError,
};
pub use loadtest::metrics::{tags, MetricKind, MetricSummary, MetricsRegistry, Tags};
pub use loadtest::report::{JsonFileSink, ReportEmitter, ReportSink, SummarySink, TestReport};
pub use loadtest::scenario::ScenarioWorkload;
pub use loadtest::stage::{Stage, StageSchedule};
pub use loadtest::transport::{HttpTransport, Request, Response, Transport};
pub use loadtest::vu::{VuContext, Workload};
