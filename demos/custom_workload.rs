//! A workload written in Rust instead of TOML steps.
//!
//! Ramps to 8 VUs against a service, calls two endpoints per iteration,
//! checks the responses and records a custom error rate and trend.
//!
//! Usage:
//!   cargo run --example custom_workload -- http://localhost:8080
//!
//! If no URL is provided, defaults to http://localhost:8080.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::prelude::*;
use stampede::loadtest::report::{ReportEmitter, SummarySink, TestReport};
use stampede::{
    tags, Checks, HttpTransport, LoadTestConfig, LoadTestEngine, Request, Response, VuContext,
    Workload, WorkloadError,
};

struct StoreBrowsing {
    base_url: String,
}

#[async_trait]
impl Workload for StoreBrowsing {
    async fn iteration(&self, ctx: &mut VuContext) -> Result<(), WorkloadError> {
        let stores = ctx
            .request(Request::get(format!("{}/api/v1/stores", self.base_url)).name("stores"))
            .await;
        let checks = Checks::new()
            .assert("stores status is 200", |r: &Result<Response, _>| {
                r.as_ref().is_ok_and(|r| r.status == 200)
            })
            .try_assert("stores data is array", |r: &Result<Response, _>| match r {
                Ok(r) => r
                    .json_value()
                    .map(|v| v["data"].is_array())
                    .ok_or("body is not JSON"),
                Err(_) => Ok(false),
            });
        let passed = ctx.check(&stores, &checks, &tags([("kind", "stores")])).passed;
        ctx.add_rate("store_errors", !passed)?;
        if let Ok(response) = &stores {
            ctx.add_trend("store_latency", response.timings.duration.as_secs_f64() * 1000.0)?;
        }

        // One in three iterations also looks at a performance report.
        if ctx.rng().random_bool(1.0 / 3.0) {
            ctx.request(
                Request::get(format!("{}/api/v1/stores/performances", self.base_url))
                    .name("performances"),
            )
            .await?;
        }

        let think = Duration::from_millis(ctx.rng().random_range(500..1500));
        ctx.pause(think).await;
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let base_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://localhost:8080".to_string());

    let config = LoadTestConfig::from_toml(
        r#"
[settings]
name = "store-browsing"
tick = "100ms"

[[stage]]
duration = "10s"
target = 8

[[stage]]
duration = "20s"
target = 8

[[stage]]
duration = "10s"
target = 0

[thresholds]
"http_req_duration{name:stores}" = ["p(95)<4000", "p(99)<6000"]
store_errors = "rate<0.05"
"#,
    )
    .expect("Failed to parse config");

    let transport = HttpTransport::new(Duration::from_secs(60)).expect("Failed to build client");
    let engine = LoadTestEngine::new(
        config,
        Arc::new(StoreBrowsing {
            base_url: base_url.clone(),
        }),
        Arc::new(transport),
    )
    .with_live_display(true, false);

    match engine.run().await {
        Ok(result) => {
            let report = TestReport::from_result(&result, Some(&base_url));
            ReportEmitter::new()
                .with_sink(SummarySink::stdout())
                .emit(&report);
            std::process::exit(if result.passed() { 0 } else { 1 });
        },
        Err(e) => {
            eprintln!("Load test could not start: {e}");
            std::process::exit(2);
        },
    }
}
