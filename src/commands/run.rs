//! `stampede run` command implementation.

use anyhow::{Context, Result};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use stampede::loadtest::config::{DurationSpec, LoadTestConfig};
use stampede::loadtest::engine::LoadTestEngine;
use stampede::loadtest::report::{JsonFileSink, ReportEmitter, SummarySink, TestReport};
use stampede::loadtest::scenario::ScenarioWorkload;
use stampede::loadtest::transport::HttpTransport;

use crate::GlobalFlags;

/// CLI flags that override the config file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub url: Option<String>,
    pub vus: Option<u32>,
    pub duration: Option<String>,
    pub iterations: Option<u64>,
    pub out: Option<String>,
    pub no_report: bool,
}

/// Execute the `run` command and return the verdict.
///
/// Loads config (via explicit path or auto-discovery), applies CLI overrides
/// and only then validates, so flags can supply what the file leaves out.
/// Builds the HTTP workload and runs the engine, then hands the report to
/// the summary and JSON sinks. Any error returned here happened before load
/// was generated.
pub async fn execute_run(
    config_path: Option<PathBuf>,
    overrides: Overrides,
    global: &GlobalFlags,
) -> Result<bool> {
    // Step 1: Load config
    let config_file = super::locate_config(config_path)?;
    tracing::info!(path = %config_file.display(), "Loading config");

    let mut config = LoadTestConfig::read(&config_file)
        .with_context(|| format!("Failed to load config '{}'", config_file.display()))?;

    // Step 2: Apply CLI overrides, then validate the combined result
    apply_overrides(&mut config, &overrides);
    let plan = config.resolve().context("Invalid configuration")?;

    // Step 3: Build the workload and transport
    let workload = ScenarioWorkload::from_config(&config).context("Invalid scenario")?;
    let transport = HttpTransport::new(plan.timeout).context("Failed to build HTTP client")?;
    let target_url = config.settings.base_url.clone();
    let report_template = overrides
        .out
        .clone()
        .unwrap_or_else(|| config.settings.report_path.clone());

    // Step 4: Run
    let mut engine = LoadTestEngine::new(config, Arc::new(workload), Arc::new(transport))
        .with_live_display(!global.quiet, global.no_color)
        .with_signal_handling(true);
    if let Some(n) = overrides.iterations {
        engine = engine.with_iterations(n);
    }

    let result = engine.run().await.context("Load test could not start")?;

    // Step 5: Emit the report. Sink failures are logged and never change the verdict.
    if global.no_color || !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }

    let report = TestReport::from_result(&result, target_url.as_deref());
    let mut emitter = ReportEmitter::new().with_sink(SummarySink::stdout());
    let json_sink = (!overrides.no_report).then(|| JsonFileSink::new(report_template));
    if let Some(sink) = &json_sink {
        emitter.push(Box::new(sink.clone()));
    }

    for outcome in emitter.emit(&report) {
        if let Err(e) = outcome.result {
            eprintln!();
            eprintln!("Warning: {} sink failed: {e}", outcome.sink);
        } else if let (Some(sink), "json") = (&json_sink, outcome.sink.as_str()) {
            eprintln!();
            eprintln!("Report written to: {}", sink.path_for(&report).display());
        }
    }

    Ok(report.verdict)
}

/// Apply CLI flag overrides to a loaded config.
///
/// When stages are present, `--vus` is ignored (stages define VU targets)
/// and `--duration` becomes a ceiling on the staged run.
fn apply_overrides(config: &mut LoadTestConfig, overrides: &Overrides) {
    if let Some(url) = &overrides.url {
        config.settings.base_url = Some(url.clone());
    }
    if let Some(v) = overrides.vus {
        if config.has_stages() {
            tracing::warn!(
                vus = v,
                "--vus ignored because config contains [[stage]] blocks (stages define VU targets)"
            );
        } else {
            config.settings.vus = v;
        }
    }
    if let Some(d) = &overrides.duration {
        let spec = DurationSpec::Text(d.clone());
        if config.has_stages() {
            config.settings.max_duration = Some(spec);
        } else {
            config.settings.duration = Some(spec);
        }
    }
    if let Some(out) = &overrides.out {
        config.settings.report_path = out.clone();
    }
}
