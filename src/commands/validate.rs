//! `stampede validate` command implementation.

use anyhow::{Context, Result};
use std::path::PathBuf;

use stampede::loadtest::config::LoadTestConfig;
use stampede::loadtest::scenario::ScenarioWorkload;

/// Parse and validate a config, its threshold expressions and its scenario,
/// without generating load.
pub fn execute_validate(config_path: Option<PathBuf>) -> Result<()> {
    let config_file = super::locate_config(config_path)?;
    let config = LoadTestConfig::load(&config_file)
        .with_context(|| format!("Failed to load config '{}'", config_file.display()))?;
    let plan = config.resolve().context("Invalid configuration")?;
    let workload = ScenarioWorkload::from_config(&config).context("Invalid scenario")?;

    let thresholds: usize = plan.thresholds.iter().map(|set| set.thresholds.len()).sum();
    println!("{} is valid", config_file.display());
    println!(
        "  {} stage(s), peak {} VUs, deadline {:.1}s",
        plan.schedule.stages().len(),
        plan.schedule.peak_vus(),
        plan.deadline.as_secs_f64()
    );
    println!(
        "  {} scenario step(s), {} threshold(s)",
        workload.len(),
        thresholds
    );
    Ok(())
}
