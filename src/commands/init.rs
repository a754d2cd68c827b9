//! `stampede init` command implementation.

use anyhow::{Context, Result};
use std::path::PathBuf;

use super::CONFIG_FILE_NAME;

const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// Write a starter `stampede.toml`, refusing to overwrite without `force`.
pub fn execute_init(url: Option<String>, dir: Option<PathBuf>, force: bool) -> Result<()> {
    let config_dir = match dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let config_path = config_dir.join(CONFIG_FILE_NAME);

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}\n\
             Use `--force` to overwrite.",
            config_path.display()
        );
    }

    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create {}", config_dir.display()))?;
    let content = generate_template(url.as_deref().unwrap_or(DEFAULT_BASE_URL));
    std::fs::write(&config_path, content)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    eprintln!("Created {}", config_path.display());
    eprintln!("Edit the file to customize your load test scenario.");
    Ok(())
}

/// Starter config: ramp to 5 VUs, hold, ramp down, one checked request.
fn generate_template(base_url: &str) -> String {
    format!(
        r#"# Load test configuration for stampede

[settings]
name = "smoke"
base_url = "{base_url}"

# Per-request timeout
timeout = "60s"

# How often the scheduler re-evaluates the VU target
# tick = "250ms"

# Headers sent with every request; ${{VAR}} is read from the environment or .env
# headers = {{ Authorization = "Bearer ${{API_TOKEN}}" }}

# Ramp up, hold, ramp down. Replace the stages with `vus` and `duration`
# in [settings] for a flat load.
[[stage]]
duration = "10s"
target = 5

[[stage]]
duration = "20s"
target = 5

[[stage]]
duration = "10s"
target = 0

# The run fails (exit code 1) if any threshold does not hold.
[thresholds]
http_req_duration = ["p(95)<500"]
http_req_failed = "rate<0.01"
checks = "rate>0.95"

[[scenario]]
type = "request"
name = "home"
path = "/"
checks = [{{ type = "status", equals = 200 }}]

[[scenario]]
type = "pause"
duration = "1s"
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampede::loadtest::config::LoadTestConfig;
    use stampede::loadtest::scenario::ScenarioWorkload;

    #[test]
    fn test_template_is_a_valid_config() {
        let config = LoadTestConfig::from_toml(&generate_template(DEFAULT_BASE_URL)).unwrap();
        let plan = config.resolve().unwrap();
        assert_eq!(plan.schedule.peak_vus(), 5);
        assert_eq!(plan.thresholds.len(), 3);
        let workload = ScenarioWorkload::from_config(&config).unwrap();
        assert_eq!(workload.len(), 2);
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        execute_init(None, Some(dir.path().to_path_buf()), false).unwrap();
        let err = execute_init(None, Some(dir.path().to_path_buf()), false).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        execute_init(
            Some("http://svc:9000".to_string()),
            Some(dir.path().to_path_buf()),
            true,
        )
        .unwrap();
        let written = std::fs::read_to_string(dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert!(written.contains("http://svc:9000"));
    }
}
