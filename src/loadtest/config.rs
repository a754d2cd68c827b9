//! TOML-based load test configuration.
//!
//! Defines typed structs for the `stampede.toml` file: general settings,
//! load-shaping `[[stage]]` blocks, `[thresholds]`, and the `[[setup]]` /
//! `[[scenario]]` steps consumed by the built-in HTTP workload.
//!
//! # Example TOML
//!
//! ```toml
//! [settings]
//! name = "complex-load-balancer"
//! base_url = "http://localhost:8080"
//! timeout = "60s"
//! headers = { Authorization = "Bearer ${API_TOKEN}" }
//!
//! [[stage]]
//! duration = "30s"
//! target = 3
//!
//! [[stage]]
//! duration = "1m"
//! target = 8
//!
//! [[stage]]
//! duration = "30s"
//! target = 0
//!
//! [thresholds]
//! http_req_duration = ["p(95)<4000", "p(99)<6000"]
//! http_req_failed = "rate<0.05"
//!
//! [[scenario]]
//! type = "request"
//! name = "stores performances"
//! path = "/api/v1/stores/performances"
//! checks = [{ type = "status", equals = 200 }]
//!
//! [[scenario]]
//! type = "pause"
//! duration = "1s"
//! ```
//!
//! Settings can be overridden with `STAMPEDE_*` environment variables when
//! loaded through [`LoadTestConfig::load`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::loadtest::error::LoadTestError;
use crate::loadtest::metrics::{Tags, TrendStorage};
use crate::loadtest::scenario::ScenarioStep;
use crate::loadtest::stage::{Stage, StageSchedule};
use crate::loadtest::threshold::ThresholdSet;

/// Bounds for the scheduler tick.
const MIN_TICK: Duration = Duration::from_millis(10);
const MAX_TICK: Duration = Duration::from_secs(5);

/// Top-level load test configuration parsed from a TOML file.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LoadTestConfig {
    /// General settings.
    #[serde(default)]
    pub settings: Settings,
    /// Load-shaping stages. The field name is `stage` because TOML
    /// `[[stage]]` array-of-tables syntax creates a key called `stage`.
    #[serde(default)]
    pub stage: Vec<StageConfig>,
    /// Metric selector -> one or more threshold expressions.
    #[serde(default)]
    pub thresholds: BTreeMap<String, ThresholdSpec>,
    /// Steps executed once before load starts.
    #[serde(default)]
    pub setup: Vec<ScenarioStep>,
    /// Steps executed by every VU iteration.
    #[serde(default)]
    pub scenario: Vec<ScenarioStep>,
}

/// A duration written either as a string (`"30s"`, `"1m30s"`, `"250ms"`)
/// or as an integer number of seconds.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum DurationSpec {
    Seconds(i64),
    Text(String),
}

impl DurationSpec {
    pub fn to_duration(&self) -> Result<Duration, String> {
        match self {
            Self::Seconds(s) if *s < 0 => Err(format!("negative duration {s}s")),
            Self::Seconds(s) => Ok(Duration::from_secs(*s as u64)),
            Self::Text(text) => parse_duration(text),
        }
    }
}

impl From<&str> for DurationSpec {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// A `[[stage]]` block as written. Negative values are representable so
/// validation can reject them instead of failing deserialization.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StageConfig {
    pub duration: DurationSpec,
    #[serde(alias = "target")]
    pub target_vus: i64,
}

/// Threshold expressions for one selector: a single string or a list.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ThresholdSpec {
    One(String),
    Many(Vec<String>),
}

impl ThresholdSpec {
    pub fn expressions(&self) -> Vec<&str> {
        match self {
            Self::One(expr) => vec![expr.as_str()],
            Self::Many(exprs) => exprs.iter().map(String::as_str).collect(),
        }
    }
}

/// General load test settings controlling execution parameters.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Test name, used in the report and its file name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Base URL that relative scenario paths are joined onto.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Flat-load VU count, used when no `[[stage]]` blocks exist.
    #[serde(default)]
    pub vus: u32,
    /// Flat-load duration, used when no `[[stage]]` blocks exist.
    #[serde(default)]
    pub duration: Option<DurationSpec>,
    /// Upper bound on the total run time; caps the stage schedule.
    #[serde(default)]
    pub max_duration: Option<DurationSpec>,
    /// Per-request timeout.
    #[serde(default = "default_timeout")]
    pub timeout: DurationSpec,
    /// Scheduler control-loop interval.
    #[serde(default = "default_tick")]
    pub tick: DurationSpec,
    /// How long in-flight iterations may run after the test stops.
    #[serde(default = "default_graceful_stop")]
    pub graceful_stop: DurationSpec,
    /// Stop after this many iterations across all VUs.
    #[serde(default)]
    pub iterations: Option<u64>,
    #[serde(default)]
    pub trend_storage: TrendStorage,
    /// Headers added to every scenario request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Tags added to every metric recorded by VUs.
    #[serde(default)]
    pub tags: Tags,
    /// JSON report path template; `{name}` and `{timestamp}` are substituted.
    #[serde(default = "default_report_path")]
    pub report_path: String,
}

fn default_name() -> String {
    "loadtest".to_string()
}

fn default_timeout() -> DurationSpec {
    DurationSpec::from("60s")
}

fn default_tick() -> DurationSpec {
    DurationSpec::from("250ms")
}

fn default_graceful_stop() -> DurationSpec {
    DurationSpec::from("30s")
}

fn default_report_path() -> String {
    "load_test_results/{name}_{timestamp}.json".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            name: default_name(),
            base_url: None,
            vus: 0,
            duration: None,
            max_duration: None,
            timeout: default_timeout(),
            tick: default_tick(),
            graceful_stop: default_graceful_stop(),
            iterations: None,
            trend_storage: TrendStorage::default(),
            headers: BTreeMap::new(),
            tags: Tags::new(),
            report_path: default_report_path(),
        }
    }
}

/// Validated, strongly typed view of a [`LoadTestConfig`] used by the engine.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub name: String,
    pub schedule: StageSchedule,
    /// Wall-clock bound: the schedule length, capped by `max_duration`.
    pub deadline: Duration,
    pub tick: Duration,
    pub graceful_stop: Duration,
    pub timeout: Duration,
    pub iterations: Option<u64>,
    pub trend_storage: TrendStorage,
    pub thresholds: Vec<ThresholdSet>,
    pub tags: Tags,
}

impl LoadTestConfig {
    /// Parse a TOML string into a validated [`LoadTestConfig`].
    ///
    /// Returns an error if the TOML is malformed or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, LoadTestError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, apply `STAMPEDE_*` environment overrides, and
    /// validate the result.
    ///
    /// Returns [`LoadTestError::ConfigIo`] if the file cannot be read,
    /// [`LoadTestError::ConfigParse`] if the TOML is malformed, or
    /// [`LoadTestError::ConfigValidation`] if validation fails.
    pub fn load(path: &Path) -> Result<Self, LoadTestError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config file and apply `STAMPEDE_*` environment overrides
    /// without validating, so callers can layer further overrides on top
    /// before calling [`validate`](Self::validate).
    pub fn read(path: &Path) -> Result<Self, LoadTestError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoadTestError::ConfigIo {
            source,
            path: path.display().to_string(),
        })?;
        let mut config: Self = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Override settings from `STAMPEDE_*` environment variables.
    ///
    /// A `STAMPEDE_VUS` that is not a non-negative integer is a
    /// [`LoadTestError::ConfigValidation`].
    pub fn apply_env_overrides(&mut self) -> Result<(), LoadTestError> {
        if let Ok(base_url) = std::env::var("STAMPEDE_BASE_URL") {
            self.settings.base_url = Some(base_url);
        }

        if let Ok(timeout) = std::env::var("STAMPEDE_TIMEOUT") {
            self.settings.timeout = DurationSpec::Text(timeout);
        }

        if let Ok(tick) = std::env::var("STAMPEDE_TICK") {
            self.settings.tick = DurationSpec::Text(tick);
        }

        if let Ok(vus) = std::env::var("STAMPEDE_VUS") {
            self.settings.vus = vus.trim().parse().map_err(|_| {
                LoadTestError::validation(format!(
                    "STAMPEDE_VUS must be a non-negative integer, got '{vus}'"
                ))
            })?;
        }

        if let Ok(duration) = std::env::var("STAMPEDE_DURATION") {
            self.settings.duration = Some(DurationSpec::Text(duration));
        }

        if let Ok(report_path) = std::env::var("STAMPEDE_REPORT_PATH") {
            self.settings.report_path = report_path;
        }
        Ok(())
    }

    /// Returns `true` if the config defines load-shaping stages.
    pub fn has_stages(&self) -> bool {
        !self.stage.is_empty()
    }

    /// Build the VU schedule: the `[[stage]]` blocks, or a flat load from
    /// `settings.vus` and `settings.duration`.
    ///
    /// Negative durations and targets are rejected, never clamped.
    pub fn schedule(&self) -> Result<StageSchedule, LoadTestError> {
        if self.has_stages() {
            let stages = self
                .stage
                .iter()
                .enumerate()
                .map(|(i, stage)| {
                    let duration = stage.duration.to_duration().map_err(|e| {
                        LoadTestError::validation(format!("Stage {} has an invalid duration: {e}", i + 1))
                    })?;
                    let target_vus = u32::try_from(stage.target_vus).map_err(|_| {
                        LoadTestError::validation(format!(
                            "Stage {} has an invalid target ({}); targets must be between 0 and {}",
                            i + 1,
                            stage.target_vus,
                            u32::MAX
                        ))
                    })?;
                    Ok(Stage::new(duration, target_vus))
                })
                .collect::<Result<Vec<_>, LoadTestError>>()?;
            let schedule = StageSchedule::new(stages);
            if schedule.checked_total_duration().is_none() {
                return Err(LoadTestError::validation(
                    "The total of the [[stage]] durations is too large",
                ));
            }
            return Ok(schedule);
        }

        let duration = self
            .settings
            .duration
            .as_ref()
            .ok_or_else(|| {
                LoadTestError::validation(
                    "Config must contain [[stage]] blocks or settings.vus with settings.duration",
                )
            })?
            .to_duration()
            .map_err(|e| LoadTestError::validation(format!("settings.duration: {e}")))?;
        if self.settings.vus == 0 {
            return Err(LoadTestError::validation(
                "settings.vus must be greater than 0 for a flat load",
            ));
        }
        Ok(StageSchedule::flat(self.settings.vus, duration))
    }

    /// Parse every `[thresholds]` entry.
    pub fn threshold_sets(&self) -> Result<Vec<ThresholdSet>, LoadTestError> {
        self.thresholds
            .iter()
            .map(|(key, spec)| ThresholdSet::parse(key, &spec.expressions()))
            .collect()
    }

    /// Validate the configuration and produce the engine's [`RunPlan`].
    pub fn resolve(&self) -> Result<RunPlan, LoadTestError> {
        let schedule = self.schedule()?;
        if schedule.total_duration().is_zero() {
            return Err(LoadTestError::validation(
                "The load schedule has zero total duration",
            ));
        }

        let setting = |field: &str, spec: &DurationSpec| {
            spec.to_duration()
                .map_err(|e| LoadTestError::validation(format!("settings.{field}: {e}")))
        };
        let tick = setting("tick", &self.settings.tick)?;
        if !(MIN_TICK..=MAX_TICK).contains(&tick) {
            return Err(LoadTestError::validation(format!(
                "settings.tick must be between {}ms and {}s",
                MIN_TICK.as_millis(),
                MAX_TICK.as_secs()
            )));
        }
        let timeout = setting("timeout", &self.settings.timeout)?;
        if timeout.is_zero() {
            return Err(LoadTestError::validation("settings.timeout must be positive"));
        }
        let graceful_stop = setting("graceful_stop", &self.settings.graceful_stop)?;
        let max_duration = self
            .settings
            .max_duration
            .as_ref()
            .map(|spec| setting("max_duration", spec))
            .transpose()?;

        let deadline = match max_duration {
            Some(max) => max.min(schedule.total_duration()),
            None => schedule.total_duration(),
        };

        if self.settings.iterations == Some(0) {
            return Err(LoadTestError::validation(
                "settings.iterations must be greater than 0",
            ));
        }

        if self.has_stages() && self.settings.vus > 0 {
            tracing::warn!(
                vus = self.settings.vus,
                "settings.vus is ignored when [[stage]] blocks are present"
            );
        }

        Ok(RunPlan {
            name: self.settings.name.clone(),
            schedule,
            deadline,
            tick,
            graceful_stop,
            timeout,
            iterations: self.settings.iterations,
            trend_storage: self.settings.trend_storage,
            thresholds: self.threshold_sets()?,
            tags: self.settings.tags.clone(),
        })
    }

    /// Validate that the config is semantically correct.
    ///
    /// Checks stages, settings and threshold syntax. Scenario steps are
    /// validated when the built-in workload is constructed from them.
    pub fn validate(&self) -> Result<(), LoadTestError> {
        self.resolve().map(|_| ())
    }
}

/// Parse a k6-style duration such as `"30s"`, `"1m30s"` or `"250ms"`.
/// A bare number is seconds and may be fractional.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let s = text.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|e| format!("'{text}': {e}"));
    }
    humantime::parse_duration(s).map_err(|e| format!("invalid duration '{text}': {e}"))
}
