//! Built-in HTTP workload driven by `[[setup]]` and `[[scenario]]` steps.
//!
//! Steps are compiled once by [`ScenarioWorkload::from_config`]: URLs are
//! joined onto `settings.base_url`, `${VAR}` placeholders are expanded from
//! the environment and check rules are resolved. Each VU iteration then
//! walks the compiled steps in order.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use rand::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::loadtest::check::Checks;
use crate::loadtest::config::{DurationSpec, LoadTestConfig};
use crate::loadtest::error::{LoadTestError, TransportError, WorkloadError};
use crate::loadtest::metrics::Tags;
use crate::loadtest::transport::{Method, Request, Response};
use crate::loadtest::vu::{VuContext, Workload};

static ENV_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

const METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// A single scenario step.
///
/// The `type` field in TOML selects the variant: `"request"` or `"pause"`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScenarioStep {
    Request(RequestStep),
    Pause(PauseStep),
}

/// An HTTP request step.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RequestStep {
    /// Label used for the `name` tag and default check names.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    /// Path joined onto `settings.base_url`.
    #[serde(default)]
    pub path: Option<String>,
    /// Absolute URL; takes precedence over `path`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Raw request body.
    #[serde(default)]
    pub body: Option<String>,
    /// JSON request body; sets `Content-Type: application/json`.
    #[serde(default)]
    pub json: Option<serde_json::Value>,
    #[serde(default)]
    pub tags: Tags,
    /// Chance in `(0, 1]` that the step runs in a given iteration.
    #[serde(default)]
    pub probability: Option<f64>,
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
    /// Rate that records `true` whenever the request or any check fails.
    #[serde(default)]
    pub error_rate: Option<String>,
    /// Counter incremented on every call.
    #[serde(default)]
    pub counter: Option<String>,
    /// Trend that records the request duration in milliseconds.
    #[serde(default)]
    pub trend: Option<String>,
    /// Per-request timeout overriding `settings.timeout`.
    #[serde(default)]
    pub timeout: Option<DurationSpec>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// A think-time step.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PauseStep {
    pub duration: DurationSpec,
    /// Uniform random extra delay in `[0, jitter]`.
    #[serde(default)]
    pub jitter: Option<DurationSpec>,
}

/// A declarative response check.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckSpec {
    Status {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        equals: Option<u16>,
        #[serde(default)]
        one_of: Vec<u16>,
    },
    MaxDuration {
        #[serde(default)]
        name: Option<String>,
        max: DurationSpec,
    },
    BodyContains {
        #[serde(default)]
        name: Option<String>,
        text: String,
    },
    JsonPath {
        #[serde(default)]
        name: Option<String>,
        /// Dotted path; numeric segments index arrays (`data.items.0.id`).
        path: String,
        #[serde(default)]
        is_array: bool,
        #[serde(default)]
        equals: Option<serde_json::Value>,
    },
    Header {
        #[serde(default)]
        name: Option<String>,
        header: String,
        #[serde(default)]
        equals: Option<String>,
    },
}

/// The config-driven [`Workload`].
#[derive(Debug)]
pub struct ScenarioWorkload {
    setup: Vec<CompiledStep>,
    steps: Vec<CompiledStep>,
}

#[derive(Debug)]
enum CompiledStep {
    Request(Box<CompiledRequest>),
    Pause { duration: Duration, jitter: Duration },
}

#[derive(Debug)]
struct CompiledRequest {
    label: String,
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    tags: Tags,
    probability: Option<f64>,
    checks: Vec<CompiledCheck>,
    error_rate: Option<String>,
    counter: Option<String>,
    trend: Option<String>,
    timeout: Option<Duration>,
}

#[derive(Debug)]
struct CompiledCheck {
    name: String,
    rule: CheckRule,
}

#[derive(Debug)]
enum CheckRule {
    Status(Vec<u16>),
    MaxDuration(Duration),
    BodyContains(String),
    JsonPath {
        path: Vec<String>,
        is_array: bool,
        equals: Option<serde_json::Value>,
    },
    Header {
        name: String,
        equals: Option<String>,
    },
}

impl CheckRule {
    fn evaluate(&self, response: &Response) -> Result<bool, String> {
        match self {
            Self::Status(allowed) => Ok(allowed.contains(&response.status)),
            Self::MaxDuration(max) => Ok(response.timings.duration <= *max),
            Self::BodyContains(text) => Ok(response.text().contains(text.as_str())),
            Self::JsonPath {
                path,
                is_array,
                equals,
            } => {
                let value = response
                    .json_value()
                    .ok_or_else(|| "response body is not JSON".to_string())?;
                let Some(found) = lookup(&value, path) else {
                    return Ok(false);
                };
                if *is_array && !found.is_array() {
                    return Ok(false);
                }
                Ok(equals.as_ref().is_none_or(|expected| found == expected))
            }
            Self::Header { name, equals } => Ok(match (response.header(name), equals) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(actual), Some(expected)) => actual == expected,
            }),
        }
    }
}

fn lookup<'v>(value: &'v serde_json::Value, path: &[String]) -> Option<&'v serde_json::Value> {
    path.iter().try_fold(value, |current, segment| match current {
        serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        serde_json::Value::Object(map) => map.get(segment),
        _ => None,
    })
}

impl ScenarioWorkload {
    /// Compile the `[[setup]]` and `[[scenario]]` steps of `config`.
    ///
    /// Returns [`LoadTestError::ConfigValidation`] for an empty scenario, an
    /// unknown method, a relative path without `base_url`, a probability
    /// outside `(0, 1]`, a malformed URL or an unset `${VAR}`.
    pub fn from_config(config: &LoadTestConfig) -> Result<Self, LoadTestError> {
        if config.scenario.is_empty() {
            return Err(LoadTestError::validation(
                "Config must contain at least one [[scenario]] step",
            ));
        }
        let compiler = Compiler::new(config)?;
        let setup = config
            .setup
            .iter()
            .enumerate()
            .map(|(i, step)| compiler.compile(step, &format!("setup step {}", i + 1)))
            .collect::<Result<Vec<_>, _>>()?;
        let steps = config
            .scenario
            .iter()
            .enumerate()
            .map(|(i, step)| compiler.compile(step, &format!("scenario step {}", i + 1)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { setup, steps })
    }

    /// Number of scenario steps per iteration.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Compiled request URLs in scenario order.
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().filter_map(|step| match step {
            CompiledStep::Request(req) => Some(req.url.as_str()),
            CompiledStep::Pause { .. } => None,
        })
    }
}

struct Compiler<'a> {
    base_url: Option<String>,
    headers: &'a BTreeMap<String, String>,
}

impl<'a> Compiler<'a> {
    fn new(config: &'a LoadTestConfig) -> Result<Self, LoadTestError> {
        let base_url = config
            .settings
            .base_url
            .as_deref()
            .map(|url| expand_env(url, "settings.base_url"))
            .transpose()?;
        Ok(Self {
            base_url,
            headers: &config.settings.headers,
        })
    }

    fn compile(&self, step: &ScenarioStep, at: &str) -> Result<CompiledStep, LoadTestError> {
        match step {
            ScenarioStep::Pause(pause) => {
                let duration = pause
                    .duration
                    .to_duration()
                    .map_err(|e| LoadTestError::validation(format!("{at}: {e}")))?;
                let jitter = pause
                    .jitter
                    .as_ref()
                    .map(|j| j.to_duration())
                    .transpose()
                    .map_err(|e| LoadTestError::validation(format!("{at}: jitter {e}")))?
                    .unwrap_or(Duration::ZERO);
                Ok(CompiledStep::Pause { duration, jitter })
            }
            ScenarioStep::Request(req) => Ok(CompiledStep::Request(Box::new(
                self.compile_request(req, at)?,
            ))),
        }
    }

    fn compile_request(&self, step: &RequestStep, at: &str) -> Result<CompiledRequest, LoadTestError> {
        let method_name = step.method.to_ascii_uppercase();
        if !METHODS.contains(&method_name.as_str()) {
            return Err(LoadTestError::validation(format!(
                "{at}: unknown HTTP method '{}'",
                step.method
            )));
        }
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|e| LoadTestError::validation(format!("{at}: {e}")))?;

        let url = match (&step.url, &step.path) {
            (Some(url), _) => expand_env(url, at)?,
            (None, Some(path)) => {
                let base = self.base_url.as_deref().ok_or_else(|| {
                    LoadTestError::validation(format!(
                        "{at}: relative path '{path}' requires settings.base_url"
                    ))
                })?;
                join_url(base, &expand_env(path, at)?)
            }
            (None, None) => {
                return Err(LoadTestError::validation(format!(
                    "{at}: a request needs either 'url' or 'path'"
                )))
            }
        };
        url::Url::parse(&url)
            .map_err(|e| LoadTestError::validation(format!("{at}: invalid URL '{url}': {e}")))?;

        if let Some(p) = step.probability {
            if !(p > 0.0 && p <= 1.0) {
                return Err(LoadTestError::validation(format!(
                    "{at}: probability must be in (0, 1], got {p}"
                )));
            }
        }

        let mut merged = self.headers.clone();
        merged.extend(step.headers.clone());
        let mut headers = merged
            .iter()
            .map(|(k, v)| Ok((k.clone(), expand_env(v, at)?)))
            .collect::<Result<Vec<_>, LoadTestError>>()?;

        let body = match (&step.json, &step.body) {
            (Some(json), _) => {
                if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")) {
                    headers.push(("Content-Type".to_string(), "application/json".to_string()));
                }
                Some(expand_json(json, at)?.to_string().into_bytes())
            }
            (None, Some(body)) => Some(expand_env(body, at)?.into_bytes()),
            (None, None) => None,
        };

        let label = step
            .name
            .clone()
            .unwrap_or_else(|| format!("{method_name} {url}"));
        let checks = step
            .checks
            .iter()
            .map(|spec| compile_check(spec, &label, at))
            .collect::<Result<Vec<_>, _>>()?;
        let timeout = step
            .timeout
            .as_ref()
            .map(|t| t.to_duration())
            .transpose()
            .map_err(|e| LoadTestError::validation(format!("{at}: timeout {e}")))?;

        Ok(CompiledRequest {
            label,
            method,
            url,
            headers,
            body,
            tags: step.tags.clone(),
            probability: step.probability,
            checks,
            error_rate: step.error_rate.clone(),
            counter: step.counter.clone(),
            trend: step.trend.clone(),
            timeout,
        })
    }
}

fn compile_check(spec: &CheckSpec, label: &str, at: &str) -> Result<CompiledCheck, LoadTestError> {
    let (name, default_name, rule) = match spec {
        CheckSpec::Status {
            name,
            equals,
            one_of,
        } => {
            let allowed: Vec<u16> = equals.iter().copied().chain(one_of.iter().copied()).collect();
            let default_name = match allowed.as_slice() {
                [] => {
                    return Err(LoadTestError::validation(format!(
                        "{at}: status check needs 'equals' or 'one_of'"
                    )))
                }
                [single] => format!("{label} status is {single}"),
                many => format!("{label} status in {many:?}"),
            };
            (name, default_name, CheckRule::Status(allowed))
        }
        CheckSpec::MaxDuration { name, max } => {
            let max = max
                .to_duration()
                .map_err(|e| LoadTestError::validation(format!("{at}: max_duration {e}")))?;
            (name, format!("{label} duration <= {max:?}"), CheckRule::MaxDuration(max))
        }
        CheckSpec::BodyContains { name, text } => (
            name,
            format!("{label} body contains '{text}'"),
            CheckRule::BodyContains(text.clone()),
        ),
        CheckSpec::JsonPath {
            name,
            path,
            is_array,
            equals,
        } => {
            let default_name = match (is_array, equals) {
                (_, Some(expected)) => format!("{label} {path} == {expected}"),
                (true, None) => format!("{label} {path} is array"),
                (false, None) => format!("{label} has {path}"),
            };
            let segments = path.split('.').map(str::to_string).collect();
            (
                name,
                default_name,
                CheckRule::JsonPath {
                    path: segments,
                    is_array: *is_array,
                    equals: equals.clone(),
                },
            )
        }
        CheckSpec::Header {
            name,
            header,
            equals,
        } => {
            let default_name = match equals {
                Some(expected) => format!("{label} header {header} is {expected}"),
                None => format!("{label} has header {header}"),
            };
            (
                name,
                default_name,
                CheckRule::Header {
                    name: header.clone(),
                    equals: equals.clone(),
                },
            )
        }
    };
    Ok(CompiledCheck {
        name: name.clone().unwrap_or(default_name),
        rule,
    })
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Replace every `${VAR}` in `text` with the variable's value.
pub fn expand_env(text: &str, at: &str) -> Result<String, LoadTestError> {
    let mut missing = None;
    let expanded = ENV_PLACEHOLDER.replace_all(text, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| caps[1].to_string());
            String::new()
        })
    });
    match missing {
        Some(var) => Err(LoadTestError::validation(format!(
            "{at}: environment variable '{var}' is not set"
        ))),
        None => Ok(expanded.into_owned()),
    }
}

fn expand_json(value: &serde_json::Value, at: &str) -> Result<serde_json::Value, LoadTestError> {
    use serde_json::Value;
    Ok(match value {
        Value::String(s) => Value::String(expand_env(s, at)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| expand_json(v, at))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), expand_json(v, at)?)))
                .collect::<Result<_, LoadTestError>>()?,
        ),
        other => other.clone(),
    })
}

/// Result of one request step.
enum StepOutcome {
    Skipped,
    Passed,
    Failed,
}

impl ScenarioWorkload {
    async fn run_steps(steps: &[CompiledStep], ctx: &mut VuContext) -> Result<Vec<StepOutcome>, WorkloadError> {
        let mut outcomes = Vec::with_capacity(steps.len());
        for step in steps {
            if ctx.is_stopping() {
                break;
            }
            match step {
                CompiledStep::Pause { duration, jitter } => {
                    let extra = if jitter.is_zero() {
                        Duration::ZERO
                    } else {
                        let nanos = u64::try_from(jitter.as_nanos()).unwrap_or(u64::MAX);
                        Duration::from_nanos(ctx.rng().random_range(0..=nanos))
                    };
                    ctx.pause(*duration + extra).await;
                }
                CompiledStep::Request(req) => outcomes.push(Self::run_request(req, ctx).await?),
            }
        }
        Ok(outcomes)
    }

    async fn run_request(req: &CompiledRequest, ctx: &mut VuContext) -> Result<StepOutcome, WorkloadError> {
        if let Some(p) = req.probability {
            if !ctx.rng().random_bool(p) {
                return Ok(StepOutcome::Skipped);
            }
        }

        let mut request = Request::new(req.method.clone(), req.url.clone()).name(req.label.clone());
        request.headers = req.headers.clone();
        request.body = req.body.clone();
        request.tags = req.tags.clone();
        request.timeout = req.timeout;

        let result = ctx.request(request).await;
        let checks = req.checks.iter().fold(Checks::new(), |checks, check| {
            checks.try_assert(
                check.name.clone(),
                move |outcome: &Result<Response, TransportError>| match outcome {
                    Ok(response) => check.rule.evaluate(response),
                    Err(err) => Err(err.to_string()),
                },
            )
        });
        let passed = if checks.is_empty() {
            result.as_ref().is_ok_and(|response| !response.is_failure())
        } else {
            ctx.check(&result, &checks, &req.tags).passed && result.is_ok()
        };

        let mut tags = ctx.tags().clone();
        tags.extend(req.tags.clone());
        let registry = ctx.registry();
        if let Some(name) = &req.error_rate {
            registry.add_rate(name, !passed, &tags)?;
        }
        if let Some(name) = &req.counter {
            registry.add_counter(name, 1.0, &tags)?;
        }
        if let (Some(name), Ok(response)) = (&req.trend, &result) {
            registry.add_trend(name, response.timings.duration.as_secs_f64() * 1000.0, &tags)?;
        }

        Ok(if passed {
            StepOutcome::Passed
        } else {
            StepOutcome::Failed
        })
    }
}

#[async_trait]
impl Workload for ScenarioWorkload {
    async fn setup(&self, ctx: &mut VuContext) -> Result<(), WorkloadError> {
        let outcomes = Self::run_steps(&self.setup, ctx).await?;
        let failed = outcomes
            .iter()
            .filter(|o| matches!(o, StepOutcome::Failed))
            .count();
        if failed > 0 {
            return Err(WorkloadError::failed(format!(
                "{failed} setup request(s) failed"
            )));
        }
        Ok(())
    }

    async fn iteration(&self, ctx: &mut VuContext) -> Result<(), WorkloadError> {
        Self::run_steps(&self.steps, ctx).await.map(|_| ())
    }
}
