//! Threshold expressions and end-of-run evaluation.
//!
//! Thresholds are keyed by a metric selector and hold one or more
//! expressions of the form `<statistic> <op> <number>`:
//!
//! ```toml
//! [thresholds]
//! http_req_duration = ["p(95)<4000", "p(99)<6000"]
//! "http_req_duration{kind:kong_gateway}" = "p(95)<500"
//! http_req_failed = "rate<0.05"
//! http_reqs = "rate>10"
//! ```
//!
//! Syntax errors are configuration errors. Problems that can only be seen
//! against the recorded data (a metric that never appeared, a statistic that
//! does not apply to the metric's kind) surface as failed thresholds carrying
//! an [`AggregationError`].

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

use crate::loadtest::error::{AggregationError, LoadTestError};
use crate::loadtest::metrics::{render_selector, MetricKind, MetricSummary, MetricsRegistry, Tags};

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_]+(?:\(\s*[^)]*\))?)\s*(<=|>=|==|!=|<|>)\s*(\S+)\s*$")
        .expect("threshold expression regex is valid")
});

/// The aggregate a threshold looks at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statistic {
    Avg,
    Min,
    Max,
    Med,
    Count,
    Rate,
    Percentile(f64),
}

impl FromStr for Statistic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        match compact.as_str() {
            "avg" => Ok(Self::Avg),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "med" => Ok(Self::Med),
            "count" => Ok(Self::Count),
            "rate" => Ok(Self::Rate),
            other => {
                let inner = other
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown statistic '{s}'"))?;
                let p: f64 = inner
                    .parse()
                    .map_err(|_| format!("invalid percentile '{inner}'"))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(format!("percentile {p} is outside 0..=100"));
                }
                Ok(Self::Percentile(p))
            }
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Med => f.write_str("med"),
            Self::Count => f.write_str("count"),
            Self::Rate => f.write_str("rate"),
            Self::Percentile(p) => write!(f, "p({p})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparator {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "==" => Self::Eq,
            "!=" => Self::Ne,
            _ => return None,
        })
    }

    pub fn holds(self, actual: f64, expected: f64) -> bool {
        match self {
            Self::Lt => actual < expected,
            Self::Le => actual <= expected,
            Self::Gt => actual > expected,
            Self::Ge => actual >= expected,
            Self::Eq => actual == expected,
            Self::Ne => actual != expected,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        })
    }
}

/// A parsed `<statistic> <op> <number>` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdExpr {
    pub statistic: Statistic,
    pub comparator: Comparator,
    pub value: f64,
}

impl FromStr for ThresholdExpr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = EXPRESSION
            .captures(s)
            .ok_or_else(|| format!("invalid threshold expression '{s}'"))?;
        let statistic: Statistic = caps[1].parse()?;
        let comparator = Comparator::parse(&caps[2])
            .ok_or_else(|| format!("invalid comparator '{}'", &caps[2]))?;
        let value: f64 = caps[3]
            .parse()
            .ok()
            .filter(|v: &f64| v.is_finite())
            .ok_or_else(|| format!("invalid threshold value '{}'", &caps[3]))?;
        Ok(Self {
            statistic,
            comparator,
            value,
        })
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.statistic, self.comparator, self.value)
    }
}

/// Metric name plus optional tag filter: `name` or `name{k:v,k2:v2}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSelector {
    pub name: String,
    pub tags: Tags,
}

impl FromStr for MetricSelector {
    type Err = String;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let key = key.trim();
        let (name, filter) = match key.split_once('{') {
            None => (key, None),
            Some((name, rest)) => {
                let inner = rest
                    .strip_suffix('}')
                    .ok_or_else(|| format!("unterminated tag filter in '{key}'"))?;
                (name.trim(), Some(inner))
            }
        };
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(format!("invalid metric name in '{key}'"));
        }

        let mut tags = Tags::new();
        for pair in filter.into_iter().flat_map(|f| f.split(',')) {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (k, v) = pair
                .split_once(':')
                .or_else(|| pair.split_once('='))
                .ok_or_else(|| format!("tag filter '{pair}' in '{key}' must be key:value"))?;
            tags.insert(k.trim().to_string(), v.trim().to_string());
        }
        Ok(Self {
            name: name.to_string(),
            tags,
        })
    }
}

impl fmt::Display for MetricSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render_selector(&self.name, &self.tags))
    }
}

/// One expression as written in config, with its parse.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub source: String,
    pub expr: ThresholdExpr,
}

/// All thresholds declared for one selector.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSet {
    pub selector: MetricSelector,
    pub thresholds: Vec<Threshold>,
}

impl ThresholdSet {
    /// Parse a selector key and its expressions. Any syntax problem is a
    /// [`LoadTestError::ConfigValidation`].
    pub fn parse<S: AsRef<str>>(key: &str, expressions: &[S]) -> Result<Self, LoadTestError> {
        let selector: MetricSelector = key
            .parse()
            .map_err(|e| LoadTestError::validation(format!("threshold key: {e}")))?;
        if expressions.is_empty() {
            return Err(LoadTestError::validation(format!(
                "threshold '{key}' has no expressions"
            )));
        }
        let thresholds = expressions
            .iter()
            .map(|source| {
                let source = source.as_ref();
                source
                    .parse()
                    .map(|expr| Threshold {
                        source: source.trim().to_string(),
                        expr,
                    })
                    .map_err(|e| LoadTestError::validation(format!("threshold '{key}': {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            selector,
            thresholds,
        })
    }
}

/// Outcome of a single threshold expression.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdResult {
    /// Selector key, e.g. `http_req_duration{kind:kong_gateway}`.
    pub metric: String,
    pub expression: String,
    pub passed: bool,
    /// The resolved statistic, if it could be resolved.
    pub actual: Option<f64>,
    pub expected: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-threshold outcomes plus the aggregate verdict.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdReport {
    pub results: Vec<ThresholdResult>,
    pub verdict: bool,
}

impl ThresholdReport {
    pub fn failed(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

/// Evaluate every threshold against the registry's current data.
///
/// `elapsed` is the run duration; it turns a counter's sum into a per-second
/// `rate`. Never mutates the registry. With no thresholds the verdict is
/// `true`.
pub fn evaluate(
    sets: &[ThresholdSet],
    registry: &MetricsRegistry,
    elapsed: Duration,
) -> ThresholdReport {
    let mut results = Vec::new();
    for set in sets {
        let key = set.selector.to_string();
        let summary = registry.snapshot_matching(&set.selector.name, &set.selector.tags);
        for threshold in &set.thresholds {
            let expr = &threshold.expr;
            let resolved = match &summary {
                Some(summary) => resolve(expr.statistic, summary, elapsed, &key),
                None => Err(AggregationError::UnknownMetric {
                    metric: key.clone(),
                }),
            };
            let result = match resolved {
                Ok(actual) => ThresholdResult {
                    metric: key.clone(),
                    expression: threshold.source.clone(),
                    passed: expr.comparator.holds(actual, expr.value),
                    actual: Some(actual),
                    expected: expr.value,
                    error: None,
                },
                Err(err) => ThresholdResult {
                    metric: key.clone(),
                    expression: threshold.source.clone(),
                    passed: false,
                    actual: None,
                    expected: expr.value,
                    error: Some(err.to_string()),
                },
            };
            if !result.passed {
                tracing::debug!(metric = %key, expression = %threshold.source, "threshold failed");
            }
            results.push(result);
        }
    }
    let verdict = results.iter().all(|r| r.passed);
    ThresholdReport { results, verdict }
}

/// Extract `statistic` from a summary.
pub fn resolve(
    statistic: Statistic,
    summary: &MetricSummary,
    elapsed: Duration,
    metric: &str,
) -> Result<f64, AggregationError> {
    let unsupported = || AggregationError::UnsupportedStatistic {
        statistic: statistic.to_string(),
        kind: summary.kind(),
    };
    match summary {
        MetricSummary::Counter(counter) => match statistic {
            Statistic::Count => Ok(counter.count),
            Statistic::Rate => {
                counter
                    .per_second(elapsed)
                    .ok_or_else(|| AggregationError::NoData {
                        metric: metric.to_string(),
                    })
            }
            _ => Err(unsupported()),
        },
        MetricSummary::Rate(rate) => match statistic {
            Statistic::Rate => rate.rate.ok_or_else(|| AggregationError::NoData {
                metric: metric.to_string(),
            }),
            Statistic::Count => Ok(rate.total as f64),
            _ => Err(unsupported()),
        },
        MetricSummary::Trend(trend) => {
            if trend.count == 0 {
                return Err(AggregationError::NoData {
                    metric: metric.to_string(),
                });
            }
            match statistic {
                Statistic::Avg => Ok(trend.avg),
                Statistic::Min => Ok(trend.min),
                Statistic::Max => Ok(trend.max),
                Statistic::Med => Ok(trend.med),
                Statistic::Count => Ok(trend.count as f64),
                Statistic::Percentile(p) => trend
                    .percentile(p)
                    .ok_or(AggregationError::UnresolvedPercentile { p }),
                Statistic::Rate => Err(AggregationError::UnsupportedStatistic {
                    statistic: statistic.to_string(),
                    kind: MetricKind::Trend,
                }),
            }
        }
    }
}
