//! Error types for the load testing engine.
//!
//! [`LoadTestError`] is the only family that stops a run before load is
//! generated. Everything else is absorbed during the run and converted into
//! metrics ([`TransportError`], [`WorkloadError`]), failed thresholds
//! ([`AggregationError`]) or sink warnings ([`SinkError`]).

use crate::loadtest::metrics::MetricKind;

/// Errors that occur during configuration parsing, validation, file I/O or
/// the workload's setup hook. All of them abort the run before any VU starts.
#[derive(Debug, thiserror::Error)]
pub enum LoadTestError {
    /// TOML parse failure -- the config file contains invalid TOML syntax
    /// or does not match the expected schema.
    #[error("Failed to parse config TOML: {source}")]
    ConfigParse {
        #[from]
        source: toml::de::Error,
    },

    /// Semantic validation failure -- the config parsed successfully but
    /// contains invalid values (e.g., a negative stage target, a malformed
    /// threshold expression).
    #[error("Config validation error: {message}")]
    ConfigValidation { message: String },

    /// File I/O failure -- the config file could not be read from disk.
    #[error("Failed to read config file '{path}': {source}")]
    ConfigIo {
        source: std::io::Error,
        path: String,
    },

    /// The workload's setup hook failed.
    #[error("Setup failed: {message}")]
    Setup { message: String },
}

impl LoadTestError {
    /// Shorthand for a [`LoadTestError::ConfigValidation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }
}

/// Per-request transport failures.
///
/// Recorded as a failed request (`http_req_failed`, `http_req_errors`) and
/// handed back to the workload; never fatal to the VU.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum TransportError {
    /// The request exceeded its deadline.
    #[error("Request timed out")]
    Timeout,

    /// Connection-level failure (DNS resolution, TCP connect, TLS handshake).
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The request could not be built or the response could not be read.
    #[error("Protocol error: {message}")]
    Protocol { message: String },
}

impl TransportError {
    /// Returns the error category as a static string for metrics classification.
    ///
    /// Categories: `"timeout"`, `"connection"`, `"protocol"`.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection { .. } => "connection",
            Self::Protocol { .. } => "protocol",
        }
    }

    /// Classify a [`reqwest::Error`] into the appropriate [`TransportError`] variant.
    pub fn classify_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connection {
                message: err.to_string(),
            }
        } else if err.is_builder() || err.is_body() || err.is_decode() {
            Self::Protocol {
                message: err.to_string(),
            }
        } else {
            Self::Connection {
                message: err.to_string(),
            }
        }
    }
}

/// Errors recorded by the metric registry.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum MetricError {
    /// A metric name was first observed with one kind and later recorded
    /// with another. The observation is rejected.
    #[error("metric '{name}' is a {existing}, cannot record it as a {requested}")]
    KindMismatch {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },

    /// The value was NaN or infinite.
    #[error("metric '{name}' cannot record non-finite value {value}")]
    NonFinite { name: String, value: f64 },

    /// The histogram backing a trend rejected a value.
    #[error("histogram error: {message}")]
    Histogram { message: String },
}

/// A fault raised by a workload iteration.
///
/// The runner records it as a failed iteration (`iteration_errors`) and the
/// VU moves on to its next iteration.
#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Metric(#[from] MetricError),

    /// Any other workload-level failure.
    #[error("{message}")]
    Failed { message: String },
}

impl WorkloadError {
    /// Shorthand for a [`WorkloadError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Short kind label used as the `error` tag on `iteration_errors`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(err) => err.category(),
            Self::Metric(_) => "metric",
            Self::Failed { .. } => "workload",
        }
    }
}

/// Threshold evaluation failures. Each one turns into a failed threshold
/// with this error attached; none of them abort report generation.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum AggregationError {
    #[error("metric '{metric}' was never observed")]
    UnknownMetric { metric: String },

    #[error("metric '{metric}' has no data")]
    NoData { metric: String },

    #[error("statistic '{statistic}' is not defined for {kind} metrics")]
    UnsupportedStatistic { statistic: String, kind: MetricKind },

    #[error("p({p}) is not available for this trend")]
    UnresolvedPercentile { p: f64 },
}

/// Report sink failures. Logged by the emitter; the verdict is unaffected.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Failed to write report to '{path}': {source}")]
    Io {
        source: std::io::Error,
        path: String,
    },

    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write summary: {source}")]
    Write { source: std::io::Error },

    #[error("Report sink panicked: {message}")]
    Panicked { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_category_strings() {
        assert_eq!(TransportError::Timeout.category(), "timeout");
        assert_eq!(
            TransportError::Connection {
                message: "refused".to_string()
            }
            .category(),
            "connection"
        );
        assert_eq!(
            TransportError::Protocol {
                message: "bad body".to_string()
            }
            .category(),
            "protocol"
        );
    }

    #[test]
    fn test_workload_error_kind_follows_transport_category() {
        let err: WorkloadError = TransportError::Timeout.into();
        assert_eq!(err.kind(), "timeout");
        assert_eq!(WorkloadError::failed("boom").kind(), "workload");
    }

    #[test]
    fn test_kind_mismatch_display() {
        let err = MetricError::KindMismatch {
            name: "latency".to_string(),
            existing: MetricKind::Trend,
            requested: MetricKind::Counter,
        };
        assert_eq!(
            err.to_string(),
            "metric 'latency' is a trend, cannot record it as a counter"
        );
    }

    #[test]
    fn test_config_validation_display() {
        let err = LoadTestError::validation("Stage 2 has a negative target (-1)");
        assert_eq!(
            err.to_string(),
            "Config validation error: Stage 2 has a negative target (-1)"
        );
    }

    #[test]
    fn test_aggregation_error_display() {
        let err = AggregationError::UnknownMetric {
            metric: "cache_hits".to_string(),
        };
        assert_eq!(err.to_string(), "metric 'cache_hits' was never observed");
    }

    #[test]
    fn test_config_parse_from_toml_error() {
        let toml_err = toml::from_str::<toml::Table>("= broken").unwrap_err();
        let err: LoadTestError = toml_err.into();
        assert!(matches!(err, LoadTestError::ConfigParse { .. }));
    }
}
