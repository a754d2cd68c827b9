//! Concurrency-safe metric registry with tag-partitioned series.
//!
//! [`MetricsRegistry`] is the only mutable structure shared between virtual
//! users. Every observation goes through [`MetricsRegistry::record`], which is
//! atomic per metric: the name lookup goes through a [`DashMap`] shard and the
//! metric's series map sits behind its own [`parking_lot::Mutex`].
//!
//! # Kinds
//!
//! - **Counter**: running sum of recorded values. Series are merged in tag
//!   order, so integer increments (exact in `f64` below 2^53) give the same
//!   total in any arrival order. Fractional increments are summed in
//!   arrival order within a series.
//! - **Rate**: `(passes, total)`; a non-zero value counts as a pass.
//! - **Trend**: retained samples for avg/min/max/percentiles.
//!
//! # Tags
//!
//! Each distinct tag set is an independent series. Reads merge series on
//! demand: [`MetricsRegistry::snapshot`] merges everything,
//! [`MetricsRegistry::snapshot_matching`] merges only the series carrying all
//! of the filter's tag pairs.
//!
//! # Percentiles
//!
//! With [`TrendStorage::Exact`] every sample is kept and `p(x)` uses linear
//! interpolation between closest ranks on the sorted samples:
//! `i = x/100 * (n - 1)`, `p = s[floor(i)] + (i - floor(i)) * (s[floor(i) + 1] - s[floor(i)])`.
//! For the samples `10, 20, ..., 1000` this gives `p(95) = 950.5`.
//!
//! [`TrendStorage::Histogram`] records into an HdrHistogram with 3 significant
//! digits at a resolution of 0.001 units. Percentiles then carry at most 0.1%
//! relative error; count, sum, min and max stay exact.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::loadtest::error::MetricError;

/// Tag set identifying one series of a metric. Ordered so that series
/// iteration, and therefore merging, is deterministic.
pub type Tags = BTreeMap<String, String>;

/// Build a [`Tags`] map from string pairs.
pub fn tags<I, K, V>(pairs: I) -> Tags
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Render a metric name with an optional tag filter, k6 style:
/// `http_req_duration{kind:kong_gateway,method:GET}`.
pub fn render_selector(name: &str, tags: &Tags) -> String {
    if tags.is_empty() {
        return name.to_string();
    }
    let rendered: Vec<String> = tags.iter().map(|(k, v)| format!("{k}:{v}")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}

/// Scale applied to trend values stored in a histogram (0.001 resolution).
const HISTOGRAM_SCALE: f64 = 1000.0;

/// The kind of a metric, fixed by its first observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Counter => "counter",
            Self::Rate => "rate",
            Self::Trend => "trend",
        };
        f.write_str(s)
    }
}

/// How trend samples are retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendStorage {
    /// Keep every sample; percentiles are exact.
    #[default]
    Exact,
    /// HdrHistogram, 3 significant digits.
    Histogram,
}

/// Shared, cheaply clonable handle to the metric store.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    metrics: DashMap<String, Arc<Metric>>,
    trend_storage: TrendStorage,
}

struct Metric {
    kind: MetricKind,
    series: Mutex<BTreeMap<Tags, Accumulator>>,
}

impl MetricsRegistry {
    /// Creates an empty registry with exact trend storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry using the given trend storage.
    pub fn with_trend_storage(trend_storage: TrendStorage) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                metrics: DashMap::new(),
                trend_storage,
            }),
        }
    }

    /// Returns the trend storage mode of this registry.
    pub fn trend_storage(&self) -> TrendStorage {
        self.inner.trend_storage
    }

    /// Append one observation to the series of `name` identified by `tags`.
    ///
    /// The first observation of a name fixes its kind; later observations
    /// with another kind are rejected with [`MetricError::KindMismatch`].
    pub fn record(
        &self,
        name: &str,
        kind: MetricKind,
        value: f64,
        tags: &Tags,
    ) -> Result<(), MetricError> {
        if !value.is_finite() {
            return Err(MetricError::NonFinite {
                name: name.to_string(),
                value,
            });
        }

        let metric = self.metric(name, kind)?;
        let mut series = metric.series.lock();
        match series.get_mut(tags) {
            Some(acc) => acc.observe(value),
            None => {
                let mut acc = Accumulator::new(kind, self.inner.trend_storage)?;
                acc.observe(value)?;
                series.insert(tags.clone(), acc);
                Ok(())
            }
        }
    }

    /// Add `value` to a counter.
    pub fn add_counter(&self, name: &str, value: f64, tags: &Tags) -> Result<(), MetricError> {
        self.record(name, MetricKind::Counter, value, tags)
    }

    /// Record one pass (`true`) or fail (`false`) on a rate.
    pub fn add_rate(&self, name: &str, passed: bool, tags: &Tags) -> Result<(), MetricError> {
        let value = if passed { 1.0 } else { 0.0 };
        self.record(name, MetricKind::Rate, value, tags)
    }

    /// Record one sample on a trend.
    pub fn add_trend(&self, name: &str, value: f64, tags: &Tags) -> Result<(), MetricError> {
        self.record(name, MetricKind::Trend, value, tags)
    }

    /// Returns the kind of `name`, if it has been observed.
    pub fn kind(&self, name: &str) -> Option<MetricKind> {
        self.inner.metrics.get(name).map(|m| m.kind)
    }

    /// Returns every observed metric name, sorted.
    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .metrics
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Aggregated view over all series of `name`, or `None` if never observed.
    pub fn snapshot(&self, name: &str) -> Option<MetricSummary> {
        self.snapshot_matching(name, &Tags::new())
    }

    /// Aggregated view over the series of `name` whose tags contain every
    /// pair in `filter`. `None` if no such series exists.
    ///
    /// The series lock is held only while the matching accumulators are
    /// copied; sorting and merging run after it is released.
    pub fn snapshot_matching(&self, name: &str, filter: &Tags) -> Option<MetricSummary> {
        let metric = self.inner.metrics.get(name)?.value().clone();
        let matching: Vec<Accumulator> = {
            let series = metric.series.lock();
            series
                .iter()
                .filter(|(tags, _)| contains_all(tags, filter))
                .map(|(_, acc)| acc.clone())
                .collect()
        };
        if matching.is_empty() {
            return None;
        }
        let parts: Vec<&Accumulator> = matching.iter().collect();
        Some(Accumulator::merge(metric.kind, &parts))
    }

    /// Per-series summaries of `name`, in tag order. Empty if never observed.
    pub fn series(&self, name: &str) -> Vec<(Tags, MetricSummary)> {
        let Some(metric) = self.inner.metrics.get(name).map(|m| m.value().clone()) else {
            return Vec::new();
        };
        let copied: Vec<(Tags, Accumulator)> = {
            let series = metric.series.lock();
            series
                .iter()
                .map(|(tags, acc)| (tags.clone(), acc.clone()))
                .collect()
        };
        copied
            .into_iter()
            .map(|(tags, acc)| {
                let summary = Accumulator::merge(metric.kind, &[&acc]);
                (tags, summary)
            })
            .collect()
    }

    fn metric(&self, name: &str, kind: MetricKind) -> Result<Arc<Metric>, MetricError> {
        // Read path first so steady-state records only take a shard read lock.
        let metric = match self.inner.metrics.get(name) {
            Some(existing) => existing.value().clone(),
            None => self
                .inner
                .metrics
                .entry(name.to_string())
                .or_insert_with(|| {
                    Arc::new(Metric {
                        kind,
                        series: Mutex::new(BTreeMap::new()),
                    })
                })
                .value()
                .clone(),
        };
        if metric.kind != kind {
            return Err(MetricError::KindMismatch {
                name: name.to_string(),
                existing: metric.kind,
                requested: kind,
            });
        }
        Ok(metric)
    }
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("metrics", &self.metric_names())
            .field("trend_storage", &self.inner.trend_storage)
            .finish()
    }
}

fn contains_all(tags: &Tags, filter: &Tags) -> bool {
    filter.iter().all(|(k, v)| tags.get(k) == Some(v))
}

/// Per-series accumulator. Only ever appended to.
#[derive(Clone)]
enum Accumulator {
    Counter { sum: f64, observations: u64 },
    Rate { passes: u64, total: u64 },
    Exact(Vec<f64>),
    Histogram(HistogramTrend),
}

#[derive(Clone)]
struct HistogramTrend {
    hist: Histogram<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

fn new_histogram() -> Result<Histogram<u64>, MetricError> {
    Histogram::<u64>::new(3).map_err(|e| MetricError::Histogram {
        message: e.to_string(),
    })
}

impl Accumulator {
    fn new(kind: MetricKind, storage: TrendStorage) -> Result<Self, MetricError> {
        Ok(match (kind, storage) {
            (MetricKind::Counter, _) => Self::Counter {
                sum: 0.0,
                observations: 0,
            },
            (MetricKind::Rate, _) => Self::Rate {
                passes: 0,
                total: 0,
            },
            (MetricKind::Trend, TrendStorage::Exact) => Self::Exact(Vec::new()),
            (MetricKind::Trend, TrendStorage::Histogram) => Self::Histogram(HistogramTrend {
                hist: new_histogram()?,
                count: 0,
                sum: 0.0,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
            }),
        })
    }

    fn observe(&mut self, value: f64) -> Result<(), MetricError> {
        match self {
            Self::Counter { sum, observations } => {
                *sum += value;
                *observations += 1;
            }
            Self::Rate { passes, total } => {
                if value != 0.0 {
                    *passes += 1;
                }
                *total += 1;
            }
            Self::Exact(samples) => samples.push(value),
            Self::Histogram(trend) => {
                // Negative samples land in the lowest bucket; min/avg keep the real value.
                let scaled = (value.max(0.0) * HISTOGRAM_SCALE).round() as u64;
                trend
                    .hist
                    .record(scaled)
                    .map_err(|e| MetricError::Histogram {
                        message: e.to_string(),
                    })?;
                trend.count += 1;
                trend.sum += value;
                trend.min = trend.min.min(value);
                trend.max = trend.max.max(value);
            }
        }
        Ok(())
    }

    fn merge(kind: MetricKind, parts: &[&Accumulator]) -> MetricSummary {
        match kind {
            MetricKind::Counter => {
                let mut count = 0.0;
                let mut observations = 0;
                for part in parts {
                    if let Self::Counter {
                        sum,
                        observations: n,
                    } = part
                    {
                        count += sum;
                        observations += n;
                    }
                }
                MetricSummary::Counter(CounterSummary {
                    count,
                    observations,
                    rate: None,
                })
            }
            MetricKind::Rate => {
                let mut passes = 0;
                let mut total = 0;
                for part in parts {
                    if let Self::Rate {
                        passes: p,
                        total: t,
                    } = part
                    {
                        passes += p;
                        total += t;
                    }
                }
                MetricSummary::Rate(RateSummary::new(passes, total))
            }
            MetricKind::Trend => MetricSummary::Trend(merge_trend(parts)),
        }
    }
}

fn merge_trend(parts: &[&Accumulator]) -> TrendSummary {
    let mut samples = Vec::new();
    let mut merged: Option<HistogramTrend> = None;

    for part in parts {
        match part {
            Accumulator::Exact(values) => samples.extend_from_slice(values),
            Accumulator::Histogram(trend) => match merged.as_mut() {
                None => {
                    merged = Some(HistogramTrend {
                        hist: trend.hist.clone(),
                        count: trend.count,
                        sum: trend.sum,
                        min: trend.min,
                        max: trend.max,
                    })
                }
                Some(acc) => {
                    if let Err(err) = acc.hist.add(&trend.hist) {
                        tracing::warn!("failed to merge trend histograms: {err}");
                    }
                    acc.count += trend.count;
                    acc.sum += trend.sum;
                    acc.min = acc.min.min(trend.min);
                    acc.max = acc.max.max(trend.max);
                }
            },
            _ => {}
        }
    }

    match merged {
        Some(trend) => TrendSummary::from_histogram(trend),
        None => {
            samples.sort_by(f64::total_cmp);
            TrendSummary::from_sorted(samples)
        }
    }
}

/// Linear interpolation between closest ranks. `sorted` must be ascending.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let rank = (p.clamp(0.0, 100.0) / 100.0) * last as f64;
    let lower = rank.floor() as usize;
    let upper = (lower + 1).min(last);
    let fraction = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

/// Immutable aggregated view of a metric (or of a filtered set of its series).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricSummary {
    Counter(CounterSummary),
    Rate(RateSummary),
    Trend(TrendSummary),
}

impl MetricSummary {
    /// Attach the per-second rate to a counter; other kinds are unchanged.
    pub fn with_elapsed(self, elapsed: Duration) -> Self {
        match self {
            Self::Counter(mut counter) => {
                counter.rate = counter.per_second(elapsed);
                Self::Counter(counter)
            }
            other => other,
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Rate(_) => MetricKind::Rate,
            Self::Trend(_) => MetricKind::Trend,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CounterSummary {
    /// Sum of all recorded values.
    pub count: f64,
    /// Number of `record` calls.
    pub observations: u64,
    /// `count` per second of run time. Set once the run length is known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
}

impl CounterSummary {
    /// `count / elapsed`, or `None` for a zero-length run.
    pub fn per_second(&self, elapsed: Duration) -> Option<f64> {
        let secs = elapsed.as_secs_f64();
        (secs > 0.0).then(|| self.count / secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateSummary {
    pub passes: u64,
    pub fails: u64,
    pub total: u64,
    /// `passes / total`, or `None` ("no data") when nothing was recorded.
    pub rate: Option<f64>,
}

impl RateSummary {
    fn new(passes: u64, total: u64) -> Self {
        let rate = if total == 0 {
            None
        } else {
            Some(passes as f64 / total as f64)
        };
        Self {
            passes,
            fails: total - passes,
            total,
            rate,
        }
    }
}

/// Distribution statistics for a trend.
#[derive(Debug, Clone, Serialize)]
pub struct TrendSummary {
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub med: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    #[serde(skip)]
    source: QuantileSource,
}

#[derive(Clone)]
enum QuantileSource {
    Sorted(Arc<Vec<f64>>),
    Histogram(Arc<Histogram<u64>>),
}

impl fmt::Debug for QuantileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sorted(samples) => write!(f, "Sorted({} samples)", samples.len()),
            Self::Histogram(hist) => write!(f, "Histogram({} samples)", hist.len()),
        }
    }
}

impl TrendSummary {
    fn from_sorted(sorted: Vec<f64>) -> Self {
        let count = sorted.len() as u64;
        let sum: f64 = sorted.iter().sum();
        let at = |p: f64| percentile(&sorted, p).unwrap_or(0.0);
        let (med, p90, p95, p99) = (at(50.0), at(90.0), at(95.0), at(99.0));
        Self {
            count,
            avg: if count > 0 { sum / count as f64 } else { 0.0 },
            min: sorted.first().copied().unwrap_or(0.0),
            max: sorted.last().copied().unwrap_or(0.0),
            med,
            p90,
            p95,
            p99,
            source: QuantileSource::Sorted(Arc::new(sorted)),
        }
    }

    fn from_histogram(trend: HistogramTrend) -> Self {
        let at = |p: f64| trend.hist.value_at_quantile(p / 100.0) as f64 / HISTOGRAM_SCALE;
        let (min, max) = if trend.count > 0 {
            (trend.min, trend.max)
        } else {
            (0.0, 0.0)
        };
        Self {
            count: trend.count,
            avg: if trend.count > 0 {
                trend.sum / trend.count as f64
            } else {
                0.0
            },
            min,
            max,
            med: at(50.0),
            p90: at(90.0),
            p95: at(95.0),
            p99: at(99.0),
            source: QuantileSource::Histogram(Arc::new(trend.hist)),
        }
    }

    /// Any percentile in `0..=100`. `None` for an empty trend.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        match &self.source {
            QuantileSource::Sorted(samples) => percentile(samples, p),
            QuantileSource::Histogram(hist) => Some(
                hist.value_at_quantile(p.clamp(0.0, 100.0) / 100.0) as f64 / HISTOGRAM_SCALE,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trend_of(registry: &MetricsRegistry, name: &str) -> TrendSummary {
        match registry.snapshot(name) {
            Some(MetricSummary::Trend(t)) => t,
            other => panic!("expected trend, got {other:?}"),
        }
    }

    #[test]
    fn test_counter_sums_values() {
        let registry = MetricsRegistry::new();
        registry.add_counter("http_reqs", 1.0, &Tags::new()).unwrap();
        registry.add_counter("http_reqs", 2.5, &Tags::new()).unwrap();
        match registry.snapshot("http_reqs") {
            Some(MetricSummary::Counter(c)) => {
                assert_eq!(c.count, 3.5);
                assert_eq!(c.observations, 2);
            }
            other => panic!("expected counter, got {other:?}"),
        }
    }

    #[test]
    fn test_rate_fraction_and_no_data() {
        let registry = MetricsRegistry::new();
        for passed in [true, true, false, true] {
            registry.add_rate("checks", passed, &Tags::new()).unwrap();
        }
        match registry.snapshot("checks") {
            Some(MetricSummary::Rate(r)) => {
                assert_eq!(r.passes, 3);
                assert_eq!(r.fails, 1);
                assert_eq!(r.rate, Some(0.75));
            }
            other => panic!("expected rate, got {other:?}"),
        }

        let empty = RateSummary::new(0, 0);
        assert_eq!(empty.rate, None);
    }

    #[test]
    fn test_unobserved_metric_has_no_snapshot() {
        let registry = MetricsRegistry::new();
        assert!(registry.snapshot("missing").is_none());
        assert!(registry.series("missing").is_empty());
    }

    #[test]
    fn test_trend_percentile_golden_value() {
        let registry = MetricsRegistry::new();
        for i in 1..=100 {
            registry
                .add_trend("latency", (i * 10) as f64, &Tags::new())
                .unwrap();
        }
        let t = trend_of(&registry, "latency");
        assert_eq!(t.count, 100);
        assert!((t.p95 - 950.5).abs() < 1e-9, "p95 = {}", t.p95);
        assert!((t.med - 505.0).abs() < 1e-9, "med = {}", t.med);
        assert_eq!(t.min, 10.0);
        assert_eq!(t.max, 1000.0);
        assert!((t.avg - 505.0).abs() < 1e-9);
        assert!((t.percentile(100.0).unwrap() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_single_sample() {
        assert_eq!(percentile(&[42.0], 99.0), Some(42.0));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn test_kind_is_fixed_by_first_observation() {
        let registry = MetricsRegistry::new();
        registry.add_trend("latency", 5.0, &Tags::new()).unwrap();
        let err = registry
            .add_counter("latency", 1.0, &Tags::new())
            .unwrap_err();
        assert!(matches!(
            err,
            MetricError::KindMismatch {
                existing: MetricKind::Trend,
                requested: MetricKind::Counter,
                ..
            }
        ));
        assert_eq!(trend_of(&registry, "latency").count, 1);
    }

    #[test]
    fn test_non_finite_values_rejected() {
        let registry = MetricsRegistry::new();
        let err = registry
            .add_trend("latency", f64::NAN, &Tags::new())
            .unwrap_err();
        assert!(matches!(err, MetricError::NonFinite { .. }));
        assert!(registry.snapshot("latency").is_none());
    }

    #[test]
    fn test_tagged_series_merge_on_read() {
        let registry = MetricsRegistry::new();
        let kong = tags([("kind", "kong_gateway")]);
        let direct = tags([("kind", "direct")]);
        registry.add_trend("http_req_duration", 100.0, &kong).unwrap();
        registry.add_trend("http_req_duration", 300.0, &kong).unwrap();
        registry.add_trend("http_req_duration", 50.0, &direct).unwrap();
        registry
            .add_trend("http_req_duration", 10.0, &Tags::new())
            .unwrap();

        assert_eq!(trend_of(&registry, "http_req_duration").count, 4);

        match registry.snapshot_matching("http_req_duration", &kong) {
            Some(MetricSummary::Trend(t)) => {
                assert_eq!(t.count, 2);
                assert_eq!(t.avg, 200.0);
            }
            other => panic!("expected trend, got {other:?}"),
        }

        let series = registry.series("http_req_duration");
        assert_eq!(series.len(), 3);
        assert!(series[0].0.is_empty(), "untagged series sorts first");
    }

    #[test]
    fn test_filter_matches_superset_tags() {
        let registry = MetricsRegistry::new();
        let full = tags([("kind", "kong_gateway"), ("method", "GET")]);
        registry.add_counter("http_reqs", 1.0, &full).unwrap();
        assert!(registry
            .snapshot_matching("http_reqs", &tags([("kind", "kong_gateway")]))
            .is_some());
        assert!(registry
            .snapshot_matching("http_reqs", &tags([("kind", "direct")]))
            .is_none());
    }

    #[test]
    fn test_snapshot_is_idempotent() {
        let registry = MetricsRegistry::new();
        for (i, v) in [0.1, 0.7, 0.2, 1e9, 3.3].iter().enumerate() {
            let t = tags([("vu", i.to_string())]);
            registry.add_trend("latency", *v, &t).unwrap();
        }
        let a = trend_of(&registry, "latency");
        let b = trend_of(&registry, "latency");
        for (x, y) in [
            (a.avg, b.avg),
            (a.min, b.min),
            (a.max, b.max),
            (a.med, b.med),
            (a.p90, b.p90),
            (a.p95, b.p95),
            (a.p99, b.p99),
        ] {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn test_histogram_storage_within_error_bound() {
        let registry = MetricsRegistry::with_trend_storage(TrendStorage::Histogram);
        for i in 1..=100 {
            registry
                .add_trend("latency", (i * 10) as f64, &Tags::new())
                .unwrap();
        }
        let t = trend_of(&registry, "latency");
        assert_eq!(t.count, 100);
        assert_eq!(t.min, 10.0);
        assert_eq!(t.max, 1000.0);
        assert!((t.avg - 505.0).abs() < 1e-9);
        // Histogram quantiles snap to recorded values: p95 lands on 950 or 960.
        assert!(t.p95 >= 949.0 && t.p95 <= 961.0, "p95 = {}", t.p95);
    }

    #[test]
    fn test_concurrent_counter_records_are_not_lost() {
        let registry = MetricsRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let tag = tags([("thread", t.to_string())]);
                    for _ in 0..1000 {
                        registry.add_counter("iterations", 1.0, &tag).unwrap();
                        registry.add_counter("iterations", 1.0, &Tags::new()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        match registry.snapshot("iterations") {
            Some(MetricSummary::Counter(c)) => assert_eq!(c.count, 16_000.0),
            other => panic!("expected counter, got {other:?}"),
        }
    }

    #[test]
    fn test_render_selector() {
        assert_eq!(render_selector("checks", &Tags::new()), "checks");
        let t = tags([("method", "GET"), ("kind", "kong_gateway")]);
        assert_eq!(
            render_selector("http_req_duration", &t),
            "http_req_duration{kind:kong_gateway,method:GET}"
        );
    }

    #[test]
    fn test_metric_names_sorted() {
        let registry = MetricsRegistry::new();
        registry.add_counter("b", 1.0, &Tags::new()).unwrap();
        registry.add_counter("a", 1.0, &Tags::new()).unwrap();
        assert_eq!(registry.metric_names(), vec!["a", "b"]);
        assert_eq!(registry.kind("a"), Some(MetricKind::Counter));
    }

    #[test]
    fn test_records_proceed_while_snapshots_run() {
        let registry = MetricsRegistry::new();
        for i in 0..10_000 {
            registry.add_trend("latency", f64::from(i % 997), &Tags::new()).unwrap();
        }
        std::thread::scope(|scope| {
            let reader = registry.clone();
            scope.spawn(move || {
                for _ in 0..20 {
                    assert!(reader.snapshot("latency").is_some());
                }
            });
            for i in 0..1_000 {
                registry.add_trend("latency", f64::from(i), &Tags::new()).unwrap();
            }
        });
        assert_eq!(trend_of(&registry, "latency").count, 11_000);
    }

    #[test]
    fn test_counter_total_independent_of_arrival_order() {
        let forward = MetricsRegistry::new();
        let backward = MetricsRegistry::new();
        let values: Vec<(u32, &str)> = (0..200)
            .map(|i| (i * 7 % 13, if i % 2 == 0 { "a" } else { "b" }))
            .collect();
        for (value, series) in &values {
            forward
                .add_counter("reqs", f64::from(*value), &tags([("s", *series)]))
                .unwrap();
        }
        for (value, series) in values.iter().rev() {
            backward
                .add_counter("reqs", f64::from(*value), &tags([("s", *series)]))
                .unwrap();
        }
        match (forward.snapshot("reqs"), backward.snapshot("reqs")) {
            (Some(MetricSummary::Counter(a)), Some(MetricSummary::Counter(b))) => assert_eq!(a, b),
            other => panic!("expected counters, got {other:?}"),
        }
    }
}
