//! Named assertions over a response.
//!
//! A [`Checks`] list is built at the call site and handed to [`check`],
//! which runs every predicate inside its own unwind boundary and folds the
//! outcomes into the `checks` and `check_sets` Rate metrics.

use std::any::Any;
use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::Serialize;

use crate::loadtest::metrics::{MetricsRegistry, Tags};

/// Rate recording one observation per assertion, tagged `check=<name>`.
pub const CHECKS_METRIC: &str = "checks";
/// Rate recording the AND of every [`check`] call.
pub const CHECK_SETS_METRIC: &str = "check_sets";

type Predicate<'a, R> = Box<dyn Fn(&R) -> Result<bool, String> + Send + Sync + 'a>;

/// Ordered `(name, predicate)` pairs.
pub struct Checks<'a, R> {
    entries: Vec<(String, Predicate<'a, R>)>,
}

impl<'a, R> Checks<'a, R> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add a plain predicate.
    pub fn assert<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'a,
    {
        self.entries
            .push((name.into(), Box::new(move |r: &R| Ok(predicate(r)))));
        self
    }

    /// Add a predicate that can fail; an `Err` counts as `false`.
    pub fn try_assert<F, E>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&R) -> Result<bool, E> + Send + Sync + 'a,
        E: Display,
    {
        self.entries.push((
            name.into(),
            Box::new(move |r: &R| predicate(r).map_err(|e| e.to_string())),
        ));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }
}

impl<R> Default for Checks<'_, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> std::fmt::Debug for Checks<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Outcome of one assertion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    /// Set when the predicate returned an error or panicked.
    pub error: Option<String>,
}

/// Outcome of a [`check`] call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckOutcome {
    /// AND of every assertion; `true` for an empty list.
    pub passed: bool,
    pub results: Vec<CheckResult>,
}

impl CheckOutcome {
    pub fn failed(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

/// Run every predicate against `response` and record the outcomes.
///
/// Each predicate is isolated: a panic or error makes that assertion
/// `false` and evaluation continues with the next one.
pub fn check<R>(
    registry: &MetricsRegistry,
    response: &R,
    checks: &Checks<'_, R>,
    tags: &Tags,
) -> CheckOutcome {
    let results: Vec<CheckResult> = checks
        .entries
        .iter()
        .map(|(name, predicate)| {
            let (passed, error) = match catch_unwind(AssertUnwindSafe(|| predicate(response))) {
                Ok(Ok(passed)) => (passed, None),
                Ok(Err(message)) => (false, Some(message)),
                Err(payload) => (false, Some(format!("panicked: {}", panic_message(&*payload)))),
            };
            if let Some(error) = &error {
                tracing::debug!(check = %name, %error, "Check predicate failed to evaluate");
            }

            let mut check_tags = tags.clone();
            check_tags.insert("check".to_string(), name.clone());
            if let Err(e) = registry.add_rate(CHECKS_METRIC, passed, &check_tags) {
                tracing::warn!(error = %e, "Failed to record check");
            }

            CheckResult {
                name: name.clone(),
                passed,
                error,
            }
        })
        .collect();

    let passed = results.iter().all(|r| r.passed);
    if !results.is_empty() {
        if let Err(e) = registry.add_rate(CHECK_SETS_METRIC, passed, tags) {
            tracing::warn!(error = %e, "Failed to record check set");
        }
    }

    CheckOutcome { passed, results }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
