//! Piecewise-linear VU target curve.
//!
//! A [`StageSchedule`] is an ordered list of [`Stage`]s. Each stage ramps
//! linearly from the previous stage's target (0 for the first stage) to its
//! own target over its own duration. The engine's control loop samples
//! [`StageSchedule::target_at`] on every tick and spawns or retires VUs to
//! match.

use std::time::Duration;

use serde::Serialize;

/// One ramp window: reach `target_vus` by the end of `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stage {
    #[serde(serialize_with = "serialize_duration_secs", rename = "duration_secs")]
    pub duration: Duration,
    pub target_vus: u32,
}

fn serialize_duration_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl Stage {
    pub fn new(duration: Duration, target_vus: u32) -> Self {
        Self {
            duration,
            target_vus,
        }
    }
}

/// Ordered stages plus the derived curve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSchedule {
    stages: Vec<Stage>,
}

impl StageSchedule {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Flat load: jump to `vus` immediately and hold for `duration`.
    pub fn flat(vus: u32, duration: Duration) -> Self {
        Self::new(vec![
            Stage::new(Duration::ZERO, vus),
            Stage::new(duration, vus),
        ])
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Sum of all stage durations, saturating at [`Duration::MAX`].
    pub fn total_duration(&self) -> Duration {
        self.checked_total_duration().unwrap_or(Duration::MAX)
    }

    /// Sum of all stage durations, or `None` if it overflows.
    pub fn checked_total_duration(&self) -> Option<Duration> {
        self.stages
            .iter()
            .try_fold(Duration::ZERO, |total, s| total.checked_add(s.duration))
    }

    /// Highest target across all stages.
    pub fn peak_vus(&self) -> u32 {
        self.stages.iter().map(|s| s.target_vus).max().unwrap_or(0)
    }

    /// Desired VU count at `elapsed`.
    ///
    /// Exact integer interpolation, floored. The result never exceeds the
    /// current stage's `max(start, target)`, equals the declared target at
    /// every stage boundary, and is 0 once `elapsed` passes the last stage.
    pub fn target_at(&self, elapsed: Duration) -> u32 {
        let Some((index, offset)) = self.locate(elapsed) else {
            return 0;
        };
        let stage = self.stages[index];
        let start = self.start_level(index);
        if stage.duration.is_zero() {
            return stage.target_vus;
        }
        let span = i128::from(stage.target_vus) - i128::from(start);
        let step = (span * offset.as_nanos() as i128).div_euclid(stage.duration.as_nanos() as i128);
        (i128::from(start) + step) as u32
    }

    /// The continuous curve behind [`target_at`](Self::target_at).
    pub fn curve_at(&self, elapsed: Duration) -> f64 {
        let Some((index, offset)) = self.locate(elapsed) else {
            return 0.0;
        };
        let stage = self.stages[index];
        let start = f64::from(self.start_level(index));
        if stage.duration.is_zero() {
            return f64::from(stage.target_vus);
        }
        let fraction = offset.as_secs_f64() / stage.duration.as_secs_f64();
        start + (f64::from(stage.target_vus) - start) * fraction
    }

    /// Zero-based index of the stage active at `elapsed`.
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        self.locate(elapsed).map(|(index, _)| index)
    }

    /// Display label such as `"stage 2/3"`.
    pub fn label_at(&self, elapsed: Duration) -> Option<String> {
        self.stage_index_at(elapsed)
            .map(|index| format!("stage {}/{}", index + 1, self.stages.len()))
    }

    /// Level at which stage `index` starts ramping.
    fn start_level(&self, index: usize) -> u32 {
        index
            .checked_sub(1)
            .map_or(0, |prev| self.stages[prev].target_vus)
    }

    /// Stage containing `elapsed` and the offset into it. A boundary instant
    /// belongs to the stage that ends there.
    fn locate(&self, elapsed: Duration) -> Option<(usize, Duration)> {
        let mut stage_start = Duration::ZERO;
        for (index, stage) in self.stages.iter().enumerate() {
            let stage_end = stage_start.saturating_add(stage.duration);
            if elapsed <= stage_end {
                return Some((index, elapsed - stage_start));
            }
            stage_start = stage_end;
        }
        None
    }
}
