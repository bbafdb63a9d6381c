//! Exposure settings, interval plans and session requests

use crate::capture::CaptureMode;
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest exposure or timeout accepted anywhere in the engine (one day)
pub const MAX_DURATION_SECS: f64 = 86_400.0;

/// Seconds to a `Duration`, clamped to `0..=MAX_DURATION_SECS`. NaN maps to zero.
pub fn duration_from_secs(value: f64) -> Duration {
    let clamped = if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, MAX_DURATION_SECS)
    };
    Duration::try_from_secs_f64(clamped).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureSettings {
    pub duration_secs: f64,
    pub gain: i32,
    #[serde(default)]
    pub filter_position: Option<u32>,
}

impl Default for ExposureSettings {
    fn default() -> Self {
        Self {
            duration_secs: 30.0,
            gain: 100,
            filter_position: None,
        }
    }
}

impl ExposureSettings {
    pub fn new(duration: Duration, gain: i32, filter_position: Option<u32>) -> Self {
        Self {
            duration_secs: duration.as_secs_f64(),
            gain,
            filter_position,
        }
    }

    pub fn duration(&self) -> Duration {
        duration_from_secs(self.duration_secs)
    }

    fn validate(&self) -> EngineResult<()> {
        if !self.duration_secs.is_finite() || self.duration_secs <= 0.0 {
            return Err(EngineError::invalid_state(format!(
                "exposure length must be positive, got {}s",
                self.duration_secs
            )));
        }
        if self.duration_secs > MAX_DURATION_SECS {
            return Err(EngineError::invalid_state(format!(
                "exposure length {}s exceeds the {}s limit",
                self.duration_secs, MAX_DURATION_SECS
            )));
        }
        Ok(())
    }
}

/// One step of an interval plan: `repeat_count` frames with the same settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalEntry {
    pub filter_position: u32,
    pub duration_secs: f64,
    pub gain: i32,
    pub repeat_count: u32,
}

impl IntervalEntry {
    pub fn settings(&self) -> ExposureSettings {
        ExposureSettings {
            duration_secs: self.duration_secs,
            gain: self.gain,
            filter_position: Some(self.filter_position),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntervalPlan {
    pub entries: Vec<IntervalEntry>,
    /// Start over from the first entry after the last one
    #[serde(default)]
    pub repeat_plan: bool,
}

impl IntervalPlan {
    pub fn new(entries: Vec<IntervalEntry>) -> Self {
        Self {
            entries,
            repeat_plan: false,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.checked_total_frames().is_none() {
            return Err(EngineError::invalid_state("interval plan has too many frames"));
        }
        if self.total_frames() == 0 {
            return Err(EngineError::invalid_state("interval plan has no frames"));
        }
        for entry in &self.entries {
            entry.settings().validate()?;
        }
        Ok(())
    }

    /// Frames in one pass over the plan.
    pub fn total_frames(&self) -> u32 {
        self.checked_total_frames().unwrap_or(u32::MAX)
    }

    /// Frames in one pass, or `None` if the count does not fit a `u32`.
    pub fn checked_total_frames(&self) -> Option<u32> {
        self.entries
            .iter()
            .try_fold(0u32, |total, e| total.checked_add(e.repeat_count))
    }

    /// One pass over the plan as a flat list of exposures.
    pub fn expand(&self) -> Vec<ExposureSettings> {
        let mut out = Vec::with_capacity(self.total_frames().min(4096) as usize);
        let mut cursor = IntervalCursor::default();
        while let Some(settings) = cursor.current(self) {
            out.push(settings);
            if cursor.advance(self) {
                break;
            }
        }
        out
    }
}

/// Position within an interval plan: entry index and frame within that entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntervalCursor {
    pub entry: usize,
    pub sub: u32,
    pub passes: u32,
}

impl IntervalCursor {
    /// Settings for the frame at the cursor, skipping empty entries.
    pub fn current(&mut self, plan: &IntervalPlan) -> Option<ExposureSettings> {
        self.skip_empty(plan);
        plan.entries.get(self.entry).map(|e| e.settings())
    }

    /// Move to the next frame. Returns `true` when a full pass just ended;
    /// the cursor wraps to the start only if the plan repeats.
    pub fn advance(&mut self, plan: &IntervalPlan) -> bool {
        self.skip_empty(plan);
        let Some(entry) = plan.entries.get(self.entry) else {
            return true;
        };
        self.sub += 1;
        if self.sub >= entry.repeat_count {
            self.sub = 0;
            self.entry += 1;
        }
        self.skip_empty(plan);
        if self.entry >= plan.entries.len() {
            self.passes += 1;
            if plan.repeat_plan {
                self.entry = 0;
                self.skip_empty(plan);
            }
            return true;
        }
        false
    }

    fn skip_empty(&mut self, plan: &IntervalPlan) {
        while let Some(entry) = plan.entries.get(self.entry) {
            if entry.repeat_count > 0 {
                break;
            }
            self.entry += 1;
            self.sub = 0;
        }
    }
}

/// What the user asked the controller to capture.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionRequest {
    Single(ExposureSettings),
    Repeat {
        settings: ExposureSettings,
        limit: Option<u32>,
    },
    Interval(IntervalPlan),
}

impl SessionRequest {
    pub fn mode(&self) -> CaptureMode {
        match self {
            SessionRequest::Single(_) => CaptureMode::Single,
            SessionRequest::Repeat { .. } => CaptureMode::Repeat,
            SessionRequest::Interval(_) => CaptureMode::Interval,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        match self {
            SessionRequest::Single(s) => s.validate(),
            SessionRequest::Repeat { settings, limit } => {
                if *limit == Some(0) {
                    return Err(EngineError::invalid_state("repeat limit of zero frames"));
                }
                settings.validate()
            }
            SessionRequest::Interval(plan) => plan.validate(),
        }
    }
}
