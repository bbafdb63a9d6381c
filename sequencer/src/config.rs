//! Engine configuration
//!
//! Plain serde structs with defaults for every field, so a partial or
//! older settings file still loads. Durations are stored as seconds.

use crate::plan::{duration_from_secs, ExposureSettings, IntervalPlan};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub capture: CaptureConfig,
    pub plate_solve: PlateSolveConfig,
    pub polar_align: PolarAlignConfig,
    pub guide: GuideConfig,
    pub display: DisplayConfig,
}

/// Configuration for the capture session controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Settings used for SINGLE and REPEAT sessions
    #[serde(default)]
    pub exposure: ExposureSettings,

    /// Frames per REPEAT session; `None` repeats until cancelled
    #[serde(default)]
    pub repeat_limit: Option<u32>,

    #[serde(default)]
    pub interval_plan: IntervalPlan,

    /// Upper bound on live preview exposures (seconds)
    #[serde(default = "default_live_max_exposure")]
    pub live_max_exposure_secs: f64,

    /// Take preview frames while no session is running
    #[serde(default = "default_true")]
    pub live_preview: bool,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Extra time allowed on top of the exposure length before giving up
    #[serde(default = "default_timeout_margin")]
    pub exposure_timeout_margin_secs: f64,

    /// Names for filter wheel slots, index 0 = position 0
    #[serde(default)]
    pub filter_names: Vec<String>,

    /// Consecutive failed exposures before the camera is reported as lost
    #[serde(default = "default_no_signal_after")]
    pub no_signal_after: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            exposure: ExposureSettings::default(),
            repeat_limit: None,
            interval_plan: IntervalPlan::default(),
            live_max_exposure_secs: default_live_max_exposure(),
            live_preview: true,
            output_dir: default_output_dir(),
            exposure_timeout_margin_secs: default_timeout_margin(),
            filter_names: Vec::new(),
            no_signal_after: default_no_signal_after(),
        }
    }
}

impl CaptureConfig {
    pub fn live_max_exposure(&self) -> Duration {
        secs(self.live_max_exposure_secs)
    }

    pub fn exposure_timeout(&self, exposure: Duration) -> Duration {
        exposure.saturating_add(secs(self.exposure_timeout_margin_secs))
    }

    pub fn filter_name(&self, position: u32) -> String {
        self.filter_names
            .get(position as usize)
            .filter(|n| !n.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| format!("Slot {}", position))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateSolveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_solve_timeout")]
    pub solve_timeout_secs: f64,

    /// Age after which a solution no longer drives guidance decisions
    #[serde(default = "default_staleness")]
    pub staleness_secs: f64,

    /// Age after which a solution is no longer used as a solver hint
    #[serde(default = "default_hint_max_age")]
    pub hint_max_age_secs: f64,

    #[serde(default = "default_hint_radius")]
    pub hint_radius_deg: f64,
}

impl Default for PlateSolveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            solve_timeout_secs: default_solve_timeout(),
            staleness_secs: default_staleness(),
            hint_max_age_secs: default_hint_max_age(),
            hint_radius_deg: default_hint_radius(),
        }
    }
}

impl PlateSolveConfig {
    pub fn solve_timeout(&self) -> Duration {
        secs(self.solve_timeout_secs)
    }

    pub fn staleness(&self) -> Duration {
        secs(self.staleness_secs)
    }

    pub fn hint_max_age(&self) -> Duration {
        secs(self.hint_max_age_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hemisphere {
    #[default]
    North,
    South,
}

impl Hemisphere {
    pub fn pole_dec(&self) -> f64 {
        match self {
            Hemisphere::North => 90.0,
            Hemisphere::South => -90.0,
        }
    }
}

/// Configuration for polar alignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolarAlignConfig {
    /// Minimum RA rotation between reference and drift measurement (degrees)
    #[serde(default = "default_min_ra_rotation")]
    pub min_ra_rotation_deg: f64,

    #[serde(default)]
    pub hemisphere: Hemisphere,
}

impl Default for PolarAlignConfig {
    fn default() -> Self {
        Self {
            min_ra_rotation_deg: default_min_ra_rotation(),
            hemisphere: Hemisphere::North,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuideConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Offsets below this (pixels) produce no pulse
    #[serde(default = "default_dead_band")]
    pub dead_band_px: f64,

    /// Pulse length per pixel of correction
    #[serde(default = "default_ms_per_px")]
    pub gain_ms_per_px: f64,

    #[serde(default = "default_integral_gain")]
    pub integral_gain: f64,

    /// Multiplier applied to the integrated error every cycle, `0..1`
    #[serde(default = "default_integral_decay")]
    pub integral_decay: f64,

    #[serde(default = "default_max_pulse_ms")]
    pub max_pulse_ms: u64,
}

impl Default for GuideConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dead_band_px: default_dead_band(),
            gain_ms_per_px: default_ms_per_px(),
            integral_gain: default_integral_gain(),
            integral_decay: default_integral_decay(),
            max_pulse_ms: default_max_pulse_ms(),
        }
    }
}

impl GuideConfig {
    pub fn max_pulse(&self) -> Duration {
        Duration::from_millis(self.max_pulse_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_display_width")]
    pub width: u32,
    #[serde(default = "default_display_height")]
    pub height: u32,
    #[serde(default = "default_histogram_bins")]
    pub histogram_bins: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: default_display_width(),
            height: default_display_height(),
            histogram_bins: default_histogram_bins(),
        }
    }
}

fn secs(value: f64) -> Duration {
    duration_from_secs(value)
}

fn default_true() -> bool {
    true
}

fn default_live_max_exposure() -> f64 {
    1.0
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("captures")
}

fn default_timeout_margin() -> f64 {
    10.0
}

fn default_no_signal_after() -> u32 {
    3
}

fn default_solve_timeout() -> f64 {
    5.0
}

fn default_staleness() -> f64 {
    30.0
}

fn default_hint_max_age() -> f64 {
    600.0
}

fn default_hint_radius() -> f64 {
    10.0
}

fn default_min_ra_rotation() -> f64 {
    15.0
}

fn default_dead_band() -> f64 {
    0.3
}

fn default_ms_per_px() -> f64 {
    100.0
}

fn default_integral_gain() -> f64 {
    0.1
}

fn default_integral_decay() -> f64 {
    0.8
}

fn default_max_pulse_ms() -> u64 {
    1000
}

fn default_display_width() -> u32 {
    640
}

fn default_display_height() -> u32 {
    480
}

fn default_histogram_bins() -> usize {
    astrocam_imaging::DEFAULT_HISTOGRAM_BINS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.capture.live_max_exposure(), Duration::from_secs(1));
        assert_eq!(config.plate_solve.solve_timeout(), Duration::from_secs(5));
        assert_eq!(config.plate_solve.staleness(), Duration::from_secs(30));
        assert_eq!(config.polar_align.min_ra_rotation_deg, 15.0);
        assert!(!config.guide.enabled);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"guide": {"enabled": true, "max_pulse_ms": 500}}"#).unwrap();
        assert!(config.guide.enabled);
        assert_eq!(config.guide.max_pulse(), Duration::from_millis(500));
        assert_eq!(config.guide.dead_band_px, 0.3);
        assert_eq!(config.capture, CaptureConfig::default());
    }

    #[test]
    fn test_serde() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_filter_name_falls_back_to_slot() {
        let capture = CaptureConfig {
            filter_names: vec!["L".into(), "".into()],
            ..Default::default()
        };
        assert_eq!(capture.filter_name(0), "L");
        assert_eq!(capture.filter_name(1), "Slot 1");
        assert_eq!(capture.filter_name(4), "Slot 4");
    }

    #[test]
    fn test_huge_durations_do_not_panic() {
        let mut config = EngineConfig::default();
        config.capture.live_max_exposure_secs = 1e20;
        config.capture.exposure_timeout_margin_secs = f64::INFINITY;
        config.plate_solve.staleness_secs = f64::NAN;
        assert_eq!(config.capture.live_max_exposure(), Duration::from_secs(86_400));
        assert_eq!(
            config.capture.exposure_timeout(Duration::MAX),
            Duration::MAX
        );
        assert_eq!(config.plate_solve.staleness(), Duration::ZERO);
    }
}
