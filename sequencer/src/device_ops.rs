//! Device port traits
//!
//! The engine talks to hardware and the plate solver only through the
//! traits in this module. Production builds plug in native bindings,
//! tests plug in the deterministic fakes from [`crate::mock`].
//!
//! Exposure, solve and persist calls are long-running and run on
//! background tasks; guide pulses are fire-and-forget.

use crate::error::{ExposureError, PersistError};
use astrocam_imaging::{FitsHeader, RawFrame};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// One exposure as issued to the camera. Never modified after issue.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureRequest {
    pub duration: Duration,
    pub gain: i32,
    pub filter_position: Option<u32>,
    /// Position of this frame within its session (0 for live frames)
    pub frame_index: u32,
}

/// Completed readout. The pixel buffer is shared read-only between the
/// preview pass, the solver and persistence.
#[derive(Debug, Clone)]
pub struct ExposureResult {
    pub frame: Arc<RawFrame>,
    pub timestamp: DateTime<Utc>,
    pub saturated_pixel_count: u64,
}

impl ExposureResult {
    pub fn new(frame: RawFrame, timestamp: DateTime<Utc>) -> Self {
        let saturated_pixel_count = frame.saturated_count();
        Self {
            frame: Arc::new(frame),
            timestamp,
            saturated_pixel_count,
        }
    }

    pub fn width(&self) -> u32 {
        self.frame.width
    }

    pub fn height(&self) -> u32 {
        self.frame.height
    }

    pub fn bit_depth(&self) -> u8 {
        self.frame.bit_depth
    }
}

/// Static description of the camera, used for file headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub name: String,
    pub pixel_size_um: Option<f64>,
    pub focal_length_mm: Option<f64>,
}

/// Equatorial position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyPosition {
    pub ra_deg: f64,
    pub dec_deg: f64,
}

impl SkyPosition {
    pub fn new(ra_deg: f64, dec_deg: f64) -> Self {
        Self { ra_deg, dec_deg }
    }

    /// Great-circle distance in arcseconds (haversine).
    pub fn separation_arcsec(&self, other: &SkyPosition) -> f64 {
        calculate_separation_arcsec(self.ra_deg, self.dec_deg, other.ra_deg, other.dec_deg)
    }
}

/// Positional hint handed to the solver to narrow its search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveHint {
    pub center: SkyPosition,
    pub radius_deg: f64,
    pub pixel_scale_arcsec: Option<f64>,
}

/// Field solution as reported by the solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolvedField {
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub rotation_deg: f64,
    pub pixel_scale_arcsec: f64,
    pub confidence: Option<f64>,
}

/// "No solution" is a normal value, not an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SolveResponse {
    Solved(SolvedField),
    NoSolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuideDirection {
    North,
    South,
    East,
    West,
}

// =============================================================================
// PORTS
// =============================================================================

/// Camera and filter wheel.
#[async_trait]
pub trait ExposurePort: Send + Sync {
    fn info(&self) -> CameraInfo;

    /// Move the filter wheel; a no-op for cameras without one.
    async fn set_filter(&self, position: u32) -> Result<(), ExposureError>;

    /// Take one exposure, blocking until readout completes.
    async fn expose(&self, request: &ExposureRequest) -> Result<ExposureResult, ExposureError>;
}

/// External plate solver. Must give up on its own after `timeout`.
#[async_trait]
pub trait SolverPort: Send + Sync {
    async fn solve(
        &self,
        frame: Arc<RawFrame>,
        hint: Option<SolveHint>,
        timeout: Duration,
    ) -> SolveResponse;
}

/// ST4-style pulse interface. Best-effort, no acknowledgement.
pub trait GuidePort: Send + Sync {
    fn pulse(&self, direction: GuideDirection, duration: Duration);
}

/// Durable storage for captured frames.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Highest frame index already present in storage.
    fn highest_index(&self) -> Option<u32>;

    fn path_for(&self, index: u32) -> PathBuf;

    /// Write the frame and flush it to stable storage. `Ok` means durable.
    async fn persist(
        &self,
        path: PathBuf,
        frame: Arc<RawFrame>,
        header: FitsHeader,
    ) -> Result<(), PersistError>;
}

pub type SharedExposurePort = Arc<dyn ExposurePort>;
pub type SharedSolverPort = Arc<dyn SolverPort>;
pub type SharedGuidePort = Arc<dyn GuidePort>;
pub type SharedFrameSink = Arc<dyn FrameSink>;

/// Angular separation between two positions in arcseconds.
pub fn calculate_separation_arcsec(ra1_deg: f64, dec1_deg: f64, ra2_deg: f64, dec2_deg: f64) -> f64 {
    let dec1_rad = dec1_deg.to_radians();
    let dec2_rad = dec2_deg.to_radians();
    let delta_ra = (ra2_deg - ra1_deg).to_radians();
    let delta_dec = (dec2_deg - dec1_deg).to_radians();

    // Haversine formula for angular separation
    let a = (delta_dec / 2.0).sin().powi(2)
        + dec1_rad.cos() * dec2_rad.cos() * (delta_ra / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().min(1.0).asin();

    c.to_degrees() * 3600.0
}

/// Smallest absolute difference between two right ascensions, in `[0, 180]`.
pub fn ra_difference_deg(ra1_deg: f64, ra2_deg: f64) -> f64 {
    let d = (ra2_deg - ra1_deg).rem_euclid(360.0);
    if d > 180.0 {
        360.0 - d
    } else {
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_separation_along_meridian() {
        let sep = calculate_separation_arcsec(10.0, 20.0, 10.0, 21.0);
        assert!((sep - 3600.0).abs() < 1e-6);
    }

    #[test]
    fn test_separation_shrinks_near_pole() {
        let equator = calculate_separation_arcsec(0.0, 0.0, 10.0, 0.0);
        let high = calculate_separation_arcsec(0.0, 80.0, 10.0, 80.0);
        assert!(high < equator * 0.2);
    }

    #[test]
    fn test_ra_difference_wraps() {
        assert!((ra_difference_deg(350.0, 10.0) - 20.0).abs() < 1e-9);
        assert!((ra_difference_deg(10.0, 350.0) - 20.0).abs() < 1e-9);
        assert!((ra_difference_deg(0.0, 180.0) - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_exposure_result_counts_saturation() {
        let frame = RawFrame::new(2, 1, 8, vec![255, 3]);
        let result = ExposureResult::new(frame, Utc::now());
        assert_eq!(result.saturated_pixel_count, 1);
        assert_eq!(result.width(), 2);
    }
}
