//! Simulated hardware
//!
//! Stand-ins for the camera, plate solver, guide port and guide star so the
//! shell runs on a desk with no telescope attached. The camera renders a
//! noisy star field; the solver reports a pointing that drifts slowly.

use astrocam_imaging::{max_value_for_depth, RawFrame};
use astrocam_sequencer::{
    CameraInfo, ExposureError, ExposurePort, ExposureRequest, ExposureResult, GuideDirection,
    GuideOffset, GuidePort, SkyPosition, SolveHint, SolveResponse, SolvedField, SolverPort,
};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// CAMERA
// =============================================================================

pub struct SimulatedCamera {
    width: u32,
    height: u32,
    bit_depth: u8,
    filter: AtomicU32,
}

impl SimulatedCamera {
    pub fn new(width: u32, height: u32, bit_depth: u8) -> Self {
        Self {
            width,
            height,
            bit_depth,
            filter: AtomicU32::new(0),
        }
    }

    pub fn filter_position(&self) -> u32 {
        self.filter.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new(1280, 960, 12)
    }
}

#[async_trait]
impl ExposurePort for SimulatedCamera {
    fn info(&self) -> CameraInfo {
        CameraInfo {
            name: "Simulated Camera".to_string(),
            pixel_size_um: Some(3.76),
            focal_length_mm: Some(250.0),
        }
    }

    async fn set_filter(&self, position: u32) -> Result<(), ExposureError> {
        if self.filter.swap(position, Ordering::SeqCst) != position {
            tracing::info!("[SIM] Filter wheel moved to slot {}", position);
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        Ok(())
    }

    async fn expose(&self, request: &ExposureRequest) -> Result<ExposureResult, ExposureError> {
        tracing::debug!(
            "[SIM] Exposing {:.2}s at gain {}",
            request.duration.as_secs_f64(),
            request.gain
        );
        tokio::time::sleep(request.duration).await;

        let (width, height, bit_depth) = (self.width, self.height, self.bit_depth);
        let gain = request.gain;
        let secs = request.duration.as_secs_f64();
        let frame = tokio::task::spawn_blocking(move || {
            generate_star_field(width, height, bit_depth, gain, secs)
        })
        .await
        .map_err(|e| ExposureError::Hardware(format!("readout failed: {}", e)))?;

        Ok(ExposureResult::new(frame, chrono::Utc::now()))
    }
}

/// Background, read noise and a handful of Gaussian stars.
pub fn generate_star_field(
    width: u32,
    height: u32,
    bit_depth: u8,
    gain: i32,
    exposure_secs: f64,
) -> RawFrame {
    let mut rng = rand::thread_rng();
    let max = max_value_for_depth(bit_depth) as f64;
    let pixel_count = width as usize * height as usize;

    let background = (max * 0.02 + gain as f64 * 0.5 + exposure_secs * 2.0).min(max * 0.5);
    let noise = (max * 0.005 + gain as f64 * 0.05).max(1.0);

    let mut pixels: Vec<f64> = (0..pixel_count)
        .map(|_| background + (rng.gen::<f64>() - 0.5) * noise)
        .collect();

    if width > 10 && height > 10 {
        let star_count = (50.0 + exposure_secs * 10.0).min(300.0) as u32;
        for _ in 0..star_count {
            let cx = rng.gen_range(5..width - 5) as i32;
            let cy = rng.gen_range(5..height - 5) as i32;
            let peak = rng.gen_range(max * 0.05..max * 1.2);
            let sigma = rng.gen_range(1.2f64..3.0f64);

            let radius = (sigma * 3.0) as i32;
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    let (px, py) = (cx + dx, cy + dy);
                    if px < 0 || py < 0 || px >= width as i32 || py >= height as i32 {
                        continue;
                    }
                    let dist_sq = (dx * dx + dy * dy) as f64;
                    let idx = py as usize * width as usize + px as usize;
                    pixels[idx] += peak * (-dist_sq / (2.0 * sigma * sigma)).exp();
                }
            }
        }
    }

    let pixels = pixels
        .into_iter()
        .map(|v| v.round().clamp(0.0, max) as u16)
        .collect();
    RawFrame::new(width, height, bit_depth, pixels)
}

// =============================================================================
// SOLVER
// =============================================================================

/// Reports the simulated mount pointing, plus a little jitter.
pub struct SimulatedSolver {
    pointing: Mutex<SkyPosition>,
    /// Fraction of blind solves that fail
    blind_failure_rate: f64,
}

impl SimulatedSolver {
    pub fn new(pointing: SkyPosition) -> Self {
        Self {
            pointing: Mutex::new(pointing),
            blind_failure_rate: 0.2,
        }
    }

    /// Rotate the simulated mount in RA, e.g. during polar alignment.
    pub fn slew_ra(&self, delta_deg: f64) {
        let mut p = self
            .pointing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        p.ra_deg = (p.ra_deg + delta_deg).rem_euclid(360.0);
        tracing::info!("[SIM] Mount rotated to RA {:.3}", p.ra_deg);
    }

    pub fn pointing(&self) -> SkyPosition {
        *self
            .pointing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SolverPort for SimulatedSolver {
    async fn solve(
        &self,
        _frame: Arc<RawFrame>,
        hint: Option<SolveHint>,
        timeout: Duration,
    ) -> SolveResponse {
        // Hinted solves search a small patch of sky and finish sooner
        let work = if hint.is_some() {
            Duration::from_millis(400)
        } else {
            Duration::from_millis(1500)
        };
        if work > timeout {
            tokio::time::sleep(timeout).await;
            return SolveResponse::NoSolution;
        }
        tokio::time::sleep(work).await;

        let pointing = self.pointing();
        let (fail, jitter_ra, jitter_dec) = {
            let mut rng = rand::thread_rng();
            (
                hint.is_none() && rng.gen::<f64>() < self.blind_failure_rate,
                rng.gen_range(-0.001..0.001),
                rng.gen_range(-0.001..0.001),
            )
        };
        if fail {
            tracing::debug!("[SIM] Blind solve failed");
            return SolveResponse::NoSolution;
        }
        SolveResponse::Solved(SolvedField {
            ra_deg: (pointing.ra_deg + jitter_ra).rem_euclid(360.0),
            dec_deg: (pointing.dec_deg + jitter_dec).clamp(-90.0, 90.0),
            rotation_deg: 3.5,
            pixel_scale_arcsec: 3.1,
            confidence: Some(0.97),
        })
    }
}

// =============================================================================
// GUIDING
// =============================================================================

/// Logs pulses and feeds them back into the simulated guide star.
pub struct SimulatedGuidePort {
    star: Arc<SimulatedGuideStar>,
}

impl SimulatedGuidePort {
    pub fn new(star: Arc<SimulatedGuideStar>) -> Self {
        Self { star }
    }
}

impl GuidePort for SimulatedGuidePort {
    fn pulse(&self, direction: GuideDirection, duration: Duration) {
        tracing::debug!("[SIM] Pulse {:?} for {}ms", direction, duration.as_millis());
        self.star.apply_pulse(direction, duration);
    }
}

/// Guide star that wanders in a random walk with a steady RA drift.
pub struct SimulatedGuideStar {
    offset: Mutex<GuideOffset>,
    /// Pixels moved per millisecond of pulse
    px_per_ms: f64,
}

impl SimulatedGuideStar {
    pub fn new() -> Self {
        Self {
            offset: Mutex::new(GuideOffset::default()),
            px_per_ms: 0.01,
        }
    }

    /// Advance the walk one step and return the new offset.
    pub fn observe(&self) -> GuideOffset {
        let mut rng = rand::thread_rng();
        let mut o = self
            .offset
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        o.ra_px += 0.05 + rng.gen_range(-0.2..0.2);
        o.dec_px += rng.gen_range(-0.15..0.15);
        *o
    }

    fn apply_pulse(&self, direction: GuideDirection, duration: Duration) {
        let moved = duration.as_millis() as f64 * self.px_per_ms;
        let mut o = self
            .offset
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match direction {
            GuideDirection::West => o.ra_px -= moved,
            GuideDirection::East => o.ra_px += moved,
            GuideDirection::South => o.dec_px -= moved,
            GuideDirection::North => o.dec_px += moved,
        }
    }
}

impl Default for SimulatedGuideStar {
    fn default() -> Self {
        Self::new()
    }
}
