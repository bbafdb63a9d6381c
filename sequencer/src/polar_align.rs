//! Two-point drift polar alignment
//!
//! The user locks a reference solve, rotates the mount in RA only, and
//! confirms. If the polar axis were perfect the star would keep its
//! declination; any change in declination is the misalignment showing
//! through. The assistant then points at the spot halfway back to the
//! original declination and the user turns the alignment screws until the
//! star sits on it.
//!
//! Every step waits for an explicit confirmation because the software
//! cannot observe the slew or the screw adjustment itself.

use crate::config::PolarAlignConfig;
use crate::device_ops::{ra_difference_deg, SkyPosition};
use crate::error::{EngineError, EngineResult};
use crate::plate_solve::SharedSolution;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum PolarAlignState {
    #[default]
    Idle,
    DecLocked,
    DriftMeasured,
    Converged,
}

/// Apparent motion between the reference and the rotated solve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DriftVector {
    pub ra_rotation_deg: f64,
    /// Declination change, arcminutes (+ = north)
    pub dec_drift_arcmin: f64,
    pub separation_arcmin: f64,
}

/// Where to move the star and how far.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CorrectionVector {
    pub target: SkyPosition,
    /// Declination still to go, arcminutes (+ = move north)
    pub dec_offset_arcmin: f64,
    pub magnitude_arcmin: f64,
    /// Position angle from the star to the target, degrees east of north
    pub direction_deg: f64,
    pub toward_pole: bool,
    /// Lower bound on the polar axis error implied by the drift
    pub axis_error_arcmin: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PolarAlignmentSession {
    pub state: PolarAlignState,
    pub locked_dec: Option<f64>,
    pub reference_solution: Option<SharedSolution>,
    pub drift_vector: Option<DriftVector>,
    pub correction_vector: Option<CorrectionVector>,
    /// Remaining error at the last convergence confirmation, arcminutes
    pub residual_arcmin: Option<f64>,
    pub iteration_count: u32,
    /// Id of the newest solution already used by a transition
    last_consumed: Option<u64>,
}

pub struct PolarAlignAssistant {
    config: PolarAlignConfig,
    staleness: Duration,
    session: PolarAlignmentSession,
}

impl PolarAlignAssistant {
    pub fn new(config: PolarAlignConfig, staleness: Duration) -> Self {
        Self {
            config,
            staleness,
            session: PolarAlignmentSession::default(),
        }
    }

    pub fn state(&self) -> PolarAlignState {
        self.session.state
    }

    pub fn session(&self) -> &PolarAlignmentSession {
        &self.session
    }

    /// One user confirmation: move to the next state.
    pub fn advance(
        &mut self,
        latest: Option<&SharedSolution>,
        now: Instant,
    ) -> EngineResult<PolarAlignState> {
        match self.session.state {
            PolarAlignState::Idle => self.lock_dec(latest, now),
            PolarAlignState::DecLocked => self.measure_drift(latest, now),
            PolarAlignState::DriftMeasured => self.confirm_adjusted(latest, now),
            PolarAlignState::Converged => self.refine(latest, now),
        }
    }

    /// IDLE -> DEC_LOCKED: snapshot the current solve as the reference.
    pub fn lock_dec(
        &mut self,
        latest: Option<&SharedSolution>,
        now: Instant,
    ) -> EngineResult<PolarAlignState> {
        if self.session.state != PolarAlignState::Idle {
            return Err(EngineError::invalid_state(format!(
                "cannot lock from {:?}",
                self.session.state
            )));
        }
        let solution = self.usable(latest, now, false)?;
        self.lock_reference(solution);
        Ok(self.session.state)
    }

    /// DEC_LOCKED -> DRIFT_MEASURED. Also allowed from DRIFT_MEASURED to
    /// re-measure with a newer solve.
    pub fn measure_drift(
        &mut self,
        latest: Option<&SharedSolution>,
        now: Instant,
    ) -> EngineResult<PolarAlignState> {
        if !matches!(
            self.session.state,
            PolarAlignState::DecLocked | PolarAlignState::DriftMeasured
        ) {
            return Err(EngineError::invalid_state(format!(
                "cannot measure drift from {:?}",
                self.session.state
            )));
        }
        let reference = self
            .session
            .reference_solution
            .clone()
            .ok_or_else(|| EngineError::invalid_state("no reference locked"))?;
        let probe = self.usable(latest, now, true)?;

        let ra_rotation_deg = ra_difference_deg(reference.ra_deg, probe.ra_deg);
        if ra_rotation_deg < self.config.min_ra_rotation_deg {
            return Err(EngineError::InsufficientRotation {
                measured_deg: ra_rotation_deg,
                required_deg: self.config.min_ra_rotation_deg,
            });
        }

        let drift = DriftVector {
            ra_rotation_deg,
            dec_drift_arcmin: (probe.dec_deg - reference.dec_deg) * 60.0,
            separation_arcmin: reference.position().separation_arcsec(&probe.position()) / 60.0,
        };
        let target = SkyPosition::new(probe.ra_deg, (reference.dec_deg + probe.dec_deg) / 2.0);
        let correction = self.correction(probe.position(), target, &drift);

        tracing::info!(
            "Polar drift: RA moved {:.1}°, Dec drift {:.1}', correction {:.1}' toward {:.0}°",
            drift.ra_rotation_deg,
            drift.dec_drift_arcmin,
            correction.magnitude_arcmin,
            correction.direction_deg
        );

        self.session.last_consumed = Some(probe.id);
        self.session.drift_vector = Some(drift);
        self.session.correction_vector = Some(correction);
        self.session.state = PolarAlignState::DriftMeasured;
        Ok(self.session.state)
    }

    /// DRIFT_MEASURED -> CONVERGED: the user has nulled the correction.
    pub fn confirm_adjusted(
        &mut self,
        latest: Option<&SharedSolution>,
        now: Instant,
    ) -> EngineResult<PolarAlignState> {
        if self.session.state != PolarAlignState::DriftMeasured {
            return Err(EngineError::invalid_state(format!(
                "cannot converge from {:?}",
                self.session.state
            )));
        }
        let (Some(correction), Some(drift)) =
            (self.session.correction_vector, self.session.drift_vector)
        else {
            return Err(EngineError::invalid_state("no correction measured"));
        };
        let solution = self.usable(latest, now, true)?;

        let residual = self.correction(solution.position(), correction.target, &drift);
        tracing::info!(
            "Polar alignment iteration {} converged, residual {:.1}'",
            self.session.iteration_count,
            residual.magnitude_arcmin
        );
        self.session.last_consumed = Some(solution.id);
        self.session.residual_arcmin = Some(residual.magnitude_arcmin);
        self.session.correction_vector = Some(residual);
        self.session.state = PolarAlignState::Converged;
        Ok(self.session.state)
    }

    /// CONVERGED -> DEC_LOCKED: start another refinement pass from here.
    pub fn refine(
        &mut self,
        latest: Option<&SharedSolution>,
        now: Instant,
    ) -> EngineResult<PolarAlignState> {
        if self.session.state != PolarAlignState::Converged {
            return Err(EngineError::invalid_state(format!(
                "cannot refine from {:?}",
                self.session.state
            )));
        }
        let solution = self.usable(latest, now, false)?;
        self.session.iteration_count += 1;
        self.lock_reference(solution);
        Ok(self.session.state)
    }

    /// Drop everything (menu return).
    pub fn reset(&mut self) {
        if self.session.state != PolarAlignState::Idle {
            tracing::info!("Polar alignment session discarded");
        }
        self.session = PolarAlignmentSession::default();
    }

    fn lock_reference(&mut self, solution: SharedSolution) {
        tracing::info!(
            "Polar alignment reference locked at RA {:.3}° Dec {:.3}°",
            solution.ra_deg,
            solution.dec_deg
        );
        self.session.locked_dec = Some(solution.dec_deg);
        self.session.last_consumed = Some(solution.id);
        self.session.reference_solution = Some(solution);
        self.session.drift_vector = None;
        self.session.correction_vector = None;
        self.session.state = PolarAlignState::DecLocked;
    }

    /// A solution that is present, not stale and, when `fresh` is set,
    /// newer than the last one a transition consumed.
    fn usable(
        &self,
        latest: Option<&SharedSolution>,
        now: Instant,
        fresh: bool,
    ) -> EngineResult<SharedSolution> {
        let solution = latest.ok_or_else(|| EngineError::no_solution("no plate solve yet"))?;
        if solution.is_stale(now, self.staleness) {
            return Err(EngineError::no_solution(format!(
                "last solve is {:.0}s old",
                solution.age(now).as_secs_f64()
            )));
        }
        if fresh && self.session.last_consumed.map_or(false, |id| solution.id <= id) {
            return Err(EngineError::no_solution("waiting for a new solve"));
        }
        Ok(solution.clone())
    }

    fn correction(
        &self,
        from: SkyPosition,
        target: SkyPosition,
        drift: &DriftVector,
    ) -> CorrectionVector {
        let half_rotation = (drift.ra_rotation_deg / 2.0).to_radians().sin();
        let axis_error_arcmin = if half_rotation > 1e-9 {
            drift.dec_drift_arcmin.abs() / (2.0 * half_rotation)
        } else {
            0.0
        };
        let pole = self.config.hemisphere.pole_dec();
        CorrectionVector {
            target,
            dec_offset_arcmin: (target.dec_deg - from.dec_deg) * 60.0,
            magnitude_arcmin: from.separation_arcsec(&target) / 60.0,
            direction_deg: position_angle_deg(from, target),
            toward_pole: (pole - target.dec_deg).abs() < (pole - from.dec_deg).abs(),
            axis_error_arcmin,
        }
    }
}

/// Position angle of `to` as seen from `from`, degrees east of north.
pub fn position_angle_deg(from: SkyPosition, to: SkyPosition) -> f64 {
    let dec1 = from.dec_deg.to_radians();
    let dec2 = to.dec_deg.to_radians();
    let dra = (to.ra_deg - from.ra_deg).to_radians();
    let y = dra.sin() * dec2.cos();
    let x = dec1.cos() * dec2.sin() - dec1.sin() * dec2.cos() * dra.cos();
    y.atan2(x).to_degrees().rem_euclid(360.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plate_solve::PlateSolution;
    use chrono::Utc;
    use std::sync::Arc;

    fn solution(id: u64, ra: f64, dec: f64) -> SharedSolution {
        Arc::new(PlateSolution {
            id,
            ra_deg: ra,
            dec_deg: dec,
            rotation_deg: 0.0,
            pixel_scale_arcsec: 2.0,
            confidence: None,
            frame_width: 1280,
            frame_height: 960,
            solved_at: Instant::now(),
            solved_at_utc: Utc::now(),
            hinted: false,
        })
    }

    fn assistant() -> PolarAlignAssistant {
        PolarAlignAssistant::new(PolarAlignConfig::default(), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cycle_and_refinement() {
        let mut pa = assistant();
        let now = Instant::now();

        assert_eq!(
            pa.advance(Some(&solution(1, 100.0, 60.0)), now).unwrap(),
            PolarAlignState::DecLocked
        );
        assert_eq!(pa.session().locked_dec, Some(60.0));

        assert_eq!(
            pa.advance(Some(&solution(2, 160.0, 60.5)), now).unwrap(),
            PolarAlignState::DriftMeasured
        );
        let c = pa.session().correction_vector.unwrap();
        assert!((c.target.ra_deg - 160.0).abs() < 1e-9);
        assert!((c.target.dec_deg - 60.25).abs() < 1e-9);
        assert!((c.dec_offset_arcmin + 15.0).abs() < 1e-6);
        assert!((c.magnitude_arcmin - 15.0).abs() < 1e-3);
        assert!((c.direction_deg - 180.0).abs() < 1e-6);
        assert!(!c.toward_pole);
        // 30' drift over 60° of rotation
        assert!((c.axis_error_arcmin - 30.0).abs() < 1e-6);

        assert_eq!(
            pa.advance(Some(&solution(3, 160.0, 60.26)), now).unwrap(),
            PolarAlignState::Converged
        );
        let residual = pa.session().residual_arcmin.unwrap();
        assert!((residual - 0.6).abs() < 1e-3);

        assert_eq!(
            pa.advance(Some(&solution(4, 160.0, 60.26)), now).unwrap(),
            PolarAlignState::DecLocked
        );
        assert_eq!(pa.session().iteration_count, 1);
        assert!(pa.session().correction_vector.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_measure_without_new_solve_is_rejected() {
        let mut pa = assistant();
        let now = Instant::now();
        pa.lock_dec(Some(&solution(1, 10.0, 45.0)), now).unwrap();
        let probe = solution(2, 80.0, 45.3);
        pa.measure_drift(Some(&probe), now).unwrap();
        let before = pa.session().correction_vector;

        let err = pa.measure_drift(Some(&probe), now).unwrap_err();
        assert!(matches!(err, EngineError::NoSolution(_)));
        assert_eq!(pa.session().correction_vector, before);
        assert_eq!(pa.state(), PolarAlignState::DriftMeasured);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_or_stale_solution() {
        let mut pa = assistant();
        let err = pa.advance(None, Instant::now()).unwrap_err();
        assert!(matches!(err, EngineError::NoSolution(_)));

        let old = solution(1, 10.0, 45.0);
        tokio::time::advance(Duration::from_secs(31)).await;
        let err = pa.advance(Some(&old), Instant::now()).unwrap_err();
        assert!(matches!(err, EngineError::NoSolution(_)));
        assert_eq!(pa.state(), PolarAlignState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_rotation_is_refused() {
        let mut pa = assistant();
        let now = Instant::now();
        pa.lock_dec(Some(&solution(1, 355.0, 45.0)), now).unwrap();
        let err = pa.measure_drift(Some(&solution(2, 5.0, 45.1)), now).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientRotation { .. }));
        assert_eq!(pa.state(), PolarAlignState::DecLocked);
        assert!(pa.session().correction_vector.is_none());

        // wrap-around is measured the short way
        pa.measure_drift(Some(&solution(3, 20.0, 45.1)), now).unwrap();
        let drift = pa.session().drift_vector.unwrap();
        assert!((drift.ra_rotation_deg - 25.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_converged_needs_drift_first() {
        let mut pa = assistant();
        let now = Instant::now();
        assert!(pa.confirm_adjusted(Some(&solution(1, 0.0, 0.0)), now).is_err());
        pa.lock_dec(Some(&solution(1, 0.0, 0.0)), now).unwrap();
        assert!(pa.confirm_adjusted(Some(&solution(2, 40.0, 0.0)), now).is_err());
        pa.reset();
        assert_eq!(pa.state(), PolarAlignState::Idle);
        assert!(pa.session().reference_solution.is_none());
    }

    #[test]
    fn test_position_angle() {
        let from = SkyPosition::new(10.0, 0.0);
        assert!((position_angle_deg(from, SkyPosition::new(10.0, 1.0)) - 0.0).abs() < 1e-9);
        assert!((position_angle_deg(from, SkyPosition::new(11.0, 0.0)) - 90.0).abs() < 1e-6);
    }
}
