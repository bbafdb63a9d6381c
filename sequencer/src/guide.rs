//! Guide Loop
//!
//! Each cycle takes the tracked star's offset from its lock position and
//! turns it into at most one pulse per axis. Pulses go out fire-and-forget;
//! an axis stays blocked until its previous pulse has had time to finish,
//! so pulses on one axis never overlap.

use crate::config::GuideConfig;
use crate::device_ops::{GuideDirection, SharedGuidePort};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Largest share of a correction the integral term may add or remove, so
/// a pulse always points against the current error.
const INTEGRAL_SHARE: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuideAxis {
    Ra,
    Dec,
}

impl GuideAxis {
    fn index(self) -> usize {
        match self {
            GuideAxis::Ra => 0,
            GuideAxis::Dec => 1,
        }
    }

    /// Direction that corrects a positive or negative error on this axis.
    pub fn direction(self, positive: bool) -> GuideDirection {
        match (self, positive) {
            (GuideAxis::Ra, true) => GuideDirection::West,
            (GuideAxis::Ra, false) => GuideDirection::East,
            (GuideAxis::Dec, true) => GuideDirection::South,
            (GuideAxis::Dec, false) => GuideDirection::North,
        }
    }
}

/// Star offset from the lock position, pixels along the mount axes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GuideOffset {
    pub ra_px: f64,
    pub dec_px: f64,
}

impl GuideOffset {
    pub fn new(ra_px: f64, dec_px: f64) -> Self {
        Self { ra_px, dec_px }
    }

    fn axis(&self, axis: GuideAxis) -> f64 {
        match axis {
            GuideAxis::Ra => self.ra_px,
            GuideAxis::Dec => self.dec_px,
        }
    }

    fn axis_mut(&mut self, axis: GuideAxis) -> &mut f64 {
        match axis {
            GuideAxis::Ra => &mut self.ra_px,
            GuideAxis::Dec => &mut self.dec_px,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuideState {
    pub last_offset: Option<GuideOffset>,
    pub integrated_error: GuideOffset,
    pub last_pulse_axis: Option<GuideAxis>,
    pub last_pulse_duration: Duration,
    pub dead_band: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuidePulse {
    pub axis: GuideAxis,
    pub direction: GuideDirection,
    pub duration: Duration,
}

pub struct GuideLoop {
    config: GuideConfig,
    port: SharedGuidePort,
    state: GuideState,
    busy_until: [Option<Instant>; 2],
    pulses_issued: u64,
}

impl GuideLoop {
    pub fn new(config: GuideConfig, port: SharedGuidePort) -> Self {
        let state = GuideState {
            last_offset: None,
            integrated_error: GuideOffset::default(),
            last_pulse_axis: None,
            last_pulse_duration: Duration::ZERO,
            dead_band: config.dead_band_px,
        };
        Self {
            config,
            port,
            state,
            busy_until: [None; 2],
            pulses_issued: 0,
        }
    }

    /// Run one correction cycle. Never waits on the port.
    pub fn cycle(&mut self, observed: GuideOffset, now: Instant) -> Vec<GuidePulse> {
        let mut pulses = Vec::with_capacity(2);
        for axis in [GuideAxis::Ra, GuideAxis::Dec] {
            if let Some(pulse) = self.axis_cycle(axis, observed.axis(axis), now) {
                pulses.push(pulse);
            }
        }
        self.state.last_offset = Some(observed);
        pulses
    }

    fn axis_cycle(&mut self, axis: GuideAxis, error: f64, now: Instant) -> Option<GuidePulse> {
        if !error.is_finite() {
            tracing::warn!("Ignoring non-finite {:?} offset", axis);
            return None;
        }

        // Offsets seen mid-pulse do not reflect the correction yet
        if let Some(until) = self.busy_until[axis.index()] {
            if until > now {
                tracing::debug!("{:?} axis still pulsing, skipping correction", axis);
                return None;
            }
        }

        let integrated = self.state.integrated_error.axis_mut(axis);
        *integrated = *integrated * self.config.integral_decay + error;
        let integrated = *integrated;

        if error.abs() < self.config.dead_band_px {
            return None;
        }

        let limit = error.abs() * INTEGRAL_SHARE;
        let integral_term = (self.config.integral_gain * integrated).clamp(-limit, limit);
        let command = error + integral_term;
        if command == 0.0 {
            return None;
        }
        let ms = (command.abs() * self.config.gain_ms_per_px).min(self.config.max_pulse_ms as f64);
        let duration = Duration::from_micros((ms * 1000.0).round() as u64);
        if duration.is_zero() {
            return None;
        }

        self.busy_until[axis.index()] = Some(now + duration);

        let direction = axis.direction(command > 0.0);
        self.port.pulse(direction, duration);
        self.pulses_issued += 1;
        self.state.last_pulse_axis = Some(axis);
        self.state.last_pulse_duration = duration;
        tracing::debug!(
            "Guide pulse {:?} {}ms (error {:.2}px)",
            direction,
            duration.as_millis(),
            error
        );
        Some(GuidePulse {
            axis,
            direction,
            duration,
        })
    }

    /// Forget accumulated error, e.g. after the lock star changes.
    pub fn reset(&mut self) {
        self.state.integrated_error = GuideOffset::default();
        self.state.last_offset = None;
        self.busy_until = [None; 2];
    }

    pub fn state(&self) -> &GuideState {
        &self.state
    }

    pub fn pulses_issued(&self) -> u64 {
        self.pulses_issued
    }
}
