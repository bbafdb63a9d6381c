//! Plate-Solve Coordinator
//!
//! Runs at most one solve at a time in the background. The latest
//! successful solution is published through a `watch` channel so readers
//! always see a whole solution, never a half-updated one.
//!
//! A solution ages in two ways: past `staleness` it no longer counts for
//! guidance decisions, past `hint_max_age` it is no longer offered to the
//! solver as a search hint.

use crate::catalog;
use crate::config::PlateSolveConfig;
use crate::device_ops::{SharedSolverPort, SkyPosition, SolveHint, SolveResponse, SolvedField};
use crate::storage::FieldPointing;
use crate::task::{take_finished, BackgroundTask};
use astrocam_imaging::RawFrame;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct PlateSolution {
    /// Increases with every successful solve
    pub id: u64,
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub rotation_deg: f64,
    pub pixel_scale_arcsec: f64,
    pub confidence: Option<f64>,
    /// Size of the solved frame in pixels
    pub frame_width: u32,
    pub frame_height: u32,
    pub solved_at: Instant,
    pub solved_at_utc: DateTime<Utc>,
    pub hinted: bool,
}

impl PlateSolution {
    pub fn position(&self) -> SkyPosition {
        SkyPosition::new(self.ra_deg, self.dec_deg)
    }

    /// Center and scale for frame headers.
    pub fn field_pointing(&self) -> FieldPointing {
        FieldPointing {
            center: self.position(),
            pixel_scale_arcsec: self.pixel_scale_arcsec,
        }
    }

    pub fn field_radius_deg(&self) -> f64 {
        catalog::field_radius_deg(self.pixel_scale_arcsec, self.frame_width, self.frame_height)
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.solved_at)
    }

    pub fn is_stale(&self, now: Instant, staleness: Duration) -> bool {
        self.age(now) > staleness
    }
}

pub type SharedSolution = Arc<PlateSolution>;

/// Result of [`PlateSolveCoordinator::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum SolvePoll {
    Solved(SharedSolution),
    Pending,
    Unsolved,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Outcome {
    Solved(SolvedField),
    NoSolution,
    TimedOut,
}

struct InFlightSolve {
    /// Outcome and the moment it was produced
    task: BackgroundTask<(Outcome, Instant)>,
    hinted: bool,
    frame_size: (u32, u32),
    /// Result is thrown away when it lands (coordinator was disabled)
    discard: bool,
}

pub struct PlateSolveCoordinator {
    config: PlateSolveConfig,
    solver: SharedSolverPort,
    runtime: Handle,
    enabled: bool,
    in_flight: Option<InFlightSolve>,
    current: watch::Sender<Option<SharedSolution>>,
    next_id: u64,
    /// Last hinted attempt failed; try the next one without a hint
    force_blind: bool,
    last_attempt_failed: bool,
    attempts: u64,
}

impl PlateSolveCoordinator {
    pub fn new(config: PlateSolveConfig, solver: SharedSolverPort, runtime: Handle) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            enabled: config.enabled,
            config,
            solver,
            runtime,
            in_flight: None,
            current,
            next_id: 1,
            force_blind: false,
            last_attempt_failed: false,
            attempts: 0,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        let enabled = enabled && self.config.enabled;
        if enabled == self.enabled {
            return;
        }
        self.enabled = enabled;
        if enabled {
            tracing::info!("Plate solving enabled");
        } else {
            tracing::info!("Plate solving disabled");
            if let Some(solve) = self.in_flight.as_mut() {
                tracing::debug!("In-flight solve will be discarded");
                solve.discard = true;
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Submit a frame unless a solve is already running. Returns whether a
    /// solve was started.
    pub fn maybe_schedule(&mut self, frame: &Arc<RawFrame>, now: Instant) -> bool {
        self.reap();
        if !self.enabled || self.in_flight.is_some() {
            return false;
        }

        let hint = if self.force_blind {
            None
        } else {
            self.hint(now)
        };
        let hinted = hint.is_some();
        let timeout = self.config.solve_timeout();
        let solver = self.solver.clone();
        let frame_size = (frame.width, frame.height);
        let frame = frame.clone();

        let task = BackgroundTask::spawn(&self.runtime, "plate-solve", async move {
            let outcome =
                match tokio::time::timeout(timeout, solver.solve(frame, hint, timeout)).await {
                    Ok(SolveResponse::Solved(field)) => Outcome::Solved(field),
                    Ok(SolveResponse::NoSolution) => Outcome::NoSolution,
                    Err(_) => Outcome::TimedOut,
                };
            (outcome, Instant::now())
        });
        self.attempts += 1;
        tracing::debug!(
            "Solve #{} scheduled ({})",
            self.attempts,
            if hinted { "hinted" } else { "blind" }
        );
        self.in_flight = Some(InFlightSolve {
            task,
            hinted,
            frame_size,
            discard: false,
        });
        true
    }

    /// Non-blocking check for the latest result.
    pub fn poll(&mut self) -> SolvePoll {
        self.reap();
        if !self.enabled {
            return SolvePoll::Unsolved;
        }
        if let Some(solution) = self.current() {
            return SolvePoll::Solved(solution);
        }
        if self.in_flight.is_some() {
            SolvePoll::Pending
        } else {
            SolvePoll::Unsolved
        }
    }

    fn reap(&mut self) {
        let Some(solve) = self.in_flight.as_mut() else {
            return;
        };
        if !solve.task.is_finished() {
            return;
        }
        let hinted = solve.hinted;
        let (frame_width, frame_height) = solve.frame_size;
        let discard = solve.discard;

        let mut slot = self.in_flight.take().map(|s| s.task);
        let (outcome, finished_at) = match take_finished(&mut slot) {
            Some(Ok(done)) => done,
            Some(Err(e)) => {
                tracing::warn!("Solve task failed: {}", e);
                (Outcome::NoSolution, Instant::now())
            }
            None => return,
        };

        if discard {
            tracing::debug!("Discarding solve result after disable: {:?}", outcome);
            return;
        }

        match outcome {
            Outcome::Solved(field) => {
                let solution = Arc::new(PlateSolution {
                    id: self.next_id,
                    ra_deg: field.ra_deg,
                    dec_deg: field.dec_deg,
                    rotation_deg: field.rotation_deg,
                    pixel_scale_arcsec: field.pixel_scale_arcsec,
                    confidence: field.confidence,
                    frame_width,
                    frame_height,
                    solved_at: finished_at,
                    solved_at_utc: Utc::now(),
                    hinted,
                });
                self.next_id += 1;
                tracing::info!(
                    "Solved #{}: RA {:.4}° Dec {:.4}° rot {:.1}° scale {:.2}\"/px",
                    solution.id,
                    solution.ra_deg,
                    solution.dec_deg,
                    solution.rotation_deg,
                    solution.pixel_scale_arcsec
                );
                self.current.send_replace(Some(solution));
                self.force_blind = false;
                self.last_attempt_failed = false;
            }
            Outcome::NoSolution | Outcome::TimedOut => {
                if outcome == Outcome::TimedOut {
                    tracing::warn!(
                        "Solve timed out after {:.1}s",
                        self.config.solve_timeout_secs
                    );
                } else {
                    tracing::info!("No solution ({})", if hinted { "hinted" } else { "blind" });
                }
                // A bad hint can hide the field; retry without one
                self.force_blind = hinted;
                self.last_attempt_failed = true;
            }
        }
    }

    fn hint(&self, now: Instant) -> Option<SolveHint> {
        let solution = self.current.borrow().clone()?;
        if solution.age(now) > self.config.hint_max_age() {
            return None;
        }
        Some(SolveHint {
            center: solution.position(),
            radius_deg: self.config.hint_radius_deg,
            pixel_scale_arcsec: Some(solution.pixel_scale_arcsec),
        })
    }

    /// Latest solution regardless of age.
    pub fn current(&self) -> Option<SharedSolution> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SharedSolution>> {
        self.current.subscribe()
    }

    pub fn in_flight_count(&self) -> usize {
        usize::from(self.in_flight.is_some())
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn last_attempt_failed(&self) -> bool {
        self.last_attempt_failed
    }

    pub fn staleness(&self) -> Duration {
        self.config.staleness()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedSolver;

    fn frame() -> Arc<RawFrame> {
        Arc::new(RawFrame::filled(8, 8, 12, 100))
    }

    fn coordinator(solver: Arc<ScriptedSolver>) -> PlateSolveCoordinator {
        PlateSolveCoordinator::new(PlateSolveConfig::default(), solver, Handle::current())
    }

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_schedule_while_pending_is_dropped() {
        let solver = Arc::new(ScriptedSolver::new(Duration::from_secs(2)));
        let mut coord = coordinator(solver.clone());

        assert!(coord.maybe_schedule(&frame(), Instant::now()));
        assert_eq!(coord.poll(), SolvePoll::Pending);
        assert!(!coord.maybe_schedule(&frame(), Instant::now()));
        assert_eq!(coord.in_flight_count(), 1);

        settle(2100).await;
        assert!(matches!(coord.poll(), SolvePoll::Solved(_)));
        assert_eq!(solver.calls(), 1);
        assert_eq!(solver.probe.peak(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_solve_is_blind_then_hinted() {
        let solver = Arc::new(ScriptedSolver::new(Duration::from_millis(500)));
        let mut coord = coordinator(solver.clone());

        coord.maybe_schedule(&frame(), Instant::now());
        settle(600).await;
        coord.poll();
        coord.maybe_schedule(&frame(), Instant::now());
        settle(600).await;

        let hints = solver.hints();
        assert!(hints[0].is_none());
        let hint = hints[1].unwrap();
        assert!((hint.center.ra_deg - 83.82).abs() < 1e-9);
        assert_eq!(hint.radius_deg, 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hinted_failure_falls_back_to_blind() {
        let solver = Arc::new(ScriptedSolver::new(Duration::from_millis(100)));
        solver.push(SolveResponse::Solved(ScriptedSolver::field(10.0, 20.0)));
        solver.push(SolveResponse::NoSolution);
        let mut coord = coordinator(solver.clone());

        for _ in 0..3 {
            coord.maybe_schedule(&frame(), Instant::now());
            settle(200).await;
            coord.poll();
        }
        let hints = solver.hints();
        assert!(hints[0].is_none());
        assert!(hints[1].is_some());
        assert!(hints[2].is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_no_solution() {
        let solver = Arc::new(ScriptedSolver::new(Duration::from_secs(60)));
        let mut coord = coordinator(solver);
        coord.maybe_schedule(&frame(), Instant::now());
        settle(5_100).await;
        assert_eq!(coord.poll(), SolvePoll::Unsolved);
        assert!(coord.last_attempt_failed());
        // the next frame can be scheduled right away
        assert!(coord.maybe_schedule(&frame(), Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_discards_in_flight_result() {
        let solver = Arc::new(ScriptedSolver::new(Duration::from_secs(1)));
        let mut coord = coordinator(solver);
        coord.maybe_schedule(&frame(), Instant::now());
        coord.set_enabled(false);
        assert!(!coord.maybe_schedule(&frame(), Instant::now()));

        coord.set_enabled(true);
        // still blocked by the discarded task
        assert!(!coord.maybe_schedule(&frame(), Instant::now()));
        settle(1100).await;
        assert_eq!(coord.poll(), SolvePoll::Unsolved);
        assert!(coord.current().is_none());
        assert!(coord.maybe_schedule(&frame(), Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_solution_still_seeds_hint() {
        let solver = Arc::new(ScriptedSolver::new(Duration::from_millis(100)));
        let mut coord = coordinator(solver.clone());
        let mut rx = coord.subscribe();

        coord.maybe_schedule(&frame(), Instant::now());
        settle(200).await;
        coord.poll();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_some());

        settle(60_000).await;
        let now = Instant::now();
        let current = coord.current().unwrap();
        assert!(current.is_stale(now, coord.staleness()));

        assert!(coord.maybe_schedule(&frame(), now));
        settle(10).await;
        assert!(solver.hints()[1].is_some());
    }
}
