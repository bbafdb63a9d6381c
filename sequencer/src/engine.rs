//! Session & Assist Engine
//!
//! Composes the capture controller, plate-solve coordinator, polar-alignment
//! assistant and guide loop into one synchronous [`SessionEngine::tick`].
//! The tick consumes logical input events, advances every component once and
//! returns a snapshot for the display. It never blocks and never fails:
//! every error is turned into a [`Notice`].

use crate::capture::{
    CaptureController, CaptureEvent, CaptureMode, SavedFrameRecord, SessionEnd, SessionState,
};
use crate::catalog::{self, CatalogObject};
use crate::config::EngineConfig;
use crate::device_ops::{SharedExposurePort, SharedFrameSink, SharedGuidePort, SharedSolverPort};
use crate::error::{EngineError, EngineResult};
use crate::guide::{GuideLoop, GuideOffset, GuidePulse};
use crate::plan::SessionRequest;
use crate::plate_solve::{PlateSolveCoordinator, SharedSolution, SolvePoll};
use crate::polar_align::{CorrectionVector, PolarAlignAssistant, PolarAlignState};
use astrocam_imaging::{stretch, FrameAnalysis};
use serde::Serialize;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::time::Instant;

/// Logical buttons, already mapped from physical controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InputEvent {
    Shutter,
    Menu,
    PrimaryAction,
    SecondaryAction,
    ModeToggle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum Screen {
    #[default]
    Capture,
    Menu,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum DisplayMode {
    #[default]
    Live,
    Playback,
}

impl DisplayMode {
    fn toggled(self) -> Self {
        match self {
            DisplayMode::Live => DisplayMode::Playback,
            DisplayMode::Playback => DisplayMode::Live,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TickInput {
    pub events: Vec<InputEvent>,
    /// Tracked guide star offset, when a guide camera is running
    pub guide_offset: Option<GuideOffset>,
}

impl TickInput {
    pub fn events(events: impl IntoIterator<Item = InputEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
            guide_offset: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub error: Option<EngineError>,
}

impl Notice {
    fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
            error: None,
        }
    }

    fn from_error(error: EngineError) -> Self {
        let level = if error.is_fatal() {
            NoticeLevel::Error
        } else {
            NoticeLevel::Warning
        };
        Self {
            level,
            message: format!("{}: {}", error.label(), error),
            error: Some(error),
        }
    }
}

/// Solver status for the overlay.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveStatus {
    Disabled,
    Pending,
    Unsolved,
    Solved { solution: SharedSolution, stale: bool },
}

/// Everything the display layer needs after one tick.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub tick: u64,
    pub mode: CaptureMode,
    pub screen: Screen,
    pub display_mode: DisplayMode,
    pub session: Option<SessionState>,
    pub exposing: bool,
    pub solve: SolveStatus,
    pub polar_state: PolarAlignState,
    pub correction: Option<CorrectionVector>,
    pub polar_iterations: u32,
    /// Most recent frame whose write was confirmed
    pub last_saved: Option<SavedFrameRecord>,
    pub saved_indicator: bool,
    pub no_signal: bool,
    pub preview: Option<Arc<FrameAnalysis>>,
    /// Raw saturated-photosite count of the last frame
    pub saturated_count: Option<u64>,
    pub guide_pulses: Vec<GuidePulse>,
    /// Catalog objects in or near the last solved field, nearest first
    pub targets: Arc<[CatalogObject]>,
    pub notices: Vec<Notice>,
}

pub struct EnginePorts {
    pub camera: SharedExposurePort,
    pub solver: SharedSolverPort,
    pub guide: SharedGuidePort,
    pub sink: SharedFrameSink,
}

pub struct SessionEngine {
    config: EngineConfig,
    capture: CaptureController,
    solver: PlateSolveCoordinator,
    polar: PolarAlignAssistant,
    guide: GuideLoop,
    screen: Screen,
    display_mode: DisplayMode,
    preview: Option<Arc<FrameAnalysis>>,
    last_saved: Option<SavedFrameRecord>,
    saved_indicator: bool,
    no_signal: bool,
    targets: Arc<[CatalogObject]>,
    /// Solution the targets were computed from
    targets_solution: Option<u64>,
    ticks: u64,
}

impl SessionEngine {
    pub fn new(config: EngineConfig, ports: EnginePorts, runtime: Handle) -> Self {
        let capture = CaptureController::new(
            config.capture.clone(),
            ports.camera,
            ports.sink,
            runtime.clone(),
        );
        let solver = PlateSolveCoordinator::new(config.plate_solve.clone(), ports.solver, runtime);
        let polar =
            PolarAlignAssistant::new(config.polar_align.clone(), config.plate_solve.staleness());
        let guide = GuideLoop::new(config.guide.clone(), ports.guide);
        tracing::info!(
            "Session engine ready (solving {}, guiding {})",
            if config.plate_solve.enabled { "on" } else { "off" },
            if config.guide.enabled { "on" } else { "off" }
        );
        Self {
            config,
            capture,
            solver,
            polar,
            guide,
            screen: Screen::Capture,
            display_mode: DisplayMode::Live,
            preview: None,
            last_saved: None,
            saved_indicator: false,
            no_signal: false,
            targets: Arc::from(Vec::new()),
            targets_solution: None,
            ticks: 0,
        }
    }

    /// Advance everything once. Call at a fixed cadence from the main loop.
    pub fn tick(&mut self, input: TickInput) -> EngineStatus {
        self.ticks += 1;
        let now = Instant::now();
        let mut notices = Vec::new();

        for event in input.events {
            if let Err(e) = self.handle_event(event, now, &mut notices) {
                tracing::info!("{:?} rejected: {}", event, e);
                notices.push(Notice::from_error(e));
            }
        }

        let solve_allowed = matches!(self.capture.mode(), CaptureMode::Live | CaptureMode::Single);
        self.solver.set_enabled(solve_allowed);

        for event in self.capture.tick() {
            self.on_capture_event(event, now, &mut notices);
        }

        let solve = match self.solver.poll() {
            _ if !self.solver.is_enabled() => SolveStatus::Disabled,
            SolvePoll::Solved(solution) => {
                let stale = solution.is_stale(now, self.solver.staleness());
                SolveStatus::Solved { solution, stale }
            }
            SolvePoll::Pending => SolveStatus::Pending,
            SolvePoll::Unsolved => SolveStatus::Unsolved,
        };
        let current = self.solver.current();
        self.capture
            .set_pointing(current.as_ref().map(|s| s.field_pointing()));
        if let Some(solution) = current {
            self.recognize_targets(&solution);
        }

        let guide_pulses = match input.guide_offset {
            Some(offset) if self.config.guide.enabled => self.guide.cycle(offset, now),
            _ => Vec::new(),
        };

        let polar = self.polar.session();
        EngineStatus {
            tick: self.ticks,
            mode: self.capture.mode(),
            screen: self.screen,
            display_mode: self.display_mode,
            session: self.capture.session().cloned(),
            exposing: self.capture.is_exposing(),
            solve,
            polar_state: polar.state,
            correction: polar.correction_vector,
            polar_iterations: polar.iteration_count,
            last_saved: self.last_saved.clone(),
            saved_indicator: self.saved_indicator,
            no_signal: self.no_signal,
            saturated_count: self.preview.as_ref().map(|p| p.saturated_count),
            preview: self.preview.clone(),
            guide_pulses,
            targets: self.targets.clone(),
            notices,
        }
    }

    fn recognize_targets(&mut self, solution: &SharedSolution) {
        if self.targets_solution == Some(solution.id) {
            return;
        }
        let found = catalog::objects_in_field(solution.position(), solution.field_radius_deg());
        if let Some(nearest) = found.first() {
            tracing::info!(
                "Field #{} contains {} catalog objects, nearest {}",
                solution.id,
                found.len(),
                nearest.alias.as_deref().unwrap_or(&nearest.name)
            );
        }
        self.targets = Arc::from(found);
        self.targets_solution = Some(solution.id);
    }

    fn handle_event(
        &mut self,
        event: InputEvent,
        now: Instant,
        notices: &mut Vec<Notice>,
    ) -> EngineResult<()> {
        match event {
            InputEvent::Menu => {
                self.screen = match self.screen {
                    Screen::Capture => {
                        if self.capture.session().is_some() {
                            self.capture.cancel()?;
                        }
                        self.polar.reset();
                        Screen::Menu
                    }
                    Screen::Menu => Screen::Capture,
                };
                Ok(())
            }
            InputEvent::ModeToggle => {
                self.display_mode = self.display_mode.toggled();
                Ok(())
            }
            _ if self.screen == Screen::Menu => {
                Err(EngineError::invalid_state("close the menu first"))
            }
            InputEvent::Shutter => self.shutter(notices),
            InputEvent::SecondaryAction => {
                let next = self.capture.mode().next();
                self.capture.set_mode(next)?;
                notices.push(Notice::info(format!("Mode: {}", next.label())));
                Ok(())
            }
            InputEvent::PrimaryAction => {
                let latest = self.solver.current();
                let state = self.polar.advance(latest.as_ref(), now)?;
                notices.push(Notice::info(format!("Polar alignment: {:?}", state)));
                Ok(())
            }
        }
    }

    fn shutter(&mut self, notices: &mut Vec<Notice>) -> EngineResult<()> {
        let mode = self.capture.mode();
        match self.capture.session().map(|s| s.paused) {
            None => {
                let request = self.request_for(mode)?;
                self.capture.start_session(request)?;
                self.saved_indicator = false;
                notices.push(Notice::info(format!("{} started", mode.label())));
            }
            Some(true) => {
                self.capture.resume()?;
                notices.push(Notice::info("Resumed"));
            }
            Some(false) if mode == CaptureMode::Interval => {
                self.capture.pause()?;
                notices.push(Notice::info("Paused"));
            }
            Some(false) => {
                self.capture.cancel()?;
                notices.push(Notice::info("Stopping after current frame"));
            }
        }
        Ok(())
    }

    fn request_for(&self, mode: CaptureMode) -> EngineResult<SessionRequest> {
        let capture = &self.config.capture;
        match mode {
            CaptureMode::Live => Err(EngineError::invalid_state(
                "switch to a capture mode to take frames",
            )),
            CaptureMode::Single => Ok(SessionRequest::Single(capture.exposure.clone())),
            CaptureMode::Repeat => Ok(SessionRequest::Repeat {
                settings: capture.exposure.clone(),
                limit: capture.repeat_limit,
            }),
            CaptureMode::Interval => Ok(SessionRequest::Interval(capture.interval_plan.clone())),
        }
    }

    fn on_capture_event(&mut self, event: CaptureEvent, now: Instant, notices: &mut Vec<Notice>) {
        match event {
            CaptureEvent::FrameReady { result, .. } => {
                self.no_signal = false;
                let display = &self.config.display;
                let analysis = stretch::analyze_with_bins(
                    &result.frame,
                    display.width,
                    display.height,
                    display.histogram_bins,
                );
                self.preview = Some(Arc::new(analysis));
                self.solver.maybe_schedule(&result.frame, now);
            }
            CaptureEvent::FrameSaved(record) => {
                notices.push(Notice::info(format!("SAVED {}", record.file_path.display())));
                self.saved_indicator = record.write_confirmed;
                self.last_saved = Some(record);
            }
            CaptureEvent::PersistFailed { error, .. } => {
                self.saved_indicator = false;
                notices.push(Notice::from_error(error));
            }
            CaptureEvent::ExposureFailed(error) => notices.push(Notice::from_error(error)),
            CaptureEvent::NoSignal { failures } => {
                tracing::warn!("No signal after {} failed exposures", failures);
                self.no_signal = true;
            }
            CaptureEvent::SessionEnded { mode, frames, end } => {
                let what = match end {
                    SessionEnd::Completed => "complete",
                    SessionEnd::Cancelled => "cancelled",
                    SessionEnd::Failed => "stopped by camera fault",
                };
                notices.push(Notice::info(format!(
                    "{} {} ({} frames)",
                    mode.label(),
                    what,
                    frames
                )));
            }
        }
    }

    pub fn capture(&self) -> &CaptureController {
        &self.capture
    }

    pub fn solver(&self) -> &PlateSolveCoordinator {
        &self.solver
    }

    pub fn polar(&self) -> &PolarAlignAssistant {
        &self.polar
    }

    pub fn guide(&self) -> &GuideLoop {
        &self.guide
    }

    pub fn screen(&self) -> Screen {
        self.screen
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MemorySink, RecordingGuidePort, ScriptedCamera, ScriptedSolver};
    use std::time::Duration;

    struct Rig {
        engine: SessionEngine,
        camera: Arc<ScriptedCamera>,
        solver: Arc<ScriptedSolver>,
        sink: Arc<MemorySink>,
    }

    fn rig(config: EngineConfig) -> Rig {
        rig_with(config, ScriptedSolver::new(Duration::from_millis(300)))
    }

    fn rig_with(config: EngineConfig, solver: ScriptedSolver) -> Rig {
        let camera = Arc::new(ScriptedCamera::new());
        let solver = Arc::new(solver);
        let sink = Arc::new(MemorySink::new());
        let engine = SessionEngine::new(
            config,
            EnginePorts {
                camera: camera.clone(),
                solver: solver.clone(),
                guide: Arc::new(RecordingGuidePort::new()),
                sink: sink.clone(),
            },
            Handle::current(),
        );
        Rig {
            engine,
            camera,
            solver,
            sink,
        }
    }

    fn short_exposures() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.capture.exposure.duration_secs = 1.0;
        config
    }

    async fn run(engine: &mut SessionEngine, ticks: usize) -> Vec<EngineStatus> {
        let mut out = Vec::new();
        for _ in 0..ticks {
            out.push(engine.tick(TickInput::default()));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        out
    }

    fn press(engine: &mut SessionEngine, event: InputEvent) -> EngineStatus {
        engine.tick(TickInput::events([event]))
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutter_in_live_mode_is_invalid_state() {
        let mut r = rig(short_exposures());
        let status = press(&mut r.engine, InputEvent::Shutter);
        assert!(matches!(
            status.notices[0].error,
            Some(EngineError::InvalidState(_))
        ));
        assert!(status.session.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_secondary_cycles_modes_but_not_during_session() {
        let mut r = rig(short_exposures());
        assert_eq!(press(&mut r.engine, InputEvent::SecondaryAction).mode, CaptureMode::Single);
        assert_eq!(press(&mut r.engine, InputEvent::SecondaryAction).mode, CaptureMode::Repeat);
        press(&mut r.engine, InputEvent::Shutter);
        let status = press(&mut r.engine, InputEvent::SecondaryAction);
        assert_eq!(status.mode, CaptureMode::Repeat);
        assert!(status.notices.iter().any(|n| n.level == NoticeLevel::Warning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_shot_shows_saved_after_confirmation() {
        let mut r = rig(short_exposures());
        press(&mut r.engine, InputEvent::SecondaryAction);
        let status = press(&mut r.engine, InputEvent::Shutter);
        assert!(status.session.is_some());
        assert!(!status.saved_indicator);

        let statuses = run(&mut r.engine, 40).await;
        let last = statuses.last().unwrap();
        assert!(last.saved_indicator);
        assert!(last.last_saved.as_ref().unwrap().write_confirmed);
        assert!(last.session.is_none());
        assert_eq!(r.sink.saved_paths().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_toggle_keeps_session_running() {
        let mut r = rig(short_exposures());
        press(&mut r.engine, InputEvent::SecondaryAction);
        press(&mut r.engine, InputEvent::SecondaryAction);
        press(&mut r.engine, InputEvent::Shutter);
        let status = press(&mut r.engine, InputEvent::ModeToggle);
        assert_eq!(status.display_mode, DisplayMode::Playback);
        assert!(status.session.is_some());
        run(&mut r.engine, 60).await;
        assert!(r.sink.saved_paths().len() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_menu_cancels_session_and_polar() {
        let mut r = rig(short_exposures());
        // get a solve in LIVE mode and lock polar alignment
        run(&mut r.engine, 20).await;
        let status = press(&mut r.engine, InputEvent::PrimaryAction);
        assert_eq!(status.polar_state, PolarAlignState::DecLocked);

        press(&mut r.engine, InputEvent::SecondaryAction);
        press(&mut r.engine, InputEvent::SecondaryAction);
        press(&mut r.engine, InputEvent::Shutter);
        run(&mut r.engine, 3).await;

        let status = press(&mut r.engine, InputEvent::Menu);
        assert_eq!(status.screen, Screen::Menu);
        assert_eq!(status.polar_state, PolarAlignState::Idle);
        let statuses = run(&mut r.engine, 30).await;
        assert!(statuses.last().unwrap().session.is_none());
        // the frame that was exposing when the menu opened still landed
        assert_eq!(r.sink.saved_paths().len(), 1);

        let status = press(&mut r.engine, InputEvent::Shutter);
        assert!(matches!(
            status.notices[0].error,
            Some(EngineError::InvalidState(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_solving_only_in_live_and_single() {
        let mut r = rig(short_exposures());
        run(&mut r.engine, 20).await;
        assert!(r.solver.calls() >= 1);

        press(&mut r.engine, InputEvent::SecondaryAction);
        let status = press(&mut r.engine, InputEvent::SecondaryAction);
        assert_eq!(status.mode, CaptureMode::Repeat);
        assert_eq!(status.solve, SolveStatus::Disabled);
        let before = r.solver.calls();
        run(&mut r.engine, 20).await;
        assert_eq!(r.solver.calls(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_without_solution_reports_no_solution() {
        let mut config = short_exposures();
        config.plate_solve.enabled = false;
        let mut r = rig(config);
        let status = press(&mut r.engine, InputEvent::PrimaryAction);
        assert!(matches!(
            status.notices[0].error,
            Some(EngineError::NoSolution(_))
        ));
        assert_eq!(status.polar_state, PolarAlignState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absurd_exposure_length_is_refused_without_panic() {
        let mut config = EngineConfig::default();
        config.capture.exposure.duration_secs = 1e20;
        let mut r = rig(config);
        press(&mut r.engine, InputEvent::SecondaryAction);
        let status = press(&mut r.engine, InputEvent::Shutter);
        assert!(matches!(
            status.notices[0].error,
            Some(EngineError::InvalidState(_))
        ));
        assert!(status.session.is_none());

        run(&mut r.engine, 10).await;
        assert!(r.sink.saved_paths().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolvable_sky_keeps_polar_idle() {
        let mut r = rig_with(
            short_exposures(),
            ScriptedSolver::never_solves(Duration::from_millis(300)),
        );
        let statuses = run(&mut r.engine, 30).await;
        assert!(r.solver.calls() >= 2);
        let last = statuses.last().unwrap();
        assert!(matches!(
            last.solve,
            SolveStatus::Unsolved | SolveStatus::Pending
        ));
        assert!(last.targets.is_empty());

        let status = press(&mut r.engine, InputEvent::PrimaryAction);
        assert!(matches!(
            status.notices[0].error,
            Some(EngineError::NoSolution(_))
        ));
        assert_eq!(status.polar_state, PolarAlignState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guide_offsets_drive_pulses_when_enabled() {
        let mut config = short_exposures();
        config.guide.enabled = true;
        let mut r = rig(config);
        let status = r.engine.tick(TickInput {
            events: Vec::new(),
            guide_offset: Some(GuideOffset::new(3.0, 0.1)),
        });
        assert_eq!(status.guide_pulses.len(), 1);
        assert_eq!(r.engine.guide().pulses_issued(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_shutter_pauses_then_resumes() {
        let mut config = short_exposures();
        config.capture.interval_plan = crate::plan::IntervalPlan::new(vec![
            crate::plan::IntervalEntry {
                filter_position: 0,
                duration_secs: 1.0,
                gain: 100,
                repeat_count: 4,
            },
        ]);
        let mut r = rig(config);
        for _ in 0..3 {
            press(&mut r.engine, InputEvent::SecondaryAction);
        }
        press(&mut r.engine, InputEvent::Shutter);
        run(&mut r.engine, 15).await;
        let status = press(&mut r.engine, InputEvent::Shutter);
        assert!(status.session.as_ref().unwrap().paused);

        run(&mut r.engine, 30).await;
        let paused_at = r.sink.saved_paths().len();
        assert!(paused_at < 4);

        press(&mut r.engine, InputEvent::Shutter);
        run(&mut r.engine, 80).await;
        assert_eq!(r.sink.saved_paths().len(), 4);
        assert!(r.camera.filter_moves().iter().all(|&f| f == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_frame_header_uses_live_solution() {
        let mut r = rig(short_exposures());
        let statuses = run(&mut r.engine, 20).await;
        assert!(matches!(
            statuses.last().unwrap().solve,
            SolveStatus::Solved { .. }
        ));

        press(&mut r.engine, InputEvent::SecondaryAction);
        press(&mut r.engine, InputEvent::Shutter);
        run(&mut r.engine, 40).await;

        let headers = r.sink.saved_headers();
        assert_eq!(headers.len(), 1);
        let header = &headers[0];
        assert_eq!(header.get_float("RA"), Some(83.82));
        assert_eq!(header.get_float("DEC"), Some(-5.39));
        // 3.76um pixels at 2.1"/px
        let focal = header.get_float("FOCALLEN").unwrap();
        assert!((focal - 369.0).abs() < 1.0, "FOCALLEN {}", focal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_solved_field_names_its_targets() {
        let mut r = rig(short_exposures());
        let before = r.engine.tick(TickInput::default());
        assert!(before.targets.is_empty());

        let statuses = run(&mut r.engine, 20).await;
        let targets = &statuses.last().unwrap().targets;
        assert_eq!(targets[0].name, "M42");
        assert_eq!(targets[0].alias.as_deref(), Some("Orion Nebula"));
        assert!(targets[0].in_frame);
        assert!(targets.iter().any(|t| t.name == "M43"));
    }
}
