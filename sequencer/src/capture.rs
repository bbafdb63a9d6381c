//! Capture Session Controller
//!
//! Owns the capture mode, the active session and the single exposure slot.
//! A frame moves through the slot in two phases: the exposure itself, then
//! the durable write. Nothing else is issued to the camera until both have
//! finished, which keeps exposures strictly ordered and non-overlapping.
//!
//! The controller is driven by [`CaptureController::tick`] and never waits
//! on either phase; it only checks whether the background task is done.

use crate::config::CaptureConfig;
use crate::device_ops::{
    ExposureRequest, ExposureResult, SharedExposurePort, SharedFrameSink,
};
use crate::error::{EngineError, EngineResult, ExposureError, PersistError};
use crate::plan::{ExposureSettings, IntervalCursor, IntervalPlan, SessionRequest};
use crate::storage::{build_header, FieldPointing, HeaderContext};
use crate::task::BackgroundTask;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use uuid::Uuid;

/// Saved-frame records kept for the status view
const RECORD_HISTORY: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureMode {
    #[default]
    Live,
    Single,
    Repeat,
    Interval,
}

impl CaptureMode {
    /// Next mode in the selector cycle.
    pub fn next(self) -> Self {
        match self {
            CaptureMode::Live => CaptureMode::Single,
            CaptureMode::Single => CaptureMode::Repeat,
            CaptureMode::Repeat => CaptureMode::Interval,
            CaptureMode::Interval => CaptureMode::Live,
        }
    }

    pub fn persists(self) -> bool {
        !matches!(self, CaptureMode::Live)
    }

    pub fn label(self) -> &'static str {
        match self {
            CaptureMode::Live => "LIVE",
            CaptureMode::Single => "SINGLE",
            CaptureMode::Repeat => "REPEAT",
            CaptureMode::Interval => "INTERVAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub id: Uuid,
    pub mode: CaptureMode,
    /// Session still accepts new exposures
    pub armed: bool,
    pub paused: bool,
    /// Frames confirmed saved in this session
    pub sequence_index: u32,
    pub started_at: DateTime<Utc>,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SavedFrameRecord {
    pub file_path: PathBuf,
    pub file_index: u32,
    /// Position of the frame within its session
    pub sequence_index: u32,
    pub header_fields: Vec<(String, String)>,
    /// True only once the durable write returned success
    pub write_confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Completed,
    Cancelled,
    /// Ended by a camera fault
    Failed,
}

/// Things that happened during one tick, in order.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// A readout is available for preview and solving
    FrameReady { result: ExposureResult, live: bool },
    FrameSaved(SavedFrameRecord),
    PersistFailed {
        record: SavedFrameRecord,
        error: EngineError,
    },
    ExposureFailed(EngineError),
    /// Too many consecutive failures; the camera looks gone
    NoSignal { failures: u32 },
    SessionEnded {
        mode: CaptureMode,
        frames: u32,
        end: SessionEnd,
    },
}

enum Source {
    Single(ExposureSettings),
    Repeat {
        settings: ExposureSettings,
        limit: Option<u32>,
    },
    Interval {
        plan: IntervalPlan,
        cursor: IntervalCursor,
    },
}

impl Source {
    fn from_request(request: SessionRequest) -> Self {
        match request {
            SessionRequest::Single(settings) => Source::Single(settings),
            SessionRequest::Repeat { settings, limit } => Source::Repeat { settings, limit },
            SessionRequest::Interval(plan) => Source::Interval {
                plan,
                cursor: IntervalCursor::default(),
            },
        }
    }

    fn next_settings(&mut self, saved: u32) -> Option<ExposureSettings> {
        match self {
            Source::Single(settings) => (saved == 0).then(|| settings.clone()),
            Source::Repeat { settings, limit } => match limit {
                Some(limit) if saved >= *limit => None,
                _ => Some(settings.clone()),
            },
            Source::Interval { plan, cursor } => cursor.current(plan),
        }
    }

    /// Record one saved frame; returns true once the source is exhausted.
    fn frame_saved(&mut self, saved: u32) -> bool {
        match self {
            Source::Single(_) => true,
            Source::Repeat { limit, .. } => limit.map_or(false, |l| saved >= l),
            Source::Interval { plan, cursor } => cursor.advance(plan) && !plan.repeat_plan,
        }
    }
}

struct ActiveSession {
    state: SessionState,
    source: Source,
}

enum InFlight {
    /// The slot stays occupied until the port call returns, even past its
    /// deadline, so a late readout can never overlap the next exposure.
    Exposing {
        request: ExposureRequest,
        persist: bool,
        timeout: Duration,
        deadline: Instant,
        task: BackgroundTask<Result<ExposureResult, ExposureError>>,
    },
    Persisting {
        record: SavedFrameRecord,
        task: BackgroundTask<Result<(), PersistError>>,
    },
}

pub struct CaptureController {
    config: CaptureConfig,
    camera: SharedExposurePort,
    sink: SharedFrameSink,
    runtime: Handle,
    mode: CaptureMode,
    session: Option<ActiveSession>,
    in_flight: Option<InFlight>,
    next_file_index: u32,
    pointing: Option<FieldPointing>,
    records: Vec<SavedFrameRecord>,
    consecutive_failures: u32,
}

impl CaptureController {
    pub fn new(
        config: CaptureConfig,
        camera: SharedExposurePort,
        sink: SharedFrameSink,
        runtime: Handle,
    ) -> Self {
        let next_file_index = sink.highest_index().map_or(1, |i| i.saturating_add(1));
        tracing::info!("Capture controller ready, next file index {}", next_file_index);
        Self {
            config,
            camera,
            sink,
            runtime,
            mode: CaptureMode::Live,
            session: None,
            in_flight: None,
            next_file_index,
            pointing: None,
            records: Vec::new(),
            consecutive_failures: 0,
        }
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    pub fn set_mode(&mut self, mode: CaptureMode) -> EngineResult<()> {
        if self.session.is_some() {
            return Err(EngineError::invalid_state(
                "cannot change mode while a session exists",
            ));
        }
        if mode != self.mode {
            tracing::info!("Capture mode {} -> {}", self.mode.label(), mode.label());
            self.mode = mode;
        }
        Ok(())
    }

    pub fn start_session(&mut self, request: SessionRequest) -> EngineResult<()> {
        if self.mode == CaptureMode::Live {
            return Err(EngineError::invalid_state("LIVE mode does not capture sessions"));
        }
        if request.mode() != self.mode {
            return Err(EngineError::invalid_state(format!(
                "{} request while in {} mode",
                request.mode().label(),
                self.mode.label()
            )));
        }
        if let Some(active) = &self.session {
            if !active.state.paused {
                return Err(EngineError::invalid_state("a session is already running"));
            }
            tracing::info!(
                "Replacing paused {} session after {} frames",
                active.state.mode.label(),
                active.state.sequence_index
            );
        }
        request.validate()?;

        // Someone may have written files since we last looked
        if let Some(highest) = self.sink.highest_index() {
            self.next_file_index = self.next_file_index.max(highest.saturating_add(1));
        }

        let state = SessionState {
            id: Uuid::new_v4(),
            mode: self.mode,
            armed: true,
            paused: false,
            sequence_index: 0,
            started_at: Utc::now(),
            cancel_requested: false,
        };
        tracing::info!(
            "Starting {} session {} at file index {}",
            state.mode.label(),
            state.id,
            self.next_file_index
        );
        self.session = Some(ActiveSession {
            state,
            source: Source::from_request(request),
        });
        self.records.clear();
        Ok(())
    }

    /// Stop queueing exposures. An in-flight frame still completes and saves.
    pub fn pause(&mut self) -> EngineResult<()> {
        let active = self.active_mut("pause")?;
        if active.state.paused {
            return Err(EngineError::invalid_state("session already paused"));
        }
        active.state.paused = true;
        tracing::info!("Session paused at frame {}", active.state.sequence_index);
        Ok(())
    }

    pub fn resume(&mut self) -> EngineResult<()> {
        let active = self.active_mut("resume")?;
        if !active.state.paused {
            return Err(EngineError::invalid_state("session is not paused"));
        }
        active.state.paused = false;
        tracing::info!("Session resumed at frame {}", active.state.sequence_index);
        Ok(())
    }

    /// Request cancellation. Takes effect once nothing is in flight.
    pub fn cancel(&mut self) -> EngineResult<()> {
        let active = self.active_mut("cancel")?;
        active.state.cancel_requested = true;
        active.state.armed = false;
        tracing::info!("Cancel requested for session {}", active.state.id);
        Ok(())
    }

    /// Header pointing for subsequent frames (from the latest plate solve).
    pub fn set_pointing(&mut self, pointing: Option<FieldPointing>) {
        self.pointing = pointing;
    }

    // =========================================================================
    // TICK
    // =========================================================================

    pub fn tick(&mut self) -> Vec<CaptureEvent> {
        let mut events = Vec::new();

        self.poll_in_flight(&mut events);

        if self.in_flight.is_none() {
            self.finish_cancelled(&mut events);
            self.issue_next(&mut events);
        }

        events
    }

    fn poll_in_flight(&mut self, events: &mut Vec<CaptureEvent>) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        match in_flight {
            InFlight::Exposing {
                request,
                persist,
                timeout,
                mut deadline,
                mut task,
            } => match task.try_take() {
                None => {
                    if Instant::now() >= deadline {
                        tracing::warn!(
                            "Camera still busy {:.1}s after issuing frame {}",
                            task.started().elapsed().as_secs_f64(),
                            request.frame_index
                        );
                        deadline += timeout;
                        self.exposure_failed(ExposureError::timeout(timeout).into(), events);
                    }
                    self.in_flight = Some(InFlight::Exposing {
                        request,
                        persist,
                        timeout,
                        deadline,
                        task,
                    })
                }
                Some(Ok(Ok(result))) => self.exposure_done(request, persist, result, events),
                Some(Ok(Err(e))) => self.exposure_failed(e.into(), events),
                Some(Err(join)) => {
                    self.exposure_failed(EngineError::HardwareError(join.to_string()), events)
                }
            },
            InFlight::Persisting { record, mut task } => match task.try_take() {
                None => self.in_flight = Some(InFlight::Persisting { record, task }),
                Some(Ok(Ok(()))) => self.persist_confirmed(record, events),
                Some(Ok(Err(e))) => self.persist_failed(record, e.into(), events),
                Some(Err(join)) => self.persist_failed(
                    record,
                    PersistError::Aborted(join.to_string()).into(),
                    events,
                ),
            },
        }
    }

    fn exposure_done(
        &mut self,
        request: ExposureRequest,
        persist: bool,
        result: ExposureResult,
        events: &mut Vec<CaptureEvent>,
    ) {
        self.consecutive_failures = 0;
        events.push(CaptureEvent::FrameReady {
            result: result.clone(),
            live: !persist,
        });
        if !persist {
            return;
        }

        let file_index = self.next_file_index;
        self.next_file_index = self.next_file_index.saturating_add(1);
        let file_path = self.sink.path_for(file_index);

        let camera = self.camera.info();
        let header = build_header(
            &request,
            &result,
            &HeaderContext {
                camera: &camera,
                filter_name: request
                    .filter_position
                    .map(|p| self.config.filter_name(p)),
                pointing: self.pointing,
            },
        );
        let record = SavedFrameRecord {
            file_path: file_path.clone(),
            file_index,
            sequence_index: request.frame_index,
            header_fields: header
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            write_confirmed: false,
        };

        let sink = self.sink.clone();
        let frame = result.frame.clone();
        let task = BackgroundTask::spawn(&self.runtime, "persist", async move {
            sink.persist(file_path, frame, header).await
        });
        self.in_flight = Some(InFlight::Persisting { record, task });
    }

    fn exposure_failed(&mut self, error: EngineError, events: &mut Vec<CaptureEvent>) {
        self.consecutive_failures += 1;
        tracing::warn!(
            "Exposure failed ({} in a row): {}",
            self.consecutive_failures,
            error
        );
        let fatal = error.is_fatal();
        events.push(CaptureEvent::ExposureFailed(error));
        if self.consecutive_failures == self.config.no_signal_after {
            events.push(CaptureEvent::NoSignal {
                failures: self.consecutive_failures,
            });
        }
        if fatal {
            if let Some(active) = self.session.take() {
                tracing::error!("Session {} cancelled by camera fault", active.state.id);
                events.push(CaptureEvent::SessionEnded {
                    mode: active.state.mode,
                    frames: active.state.sequence_index,
                    end: SessionEnd::Failed,
                });
            }
        }
        // Timeouts leave the session untouched; the same frame is retried
    }

    fn persist_confirmed(&mut self, mut record: SavedFrameRecord, events: &mut Vec<CaptureEvent>) {
        record.write_confirmed = true;
        self.remember(record.clone());
        events.push(CaptureEvent::FrameSaved(record));

        let Some(active) = self.session.as_mut() else {
            return;
        };
        active.state.sequence_index += 1;
        let exhausted = active.source.frame_saved(active.state.sequence_index);
        if exhausted && !active.state.cancel_requested {
            let state = &active.state;
            tracing::info!(
                "{} session {} complete after {} frames",
                state.mode.label(),
                state.id,
                state.sequence_index
            );
            events.push(CaptureEvent::SessionEnded {
                mode: state.mode,
                frames: state.sequence_index,
                end: SessionEnd::Completed,
            });
            self.session = None;
        }
    }

    fn persist_failed(
        &mut self,
        record: SavedFrameRecord,
        error: EngineError,
        events: &mut Vec<CaptureEvent>,
    ) {
        tracing::error!("Frame {} not saved: {}", record.file_path.display(), error);
        self.remember(record.clone());
        if let Some(active) = self.session.as_mut() {
            if !active.state.cancel_requested {
                active.state.paused = true;
            }
        }
        events.push(CaptureEvent::PersistFailed { record, error });
    }

    fn remember(&mut self, record: SavedFrameRecord) {
        if self.records.len() >= RECORD_HISTORY {
            let excess = self.records.len() + 1 - RECORD_HISTORY;
            self.records.drain(..excess);
        }
        self.records.push(record);
    }

    fn finish_cancelled(&mut self, events: &mut Vec<CaptureEvent>) {
        let cancelled = self
            .session
            .as_ref()
            .map_or(false, |a| a.state.cancel_requested);
        if !cancelled {
            return;
        }
        if let Some(active) = self.session.take() {
            tracing::info!(
                "Session {} cancelled after {} frames",
                active.state.id,
                active.state.sequence_index
            );
            events.push(CaptureEvent::SessionEnded {
                mode: active.state.mode,
                frames: active.state.sequence_index,
                end: SessionEnd::Cancelled,
            });
        }
    }

    fn issue_next(&mut self, events: &mut Vec<CaptureEvent>) {
        let (request, persist) = match self.session.as_mut() {
            Some(active) => {
                if active.state.paused || !active.state.armed {
                    return;
                }
                let Some(settings) = active.source.next_settings(active.state.sequence_index)
                else {
                    // Nothing left to take; close out quietly
                    let state = &active.state;
                    events.push(CaptureEvent::SessionEnded {
                        mode: state.mode,
                        frames: state.sequence_index,
                        end: SessionEnd::Completed,
                    });
                    self.session = None;
                    return;
                };
                let request = ExposureRequest {
                    duration: settings.duration(),
                    gain: settings.gain,
                    filter_position: settings.filter_position,
                    frame_index: active.state.sequence_index,
                };
                (request, true)
            }
            None => {
                if !self.config.live_preview {
                    return;
                }
                let settings = &self.config.exposure;
                let request = ExposureRequest {
                    duration: settings.duration().min(self.config.live_max_exposure()),
                    gain: settings.gain,
                    filter_position: None,
                    frame_index: 0,
                };
                (request, false)
            }
        };

        let camera = self.camera.clone();
        let timeout = self.config.exposure_timeout(request.duration);
        let issued = request.clone();
        let task = BackgroundTask::spawn(&self.runtime, "exposure", async move {
            run_exposure(camera, issued).await
        });
        let deadline = task.started() + timeout;
        tracing::debug!(
            "Exposure issued: {:.2}s gain {} filter {:?} frame {}",
            request.duration.as_secs_f64(),
            request.gain,
            request.filter_position,
            request.frame_index
        );
        self.in_flight = Some(InFlight::Exposing {
            request,
            persist,
            timeout,
            deadline,
            task,
        });
    }

    fn active_mut(&mut self, op: &str) -> EngineResult<&mut ActiveSession> {
        self.session
            .as_mut()
            .ok_or_else(|| EngineError::invalid_state(format!("no session to {}", op)))
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    pub fn session(&self) -> Option<&SessionState> {
        self.session.as_ref().map(|a| &a.state)
    }

    pub fn has_running_session(&self) -> bool {
        self.session.as_ref().map_or(false, |a| !a.state.paused)
    }

    /// Exposure or write currently outstanding (0 or 1).
    pub fn in_flight_count(&self) -> usize {
        usize::from(self.in_flight.is_some())
    }

    pub fn is_exposing(&self) -> bool {
        matches!(self.in_flight, Some(InFlight::Exposing { .. }))
    }

    /// Frames written or attempted in the latest session, oldest first.
    pub fn records(&self) -> &[SavedFrameRecord] {
        &self.records
    }

    pub fn next_file_index(&self) -> u32 {
        self.next_file_index
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }
}

async fn run_exposure(
    camera: SharedExposurePort,
    request: ExposureRequest,
) -> Result<ExposureResult, ExposureError> {
    if let Some(position) = request.filter_position {
        camera.set_filter(position).await?;
    }
    camera.expose(&request).await
}
