//! Deterministic fakes for every port
//!
//! Used by the unit and scenario tests, and handy for bench runs without
//! hardware. Each fake records what it was asked to do and can be scripted
//! to fail.

use crate::device_ops::{
    CameraInfo, ExposurePort, ExposureRequest, ExposureResult, FrameSink, GuideDirection,
    GuidePort, SolveHint, SolveResponse, SolvedField, SolverPort,
};
use crate::error::{ExposureError, PersistError};
use crate::storage::frame_file_name;
use astrocam_imaging::{FitsHeader, RawFrame};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tracks how many calls are running at once.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn enter(&self) -> ProbeGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ProbeGuard(self)
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Counts as running until dropped.
pub struct ProbeGuard<'a>(&'a ConcurrencyProbe);

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// CAMERA
// =============================================================================

/// Camera that sleeps for the requested duration and returns a fixed frame.
pub struct ScriptedCamera {
    frame: RawFrame,
    failures: Mutex<VecDeque<ExposureError>>,
    requests: Mutex<Vec<ExposureRequest>>,
    filters: Mutex<Vec<u32>>,
    pub probe: ConcurrencyProbe,
}

impl ScriptedCamera {
    pub fn new() -> Self {
        Self::with_frame(RawFrame::filled(32, 24, 12, 800))
    }

    pub fn with_frame(frame: RawFrame) -> Self {
        Self {
            frame,
            failures: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            filters: Mutex::new(Vec::new()),
            probe: ConcurrencyProbe::default(),
        }
    }

    /// Queue an error for the next exposure call.
    pub fn fail_next(&self, error: ExposureError) {
        lock(&self.failures).push_back(error);
    }

    pub fn requests(&self) -> Vec<ExposureRequest> {
        lock(&self.requests).clone()
    }

    pub fn filter_moves(&self) -> Vec<u32> {
        lock(&self.filters).clone()
    }
}

impl Default for ScriptedCamera {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExposurePort for ScriptedCamera {
    fn info(&self) -> CameraInfo {
        CameraInfo {
            name: "ScriptedCam".to_string(),
            pixel_size_um: Some(3.76),
            focal_length_mm: None,
        }
    }

    async fn set_filter(&self, position: u32) -> Result<(), ExposureError> {
        lock(&self.filters).push(position);
        Ok(())
    }

    async fn expose(&self, request: &ExposureRequest) -> Result<ExposureResult, ExposureError> {
        let _guard = self.probe.enter();
        lock(&self.requests).push(request.clone());
        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }
        tokio::time::sleep(request.duration).await;
        Ok(ExposureResult::new(self.frame.clone(), Utc::now()))
    }
}

// =============================================================================
// SOLVER
// =============================================================================

/// Solver that answers from a script, falling back to a fixed field.
pub struct ScriptedSolver {
    delay: Duration,
    fallback: SolveResponse,
    script: Mutex<VecDeque<SolveResponse>>,
    hints: Mutex<Vec<Option<SolveHint>>>,
    pub probe: ConcurrencyProbe,
}

impl ScriptedSolver {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            fallback: SolveResponse::Solved(Self::field(83.82, -5.39)),
            script: Mutex::new(VecDeque::new()),
            hints: Mutex::new(Vec::new()),
            probe: ConcurrencyProbe::default(),
        }
    }

    pub fn field(ra_deg: f64, dec_deg: f64) -> SolvedField {
        SolvedField {
            ra_deg,
            dec_deg,
            rotation_deg: 12.0,
            pixel_scale_arcsec: 2.1,
            confidence: Some(0.99),
        }
    }

    pub fn never_solves(delay: Duration) -> Self {
        let mut solver = Self::new(delay);
        solver.fallback = SolveResponse::NoSolution;
        solver
    }

    pub fn push(&self, response: SolveResponse) {
        lock(&self.script).push_back(response);
    }

    /// Hints seen, one entry per call.
    pub fn hints(&self) -> Vec<Option<SolveHint>> {
        lock(&self.hints).clone()
    }

    pub fn calls(&self) -> usize {
        lock(&self.hints).len()
    }
}

#[async_trait]
impl SolverPort for ScriptedSolver {
    async fn solve(
        &self,
        _frame: Arc<RawFrame>,
        hint: Option<SolveHint>,
        _timeout: Duration,
    ) -> SolveResponse {
        let _guard = self.probe.enter();
        lock(&self.hints).push(hint);
        tokio::time::sleep(self.delay).await;
        lock(&self.script).pop_front().unwrap_or(self.fallback)
    }
}

// =============================================================================
// GUIDE PORT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordedPulse {
    pub direction: GuideDirection,
    pub duration: Duration,
    pub at: Instant,
}

#[derive(Default)]
pub struct RecordingGuidePort {
    pulses: Mutex<Vec<RecordedPulse>>,
}

impl RecordingGuidePort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pulses(&self) -> Vec<RecordedPulse> {
        lock(&self.pulses).clone()
    }
}

impl GuidePort for RecordingGuidePort {
    fn pulse(&self, direction: GuideDirection, duration: Duration) {
        tracing::debug!("[MOCK] Pulse {:?} for {}ms", direction, duration.as_millis());
        lock(&self.pulses).push(RecordedPulse {
            direction,
            duration,
            at: Instant::now(),
        });
    }
}

// =============================================================================
// FRAME SINK
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFailure {
    Write,
    Flush,
}

/// In-memory sink; "durable" as soon as the call returns `Ok`.
pub struct MemorySink {
    delay: Duration,
    highest: Mutex<Option<u32>>,
    failures: Mutex<VecDeque<SinkFailure>>,
    saved: Mutex<Vec<(PathBuf, FitsHeader)>>,
    pub probe: ConcurrencyProbe,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(50),
            highest: Mutex::new(None),
            failures: Mutex::new(VecDeque::new()),
            saved: Mutex::new(Vec::new()),
            probe: ConcurrencyProbe::default(),
        }
    }

    /// Pretend frames up to `highest` already exist.
    pub fn with_existing(highest: u32) -> Self {
        let sink = Self::new();
        *lock(&sink.highest) = Some(highest);
        sink
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail_next(&self, failure: SinkFailure) {
        lock(&self.failures).push_back(failure);
    }

    /// Paths whose write was confirmed, in order.
    pub fn saved_paths(&self) -> Vec<PathBuf> {
        lock(&self.saved).iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn saved_headers(&self) -> Vec<FitsHeader> {
        lock(&self.saved).iter().map(|(_, h)| h.clone()).collect()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    fn highest_index(&self) -> Option<u32> {
        *lock(&self.highest)
    }

    fn path_for(&self, index: u32) -> PathBuf {
        PathBuf::from("memory").join(frame_file_name(index))
    }

    async fn persist(
        &self,
        path: PathBuf,
        _frame: Arc<RawFrame>,
        header: FitsHeader,
    ) -> Result<(), PersistError> {
        let _guard = self.probe.enter();
        tokio::time::sleep(self.delay).await;
        let shown = path.display().to_string();
        match lock(&self.failures).pop_front() {
            Some(SinkFailure::Write) => return Err(PersistError::write(shown, "simulated write error")),
            Some(SinkFailure::Flush) => {
                return Err(PersistError::Flush {
                    path: shown,
                    reason: "simulated fsync error".to_string(),
                })
            }
            None => {}
        }
        if let Some(index) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(crate::storage::parse_frame_index)
        {
            let mut highest = lock(&self.highest);
            *highest = Some(highest.map_or(index, |h| h.max(index)));
        }
        lock(&self.saved).push((path, header));
        Ok(())
    }
}
