//! End-to-end scenarios driven through the public API with the mock ports.

use astrocam_imaging::RawFrame;
use astrocam_sequencer::mock::{
    MemorySink, RecordingGuidePort, ScriptedCamera, ScriptedSolver, SinkFailure,
};
use astrocam_sequencer::{
    CaptureConfig, CaptureController, CaptureEvent, CaptureMode, EngineConfig, EngineError,
    EnginePorts, ExposureSettings, GuideConfig, GuideDirection, GuideLoop, GuideOffset,
    InputEvent, IntervalEntry, IntervalPlan, PlateSolveConfig, PlateSolveCoordinator,
    PolarAlignAssistant, PolarAlignConfig, PolarAlignState, SessionEnd, SessionEngine,
    SessionRequest, SolveResponse, TickInput,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;

const TICK: Duration = Duration::from_millis(100);

fn one_second() -> ExposureSettings {
    ExposureSettings::new(Duration::from_secs(1), 100, None)
}

fn quiet_capture() -> CaptureConfig {
    CaptureConfig {
        live_preview: false,
        ..Default::default()
    }
}

async fn drive(ctl: &mut CaptureController, ticks: usize) -> Vec<CaptureEvent> {
    let mut events = Vec::new();
    for _ in 0..ticks {
        events.extend(ctl.tick());
        assert!(ctl.in_flight_count() <= 1);
        tokio::time::sleep(TICK).await;
    }
    events
}

fn ended(events: &[CaptureEvent]) -> Option<(u32, SessionEnd)> {
    events.iter().find_map(|e| match e {
        CaptureEvent::SessionEnded { frames, end, .. } => Some((*frames, *end)),
        _ => None,
    })
}

#[tokio::test(start_paused = true)]
async fn repeat_session_saves_three_frames_in_order() {
    let camera = Arc::new(ScriptedCamera::new());
    let sink = Arc::new(MemorySink::new());
    let mut ctl = CaptureController::new(
        quiet_capture(),
        camera.clone(),
        sink.clone(),
        Handle::current(),
    );
    ctl.set_mode(CaptureMode::Repeat).unwrap();
    ctl.start_session(SessionRequest::Repeat {
        settings: one_second(),
        limit: Some(3),
    })
    .unwrap();

    let events = drive(&mut ctl, 60).await;

    assert_eq!(ended(&events), Some((3, SessionEnd::Completed)));
    let records = ctl.records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.write_confirmed));
    assert!(records.windows(2).all(|w| w[0].file_index < w[1].file_index));
    let positions: Vec<u32> = records.iter().map(|r| r.sequence_index).collect();
    assert_eq!(positions, vec![0, 1, 2]);
    assert_eq!(camera.requests().len(), 3);
    assert_eq!(sink.saved_paths().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn never_more_than_one_exposure_in_flight() {
    let camera = Arc::new(ScriptedCamera::new());
    let sink = Arc::new(MemorySink::new().with_delay(Duration::from_millis(700)));
    let mut config = EngineConfig::default();
    config.capture.exposure = one_second();
    config.capture.repeat_limit = Some(4);
    let mut engine = SessionEngine::new(
        config,
        EnginePorts {
            camera: camera.clone(),
            solver: Arc::new(ScriptedSolver::new(Duration::from_millis(400))),
            guide: Arc::new(RecordingGuidePort::new()),
            sink: sink.clone(),
        },
        Handle::current(),
    );

    // live preview first, then a REPEAT session, hammering the shutter
    for _ in 0..15 {
        engine.tick(TickInput::default());
        tokio::time::sleep(TICK).await;
    }
    engine.tick(TickInput::events([
        InputEvent::SecondaryAction,
        InputEvent::SecondaryAction,
    ]));
    engine.tick(TickInput::events([InputEvent::Shutter]));
    for i in 0..120 {
        let status = engine.tick(TickInput::default());
        assert!(engine.capture().in_flight_count() <= 1);
        if i % 7 == 0 && status.session.is_none() {
            engine.tick(TickInput::events([InputEvent::Shutter]));
        }
        tokio::time::sleep(TICK).await;
    }

    assert_eq!(camera.probe.peak(), 1);
    assert_eq!(sink.probe.peak(), 1);
    assert!(sink.saved_paths().len() >= 4);
}

#[tokio::test(start_paused = true)]
async fn failed_write_is_never_reported_saved() {
    let camera = Arc::new(ScriptedCamera::new());
    let sink = Arc::new(MemorySink::new());
    sink.fail_next(SinkFailure::Flush);
    let mut ctl = CaptureController::new(
        quiet_capture(),
        camera.clone(),
        sink.clone(),
        Handle::current(),
    );
    ctl.set_mode(CaptureMode::Repeat).unwrap();
    ctl.start_session(SessionRequest::Repeat {
        settings: one_second(),
        limit: Some(2),
    })
    .unwrap();

    let events = drive(&mut ctl, 30).await;

    assert!(events
        .iter()
        .all(|e| !matches!(e, CaptureEvent::FrameSaved(_))));
    let failed = events
        .iter()
        .find_map(|e| match e {
            CaptureEvent::PersistFailed { record, error } => Some((record.clone(), error.clone())),
            _ => None,
        })
        .expect("persist failure surfaced");
    assert!(!failed.0.write_confirmed);
    assert!(matches!(failed.1, EngineError::PersistenceFailure(_)));
    assert!(ctl.records().iter().all(|r| !r.write_confirmed));
    assert!(ctl.session().unwrap().paused);
    assert_eq!(ctl.session().unwrap().sequence_index, 0);
    assert!(sink.saved_paths().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_during_exposure_still_persists_frame() {
    let camera = Arc::new(ScriptedCamera::new());
    let sink = Arc::new(MemorySink::new());
    let mut ctl = CaptureController::new(
        quiet_capture(),
        camera.clone(),
        sink.clone(),
        Handle::current(),
    );
    ctl.set_mode(CaptureMode::Repeat).unwrap();
    ctl.start_session(SessionRequest::Repeat {
        settings: one_second(),
        limit: None,
    })
    .unwrap();

    let mut events = drive(&mut ctl, 3).await;
    assert!(ctl.is_exposing());
    ctl.cancel().unwrap();

    // still running until the in-flight frame is on disk
    assert!(ctl.session().is_some());
    events.extend(drive(&mut ctl, 30).await);

    let saved_at = events
        .iter()
        .position(|e| matches!(e, CaptureEvent::FrameSaved(_)))
        .expect("frame saved");
    let ended_at = events
        .iter()
        .position(|e| matches!(e, CaptureEvent::SessionEnded { .. }))
        .expect("session ended");
    assert!(saved_at < ended_at);
    assert_eq!(ended(&events), Some((1, SessionEnd::Cancelled)));
    assert_eq!(sink.saved_paths().len(), 1);
    assert_eq!(camera.requests().len(), 1);
    assert!(ctl.session().is_none());
}

#[tokio::test(start_paused = true)]
async fn polar_measure_twice_without_new_solve_is_refused() {
    let solver = Arc::new(ScriptedSolver::new(Duration::from_millis(200)));
    solver.push(SolveResponse::Solved(ScriptedSolver::field(10.0, 80.0)));
    solver.push(SolveResponse::Solved(ScriptedSolver::field(40.0, 80.4)));
    let mut coord = PlateSolveCoordinator::new(
        PlateSolveConfig::default(),
        solver.clone(),
        Handle::current(),
    );
    let mut assistant = PolarAlignAssistant::new(
        PolarAlignConfig::default(),
        PlateSolveConfig::default().staleness(),
    );
    let frame = Arc::new(RawFrame::filled(32, 24, 12, 800));

    assert!(coord.maybe_schedule(&frame, Instant::now()));
    tokio::time::sleep(Duration::from_millis(300)).await;
    coord.poll();
    assistant
        .advance(coord.current().as_ref(), Instant::now())
        .unwrap();
    assert_eq!(assistant.state(), PolarAlignState::DecLocked);

    assert!(coord.maybe_schedule(&frame, Instant::now()));
    tokio::time::sleep(Duration::from_millis(300)).await;
    coord.poll();
    assistant
        .measure_drift(coord.current().as_ref(), Instant::now())
        .unwrap();
    let measured = assistant.session().correction_vector;
    assert!(measured.is_some());

    let err = assistant
        .measure_drift(coord.current().as_ref(), Instant::now())
        .unwrap_err();
    assert!(matches!(err, EngineError::NoSolution(_)));
    assert_eq!(assistant.session().correction_vector, measured);
    assert_eq!(assistant.state(), PolarAlignState::DriftMeasured);
}

#[tokio::test(start_paused = true)]
async fn guide_dead_band_and_clamp() {
    let port = Arc::new(RecordingGuidePort::new());
    let config = GuideConfig {
        enabled: true,
        ..Default::default()
    };
    let max = config.max_pulse();
    let mut guide = GuideLoop::new(config, port.clone());

    let t0 = Instant::now();
    assert!(guide.cycle(GuideOffset::new(0.1, -0.1), t0).is_empty());
    assert!(port.pulses().is_empty());

    let pulses = guide.cycle(GuideOffset::new(-40.0, 40.0), t0 + Duration::from_secs(5));
    assert_eq!(pulses.len(), 2);
    assert!(pulses.iter().all(|p| p.duration == max));
    let recorded = port.pulses();
    assert_eq!(recorded[0].direction, GuideDirection::East);
    assert_eq!(recorded[1].direction, GuideDirection::South);
}

#[tokio::test(start_paused = true)]
async fn schedule_while_solve_pending_is_noop() {
    let solver = Arc::new(ScriptedSolver::new(Duration::from_secs(2)));
    let mut coord = PlateSolveCoordinator::new(
        PlateSolveConfig::default(),
        solver.clone(),
        Handle::current(),
    );
    let f1 = Arc::new(RawFrame::filled(32, 24, 12, 800));
    let f2 = Arc::new(RawFrame::filled(32, 24, 12, 900));

    assert!(coord.maybe_schedule(&f1, Instant::now()));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!coord.maybe_schedule(&f2, Instant::now()));
    assert_eq!(coord.in_flight_count(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    coord.poll();
    let s1 = coord.current().expect("solution from first frame");
    assert!(!s1.hinted);
    assert_eq!(solver.calls(), 1);
    assert_eq!(solver.hints(), vec![None]);
    assert_eq!(solver.probe.peak(), 1);
}

#[tokio::test(start_paused = true)]
async fn interval_plan_drives_filter_order() {
    let camera = Arc::new(ScriptedCamera::new());
    let sink = Arc::new(MemorySink::new());
    let mut ctl = CaptureController::new(
        quiet_capture(),
        camera.clone(),
        sink.clone(),
        Handle::current(),
    );
    let entry = |filter_position, repeat_count| IntervalEntry {
        filter_position,
        duration_secs: 1.0,
        gain: 120,
        repeat_count,
    };
    let plan = IntervalPlan::new(vec![entry(1, 2), entry(2, 1), entry(1, 1)]);
    ctl.set_mode(CaptureMode::Interval).unwrap();
    ctl.start_session(SessionRequest::Interval(plan)).unwrap();

    let events = drive(&mut ctl, 80).await;

    assert_eq!(ended(&events), Some((4, SessionEnd::Completed)));
    let filters: Vec<Option<u32>> = camera
        .requests()
        .iter()
        .map(|r| r.filter_position)
        .collect();
    assert_eq!(filters, vec![Some(1), Some(1), Some(2), Some(1)]);
    assert_eq!(camera.filter_moves(), vec![1, 1, 2, 1]);
    let filter_cards: Vec<Option<i64>> = sink
        .saved_headers()
        .iter()
        .map(|h| h.get_int("FILTPOS"))
        .collect();
    assert_eq!(filter_cards, vec![Some(1), Some(1), Some(2), Some(1)]);
}
