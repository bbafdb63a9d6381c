//! Astrocam Session & Assist Engine
//!
//! Runs capture sessions, background plate solving, polar alignment and
//! autoguiding behind one synchronous tick. Hardware and storage sit behind
//! the port traits in [`device_ops`].

pub mod capture;
pub mod catalog;
pub mod config;
pub mod device_ops;
pub mod engine;
pub mod error;
pub mod guide;
pub mod mock;
pub mod plan;
pub mod plate_solve;
pub mod polar_align;
pub mod storage;
pub mod task;

pub use capture::{
    CaptureController, CaptureEvent, CaptureMode, SavedFrameRecord, SessionEnd, SessionState,
};
pub use catalog::{CatalogEntry, CatalogKind, CatalogObject};
pub use config::{
    CaptureConfig, DisplayConfig, EngineConfig, GuideConfig, Hemisphere, PlateSolveConfig,
    PolarAlignConfig,
};
pub use device_ops::*;
pub use engine::{
    DisplayMode, EnginePorts, EngineStatus, InputEvent, Notice, NoticeLevel, Screen,
    SessionEngine, SolveStatus, TickInput,
};
pub use error::{EngineError, EngineResult, ExposureError, PersistError};
pub use guide::{GuideAxis, GuideLoop, GuideOffset, GuidePulse, GuideState};
pub use plan::{
    duration_from_secs, ExposureSettings, IntervalEntry, IntervalPlan, SessionRequest,
    MAX_DURATION_SECS,
};
pub use plate_solve::{PlateSolution, PlateSolveCoordinator, SharedSolution, SolvePoll};
pub use polar_align::{
    CorrectionVector, DriftVector, PolarAlignAssistant, PolarAlignState, PolarAlignmentSession,
};
pub use storage::{
    build_header, focal_length_from_scale, frame_file_name, FieldPointing, FitsDirectory,
    HeaderContext, PROGRAM_NAME,
};
