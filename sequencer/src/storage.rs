//! Frame persistence
//!
//! [`FitsDirectory`] writes one `IMG_#####.fits` per frame into the output
//! directory. Numbering resumes after the highest index already on disk,
//! so a restart never overwrites earlier frames.

use crate::device_ops::{CameraInfo, ExposureRequest, ExposureResult, FrameSink, SkyPosition};
use crate::error::PersistError;
use astrocam_imaging::{write_fits, FitsError, FitsHeader, RawFrame};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const PROGRAM_NAME: &str = "astrocam";

const FILE_PREFIX: &str = "IMG_";
const FILE_SUFFIX: &str = ".fits";

pub fn frame_file_name(index: u32) -> String {
    format!("{}{:05}{}", FILE_PREFIX, index, FILE_SUFFIX)
}

/// Index encoded in a frame file name, if it is one of ours.
pub fn parse_frame_index(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Highest frame index found in `dir`; `None` if the directory is empty
/// or missing.
pub fn scan_highest_index(dir: &Path) -> Option<u32> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Cannot scan {} for frames: {}", dir.display(), e);
            return None;
        }
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().and_then(parse_frame_index))
        .max()
}

/// Where the telescope was last solved to be pointing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldPointing {
    pub center: SkyPosition,
    pub pixel_scale_arcsec: f64,
}

/// Header cards written with every persisted frame.
pub struct HeaderContext<'a> {
    pub camera: &'a CameraInfo,
    pub filter_name: Option<String>,
    pub pointing: Option<FieldPointing>,
}

/// Focal length implied by the pixel size and the solved image scale,
/// rounded to the nearest millimetre.
pub fn focal_length_from_scale(pixel_size_um: f64, pixel_scale_arcsec: f64) -> Option<f64> {
    if !(pixel_scale_arcsec.is_finite() && pixel_scale_arcsec > 0.0 && pixel_size_um > 0.0) {
        return None;
    }
    Some((pixel_size_um / pixel_scale_arcsec * 206.265).round())
}

pub fn build_header(
    request: &ExposureRequest,
    result: &ExposureResult,
    ctx: &HeaderContext<'_>,
) -> FitsHeader {
    let mut header = FitsHeader::new();
    header.set_string("PROGRAM", PROGRAM_NAME);
    header.set_string(
        "DATE",
        &result.timestamp.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
    );
    header.set_float("EXPTIME", request.duration.as_secs_f64());
    header.set_int("GAIN", request.gain as i64);
    if let Some(pos) = request.filter_position {
        header.set_int("FILTPOS", pos as i64);
    }
    if let Some(name) = &ctx.filter_name {
        header.set_string("FILTER", name);
    }
    header.set_int("FRAMENUM", request.frame_index as i64);
    header.set_int("BITDEPTH", result.bit_depth() as i64);
    if !ctx.camera.name.is_empty() {
        header.set_string("INSTRUME", &ctx.camera.name);
    }
    if let Some(px) = ctx.camera.pixel_size_um {
        header.set_float("XPIXSZ", px);
        header.set_float("YPIXSZ", px);
    }
    if let Some(pointing) = ctx.pointing {
        header.set_float("RA", pointing.center.ra_deg);
        header.set_float("DEC", pointing.center.dec_deg);
    }
    let derived = ctx.pointing.zip(ctx.camera.pixel_size_um).and_then(|(pointing, px)| {
        focal_length_from_scale(px, pointing.pixel_scale_arcsec)
    });
    if let Some(focal) = ctx.camera.focal_length_mm.or(derived) {
        header.set_float("FOCALLEN", focal);
    }
    header
}

/// FITS files in a single directory.
pub struct FitsDirectory {
    dir: PathBuf,
}

impl FitsDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        tracing::info!("Frames will be saved to {}", dir.display());
        Self { dir }
    }
}

#[async_trait]
impl FrameSink for FitsDirectory {
    fn highest_index(&self) -> Option<u32> {
        scan_highest_index(&self.dir)
    }

    fn path_for(&self, index: u32) -> PathBuf {
        self.dir.join(frame_file_name(index))
    }

    async fn persist(
        &self,
        path: PathBuf,
        frame: Arc<RawFrame>,
        header: FitsHeader,
    ) -> Result<(), PersistError> {
        let dir = self.dir.clone();
        let shown = path.display().to_string();
        let joined = tokio::task::spawn_blocking(move || -> Result<(), FitsError> {
            std::fs::create_dir_all(&dir)?;
            write_fits(&path, &frame, &header)
        })
        .await;

        match joined {
            Ok(Ok(())) => {
                tracing::info!("Saved {}", shown);
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!("Failed to save {}: {}", shown, e);
                Err(PersistError::write(shown, e.to_string()))
            }
            Err(e) => Err(PersistError::Aborted(e.to_string())),
        }
    }
}
